use std::path::PathBuf;
use std::sync::Arc;

use mri_core::error::{CoreError, CoreResult};
use mri_core::event_bus::EventBus;
use mri_core::logger::StructuredLogger;
use mri_core::registry::{InputSpace, ModelEntry, ModelKind, ModelRegistry, NormalizationPolicy};
use mri_core::session::SessionStore;
use mri_core::shared_state::SharedState;
use serde_json::json;
use tracing::error;
use uuid::Uuid;

use crate::geometry::{reorient_to_ras, resample_isotropic, voxel_spacing};
use crate::normalize::{choose_normalization, fixed_scale_normalize, percentile_normalize, NormalizationDecision};
use crate::resampler::ExternalResampler;
use crate::resize::resize_with_pad_or_crop;
use crate::tiling::sliding_window_inference;
use crate::volume::{Predictor, Volume, VolumeDtype, VolumeStore};

const PROGRESS_HASH_KEY: &str = "progress";

/// Executes one `Step` of a `Job` on a reserved accelerator slot, driving it
/// through model_load → preprocess → infer → save. A pure function of
/// `(session_id, model_name, input_path, slot)` modulo the side effects of
/// progress publication.
pub struct PipelineRunner {
    sessions: Arc<SessionStore>,
    registry: Arc<ModelRegistry>,
    events: Arc<EventBus>,
    shared: Arc<dyn SharedState>,
    logger: Arc<StructuredLogger>,
    volumes: Arc<dyn VolumeStore>,
    resampler: Arc<dyn ExternalResampler>,
}

impl PipelineRunner {
    pub fn new(
        sessions: Arc<SessionStore>,
        registry: Arc<ModelRegistry>,
        events: Arc<EventBus>,
        shared: Arc<dyn SharedState>,
        logger: Arc<StructuredLogger>,
        volumes: Arc<dyn VolumeStore>,
        resampler: Arc<dyn ExternalResampler>,
    ) -> Self {
        Self {
            sessions,
            registry,
            events,
            shared,
            logger,
            volumes,
            resampler,
        }
    }

    async fn emit(&self, sid: Uuid, model: &str, slot: usize, event: &str, progress: i32, detail: Option<&str>) -> CoreResult<()> {
        let mut payload = json!({"event": event, "model": model, "progress": progress, "gpu": slot});
        if let Some(detail) = detail {
            payload["detail"] = json!(detail);
        }
        self.events.publish(sid, payload.clone()).await?;
        self.logger.event(sid, payload)?;
        self.shared
            .hset(PROGRESS_HASH_KEY, &format!("{sid}:{model}"), progress.to_string())
            .await?;
        Ok(())
    }

    pub async fn run(
        &self,
        sid: Uuid,
        model_name: &str,
        input_path: PathBuf,
        slot: usize,
        predictor: &mut dyn Predictor,
    ) -> CoreResult<PathBuf> {
        match self.run_inner(sid, model_name, &input_path, slot, predictor).await {
            Ok(path) => Ok(path),
            Err(e) => {
                error!(session = %sid, model = model_name, error = %e, "model step failed");
                self.logger.error(sid, &format!("model {model_name} crashed: {e}"), None)?;
                self.emit(sid, model_name, slot, "model_error", -1, Some(&e.to_string())).await.ok();
                Err(e)
            }
        }
    }

    async fn run_inner(
        &self,
        sid: Uuid,
        model_name: &str,
        input_path: &std::path::Path,
        slot: usize,
        predictor: &mut dyn Predictor,
    ) -> CoreResult<PathBuf> {
        let entry = self
            .registry
            .get(model_name)
            .ok_or_else(|| CoreError::MissingModel(model_name.to_string()))?
            .clone();

        self.emit(sid, model_name, slot, "model_load_start", 5, None).await?;
        if !entry.checkpoint_path.exists() {
            return Err(CoreError::MissingModel(entry.checkpoint_path.display().to_string()));
        }
        predictor.load(&entry.checkpoint_path).await?;
        self.emit(sid, model_name, slot, "model_load_complete", 10, None).await?;

        self.emit(sid, model_name, slot, "preprocess_start", 15, None).await?;
        let input_volume = self.volumes.load(input_path).await?;
        let preprocessed = preprocess(&input_volume, &entry);
        self.emit(sid, model_name, slot, "preprocess_complete", 25, None).await?;

        self.emit(sid, model_name, slot, "inference_start", 30, None).await?;
        let logits = sliding_window_inference(predictor, &preprocessed, entry.spatial_size, entry.num_classes).await?;
        self.emit(sid, model_name, slot, "inference_mid", 65, None).await?;

        self.emit(sid, model_name, slot, "save_start", 70, None).await?;
        let labels = argmax_classes(&logits);
        let resized = resize_with_pad_or_crop(&labels, input_volume.metadata.original_shape, 0.0);
        let labels_u8 = cast_labels_to_u8(&resized);

        let mut output_metadata = input_volume.metadata.clone();
        output_metadata.dtype = VolumeDtype::Uint8;
        let output_volume = Volume {
            data: labels_u8,
            metadata: output_metadata,
        };

        let out_path = self.sessions.model_output(sid, model_name)?;
        self.volumes.save(&out_path, &output_volume).await?;

        if entry.input_space == InputSpace::Conformed {
            self.convert_to_native(sid, model_name, &out_path).await;
        }

        self.emit(sid, model_name, slot, "model_complete", 100, None).await?;
        Ok(out_path)
    }

    /// Converts the conformed-space output back to native orientation.
    /// Non-fatal on failure: the conformed output remains the canonical
    /// result and a warning is logged.
    async fn convert_to_native(&self, sid: Uuid, model_name: &str, out_path: &std::path::Path) {
        let native_input = match self.sessions.native_input(sid) {
            Ok(p) => p,
            Err(e) => {
                self.logger.error(sid, &format!("native conversion skipped: {e}"), None).ok();
                return;
            }
        };
        let fs_path = match self.sessions.model_output_fs(sid, model_name) {
            Ok(p) => p,
            Err(_) => return,
        };
        let native_tmp = out_path.with_file_name("output_native.nii.gz");

        match self.resampler.to_native(out_path, &native_input, &native_tmp).await {
            Ok(()) => {
                if std::fs::rename(out_path, &fs_path).is_ok() && std::fs::rename(&native_tmp, out_path).is_ok() {
                    self.logger
                        .info(sid, &format!("[{model_name}] native space output saved as default"), None)
                        .ok();
                }
            }
            Err(e) => {
                self.logger
                    .info(
                        sid,
                        &format!("[{model_name}] WARNING: native conversion failed, keeping conformed-space output: {e}"),
                        None,
                    )
                    .ok();
            }
        }
    }
}

/// Picks the normalization branch from the registry's intensity policy,
/// reorients to RAS and resamples to an isotropic 1mm grid using the
/// registry's interpolation mode, then resizes to the model's spatial
/// size, returning a volume ready for tiled inference. Mirrors the
/// original preprocessing pipeline's
/// normalize → `Orientationd(axcodes="RAS")` → `Spacingd(pixdim=(1,1,1))`
/// → `ResizeWithPadOrCropd` order.
fn preprocess(volume: &Volume, entry: &ModelEntry) -> ndarray::Array3<f32> {
    let max_intensity = volume.max();

    let decision = match entry.normalization_policy {
        NormalizationPolicy::Percentile => NormalizationDecision::Percentile,
        NormalizationPolicy::Fixed => NormalizationDecision::Fixed,
        NormalizationPolicy::Auto => choose_normalization(entry.kind, max_intensity),
    };

    let normalized = match decision {
        NormalizationDecision::Percentile => {
            percentile_normalize(&volume.data, entry.percentile_range.0, entry.percentile_range.1)
        }
        NormalizationDecision::Fixed => fixed_scale_normalize(&volume.data, entry.fixed_range.0 as f32, entry.fixed_range.1 as f32),
        NormalizationDecision::Skip => volume.data.clone(),
    };

    let (reoriented, reoriented_affine) = reorient_to_ras(&normalized, &volume.metadata.affine);
    let spacing = voxel_spacing(&reoriented_affine);
    let resampled = resample_isotropic(&reoriented, spacing, entry.interp_mode);

    let foreground_cropped = match entry.kind {
        ModelKind::Domino | ModelKind::DominoPlusPlus => crop_foreground(&resampled),
        ModelKind::Grace => resampled,
    };

    resize_with_pad_or_crop(&foreground_cropped, entry.resize_target, 0.0)
}

/// Crops to the tight bounding box of non-zero voxels, matching the
/// DOMINO-family foreground-crop preprocessing step.
fn crop_foreground(volume: &ndarray::Array3<f32>) -> ndarray::Array3<f32> {
    let mut min = [usize::MAX; 3];
    let mut max = [0usize; 3];
    let mut found = false;

    for ((x, y, z), &v) in volume.indexed_iter() {
        if v != 0.0 {
            found = true;
            min[0] = min[0].min(x);
            min[1] = min[1].min(y);
            min[2] = min[2].min(z);
            max[0] = max[0].max(x);
            max[1] = max[1].max(y);
            max[2] = max[2].max(z);
        }
    }

    if !found {
        return volume.clone();
    }

    volume
        .slice(ndarray::s![min[0]..=max[0], min[1]..=max[1], min[2]..=max[2]])
        .to_owned()
}

/// Argmax across the class axis of a `(num_classes, D, H, W)` logit
/// volume, returning an `(D, H, W)` label volume.
fn argmax_classes(logits: &ndarray::Array4<f32>) -> ndarray::Array3<f32> {
    let (num_classes, d, h, w) = logits.dim();
    let mut out = ndarray::Array3::<f32>::zeros((d, h, w));

    for x in 0..d {
        for y in 0..h {
            for z in 0..w {
                let mut best_class = 0usize;
                let mut best_value = f32::MIN;
                for c in 0..num_classes {
                    let value = logits[[c, x, y, z]];
                    if value > best_value {
                        best_value = value;
                        best_class = c;
                    }
                }
                out[[x, y, z]] = best_class as f32;
            }
        }
    }

    out
}

/// Rounds and clamps a label volume into the `0..=255` range a `u8`
/// segmentation mask can hold. `VolumeMetadata::dtype` is set to `Uint8`
/// alongside this so the store persists one byte per voxel instead of
/// carrying label data as 4-byte floats.
fn cast_labels_to_u8(labels: &ndarray::Array3<f32>) -> ndarray::Array3<f32> {
    labels.mapv(|v| v.round().clamp(0.0, 255.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    #[test]
    fn argmax_selects_the_highest_scoring_class() {
        let mut logits = Array4::<f32>::zeros((3, 1, 1, 1));
        logits[[0, 0, 0, 0]] = 0.1;
        logits[[1, 0, 0, 0]] = 5.0;
        logits[[2, 0, 0, 0]] = 2.0;

        let labels = argmax_classes(&logits);
        assert_eq!(labels[[0, 0, 0]], 1.0);
    }

    #[test]
    fn cast_labels_to_u8_rounds_and_clamps_into_byte_range() {
        let mut labels = ndarray::Array3::<f32>::zeros((1, 1, 3));
        labels[[0, 0, 0]] = 2.4;
        labels[[0, 0, 1]] = -3.0;
        labels[[0, 0, 2]] = 999.0;

        let cast = cast_labels_to_u8(&labels);
        assert_eq!(cast[[0, 0, 0]], 2.0);
        assert_eq!(cast[[0, 0, 1]], 0.0);
        assert_eq!(cast[[0, 0, 2]], 255.0);
    }

    #[test]
    fn crop_foreground_shrinks_to_nonzero_bounds() {
        let mut vol = ndarray::Array3::<f32>::zeros((10, 10, 10));
        vol[[5, 5, 5]] = 1.0;
        vol[[6, 6, 6]] = 1.0;
        let cropped = crop_foreground(&vol);
        assert_eq!(cropped.dim(), (2, 2, 2));
    }
}

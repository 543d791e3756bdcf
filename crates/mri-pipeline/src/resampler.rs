use std::path::Path;

use async_trait::async_trait;
use mri_core::error::{CoreError, CoreResult};
use tokio::process::Command;

/// The external geometry resampler used to move a conformed-space
/// segmentation back onto the native input's voxel grid. Opaque by design:
/// the core only needs "given these two volumes, produce a resampled one".
#[async_trait]
pub trait ExternalResampler: Send + Sync {
    async fn to_conformed(&self, input: &Path, output: &Path) -> CoreResult<()>;
    async fn to_native(&self, segmentation: &Path, reference: &Path, output: &Path) -> CoreResult<()>;
}

/// Shells out to FreeSurfer's `mri_convert --conform` and
/// `mri_vol2vol --regheader --interp nearest`, matching the original
/// system's conversion commands exactly.
pub struct FreeSurferResampler {
    pub mri_convert_path: std::path::PathBuf,
    pub mri_vol2vol_path: std::path::PathBuf,
}

#[async_trait]
impl ExternalResampler for FreeSurferResampler {
    async fn to_conformed(&self, input: &Path, output: &Path) -> CoreResult<()> {
        let status = Command::new(&self.mri_convert_path)
            .arg(input)
            .arg(output)
            .arg("--conform")
            .status()
            .await?;
        if !status.success() {
            return Err(CoreError::Subprocess(format!(
                "mri_convert exited with {status}"
            )));
        }
        if !output.exists() {
            return Err(CoreError::MissingOutput(output.display().to_string()));
        }
        Ok(())
    }

    async fn to_native(&self, segmentation: &Path, reference: &Path, output: &Path) -> CoreResult<()> {
        // --interp nearest is required for label maps: linear/bilinear
        // interpolation would invent new label values between classes.
        let status = Command::new(&self.mri_vol2vol_path)
            .arg("--mov")
            .arg(segmentation)
            .arg("--targ")
            .arg(reference)
            .arg("--regheader")
            .arg("--o")
            .arg(output)
            .arg("--interp")
            .arg("nearest")
            .status()
            .await?;
        if !status.success() {
            return Err(CoreError::Subprocess(format!(
                "mri_vol2vol exited with {status}"
            )));
        }
        if !output.exists() {
            return Err(CoreError::MissingOutput(output.display().to_string()));
        }
        Ok(())
    }
}

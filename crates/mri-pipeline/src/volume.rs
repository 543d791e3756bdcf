use async_trait::async_trait;
use ndarray::Array3;
use mri_core::error::CoreResult;

/// The voxel datatype a volume is stored as. Intensity volumes stay
/// `Float32` throughout the pipeline; segmentation label volumes are cast
/// to `Uint8` before save, matching the original system's NIfTI output
/// dtype for label maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VolumeDtype {
    #[default]
    Float32,
    Uint8,
}

/// Affine transform and header bytes carried alongside voxel data so output
/// volumes can be written back with the original image's geometry.
#[derive(Debug, Clone)]
pub struct VolumeMetadata {
    pub affine: [[f64; 4]; 4],
    pub header: Vec<u8>,
    pub original_shape: (usize, usize, usize),
    pub dtype: VolumeDtype,
}

/// A single-channel labelled or intensity volume plus its geometry.
#[derive(Debug, Clone)]
pub struct Volume {
    pub data: Array3<f32>,
    pub metadata: VolumeMetadata,
}

impl Volume {
    pub fn shape(&self) -> (usize, usize, usize) {
        let dims = self.data.dim();
        (dims.0, dims.1, dims.2)
    }

    pub fn max(&self) -> f32 {
        self.data.iter().copied().fold(f32::MIN, f32::max)
    }
}

/// Opaque image-format I/O: loads and saves labelled volumes with
/// affine/header metadata. The numeric content of the model and the
/// specifics of the NIfTI codec are out of scope; only this contract
/// matters to the pipeline.
#[async_trait]
pub trait VolumeStore: Send + Sync {
    async fn load(&self, path: &std::path::Path) -> CoreResult<Volume>;

    /// Saves `volume` atomically: stage to a sibling path, then rename into
    /// place, so concurrent readers never observe a partial write.
    async fn save(&self, path: &std::path::Path, volume: &Volume) -> CoreResult<()>;
}

/// Opaque predictor: maps a preprocessed tile tensor of shape
/// `(1, 1, D, H, W)` to a per-class logit tensor of shape
/// `(1, num_classes, D, H, W)`. Backed by whatever checkpoint/runtime the
/// deployment wires in; the pipeline only depends on this contract.
#[async_trait]
pub trait Predictor: Send + Sync {
    async fn load(&mut self, checkpoint_path: &std::path::Path) -> CoreResult<()>;

    /// Runs one sliding-window tile through the model. `tile_batch` is the
    /// number of windows batched in this call; an out-of-memory condition is
    /// reported as `CoreError::Oom` so the runner can retry with a smaller
    /// batch.
    async fn predict(&self, tile: &Array3<f32>, num_classes: usize, tile_batch: usize) -> CoreResult<ndarray::Array4<f32>>;
}

/// Placeholder [`Predictor`] that fails clearly instead of silently
/// fabricating segmentation output. Swapped out at deployment time for
/// whatever checkpoint runtime a site actually has installed; the
/// orchestration layer only ever talks to the trait.
pub struct UnimplementedPredictor;

#[async_trait]
impl Predictor for UnimplementedPredictor {
    async fn load(&mut self, _checkpoint_path: &std::path::Path) -> CoreResult<()> {
        Ok(())
    }

    async fn predict(&self, _tile: &Array3<f32>, _num_classes: usize, _tile_batch: usize) -> CoreResult<ndarray::Array4<f32>> {
        Err(mri_core::error::CoreError::PredictFailure(
            "no model runtime configured: wire a real Predictor implementation for this deployment".into(),
        ))
    }
}

/// Minimal, dependency-free volume codec: a little-endian header of
/// `(depth, height, width)` followed by the affine and raw `f32` voxel
/// data, gzip-compressed end to end. This is not a NIfTI reader — that
/// codec, and the model runtime behind [`Predictor`], are deployment
/// specifics the orchestration layer only depends on through these traits.
/// A site running real scans swaps this out for a NIfTI-aware store
/// without touching anything upstream of it.
pub struct RawVolumeStore;

#[async_trait]
impl VolumeStore for RawVolumeStore {
    async fn load(&self, path: &std::path::Path) -> CoreResult<Volume> {
        use std::io::Read;
        let file = std::fs::File::open(path)?;
        let mut decoder = flate2::read::GzDecoder::new(file);
        let mut buf = Vec::new();
        decoder.read_to_end(&mut buf)?;
        decode_volume(&buf)
    }

    async fn save(&self, path: &std::path::Path, volume: &Volume) -> CoreResult<()> {
        use std::io::Write;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let encoded = encode_volume(volume);
        let tmp = path.with_extension("tmp-write");
        {
            let file = std::fs::File::create(&tmp)?;
            let mut encoder = flate2::write::GzEncoder::new(file, flate2::Compression::fast());
            encoder.write_all(&encoded)?;
            encoder.finish()?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn encode_volume(volume: &Volume) -> Vec<u8> {
    let (d, h, w) = volume.shape();
    let mut buf = Vec::with_capacity(25 + 128 + volume.data.len() * 4);
    buf.extend_from_slice(&(d as u64).to_le_bytes());
    buf.extend_from_slice(&(h as u64).to_le_bytes());
    buf.extend_from_slice(&(w as u64).to_le_bytes());
    for row in &volume.metadata.affine {
        for v in row {
            buf.extend_from_slice(&v.to_le_bytes());
        }
    }
    buf.extend_from_slice(&(volume.metadata.original_shape.0 as u64).to_le_bytes());
    buf.extend_from_slice(&(volume.metadata.original_shape.1 as u64).to_le_bytes());
    buf.extend_from_slice(&(volume.metadata.original_shape.2 as u64).to_le_bytes());
    buf.push(match volume.metadata.dtype {
        VolumeDtype::Float32 => 0u8,
        VolumeDtype::Uint8 => 1u8,
    });
    buf.extend_from_slice(&(volume.metadata.header.len() as u64).to_le_bytes());
    buf.extend_from_slice(&volume.metadata.header);
    match volume.metadata.dtype {
        VolumeDtype::Float32 => {
            for v in volume.data.iter() {
                buf.extend_from_slice(&v.to_le_bytes());
            }
        }
        VolumeDtype::Uint8 => {
            for v in volume.data.iter() {
                buf.push(v.round().clamp(0.0, 255.0) as u8);
            }
        }
    }
    buf
}

fn read_u64(buf: &[u8], cursor: &mut usize) -> CoreResult<u64> {
    let bytes: [u8; 8] = buf
        .get(*cursor..*cursor + 8)
        .ok_or_else(|| mri_core::error::CoreError::InputInvalid("truncated volume header".into()))?
        .try_into()
        .unwrap();
    *cursor += 8;
    Ok(u64::from_le_bytes(bytes))
}

fn read_f64(buf: &[u8], cursor: &mut usize) -> CoreResult<f64> {
    let bytes: [u8; 8] = buf
        .get(*cursor..*cursor + 8)
        .ok_or_else(|| mri_core::error::CoreError::InputInvalid("truncated affine".into()))?
        .try_into()
        .unwrap();
    *cursor += 8;
    Ok(f64::from_le_bytes(bytes))
}

fn decode_volume(buf: &[u8]) -> CoreResult<Volume> {
    let mut cursor = 0usize;

    let d = read_u64(buf, &mut cursor)? as usize;
    let h = read_u64(buf, &mut cursor)? as usize;
    let w = read_u64(buf, &mut cursor)? as usize;

    let mut affine = [[0.0f64; 4]; 4];
    for row in affine.iter_mut() {
        for v in row.iter_mut() {
            *v = read_f64(buf, &mut cursor)?;
        }
    }

    let original_shape = (
        read_u64(buf, &mut cursor)? as usize,
        read_u64(buf, &mut cursor)? as usize,
        read_u64(buf, &mut cursor)? as usize,
    );
    let dtype_tag = *buf
        .get(cursor)
        .ok_or_else(|| mri_core::error::CoreError::InputInvalid("truncated dtype tag".into()))?;
    cursor += 1;
    let dtype = match dtype_tag {
        0 => VolumeDtype::Float32,
        1 => VolumeDtype::Uint8,
        other => {
            return Err(mri_core::error::CoreError::InputInvalid(format!("unknown volume dtype tag {other}")))
        }
    };

    let header_len = read_u64(buf, &mut cursor)? as usize;
    let header = buf
        .get(cursor..cursor + header_len)
        .ok_or_else(|| mri_core::error::CoreError::InputInvalid("truncated header bytes".into()))?
        .to_vec();
    cursor += header_len;

    let expected_voxels = d * h * w;
    let mut data = Vec::with_capacity(expected_voxels);
    match dtype {
        VolumeDtype::Float32 => {
            for _ in 0..expected_voxels {
                let bytes: [u8; 4] = buf
                    .get(cursor..cursor + 4)
                    .ok_or_else(|| mri_core::error::CoreError::InputInvalid("truncated voxel data".into()))?
                    .try_into()
                    .unwrap();
                cursor += 4;
                data.push(f32::from_le_bytes(bytes));
            }
        }
        VolumeDtype::Uint8 => {
            for _ in 0..expected_voxels {
                let byte = *buf
                    .get(cursor)
                    .ok_or_else(|| mri_core::error::CoreError::InputInvalid("truncated voxel data".into()))?;
                cursor += 1;
                data.push(byte as f32);
            }
        }
    }

    let array = Array3::from_shape_vec((d, h, w), data).map_err(|e| anyhow::anyhow!(e))?;
    Ok(Volume {
        data: array,
        metadata: VolumeMetadata { affine, header, original_shape, dtype },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn raw_volume_store_round_trips_shape_affine_and_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.nii.gz");

        let mut affine = [[0.0f64; 4]; 4];
        affine[0][0] = 1.0;
        affine[3][3] = 1.0;
        let volume = Volume {
            data: Array3::from_shape_fn((2, 3, 4), |(z, y, x)| (z * 100 + y * 10 + x) as f32),
            metadata: VolumeMetadata {
                affine,
                header: vec![1, 2, 3],
                original_shape: (2, 3, 4),
                dtype: VolumeDtype::Float32,
            },
        };

        let store = RawVolumeStore;
        store.save(&path, &volume).await.unwrap();
        let loaded = store.load(&path).await.unwrap();

        assert_eq!(loaded.shape(), (2, 3, 4));
        assert_eq!(loaded.metadata.affine[0][0], 1.0);
        assert_eq!(loaded.metadata.header, vec![1, 2, 3]);
        assert_eq!(loaded.data, volume.data);
        assert_eq!(loaded.metadata.dtype, VolumeDtype::Float32);
    }

    #[tokio::test]
    async fn uint8_labels_round_trip_as_whole_numbers_in_one_byte_per_voxel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.nii.gz");

        let mut affine = [[0.0f64; 4]; 4];
        affine[0][0] = 1.0;
        affine[3][3] = 1.0;
        let volume = Volume {
            data: Array3::from_shape_fn((2, 2, 2), |(z, y, x)| (z * 4 + y * 2 + x) as f32),
            metadata: VolumeMetadata {
                affine,
                header: vec![],
                original_shape: (2, 2, 2),
                dtype: VolumeDtype::Uint8,
            },
        };

        let store = RawVolumeStore;
        store.save(&path, &volume).await.unwrap();
        let loaded = store.load(&path).await.unwrap();

        assert_eq!(loaded.metadata.dtype, VolumeDtype::Uint8);
        assert_eq!(loaded.data, volume.data);
    }
}

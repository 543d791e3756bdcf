pub mod geometry;
pub mod normalize;
pub mod resampler;
pub mod resize;
pub mod runner;
pub mod tiling;
pub mod volume;

pub use geometry::{reorient_to_ras, resample_isotropic, voxel_spacing};
pub use normalize::{choose_normalization, fixed_scale_normalize, percentile_normalize, NormalizationDecision};
pub use resampler::{ExternalResampler, FreeSurferResampler};
pub use resize::resize_with_pad_or_crop;
pub use runner::PipelineRunner;
pub use tiling::{sliding_window_inference, window_starts};
pub use volume::{Predictor, RawVolumeStore, UnimplementedPredictor, Volume, VolumeDtype, VolumeMetadata, VolumeStore};

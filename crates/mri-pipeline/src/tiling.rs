use mri_core::error::{CoreError, CoreResult};
use ndarray::{Array3, Array4, Axis};
use tracing::{info, warn};

use crate::volume::Predictor;

const OVERLAP: f64 = 0.8;
const BATCH_LADDER: &[usize] = &[2, 1];

/// Start offsets for every window of size `roi` tiling `shape` with the
/// configured overlap, clamped so the final window in each axis never runs
/// past the volume boundary.
pub fn window_starts(shape: (usize, usize, usize), roi: (usize, usize, usize)) -> Vec<(usize, usize, usize)> {
    fn axis_starts(dim: usize, roi_dim: usize) -> Vec<usize> {
        if roi_dim >= dim {
            return vec![0];
        }
        let stride = ((roi_dim as f64) * (1.0 - OVERLAP)).max(1.0) as usize;
        let mut starts = Vec::new();
        let mut pos = 0;
        loop {
            starts.push(pos);
            if pos + roi_dim >= dim {
                break;
            }
            pos += stride;
            if pos + roi_dim > dim {
                pos = dim - roi_dim;
            }
        }
        starts
    }

    let xs = axis_starts(shape.0, roi.0);
    let ys = axis_starts(shape.1, roi.1);
    let zs = axis_starts(shape.2, roi.2);

    let mut out = Vec::with_capacity(xs.len() * ys.len() * zs.len());
    for &x in &xs {
        for &y in &ys {
            for &z in &zs {
                out.push((x, y, z));
            }
        }
    }
    out
}

fn extract_window(volume: &Array3<f32>, start: (usize, usize, usize), roi: (usize, usize, usize)) -> Array3<f32> {
    volume
        .slice(ndarray::s![
            start.0..start.0 + roi.0,
            start.1..start.1 + roi.1,
            start.2..start.2 + roi.2
        ])
        .to_owned()
}

/// Sliding-window tiled inference over `volume`: tries descending tile
/// batch sizes on OOM (matching the original system's `[2, 1]` retry
/// ladder), averaging overlapping window predictions into a single
/// per-class logit volume of shape `(num_classes, D, H, W)`.
pub async fn sliding_window_inference(
    predictor: &dyn Predictor,
    volume: &Array3<f32>,
    roi: (usize, usize, usize),
    num_classes: usize,
) -> CoreResult<Array4<f32>> {
    let shape = {
        let dims = volume.dim();
        (dims.0, dims.1, dims.2)
    };
    let starts = window_starts(shape, roi);

    let mut last_err = None;
    for (attempt, &batch) in BATCH_LADDER.iter().enumerate() {
        match run_tiles(predictor, volume, &starts, roi, shape, num_classes, batch).await {
            Ok(result) => return Ok(result),
            Err(CoreError::Oom) if attempt + 1 < BATCH_LADDER.len() => {
                warn!(tile_batch = batch, "OOM during tiled inference, retrying with smaller batch");
                last_err = Some(CoreError::Oom);
                continue;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or(CoreError::Oom))
}

async fn run_tiles(
    predictor: &dyn Predictor,
    volume: &Array3<f32>,
    starts: &[(usize, usize, usize)],
    roi: (usize, usize, usize),
    shape: (usize, usize, usize),
    num_classes: usize,
    tile_batch: usize,
) -> CoreResult<Array4<f32>> {
    let mut accum = Array4::<f32>::zeros((num_classes, shape.0, shape.1, shape.2));
    let mut weight = Array3::<f32>::zeros(shape);

    for chunk in starts.chunks(tile_batch.max(1)) {
        for &start in chunk {
            let window = extract_window(volume, start, roi);
            let preds = predictor.predict(&window, num_classes, tile_batch).await?;

            for c in 0..num_classes {
                let mut target = accum.index_axis_mut(Axis(0), c);
                let mut target = target.slice_mut(ndarray::s![
                    start.0..start.0 + roi.0,
                    start.1..start.1 + roi.1,
                    start.2..start.2 + roi.2
                ]);
                let src = preds.index_axis(Axis(1), c).index_axis(Axis(0), 0);
                target += &src;
            }
            let mut w = weight.slice_mut(ndarray::s![
                start.0..start.0 + roi.0,
                start.1..start.1 + roi.1,
                start.2..start.2 + roi.2
            ]);
            w += 1.0;
        }
    }

    info!(windows = starts.len(), tile_batch, "sliding window inference complete");

    for mut class_slice in accum.axis_iter_mut(Axis(0)) {
        class_slice /= &weight.mapv(|w| if w <= 0.0 { 1.0 } else { w });
    }

    Ok(accum)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_starts_cover_the_whole_volume() {
        let starts = window_starts((10, 10, 10), (4, 4, 4));
        for &(x, y, z) in &starts {
            assert!(x + 4 <= 10);
            assert!(y + 4 <= 10);
            assert!(z + 4 <= 10);
        }
        // Last window in each axis must reach the boundary.
        assert!(starts.iter().any(|&(x, _, _)| x + 4 == 10));
    }

    #[test]
    fn roi_larger_than_volume_yields_a_single_window_at_origin() {
        let starts = window_starts((8, 8, 8), (64, 64, 64));
        assert_eq!(starts, vec![(0, 0, 0)]);
    }
}

use ndarray::Array3;

/// Pads with a constant value or center-crops `volume` to exactly
/// `target_shape` along every axis, matching MONAI's
/// `ResizeWithPadOrCrop` semantics.
pub fn resize_with_pad_or_crop(volume: &Array3<f32>, target_shape: (usize, usize, usize), constant: f32) -> Array3<f32> {
    let src_shape = {
        let dims = volume.dim();
        (dims.0, dims.1, dims.2)
    };

    let mut out = Array3::<f32>::from_elem(target_shape, constant);

    let overlap = (
        src_shape.0.min(target_shape.0),
        src_shape.1.min(target_shape.1),
        src_shape.2.min(target_shape.2),
    );

    let src_start = (
        (src_shape.0.saturating_sub(overlap.0)) / 2,
        (src_shape.1.saturating_sub(overlap.1)) / 2,
        (src_shape.2.saturating_sub(overlap.2)) / 2,
    );
    let dst_start = (
        (target_shape.0.saturating_sub(overlap.0)) / 2,
        (target_shape.1.saturating_sub(overlap.1)) / 2,
        (target_shape.2.saturating_sub(overlap.2)) / 2,
    );

    let src_slice = volume.slice(ndarray::s![
        src_start.0..src_start.0 + overlap.0,
        src_start.1..src_start.1 + overlap.1,
        src_start.2..src_start.2 + overlap.2
    ]);
    let mut dst_slice = out.slice_mut(ndarray::s![
        dst_start.0..dst_start.0 + overlap.0,
        dst_start.1..dst_start.1 + overlap.1,
        dst_start.2..dst_start.2 + overlap.2
    ]);
    dst_slice.assign(&src_slice);

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_a_smaller_volume_with_the_constant() {
        let vol = Array3::from_elem((2, 2, 2), 1.0f32);
        let out = resize_with_pad_or_crop(&vol, (4, 4, 4), 0.0);
        assert_eq!(out.dim(), (4, 4, 4));
        assert_eq!(out[[0, 0, 0]], 0.0);
        assert_eq!(out[[2, 2, 2]], 1.0);
    }

    #[test]
    fn crops_a_larger_volume_to_the_center() {
        let mut vol = Array3::<f32>::zeros((6, 6, 6));
        vol[[3, 3, 3]] = 9.0;
        let out = resize_with_pad_or_crop(&vol, (4, 4, 4), 0.0);
        assert_eq!(out.dim(), (4, 4, 4));
        assert_eq!(out[[2, 2, 2]], 9.0);
    }

    #[test]
    fn round_trip_to_original_shape_preserves_dims() {
        let vol = Array3::<f32>::zeros((64, 64, 64));
        let resized = resize_with_pad_or_crop(&vol, (176, 256, 256), 0.0);
        let back = resize_with_pad_or_crop(&resized, (64, 64, 64), 0.0);
        assert_eq!(back.dim(), (64, 64, 64));
    }
}

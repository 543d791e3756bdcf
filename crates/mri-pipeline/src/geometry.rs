use ndarray::Array3;

/// Voxel spacing (mm) along each array axis, read off the column norms of
/// the affine's rotation/scale block — the same quantity MONAI's
/// `Spacingd` derives from a NIfTI affine.
pub fn voxel_spacing(affine: &[[f64; 4]; 4]) -> (f64, f64, f64) {
    let col_norm = |c: usize| -> f64 {
        (0..3).map(|r| affine[r][c] * affine[r][c]).sum::<f64>().sqrt()
    };
    (col_norm(0), col_norm(1), col_norm(2))
}

/// Permutes and flips `volume`'s axes so they read left-to-right as
/// Right/Anterior/Superior, matching MONAI's `Orientationd(axcodes="RAS")`.
/// For each array axis, the affine column with the largest-magnitude
/// component names which RAS direction that axis walks, and its sign says
/// whether indices run with or against that direction.
pub fn reorient_to_ras(volume: &Array3<f32>, affine: &[[f64; 4]; 4]) -> (Array3<f32>, [[f64; 4]; 4]) {
    let dims = volume.dim();
    let dim_of = [dims.0, dims.1, dims.2];

    // dominant_ras_axis[col] = which RAS axis (0=R,1=A,2=S) array axis `col` tracks.
    let mut dominant_ras_axis = [0usize; 3];
    let mut flipped = [false; 3];
    for col in 0..3 {
        let mut best_row = 0;
        let mut best_val = 0.0f64;
        for row in 0..3 {
            let v = affine[row][col].abs();
            if v > best_val {
                best_val = v;
                best_row = row;
            }
        }
        dominant_ras_axis[col] = best_row;
        flipped[col] = affine[best_row][col] < 0.0;
    }

    // ras_axis_to_col[r] = which array axis is walking RAS axis r.
    let mut ras_axis_to_col = [0usize; 3];
    for col in 0..3 {
        ras_axis_to_col[dominant_ras_axis[col]] = col;
    }

    let out_shape = (
        dim_of[ras_axis_to_col[0]],
        dim_of[ras_axis_to_col[1]],
        dim_of[ras_axis_to_col[2]],
    );

    let mut out = Array3::<f32>::zeros(out_shape);
    for ((o0, o1, o2), v) in out.indexed_iter_mut() {
        let o = [o0, o1, o2];
        let mut src = [0usize; 3];
        for ras_axis in 0..3 {
            let col = ras_axis_to_col[ras_axis];
            src[col] = if flipped[col] { dim_of[col] - 1 - o[ras_axis] } else { o[ras_axis] };
        }
        *v = volume[[src[0], src[1], src[2]]];
    }

    let mut new_affine = *affine;
    for ras_axis in 0..3 {
        let col = ras_axis_to_col[ras_axis];
        let sign = if flipped[col] { -1.0 } else { 1.0 };
        for row in 0..4 {
            new_affine[row][ras_axis] = affine[row][col] * sign;
        }
    }

    (out, new_affine)
}

/// Resamples `volume` to an isotropic 1mm grid given its current per-axis
/// `spacing` (mm/voxel), using `interp_mode` ("nearest" or anything else
/// for trilinear) as the registry names it per model.
pub fn resample_isotropic(volume: &Array3<f32>, spacing: (f64, f64, f64), interp_mode: &str) -> Array3<f32> {
    let dims = volume.dim();
    let target_len = |n: usize, s: f64| -> usize { ((n as f64 * s).round() as usize).max(1) };
    let out_shape = (target_len(dims.0, spacing.0), target_len(dims.1, spacing.1), target_len(dims.2, spacing.2));
    let nearest = interp_mode.eq_ignore_ascii_case("nearest");

    let mut out = Array3::<f32>::zeros(out_shape);
    for ((ox, oy, oz), v) in out.indexed_iter_mut() {
        let x = ox as f64 / spacing.0;
        let y = oy as f64 / spacing.1;
        let z = oz as f64 / spacing.2;
        *v = if nearest {
            sample_nearest(volume, dims, x, y, z)
        } else {
            sample_trilinear(volume, dims, x, y, z)
        };
    }
    out
}

fn sample_nearest(volume: &Array3<f32>, dims: (usize, usize, usize), x: f64, y: f64, z: f64) -> f32 {
    let clamp = |v: f64, max: usize| v.round().clamp(0.0, (max.saturating_sub(1)) as f64) as usize;
    volume[[clamp(x, dims.0), clamp(y, dims.1), clamp(z, dims.2)]]
}

fn sample_trilinear(volume: &Array3<f32>, dims: (usize, usize, usize), x: f64, y: f64, z: f64) -> f32 {
    let clamp = |v: f64, max: usize| v.clamp(0.0, (max as f64 - 1.0).max(0.0));
    let (x, y, z) = (clamp(x, dims.0), clamp(y, dims.1), clamp(z, dims.2));

    let (x0, y0, z0) = (x.floor() as usize, y.floor() as usize, z.floor() as usize);
    let x1 = (x0 + 1).min(dims.0 - 1);
    let y1 = (y0 + 1).min(dims.1 - 1);
    let z1 = (z0 + 1).min(dims.2 - 1);
    let (fx, fy, fz) = ((x - x0 as f64) as f32, (y - y0 as f64) as f32, (z - z0 as f64) as f32);

    let c = |xi: usize, yi: usize, zi: usize| volume[[xi, yi, zi]];
    let c00 = c(x0, y0, z0) * (1.0 - fx) + c(x1, y0, z0) * fx;
    let c10 = c(x0, y1, z0) * (1.0 - fx) + c(x1, y1, z0) * fx;
    let c01 = c(x0, y0, z1) * (1.0 - fx) + c(x1, y0, z1) * fx;
    let c11 = c(x0, y1, z1) * (1.0 - fx) + c(x1, y1, z1) * fx;
    let c0 = c00 * (1.0 - fy) + c10 * fy;
    let c1 = c01 * (1.0 - fy) + c11 * fy;
    c0 * (1.0 - fz) + c1 * fz
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_affine_leaves_volume_untouched() {
        let mut affine = [[0.0f64; 4]; 4];
        affine[0][0] = 1.0;
        affine[1][1] = 1.0;
        affine[2][2] = 1.0;
        affine[3][3] = 1.0;

        let vol = Array3::from_shape_fn((2, 3, 4), |(x, y, z)| (x * 100 + y * 10 + z) as f32);
        let (out, new_affine) = reorient_to_ras(&vol, &affine);
        assert_eq!(out, vol);
        assert_eq!(new_affine, affine);
    }

    #[test]
    fn flipped_x_axis_reverses_that_axis() {
        let mut affine = [[0.0f64; 4]; 4];
        affine[0][0] = -1.0;
        affine[1][1] = 1.0;
        affine[2][2] = 1.0;
        affine[3][3] = 1.0;

        let mut vol = Array3::<f32>::zeros((2, 1, 1));
        vol[[0, 0, 0]] = 1.0;
        vol[[1, 0, 0]] = 2.0;

        let (out, _) = reorient_to_ras(&vol, &affine);
        assert_eq!(out[[0, 0, 0]], 2.0);
        assert_eq!(out[[1, 0, 0]], 1.0);
    }

    #[test]
    fn voxel_spacing_reads_column_norms() {
        let mut affine = [[0.0f64; 4]; 4];
        affine[0][0] = 2.0;
        affine[1][1] = 1.5;
        affine[2][2] = 1.0;
        affine[3][3] = 1.0;
        assert_eq!(voxel_spacing(&affine), (2.0, 1.5, 1.0));
    }

    #[test]
    fn resample_to_isotropic_scales_shape_by_spacing() {
        let vol = Array3::<f32>::zeros((4, 4, 4));
        let out = resample_isotropic(&vol, (2.0, 2.0, 2.0), "bilinear");
        assert_eq!(out.dim(), (8, 8, 8));
    }

    #[test]
    fn nearest_mode_preserves_discrete_label_values() {
        let mut vol = Array3::<f32>::zeros((2, 2, 2));
        vol[[0, 0, 0]] = 5.0;
        let out = resample_isotropic(&vol, (1.0, 1.0, 1.0), "nearest");
        assert_eq!(out[[0, 0, 0]], 5.0);
    }
}

/// Static remap from segmentation label to the second simulator's tissue
/// codes, per the design notes: `{WM=1, GM=2, CSF=3, skull=4 (labels 4,5),
/// scalp=5 (labels 6,8,9), eyes=6 (label 11), background=0 (labels 7,10)}`.
/// Any label outside `1..=11` maps to background.
pub fn remap_label(label: u8) -> u8 {
    match label {
        1 => 1, // white matter
        2 => 2, // gray matter
        3 => 3, // CSF
        4 | 5 => 4,     // skull
        6 | 8 | 9 => 5, // scalp
        11 => 6,        // eyes
        7 | 10 => 0,    // background
        _ => 0,
    }
}

/// Applies [`remap_label`] across a flat label buffer, rewriting it to
/// 8-bit unsigned in place. The caller must regenerate the output header's
/// dtype from the rewritten data rather than inheriting the source header,
/// since the source may have been int16/float32 while the remapped array is
/// always uint8.
pub fn remap_labels(labels: &mut [u8]) {
    for label in labels.iter_mut() {
        *label = remap_label(*label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_documented_label_maps_as_specified() {
        assert_eq!(remap_label(1), 1);
        assert_eq!(remap_label(2), 2);
        assert_eq!(remap_label(3), 3);
        assert_eq!(remap_label(4), 4);
        assert_eq!(remap_label(5), 4);
        assert_eq!(remap_label(6), 5);
        assert_eq!(remap_label(8), 5);
        assert_eq!(remap_label(9), 5);
        assert_eq!(remap_label(7), 0);
        assert_eq!(remap_label(10), 0);
        assert_eq!(remap_label(11), 6);
    }

    #[test]
    fn labels_outside_known_range_fall_back_to_background() {
        assert_eq!(remap_label(0), 0);
        assert_eq!(remap_label(200), 0);
    }

    #[test]
    fn remap_labels_rewrites_buffer_in_place() {
        let mut buf = vec![1u8, 7, 11];
        remap_labels(&mut buf);
        assert_eq!(buf, vec![1, 0, 6]);
    }
}

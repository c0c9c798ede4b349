//! Pitched staging rows to packed RGBA8.

use rayon::prelude::*;

use crate::staging::{ChannelOrder, MappedImage};
use crate::{ReadbackError, ReadbackResult};

/// Pack the rows of `mapped` into a dense RGBA8 buffer.
///
/// Row padding beyond `width * 4` is skipped. With `transparent` the alpha
/// channel is copied verbatim, otherwise it is forced to 255. BGRA sources
/// are swizzled to RGBA.
pub fn unpack_rows(mapped: &MappedImage<'_>, transparent: bool) -> ReadbackResult<Vec<u8>> {
    let extent = mapped.extent;
    extent.validate()?;
    let row = extent.packed_row();
    let height = extent.height as usize;

    if mapped.row_pitch < row {
        return Err(ReadbackError::Map(format!(
            "row pitch {} is smaller than a {}-pixel row",
            mapped.row_pitch, extent.width
        )));
    }
    let needed = mapped.row_pitch * (height - 1) + row;
    if mapped.bytes.len() < needed {
        return Err(ReadbackError::Map(format!(
            "mapped {} bytes, {extent} image with pitch {} needs {needed}",
            mapped.bytes.len(),
            mapped.row_pitch
        )));
    }

    let mut out = vec![0u8; row * height];
    out.par_chunks_mut(row).enumerate().for_each(|(y, dst)| {
        let start = y * mapped.row_pitch;
        let src = &mapped.bytes[start..start + row];
        for (d, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
            match mapped.order {
                ChannelOrder::Rgba => d.copy_from_slice(s),
                ChannelOrder::Bgra => d.copy_from_slice(&[s[2], s[1], s[0], s[3]]),
            }
            if !transparent {
                d[3] = 255;
            }
        }
    });
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::Extent;

    fn mapped(bytes: &[u8], pitch: usize, w: u32, h: u32, order: ChannelOrder) -> MappedImage<'_> {
        MappedImage { bytes, row_pitch: pitch, extent: Extent::new(w, h), order }
    }

    #[test]
    fn test_padding_is_skipped() {
        // 2x2 image, 12-byte pitch: 8 bytes of pixels + 4 bytes of padding per row.
        let bytes = [
            1, 2, 3, 4, 5, 6, 7, 8, 0xEE, 0xEE, 0xEE, 0xEE, //
            9, 10, 11, 12, 13, 14, 15, 16, 0xEE, 0xEE, 0xEE, 0xEE,
        ];
        let out = unpack_rows(&mapped(&bytes, 12, 2, 2, ChannelOrder::Rgba), true).unwrap();
        assert_eq!(out, (1..=16).collect::<Vec<u8>>());
    }

    #[test]
    fn test_last_row_needs_no_padding() {
        let bytes = [1, 2, 3, 4, 0, 0, 0, 0, 5, 6, 7, 8];
        let out = unpack_rows(&mapped(&bytes, 8, 1, 2, ChannelOrder::Rgba), true).unwrap();
        assert_eq!(out, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_opaque_forces_alpha() {
        let bytes = [10, 20, 30, 0, 40, 50, 60, 128];
        let out = unpack_rows(&mapped(&bytes, 8, 2, 1, ChannelOrder::Rgba), false).unwrap();
        assert_eq!(out, vec![10, 20, 30, 255, 40, 50, 60, 255]);
    }

    #[test]
    fn test_bgra_swizzle() {
        let bytes = [30, 20, 10, 77];
        let out = unpack_rows(&mapped(&bytes, 4, 1, 1, ChannelOrder::Bgra), true).unwrap();
        assert_eq!(out, vec![10, 20, 30, 77]);
    }

    #[test]
    fn test_short_mapping_rejected() {
        let bytes = [0u8; 15];
        let err = unpack_rows(&mapped(&bytes, 8, 2, 2, ChannelOrder::Rgba), true).unwrap_err();
        assert!(matches!(err, ReadbackError::Map(_)));
    }

    #[test]
    fn test_pitch_below_row_rejected() {
        let bytes = [0u8; 64];
        assert!(unpack_rows(&mapped(&bytes, 4, 2, 2, ChannelOrder::Rgba), true).is_err());
    }
}

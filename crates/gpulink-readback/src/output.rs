//! PNG output.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use crate::{ReadbackError, ReadbackResult};

/// Write packed RGBA8 pixels as an 8-bit RGBA PNG tagged sRGB.
pub fn write_png(path: &Path, width: u32, height: u32, rgba: &[u8]) -> ReadbackResult<()> {
    let expected = width as usize * height as usize * 4;
    if rgba.len() != expected {
        return Err(ReadbackError::Encode(format!(
            "{} bytes for a {width}x{height} RGBA image, expected {expected}",
            rgba.len()
        )));
    }

    let file = File::create(path)?;
    let writer = BufWriter::new(file);

    let mut encoder = png::Encoder::new(writer, width, height);
    encoder.set_color(png::ColorType::Rgba);
    encoder.set_depth(png::BitDepth::Eight);
    encoder.set_compression(png::Compression::default());
    encoder.set_source_srgb(png::SrgbRenderingIntent::Perceptual);

    let mut png_writer = encoder.write_header()
        .map_err(|e| ReadbackError::Encode(e.to_string()))?;
    png_writer.write_image_data(rgba)
        .map_err(|e| ReadbackError::Encode(e.to_string()))?;
    png_writer.finish()
        .map_err(|e| ReadbackError::Encode(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;

    #[test]
    fn test_write_and_decode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shot.png");
        let pixels: Vec<u8> = (0..3 * 2 * 4).map(|i| i as u8 * 7).collect();
        write_png(&path, 3, 2, &pixels).unwrap();

        let decoder = png::Decoder::new(BufReader::new(File::open(&path).unwrap()));
        let mut reader = decoder.read_info().unwrap();
        assert!(reader.info().srgb.is_some());
        let mut buf = vec![0u8; reader.output_buffer_size().unwrap()];
        let info = reader.next_frame(&mut buf).unwrap();
        assert_eq!((info.width, info.height), (3, 2));
        assert_eq!(info.color_type, png::ColorType::Rgba);
        assert_eq!(&buf[..info.buffer_size()], &pixels[..]);
    }

    #[test]
    fn test_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let err = write_png(&dir.path().join("x.png"), 2, 2, &[0; 12]).unwrap_err();
        assert!(matches!(err, ReadbackError::Encode(_)));
    }

    #[test]
    fn test_missing_directory_is_io() {
        let dir = tempfile::tempdir().unwrap();
        let err = write_png(&dir.path().join("no/such/dir.png"), 1, 1, &[0; 4]).unwrap_err();
        assert!(matches!(err, ReadbackError::Io(_)));
    }
}

use crate::error::Result;
use image::RgbImage;
use image::codecs::jpeg::JpegEncoder;

const JPEG_QUALITY: u8 = 85;

/// Encodes a frame as JPEG, for evidence attachments and remote inference.
pub fn encode_jpeg(frame: &RgbImage) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, JPEG_QUALITY).encode_image(frame)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produces_jpeg_magic() {
        let frame = RgbImage::from_pixel(16, 8, image::Rgb([10, 200, 30]));
        let jpeg = encode_jpeg(&frame).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }
}

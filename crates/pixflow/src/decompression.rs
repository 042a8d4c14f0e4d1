use image::{ColorType, DynamicImage};

use crate::container::ImageResponse;

/// Converts decoded images into the pixel layout consumers draw from, ahead
/// of time and off the caller's thread.
pub trait ImageDecompressing: Send + Sync {
    fn is_decompression_needed(&self, image: &DynamicImage) -> bool;

    fn decompress(&self, image: &DynamicImage) -> DynamicImage;
}

/// Normalizes every image to 8-bit RGBA.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDecompressor;

impl ImageDecompressing for DefaultDecompressor {
    fn is_decompression_needed(&self, image: &DynamicImage) -> bool {
        image.color() != ColorType::Rgba8 && image.width() > 0 && image.height() > 0
    }

    fn decompress(&self, image: &DynamicImage) -> DynamicImage {
        DynamicImage::ImageRgba8(image.to_rgba8())
    }
}

pub(crate) fn decompress_response(
    decompressor: &dyn ImageDecompressing,
    response: &ImageResponse,
) -> ImageResponse {
    response
        .map(|image| Some(decompressor.decompress(image)))
        .unwrap_or_else(|| response.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{RgbImage, RgbaImage};

    #[test]
    fn only_non_rgba_images_need_work() {
        let decompressor = DefaultDecompressor;
        let rgb = DynamicImage::ImageRgb8(RgbImage::new(4, 4));
        let rgba = DynamicImage::ImageRgba8(RgbaImage::new(4, 4));
        let empty = DynamicImage::ImageRgb8(RgbImage::new(0, 0));

        assert!(decompressor.is_decompression_needed(&rgb));
        assert!(!decompressor.is_decompression_needed(&rgba));
        assert!(!decompressor.is_decompression_needed(&empty));

        let output = decompressor.decompress(&rgb);
        assert_eq!(output.color(), ColorType::Rgba8);
        assert!(!decompressor.is_decompression_needed(&output));
    }
}

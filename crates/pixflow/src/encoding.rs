use std::io::Cursor;
use std::sync::Arc;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};
use tracing::debug;

use crate::container::{ImageContainer, ImageType};
use crate::loader::UrlResponse;
use crate::request::ImageRequest;

#[derive(Debug, Clone)]
pub struct ImageEncodingContext {
    pub request: ImageRequest,
    pub image: Arc<DynamicImage>,
    pub url_response: Option<UrlResponse>,
}

pub trait ImageEncoding: Send + Sync {
    fn encode(&self, container: &ImageContainer, context: &ImageEncodingContext) -> Option<Bytes>;
}

pub type EncoderFactory = Arc<dyn Fn(&ImageEncodingContext) -> Arc<dyn ImageEncoding> + Send + Sync>;

/// PNG for images with an alpha channel, JPEG otherwise. Animated images
/// keep their original bytes.
#[derive(Debug, Clone, Copy)]
pub struct DefaultEncoder {
    pub quality: u8,
}

impl Default for DefaultEncoder {
    fn default() -> Self {
        Self { quality: 80 }
    }
}

impl DefaultEncoder {
    pub fn encode_image(&self, image: &DynamicImage) -> Option<Bytes> {
        let mut buffer = Vec::new();
        let result = if image.color().has_alpha() {
            image.write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
        } else {
            JpegEncoder::new_with_quality(&mut buffer, self.quality.clamp(1, 100))
                .encode_image(&image.to_rgb8())
        };
        match result {
            Ok(()) => Some(Bytes::from(buffer)),
            Err(e) => {
                debug!(error = %e, "Failed to encode image");
                None
            }
        }
    }
}

impl ImageEncoding for DefaultEncoder {
    fn encode(&self, container: &ImageContainer, _context: &ImageEncodingContext) -> Option<Bytes> {
        if container.kind == Some(ImageType::Gif)
            && let Some(data) = &container.data
        {
            return Some(data.clone());
        }
        self.encode_image(&container.image)
    }
}

pub fn default_encoder_factory() -> EncoderFactory {
    let encoder: Arc<dyn ImageEncoding> = Arc::new(DefaultEncoder::default());
    Arc::new(move |_| encoder.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage, Rgba, RgbaImage};

    fn context(image: DynamicImage) -> ImageEncodingContext {
        ImageEncodingContext {
            request: ImageRequest::new("https://example.com/a".parse().unwrap()),
            image: Arc::new(image),
            url_response: None,
        }
    }

    #[test]
    fn opaque_images_become_jpeg() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([200, 10, 10])));
        let container = ImageContainer::new(image.clone());
        let data = DefaultEncoder::default()
            .encode(&container, &context(image))
            .unwrap();
        assert_eq!(ImageType::sniff(&data), Some(ImageType::Jpeg));
    }

    #[test]
    fn transparent_images_become_png() {
        let image = DynamicImage::ImageRgba8(RgbaImage::from_pixel(8, 8, Rgba([0, 0, 0, 0])));
        let container = ImageContainer::new(image.clone());
        let data = DefaultEncoder::default()
            .encode(&container, &context(image))
            .unwrap();
        assert_eq!(ImageType::sniff(&data), Some(ImageType::Png));

        let decoded = image::load_from_memory(&data).unwrap();
        assert_eq!(decoded.width(), 8);
    }

    #[test]
    fn animated_data_passes_through() {
        let image = DynamicImage::ImageRgba8(RgbaImage::new(1, 1));
        let mut container = ImageContainer::new(image.clone()).with_kind(Some(ImageType::Gif));
        container.data = Some(Bytes::from_static(b"GIF89a..."));
        let data = DefaultEncoder::default()
            .encode(&container, &context(image))
            .unwrap();
        assert_eq!(&data[..], b"GIF89a...");
    }
}

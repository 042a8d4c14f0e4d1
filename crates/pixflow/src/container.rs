//! Decoded images and the responses that carry them.

use std::sync::Arc;

use bytes::Bytes;
use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};

use crate::loader::UrlResponse;

/// Encoded image format, detected from leading magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    Png,
    Jpeg,
    Gif,
    Webp,
}

impl ImageType {
    pub fn sniff(data: &[u8]) -> Option<Self> {
        match data {
            [0x89, b'P', b'N', b'G', ..] => Some(Self::Png),
            [0xFF, 0xD8, 0xFF, ..] => Some(Self::Jpeg),
            [b'G', b'I', b'F', b'8', ..] => Some(Self::Gif),
            [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => Some(Self::Webp),
            _ => None,
        }
    }

    pub fn format(self) -> ImageFormat {
        match self {
            Self::Png => ImageFormat::Png,
            Self::Jpeg => ImageFormat::Jpeg,
            Self::Gif => ImageFormat::Gif,
            Self::Webp => ImageFormat::WebP,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::Gif => "gif",
            Self::Webp => "webp",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImageContainer {
    pub image: Arc<DynamicImage>,
    pub kind: Option<ImageType>,
    /// Set for images decoded from partially downloaded data.
    pub is_preview: bool,
    /// Original encoded bytes, kept for animated images.
    pub data: Option<Bytes>,
    /// Number of progressive scans the preview was decoded from.
    pub scan_number: Option<usize>,
}

impl ImageContainer {
    pub fn new(image: DynamicImage) -> Self {
        Self {
            image: Arc::new(image),
            kind: None,
            is_preview: false,
            data: None,
            scan_number: None,
        }
    }

    pub fn with_kind(mut self, kind: Option<ImageType>) -> Self {
        self.kind = kind;
        self
    }

    pub fn preview(mut self, scan_number: Option<usize>) -> Self {
        self.is_preview = true;
        self.scan_number = scan_number;
        self
    }

    /// Replace the image, keeping the metadata.
    pub fn map(&self, transform: impl FnOnce(&DynamicImage) -> Option<DynamicImage>) -> Option<Self> {
        let image = transform(&self.image)?;
        Some(Self {
            image: Arc::new(image),
            ..self.clone()
        })
    }

    /// Approximate decoded size in bytes.
    pub fn cost(&self) -> u64 {
        let pixel_bytes = self.image.as_bytes().len() as u64;
        pixel_bytes + self.data.as_ref().map_or(0, |data| data.len() as u64)
    }
}

#[derive(Debug, Clone)]
pub struct ImageResponse {
    pub container: ImageContainer,
    pub url_response: Option<UrlResponse>,
}

impl ImageResponse {
    pub fn new(container: ImageContainer, url_response: Option<UrlResponse>) -> Self {
        Self {
            container,
            url_response,
        }
    }

    pub fn image(&self) -> &DynamicImage {
        &self.container.image
    }

    pub fn is_preview(&self) -> bool {
        self.container.is_preview
    }

    pub fn map(&self, transform: impl FnOnce(&DynamicImage) -> Option<DynamicImage>) -> Option<Self> {
        Some(Self {
            container: self.container.map(transform)?,
            url_response: self.url_response.clone(),
        })
    }
}

/// Raw bytes as loaded, with the response they came from when fetched over
/// the network.
#[derive(Debug, Clone)]
pub struct ImageData {
    pub data: Bytes,
    pub response: Option<UrlResponse>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbaImage;

    #[test]
    fn sniffs_common_formats() {
        assert_eq!(ImageType::sniff(b"\x89PNG\r\n\x1a\n"), Some(ImageType::Png));
        assert_eq!(ImageType::sniff(&[0xFF, 0xD8, 0xFF, 0xE0]), Some(ImageType::Jpeg));
        assert_eq!(ImageType::sniff(b"GIF89a"), Some(ImageType::Gif));
        assert_eq!(ImageType::sniff(b"RIFF\0\0\0\0WEBPVP8 "), Some(ImageType::Webp));
        assert_eq!(ImageType::sniff(b"<html>"), None);
        assert_eq!(ImageType::sniff(&[]), None);
    }

    #[test]
    fn map_keeps_metadata() {
        let container = ImageContainer::new(DynamicImage::ImageRgba8(RgbaImage::new(4, 4)))
            .with_kind(Some(ImageType::Jpeg))
            .preview(Some(2));
        let mapped = container
            .map(|image| Some(image.resize_exact(2, 2, image::imageops::FilterType::Nearest)))
            .unwrap();

        assert_eq!(mapped.image.width(), 2);
        assert!(mapped.is_preview);
        assert_eq!(mapped.scan_number, Some(2));
        assert_eq!(mapped.kind, Some(ImageType::Jpeg));
        assert_eq!(mapped.cost(), 2 * 2 * 4);
    }
}

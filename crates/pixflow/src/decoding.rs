//! Image decoding.
//!
//! Decoders are created per task through a factory so that stateful decoders
//! (the progressive JPEG scanner) can keep state across chunks of one
//! download.

use std::sync::Arc;

use bytes::Bytes;
use image::{DynamicImage, RgbaImage};
use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::container::{ImageContainer, ImageResponse, ImageType};
use crate::loader::UrlResponse;
use crate::request::ImageRequest;

pub trait ImageDecoding: Send + Sync {
    fn decode(&self, data: &[u8]) -> Option<ImageContainer>;

    /// Decode a preview from incomplete data. Most decoders can't.
    fn decode_partially_downloaded_data(&self, _data: &[u8]) -> Option<ImageContainer> {
        None
    }
}

/// Decode `data` as a final or partial response.
pub fn decode_response(
    decoder: &dyn ImageDecoding,
    data: &[u8],
    url_response: Option<UrlResponse>,
    is_completed: bool,
) -> Option<ImageResponse> {
    let container = if is_completed {
        decoder.decode(data)
    } else {
        decoder.decode_partially_downloaded_data(data)
    }?;
    Some(ImageResponse::new(container, url_response))
}

#[derive(Debug, Clone)]
pub struct ImageDecodingContext {
    pub request: ImageRequest,
    pub data: Bytes,
    pub is_completed: bool,
    pub url_response: Option<UrlResponse>,
}

pub type DecoderFactory =
    Arc<dyn Fn(&ImageDecodingContext) -> Option<Arc<dyn ImageDecoding>> + Send + Sync>;

/// Decoder backed by the `image` crate, with previews for progressive JPEGs.
#[derive(Debug, Default)]
pub struct DefaultDecoder {
    scanner: Mutex<ProgressiveJpegScanner>,
}

impl DefaultDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Partial data is only accepted for progressive JPEGs.
    pub fn for_context(context: &ImageDecodingContext) -> Option<Self> {
        if context.is_completed {
            return Some(Self::new());
        }
        let is_progressive_jpeg = ImageType::sniff(&context.data) == Some(ImageType::Jpeg)
            && is_progressive_jpeg(&context.data) == Some(true);
        is_progressive_jpeg.then(Self::new)
    }

    pub fn number_of_scans(&self) -> usize {
        self.scanner.lock().number_of_scans
    }
}

impl ImageDecoding for DefaultDecoder {
    fn decode(&self, data: &[u8]) -> Option<ImageContainer> {
        let kind = ImageType::sniff(data);
        let image = load(data, kind)?;
        let mut container = ImageContainer::new(image).with_kind(kind);
        if kind == Some(ImageType::Gif) {
            container.data = Some(Bytes::copy_from_slice(data));
        }
        let scans = self.number_of_scans();
        if scans > 0 {
            container.scan_number = Some(scans);
        }
        Some(container)
    }

    fn decode_partially_downloaded_data(&self, data: &[u8]) -> Option<ImageContainer> {
        let (end_of_scan, scans) = {
            let mut scanner = self.scanner.lock();
            let end = scanner.scan(data)?;
            (end, scanner.number_of_scans)
        };
        if end_of_scan == 0 {
            return None;
        }

        // Close the truncated stream with an EOI marker so the codec accepts it.
        let mut preview = Vec::with_capacity(end_of_scan + 3);
        preview.extend_from_slice(&data[..=end_of_scan]);
        preview.extend_from_slice(&[0xFF, 0xD9]);

        let image = load(&preview, Some(ImageType::Jpeg))?;
        trace!(scans, bytes = end_of_scan + 1, "Decoded progressive preview");
        Some(
            ImageContainer::new(image)
                .with_kind(Some(ImageType::Jpeg))
                .preview(Some(scans)),
        )
    }
}

fn load(data: &[u8], kind: Option<ImageType>) -> Option<DynamicImage> {
    let result = match kind {
        Some(kind) => image::load_from_memory_with_format(data, kind.format()),
        None => image::load_from_memory(data),
    };
    match result {
        Ok(image) => Some(image),
        Err(e) => {
            trace!(error = %e, "Image data could not be decoded");
            None
        }
    }
}

/// Tracks start-of-scan markers across successive, growing prefixes of one
/// JPEG stream.
#[derive(Debug, Default)]
struct ProgressiveJpegScanner {
    number_of_scans: usize,
    last_start_of_scan: usize,
    scanned_index: Option<usize>,
}

impl ProgressiveJpegScanner {
    /// Index of the last byte before the most recent start of scan, once a
    /// new scan was found and at least two are known.
    fn scan(&mut self, data: &[u8]) -> Option<usize> {
        let mut index = self.scanned_index.map_or(0, |scanned| scanned + 1);
        if index >= data.len() {
            return None;
        }

        let mut number_of_scans = self.number_of_scans;
        while index + 1 < data.len() {
            self.scanned_index = Some(index);
            if data[index] == 0xFF && data[index + 1] == 0xDA {
                self.last_start_of_scan = index;
                number_of_scans += 1;
            }
            index += 1;
        }

        if number_of_scans <= self.number_of_scans {
            return None;
        }
        self.number_of_scans = number_of_scans;
        if number_of_scans < 2 || self.last_start_of_scan == 0 {
            return None;
        }
        Some(self.last_start_of_scan - 1)
    }
}

/// `Some(true)` for SOF2 (progressive), `Some(false)` for SOF0 (baseline).
pub fn is_progressive_jpeg(data: &[u8]) -> Option<bool> {
    data.windows(2).skip(3).find_map(|pair| match pair {
        [0xFF, 0xC2] => Some(true),
        [0xFF, 0xC0] => Some(false),
        _ => None,
    })
}

/// Wraps the raw bytes in a container without decoding them.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyDecoder {
    pub is_progressive: bool,
}

impl EmptyDecoder {
    fn container(data: &[u8]) -> ImageContainer {
        let mut container = ImageContainer::new(DynamicImage::ImageRgba8(RgbaImage::new(0, 0)))
            .with_kind(ImageType::sniff(data));
        container.data = Some(Bytes::copy_from_slice(data));
        container
    }
}

impl ImageDecoding for EmptyDecoder {
    fn decode(&self, data: &[u8]) -> Option<ImageContainer> {
        Some(Self::container(data))
    }

    fn decode_partially_downloaded_data(&self, data: &[u8]) -> Option<ImageContainer> {
        self.is_progressive
            .then(|| Self::container(data).preview(None))
    }
}

type DecoderMatch = Arc<dyn Fn(&ImageDecodingContext) -> Option<Arc<dyn ImageDecoding>> + Send + Sync>;

/// Ordered list of decoder constructors; the most recently registered match
/// wins.
pub struct ImageDecoderRegistry {
    matches: RwLock<Vec<DecoderMatch>>,
}

impl ImageDecoderRegistry {
    /// Registry containing only [`DefaultDecoder`].
    pub fn new() -> Self {
        let registry = Self {
            matches: RwLock::new(Vec::new()),
        };
        registry.register(|context| {
            DefaultDecoder::for_context(context)
                .map(|decoder| Arc::new(decoder) as Arc<dyn ImageDecoding>)
        });
        registry
    }

    pub fn register(
        &self,
        decoder: impl Fn(&ImageDecodingContext) -> Option<Arc<dyn ImageDecoding>>
        + Send
        + Sync
        + 'static,
    ) {
        self.matches.write().insert(0, Arc::new(decoder));
    }

    pub fn decoder(&self, context: &ImageDecodingContext) -> Option<Arc<dyn ImageDecoding>> {
        let matches = self.matches.read().clone();
        matches.iter().find_map(|make| make(context))
    }

    pub fn clear(&self) {
        self.matches.write().clear();
    }

    pub fn into_factory(self) -> DecoderFactory {
        let registry = Arc::new(self);
        Arc::new(move |context| registry.decoder(context))
    }
}

impl Default for ImageDecoderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{jpeg_bytes, png_bytes};

    fn context(data: Vec<u8>, is_completed: bool) -> ImageDecodingContext {
        ImageDecodingContext {
            request: ImageRequest::new("https://example.com/a".parse().unwrap()),
            data: Bytes::from(data),
            is_completed,
            url_response: None,
        }
    }

    #[test]
    fn decodes_png_and_jpeg() {
        let decoder = DefaultDecoder::new();

        let png = decoder.decode(&png_bytes(8, 6)).unwrap();
        assert_eq!((png.image.width(), png.image.height()), (8, 6));
        assert_eq!(png.kind, Some(ImageType::Png));
        assert!(!png.is_preview);

        let jpeg = decoder.decode(&jpeg_bytes(16, 16)).unwrap();
        assert_eq!(jpeg.kind, Some(ImageType::Jpeg));
    }

    #[test]
    fn garbage_does_not_decode() {
        assert!(DefaultDecoder::new().decode(b"definitely not an image").is_none());
    }

    #[test]
    fn partial_decoder_only_for_progressive_jpeg() {
        assert!(DefaultDecoder::for_context(&context(png_bytes(4, 4), true)).is_some());
        assert!(DefaultDecoder::for_context(&context(png_bytes(4, 4), false)).is_none());
        // Baseline JPEG (SOF0) gets no preview decoder.
        assert!(DefaultDecoder::for_context(&context(jpeg_bytes(4, 4), false)).is_none());
    }

    #[test]
    fn scanner_reports_end_of_previous_scan() {
        let mut scanner = ProgressiveJpegScanner::default();
        let mut data = vec![0xFF, 0xD8, 0xFF, 0xC2, 0x00, 0xFF, 0xDA, 0x01, 0x02];
        assert_eq!(scanner.scan(&data), None);
        assert_eq!(scanner.number_of_scans, 1);

        data.extend_from_slice(&[0x03, 0xFF, 0xDA, 0x04]);
        assert_eq!(scanner.scan(&data), Some(9));
        assert_eq!(scanner.number_of_scans, 2);

        // Nothing new arrived.
        assert_eq!(scanner.scan(&data), None);
    }

    #[test]
    fn progressive_marker_detection() {
        assert_eq!(is_progressive_jpeg(&[0xFF, 0xD8, 0xFF, 0xE0, 0xFF, 0xC2]), Some(true));
        assert_eq!(is_progressive_jpeg(&[0xFF, 0xD8, 0xFF, 0xE0, 0xFF, 0xC0]), Some(false));
        assert_eq!(is_progressive_jpeg(&[0xFF, 0xD8, 0xFF]), None);
    }

    #[test]
    fn empty_decoder_keeps_bytes() {
        let decoder = EmptyDecoder { is_progressive: true };
        let container = decoder.decode(b"payload").unwrap();
        assert_eq!(container.data.as_deref(), Some(&b"payload"[..]));
        assert!(decoder.decode_partially_downloaded_data(b"pay").unwrap().is_preview);
        assert!(EmptyDecoder::default()
            .decode_partially_downloaded_data(b"pay")
            .is_none());
    }

    #[test]
    fn registry_prefers_latest_registration() {
        let registry = ImageDecoderRegistry::new();
        registry.register(|_| Some(Arc::new(EmptyDecoder::default()) as Arc<dyn ImageDecoding>));
        let decoder = registry.decoder(&context(png_bytes(2, 2), true)).unwrap();
        // EmptyDecoder yields a zero-sized image.
        assert_eq!(decoder.decode(&png_bytes(2, 2)).unwrap().image.width(), 0);

        registry.clear();
        assert!(registry.decoder(&context(png_bytes(2, 2), true)).is_none());
    }
}

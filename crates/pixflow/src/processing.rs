//! Image processors.
//!
//! A processor's [`identifier`](ImageProcessing::identifier) participates in
//! cache keys: two processors with equal identifiers must produce equal
//! output for the same input.

use std::fmt;
use std::sync::Arc;

use image::imageops::FilterType;
use image::{DynamicImage, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::container::ImageContainer;
use crate::loader::UrlResponse;
use crate::request::ImageRequest;

#[derive(Debug, Clone)]
pub struct ImageProcessingContext {
    pub request: ImageRequest,
    pub url_response: Option<UrlResponse>,
    /// `false` while processing progressive previews.
    pub is_final: bool,
}

pub trait ImageProcessing: Send + Sync {
    fn process(&self, image: &DynamicImage) -> Option<DynamicImage>;

    fn process_container(
        &self,
        container: &ImageContainer,
        _context: &ImageProcessingContext,
    ) -> Option<ImageContainer> {
        container.map(|image| self.process(image))
    }

    fn identifier(&self) -> String;
}

impl fmt::Debug for dyn ImageProcessing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identifier())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentMode {
    /// Scale to cover the target size.
    #[default]
    AspectFill,
    /// Scale to fit inside the target size.
    AspectFit,
}

impl fmt::Display for ContentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AspectFill => f.write_str("aspect_fill"),
            Self::AspectFit => f.write_str("aspect_fit"),
        }
    }
}

/// Resizes to a target size in pixels, keeping the aspect ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resize {
    width: u32,
    height: u32,
    content_mode: ContentMode,
    crop: bool,
    upscale: bool,
}

impl Resize {
    const UNBOUNDED: u32 = 9999;

    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            content_mode: ContentMode::AspectFill,
            crop: false,
            upscale: false,
        }
    }

    /// Fit to a width, whatever the resulting height.
    pub fn width(width: u32) -> Self {
        Self::new(width, Self::UNBOUNDED).with_content_mode(ContentMode::AspectFit)
    }

    /// Fit to a height, whatever the resulting width.
    pub fn height(height: u32) -> Self {
        Self::new(Self::UNBOUNDED, height).with_content_mode(ContentMode::AspectFit)
    }

    pub fn with_content_mode(mut self, content_mode: ContentMode) -> Self {
        self.content_mode = content_mode;
        self
    }

    /// Crop the overflow when filling.
    pub fn with_crop(mut self, crop: bool) -> Self {
        self.crop = crop;
        self
    }

    pub fn with_upscale(mut self, upscale: bool) -> Self {
        self.upscale = upscale;
        self
    }
}

impl ImageProcessing for Resize {
    fn process(&self, image: &DynamicImage) -> Option<DynamicImage> {
        let (width, height) = (image.width(), image.height());
        if width == 0 || height == 0 {
            return None;
        }

        if self.crop && self.content_mode == ContentMode::AspectFill {
            return Some(image.resize_to_fill(self.width, self.height, FilterType::Triangle));
        }

        let scale_x = self.width as f64 / width as f64;
        let scale_y = self.height as f64 / height as f64;
        let scale = match self.content_mode {
            ContentMode::AspectFill => scale_x.max(scale_y),
            ContentMode::AspectFit => scale_x.min(scale_y),
        };
        if scale >= 1.0 && !self.upscale {
            return Some(image.clone());
        }

        let target_width = ((width as f64 * scale).round() as u32).max(1);
        let target_height = ((height as f64 * scale).round() as u32).max(1);
        Some(image.resize_exact(target_width, target_height, FilterType::Triangle))
    }

    fn identifier(&self) -> String {
        format!(
            "pixflow/resize?s={}x{},cm={},crop={},upscale={}",
            self.width, self.height, self.content_mode, self.crop, self.upscale
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Border {
    pub color: [u8; 4],
    /// Width in pixels.
    pub width: u32,
}

impl fmt::Display for Border {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [r, g, b, a] = self.color;
        write!(f, "#{r:02x}{g:02x}{b:02x}{a:02x}/{}", self.width)
    }
}

/// Crops to a centered square and masks it to a circle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Circle {
    pub border: Option<Border>,
}

impl ImageProcessing for Circle {
    fn process(&self, image: &DynamicImage) -> Option<DynamicImage> {
        let side = image.width().min(image.height());
        if side == 0 {
            return None;
        }
        let x = (image.width() - side) / 2;
        let y = (image.height() - side) / 2;
        let mut square = image.crop_imm(x, y, side, side).to_rgba8();
        mask_rounded_rect(&mut square, side as f32 / 2.0, self.border);
        Some(DynamicImage::ImageRgba8(square))
    }

    fn identifier(&self) -> String {
        match self.border {
            Some(border) => format!("pixflow/circle?border={border}"),
            None => "pixflow/circle".to_owned(),
        }
    }
}

/// Rounds the corners with a radius in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoundedCorners {
    pub radius: u32,
    pub border: Option<Border>,
}

impl RoundedCorners {
    pub fn new(radius: u32) -> Self {
        Self {
            radius,
            border: None,
        }
    }
}

impl ImageProcessing for RoundedCorners {
    fn process(&self, image: &DynamicImage) -> Option<DynamicImage> {
        if image.width() == 0 || image.height() == 0 {
            return None;
        }
        let mut output = image.to_rgba8();
        let max_radius = output.width().min(output.height()) as f32 / 2.0;
        mask_rounded_rect(&mut output, (self.radius as f32).min(max_radius), self.border);
        Some(DynamicImage::ImageRgba8(output))
    }

    fn identifier(&self) -> String {
        match self.border {
            Some(border) => format!("pixflow/rounded_corners?radius={},border={border}", self.radius),
            None => format!("pixflow/rounded_corners?radius={}", self.radius),
        }
    }
}

/// Clear pixels outside a rectangle with rounded corners and paint the border
/// inside its edge.
fn mask_rounded_rect(image: &mut RgbaImage, radius: f32, border: Option<Border>) {
    let (width, height) = (image.width() as f32, image.height() as f32);
    for (x, y, pixel) in image.enumerate_pixels_mut() {
        let cx = x as f32 + 0.5;
        let cy = y as f32 + 0.5;
        let dx = (radius - cx).max(cx - (width - radius)).max(0.0);
        let dy = (radius - cy).max(cy - (height - radius)).max(0.0);
        let distance = (dx * dx + dy * dy).sqrt();

        if distance > radius {
            *pixel = Rgba([0, 0, 0, 0]);
            continue;
        }
        if let Some(border) = border {
            let to_edge = (radius - distance)
                .min(cx)
                .min(width - cx)
                .min(cy)
                .min(height - cy);
            if to_edge < border.width as f32 {
                *pixel = Rgba(border.color);
            }
        }
    }
}

/// Applies processors in order, failing if any of them fails.
#[derive(Clone, Default)]
pub struct Composition {
    processors: Vec<Arc<dyn ImageProcessing>>,
}

impl Composition {
    pub fn new(processors: Vec<Arc<dyn ImageProcessing>>) -> Self {
        Self { processors }
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

impl ImageProcessing for Composition {
    fn process(&self, image: &DynamicImage) -> Option<DynamicImage> {
        self.processors
            .iter()
            .try_fold(image.clone(), |image, processor| processor.process(&image))
    }

    fn process_container(
        &self,
        container: &ImageContainer,
        context: &ImageProcessingContext,
    ) -> Option<ImageContainer> {
        self.processors
            .iter()
            .try_fold(container.clone(), |container, processor| {
                processor.process_container(&container, context)
            })
    }

    fn identifier(&self) -> String {
        self.processors
            .iter()
            .map(|processor| processor.identifier())
            .collect()
    }
}

impl fmt::Debug for Composition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Composition")
            .field("processors", &self.processors)
            .finish()
    }
}

type ProcessFn = dyn Fn(&DynamicImage) -> Option<DynamicImage> + Send + Sync;

/// Processor built from a closure. The caller vouches for the identifier.
#[derive(Clone)]
pub struct Anonymous {
    identifier: String,
    closure: Arc<ProcessFn>,
}

impl Anonymous {
    pub fn new(
        identifier: impl Into<String>,
        closure: impl Fn(&DynamicImage) -> Option<DynamicImage> + Send + Sync + 'static,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            closure: Arc::new(closure),
        }
    }
}

impl ImageProcessing for Anonymous {
    fn process(&self, image: &DynamicImage) -> Option<DynamicImage> {
        (self.closure)(image)
    }

    fn identifier(&self) -> String {
        self.identifier.clone()
    }
}

impl fmt::Debug for Anonymous {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Anonymous")
            .field("identifier", &self.identifier)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, Rgb, RgbImage};

    fn opaque(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([10, 20, 30])))
    }

    #[test]
    fn resize_fill_and_fit() {
        let image = opaque(400, 200);

        let fill = Resize::new(100, 100).process(&image).unwrap();
        assert_eq!(fill.dimensions(), (200, 100));

        let fit = Resize::new(100, 100)
            .with_content_mode(ContentMode::AspectFit)
            .process(&image)
            .unwrap();
        assert_eq!(fit.dimensions(), (100, 50));

        let cropped = Resize::new(100, 100).with_crop(true).process(&image).unwrap();
        assert_eq!(cropped.dimensions(), (100, 100));

        assert_eq!(Resize::width(40).process(&image).unwrap().dimensions(), (40, 20));
    }

    #[test]
    fn resize_does_not_upscale_by_default() {
        let image = opaque(50, 50);
        assert_eq!(Resize::new(100, 100).process(&image).unwrap().dimensions(), (50, 50));
        assert_eq!(
            Resize::new(100, 100)
                .with_upscale(true)
                .process(&image)
                .unwrap()
                .dimensions(),
            (100, 100)
        );
    }

    #[test]
    fn circle_clears_corners() {
        let circle = Circle::default().process(&opaque(30, 20)).unwrap().to_rgba8();
        assert_eq!(circle.dimensions(), (20, 20));
        assert_eq!(circle.get_pixel(0, 0)[3], 0);
        assert_eq!(circle.get_pixel(10, 10)[3], 255);
    }

    #[test]
    fn rounded_corners_paint_border() {
        let border = Border {
            color: [255, 0, 0, 255],
            width: 2,
        };
        let output = RoundedCorners {
            radius: 5,
            border: Some(border),
        }
        .process(&opaque(20, 20))
        .unwrap()
        .to_rgba8();

        assert_eq!(output.get_pixel(0, 0)[3], 0);
        assert_eq!(output.get_pixel(10, 0).0, [255, 0, 0, 255]);
        assert_eq!(output.get_pixel(10, 10).0, [10, 20, 30, 255]);
    }

    #[test]
    fn composition_applies_in_order_and_joins_identifiers() {
        let composition = Composition::new(vec![
            Arc::new(Resize::new(10, 10).with_crop(true)),
            Arc::new(Anonymous::new("fail-on-small", |image: &DynamicImage| {
                (image.width() > 10).then(|| image.clone())
            })),
        ]);
        assert!(composition.process(&opaque(40, 40)).is_none());
        assert_eq!(
            composition.identifier(),
            format!("{}fail-on-small", Resize::new(10, 10).with_crop(true).identifier())
        );
        assert_eq!(
            Composition::default().process(&opaque(3, 1)).unwrap().dimensions(),
            (3, 1)
        );
    }

    #[test]
    fn identifiers_distinguish_parameters() {
        assert_ne!(Resize::new(10, 10).identifier(), Resize::new(10, 20).identifier());
        assert_ne!(
            Circle::default().identifier(),
            Circle {
                border: Some(Border {
                    color: [0; 4],
                    width: 1
                })
            }
            .identifier()
        );
    }
}

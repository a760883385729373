//! RAW derivative codec.
//!
//! Nearly every RAW format carries one or more embedded JPEG previews. The
//! codec renders from the largest one that decodes, falling back to decoding
//! the source directly for plain image files, then applies the edit
//! adjustments on the CPU and resizes to the tier's bounding box.

use crate::error::CodecError;
use crate::pipeline::Codec;
use crate::state::{DerivativeKind, EditParams};
use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::{imageops::FilterType, DynamicImage, ImageFormat, RgbImage};
use tracing::{debug, trace};

const JPEG_START: [u8; 3] = [0xFF, 0xD8, 0xFF];
const JPEG_END: [u8; 2] = [0xFF, 0xD9];

/// Embedded JPEG candidates examined per source
const MAX_CANDIDATES: usize = 16;

pub const DEFAULT_QUALITY: u8 = 85;

/// Renders derivatives from RAW (or plain image) bytes.
#[derive(Debug, Clone, Copy)]
pub struct RawCodec {
    quality: u8,
}

impl Default for RawCodec {
    fn default() -> Self {
        Self {
            quality: DEFAULT_QUALITY,
        }
    }
}

impl RawCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// JPEG quality of the encoded derivative (1..=100)
    pub fn with_quality(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    /// Synchronous render; [`Codec::generate`] runs this on the blocking pool.
    pub fn render(
        &self,
        source: &[u8],
        edit: Option<&EditParams>,
        kind: DerivativeKind,
    ) -> Result<Vec<u8>, CodecError> {
        let img = decode_source(source)?;
        trace!(width = img.width(), height = img.height(), "decoded source");

        let max = kind.max_dimension();
        let img = if img.width() > max || img.height() > max {
            img.resize(max, max, FilterType::Lanczos3)
        } else {
            img
        };

        let mut rgb = img.to_rgb8();
        if let Some(edit) = edit.filter(|edit| !edit.is_unedited()) {
            apply_adjustments(&mut rgb, edit);
        }

        let mut encoded = Vec::new();
        let encoder = JpegEncoder::new_with_quality(&mut encoded, self.quality);
        DynamicImage::ImageRgb8(rgb)
            .write_with_encoder(encoder)
            .map_err(CodecError::Encode)?;

        debug!(
            tier = kind.tier_name(),
            source_kb = source.len() / 1024,
            output_kb = encoded.len() / 1024,
            "rendered derivative"
        );
        Ok(encoded)
    }
}

#[async_trait]
impl Codec for RawCodec {
    async fn generate(
        &self,
        source: Vec<u8>,
        edit: Option<EditParams>,
        kind: DerivativeKind,
    ) -> Result<Vec<u8>, CodecError> {
        let codec = *self;
        tokio::task::spawn_blocking(move || codec.render(&source, edit.as_ref(), kind))
            .await
            .map_err(|e| CodecError::Task(e.to_string()))?
    }
}

fn decode_source(source: &[u8]) -> Result<DynamicImage, CodecError> {
    if let Some(img) = largest_embedded_jpeg(source) {
        return Ok(img);
    }
    image::load_from_memory(source).map_err(|e| match e {
        image::ImageError::Unsupported(_) => CodecError::NoImageData(source.len()),
        e => CodecError::Decode(e),
    })
}

/// Decode the largest embedded JPEG that decodes cleanly.
fn largest_embedded_jpeg(data: &[u8]) -> Option<DynamicImage> {
    let mut candidates = find_embedded_jpegs(data);
    candidates.sort_by_key(|jpeg| std::cmp::Reverse(jpeg.len()));

    candidates.into_iter().find_map(|jpeg| {
        image::load_from_memory_with_format(jpeg, ImageFormat::Jpeg)
            .map_err(|e| trace!(size = jpeg.len(), error = %e, "skipping embedded JPEG"))
            .ok()
    })
}

/// Slices between SOI and the first following EOI marker.
fn find_embedded_jpegs(data: &[u8]) -> Vec<&[u8]> {
    let mut found = Vec::new();
    let mut offset = 0;

    while found.len() < MAX_CANDIDATES {
        let Some(start) = find(&data[offset..], &JPEG_START).map(|i| offset + i) else {
            break;
        };
        let body = start + JPEG_START.len();
        match find(&data[body..], &JPEG_END) {
            Some(end) => {
                let end = body + end + JPEG_END.len();
                found.push(&data[start..end]);
                offset = end;
            }
            None => break,
        }
    }

    found
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Tone and color adjustments in linear light, matching the editor's
/// preview order: exposure, highlights/shadows, contrast, levels, saturation,
/// white balance.
fn apply_adjustments(img: &mut RgbImage, edit: &EditParams) {
    let exposure = 2f32.powf(edit.exposure);
    let highlights = edit.highlights / 100.0;
    let shadows = edit.shadows / 100.0;
    let contrast = 1.0 + edit.contrast / 100.0;
    let black = edit.blacks / 400.0;
    let white = 1.0 + edit.whites / 400.0;
    let saturation = 1.0 + edit.saturation / 100.0;
    let warm = edit.temperature as f32 / 500.0;
    let tint = edit.tint as f32 / 500.0;
    let gain = [1.0 + warm + tint * 0.5, 1.0 - tint, 1.0 - warm + tint * 0.5];

    for pixel in img.pixels_mut() {
        let mut c = pixel.0.map(|v| (v as f32 / 255.0).powf(2.2));

        c = c.map(|v| v * exposure);

        let lum = luminance(c);
        let tone = (1.0 + lum * highlights) * (1.0 + (1.0 - lum) * shadows);
        c = c.map(|v| v * tone);

        c = c.map(|v| (v - 0.5) * contrast + 0.5);
        c = c.map(|v| (v - black) / (white - black + 0.0001));

        let lum = luminance(c);
        c = c.map(|v| lum + (v - lum) * saturation);

        for (v, g) in c.iter_mut().zip(gain) {
            *v *= g;
        }

        pixel.0 = c.map(|v| (v.max(0.0).powf(1.0 / 2.2).clamp(0.0, 1.0) * 255.0).round() as u8);
    }
}

fn luminance(c: [f32; 3]) -> f32 {
    0.2126 * c[0] + 0.7152 * c[1] + 0.0722 * c[2]
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, Rgb};
    use std::io::Cursor;

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 255 / width) as u8, (y * 255 / height) as u8, 96])
        })
    }

    fn encode(img: &RgbImage, format: ImageFormat) -> Vec<u8> {
        let mut bytes = Cursor::new(Vec::new());
        img.write_to(&mut bytes, format).unwrap();
        bytes.into_inner()
    }

    /// Fake RAW container: header junk, a small preview, sensor junk, a large preview.
    fn fake_raw() -> Vec<u8> {
        let mut raw = b"II*\0fake-raw-header".to_vec();
        raw.extend(encode(&gradient(64, 48), ImageFormat::Jpeg));
        raw.extend(vec![0x5A; 4096]);
        raw.extend(encode(&gradient(800, 600), ImageFormat::Jpeg));
        raw.extend(vec![0x00; 512]);
        raw
    }

    fn mean_brightness(jpeg: &[u8]) -> f64 {
        let img = image::load_from_memory(jpeg).unwrap().to_luma8();
        let total: f64 = img.pixels().map(|p| p.0[0] as f64).sum();
        total / (img.width() * img.height()) as f64
    }

    #[test]
    fn test_finds_every_embedded_jpeg() {
        let raw = fake_raw();
        assert_eq!(find_embedded_jpegs(&raw).len(), 2);
        assert!(find_embedded_jpegs(b"no markers here").is_empty());
    }

    #[test]
    fn test_renders_from_largest_preview() {
        let out = RawCodec::new()
            .render(&fake_raw(), None, DerivativeKind::Instant)
            .unwrap();

        let img = image::load_from_memory_with_format(&out, ImageFormat::Jpeg).unwrap();
        // 800x600 into a 384 box
        assert_eq!(img.dimensions(), (384, 288));
    }

    #[test]
    fn test_never_upscales() {
        let source = encode(&gradient(120, 80), ImageFormat::Jpeg);
        let out = RawCodec::new()
            .render(&source, None, DerivativeKind::Working)
            .unwrap();

        let img = image::load_from_memory(&out).unwrap();
        assert_eq!(img.dimensions(), (120, 80));
    }

    #[test]
    fn test_falls_back_to_plain_image_decode() {
        let source = encode(&gradient(512, 512), ImageFormat::Png);
        let out = RawCodec::new()
            .render(&source, None, DerivativeKind::Thumb)
            .unwrap();

        let img = image::load_from_memory(&out).unwrap();
        assert_eq!(img.dimensions(), (256, 256));
    }

    #[test]
    fn test_garbage_is_rejected() {
        let result = RawCodec::new().render(&[0x42; 2048], None, DerivativeKind::Thumb);
        assert!(matches!(result, Err(CodecError::NoImageData(2048))));
    }

    #[test]
    fn test_exposure_brightens() {
        let source = encode(&gradient(200, 200), ImageFormat::Png);
        let codec = RawCodec::new();
        let brighter = EditParams {
            exposure: 1.0,
            ..EditParams::default()
        };

        let plain = codec.render(&source, None, DerivativeKind::Thumb).unwrap();
        let edited = codec
            .render(&source, Some(&brighter), DerivativeKind::Thumb)
            .unwrap();

        assert!(mean_brightness(&edited) > mean_brightness(&plain) + 10.0);
    }

    #[test]
    fn test_full_desaturation_is_gray() {
        let mut img = RgbImage::from_pixel(4, 4, Rgb([200, 40, 40]));
        let edit = EditParams {
            saturation: -100.0,
            ..EditParams::default()
        };

        apply_adjustments(&mut img, &edit);

        let [r, g, b] = img.get_pixel(0, 0).0;
        assert!(r.abs_diff(g) <= 1 && g.abs_diff(b) <= 1, "got {r},{g},{b}");
    }

    #[tokio::test]
    async fn test_generate_runs_off_thread() {
        let out = RawCodec::with_quality(70)
            .generate(fake_raw(), None, DerivativeKind::Thumb)
            .await
            .unwrap();
        assert!(out.starts_with(&[0xFF, 0xD8]));
    }
}

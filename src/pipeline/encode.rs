//! Image encoding: extracted picture bytes → base64 data URI.
//!
//! DashScope accepts images inline as `data:<mime>;base64,...` URIs in the
//! `image` field of a message part. PNG and JPEG are forwarded untouched when
//! they are small enough, so the model sees exactly what the report author
//! embedded. Anything else the `image` crate can decode is re-encoded as PNG;
//! vector formats such as EMF/WMF cannot be rasterised here and are skipped
//! by the caller.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{imageops::FilterType, DynamicImage, ImageFormat};
use std::io::Cursor;
use tracing::debug;

/// Encode one image for the model request.
///
/// ## Why downscale?
/// A 6000 × 4000 px photo of a chromatogram costs thousands of image tokens
/// and can exceed the request size limit, while the model reads it just as
/// well at 2000 px on the long side.
pub fn encode_image(bytes: &[u8], max_pixels: u32) -> Result<String, image::ImageError> {
    let format = image::guess_format(bytes)?;
    let passthrough = matches!(format, ImageFormat::Png | ImageFormat::Jpeg);

    if passthrough {
        let (w, h) = image::ImageReader::with_format(Cursor::new(bytes), format).into_dimensions()?;
        if w <= max_pixels && h <= max_pixels {
            return Ok(data_uri(bytes, format.to_mime_type()));
        }
    }

    let img = image::load_from_memory_with_format(bytes, format)?;
    let img = downscale(img, max_pixels);
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
    debug!(
        "Re-encoded {:?} image → {}×{} PNG, {} bytes",
        format,
        img.width(),
        img.height(),
        buf.len()
    );
    Ok(data_uri(&buf, "image/png"))
}

fn downscale(img: DynamicImage, max_pixels: u32) -> DynamicImage {
    if img.width() <= max_pixels && img.height() <= max_pixels {
        img
    } else {
        img.resize(max_pixels, max_pixels, FilterType::Triangle)
    }
}

fn data_uri(bytes: &[u8], mime: &str) -> String {
    format!("data:{mime};base64,{}", STANDARD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn encoded(w: u32, h: u32, format: ImageFormat) -> Vec<u8> {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(w, h, Rgba([255, 0, 0, 255])));
        let img = if format == ImageFormat::Jpeg {
            DynamicImage::ImageRgb8(img.to_rgb8())
        } else {
            img
        };
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), format).unwrap();
        buf
    }

    fn decode_uri(uri: &str) -> (String, Vec<u8>) {
        let rest = uri.strip_prefix("data:").unwrap();
        let (mime, b64) = rest.split_once(";base64,").unwrap();
        (mime.to_string(), STANDARD.decode(b64).unwrap())
    }

    #[test]
    fn small_png_passes_through() {
        let png = encoded(10, 10, ImageFormat::Png);
        let (mime, bytes) = decode_uri(&encode_image(&png, 2000).unwrap());
        assert_eq!(mime, "image/png");
        assert_eq!(bytes, png);
    }

    #[test]
    fn small_jpeg_keeps_its_mime() {
        let jpg = encoded(8, 8, ImageFormat::Jpeg);
        let (mime, _) = decode_uri(&encode_image(&jpg, 2000).unwrap());
        assert_eq!(mime, "image/jpeg");
    }

    #[test]
    fn large_image_is_downscaled_to_png() {
        let png = encoded(400, 100, ImageFormat::Png);
        let (mime, bytes) = decode_uri(&encode_image(&png, 200).unwrap());
        assert_eq!(mime, "image/png");
        let img = image::load_from_memory(&bytes).unwrap();
        assert_eq!((img.width(), img.height()), (200, 50));
    }

    #[test]
    fn gif_is_reencoded_as_png() {
        let gif = encoded(4, 4, ImageFormat::Gif);
        let (mime, _) = decode_uri(&encode_image(&gif, 2000).unwrap());
        assert_eq!(mime, "image/png");
    }

    #[test]
    fn unknown_format_is_an_error() {
        // EMF header bytes: not decodable by the image crate.
        let emf = [0x01u8, 0x00, 0x00, 0x00, 0x6c, 0x00, 0x00, 0x00];
        assert!(encode_image(&emf, 2000).is_err());
    }
}

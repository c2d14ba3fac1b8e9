//! Image payload encoding for cross-context transport.

use crate::message::{ImagePayload, PayloadKind};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::DynamicImage;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("No image data provided")]
    Missing,

    #[error("Unsupported payload type: {0}")]
    Unsupported(String),

    #[error("Malformed data URL")]
    InvalidDataUrl,

    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Image decode failed: {0}")]
    Image(#[from] image::ImageError),
}

/// `data:<mime>;base64,<payload>`
pub fn encode_data_url(mime: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", mime, STANDARD.encode(bytes))
}

/// Split a data URL into its mime type and decoded bytes.
///
/// Only base64 data URLs are accepted.
pub fn decode_data_url(data_url: &str) -> Result<(String, Vec<u8>), PayloadError> {
    let rest = data_url.strip_prefix("data:").ok_or(PayloadError::InvalidDataUrl)?;
    let (meta, body) = rest.split_once(',').ok_or(PayloadError::InvalidDataUrl)?;
    let mime = meta.strip_suffix(";base64").ok_or(PayloadError::InvalidDataUrl)?;
    let mime = if mime.is_empty() { "text/plain" } else { mime };
    Ok((mime.to_string(), STANDARD.decode(body.trim())?))
}

impl ImagePayload {
    /// Raw image bytes carried by the payload.
    pub fn image_bytes(&self) -> Result<Vec<u8>, PayloadError> {
        let data = self.data.as_deref().ok_or(PayloadError::Missing)?;
        match self.kind.unwrap_or(PayloadKind::Base64) {
            PayloadKind::Base64 if data.starts_with("data:") => Ok(decode_data_url(data)?.1),
            PayloadKind::Base64 => Ok(STANDARD.decode(data.trim())?),
            PayloadKind::Blob => Err(PayloadError::Unsupported("blob".to_string())),
        }
    }

    /// Decode the carried image into pixels.
    pub fn decode_image(&self) -> Result<DynamicImage, PayloadError> {
        let bytes = self.image_bytes()?;
        Ok(image::load_from_memory(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbaImage};
    use orange_config::Sensitivity;
    use std::io::Cursor;

    fn png_bytes() -> Vec<u8> {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 3, image::Rgba([200, 10, 10, 255])));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_data_url_roundtrip() {
        let url = encode_data_url("image/png", b"hello");
        assert!(url.starts_with("data:image/png;base64,"));

        let (mime, bytes) = decode_data_url(&url).unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(bytes, b"hello");
    }

    #[test]
    fn test_rejects_non_base64_data_url() {
        assert!(matches!(
            decode_data_url("data:text/plain,hello"),
            Err(PayloadError::InvalidDataUrl)
        ));
        assert!(matches!(decode_data_url("https://x"), Err(PayloadError::InvalidDataUrl)));
    }

    #[test]
    fn test_decode_image_from_payload() {
        let payload = ImagePayload::new(None, Sensitivity::Balanced)
            .with_base64(encode_data_url("image/png", &png_bytes()));

        let image = payload.decode_image().unwrap();
        assert_eq!((image.width(), image.height()), (4, 3));
    }

    #[test]
    fn test_missing_and_blob_payloads() {
        let payload = ImagePayload::new(Some("https://a/b.png".into()), Sensitivity::Balanced);
        assert!(matches!(payload.decode_image(), Err(PayloadError::Missing)));

        let mut blob = payload.with_base64("AAAA".into());
        blob.kind = Some(PayloadKind::Blob);
        assert!(matches!(blob.decode_image(), Err(PayloadError::Unsupported(_))));
    }
}

//! Converting page images to `data:` URLs.

use base64::{Engine as _, prelude::BASE64_STANDARD};
use tokio::fs;

use crate::prelude::*;

/// Image types the OCR backend accepts. Anything else is sent as PNG, which
/// matches what the backend itself falls back to.
const ACCEPTED_MIME_TYPES: &[&str] = &["image/png", "image/jpeg", "image/webp"];

/// Convert binary data to a `data:` URL.
///
/// Some sources indicate that the Base64 data should be percent-encoded, but
/// in practice this breaks Gemini and probably several other models.
pub fn data_url(mime_type: &str, data: &[u8]) -> String {
    let base64_data = BASE64_STANDARD.encode(data);
    format!("data:{};base64,{}", mime_type, base64_data)
}

/// Guess the MIME type we should declare for a page image.
pub fn page_mime_type(path: &Path) -> &'static str {
    let guessed = mime_guess::from_path(path).first_or_octet_stream();
    ACCEPTED_MIME_TYPES
        .iter()
        .find(|&&accepted| accepted == guessed.essence_str())
        .copied()
        .unwrap_or("image/png")
}

/// Read a page image from disk and encode it as a `data:` URL.
pub async fn page_data_url(path: &Path) -> Result<String> {
    let data = fs::read(path)
        .await
        .with_context(|| format!("failed to read page image {:?}", path))?;
    Ok(data_url(page_mime_type(path), &data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_url() {
        assert_eq!(
            data_url("image/png", b"abc"),
            "data:image/png;base64,YWJj"
        );
    }

    #[test]
    fn test_page_mime_type() {
        assert_eq!(page_mime_type(Path::new("scan.jpg")), "image/jpeg");
        assert_eq!(page_mime_type(Path::new("scan.webp")), "image/webp");
        // Types the backend rejects fall back to PNG.
        assert_eq!(page_mime_type(Path::new("scan.tiff")), "image/png");
        assert_eq!(page_mime_type(Path::new("scan")), "image/png");
    }
}

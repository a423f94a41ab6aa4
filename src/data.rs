use anyhow::{Context, Result, anyhow};
use image::ImageFormat;
use std::io::Cursor;
use std::path::Path;
use tracing::debug;

pub const PNG_MIME: &str = "image/png";
pub const JPEG_MIME: &str = "image/jpeg";

/// File extensions treated as comic pages in folder mode.
pub const PAGE_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "bmp", "tiff", "webp"];

/// Encodings the LLM backends and the SVG rasterizer both decode as-is.
const PORTABLE_MIMES: [&str; 4] = [PNG_MIME, JPEG_MIME, "image/webp", "image/gif"];

/// Raw image bytes plus the mime type used when shipping them to a service.
#[derive(Debug, Clone)]
pub struct DataAttachment {
    pub bytes: Vec<u8>,
    pub mime: String,
    pub name: Option<String>,
}

impl DataAttachment {
    pub fn png(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            mime: PNG_MIME.to_string(),
            name: None,
        }
    }
}

/// Reads a page image. BMP, TIFF and other encodings outside
/// [`PORTABLE_MIMES`] are decoded and handed out as PNG.
pub fn load_image_attachment(path: &Path) -> Result<DataAttachment> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read image: {}", path.display()))?;
    let mime = detect_image_mime(&bytes, path)?;
    let name = path
        .file_name()
        .and_then(|value| value.to_str())
        .map(|value| value.to_string());
    if PORTABLE_MIMES.contains(&mime.as_str()) {
        return Ok(DataAttachment { bytes, mime, name });
    }
    let page = image::load_from_memory(&bytes)
        .with_context(|| format!("failed to decode {} ({})", path.display(), mime))?;
    let mut png = Vec::new();
    page.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .with_context(|| format!("failed to re-encode {} as PNG", path.display()))?;
    debug!("transcoded {} from {} to PNG", path.display(), mime);
    Ok(DataAttachment {
        name,
        ..DataAttachment::png(png)
    })
}

fn detect_image_mime(bytes: &[u8], path: &Path) -> Result<String> {
    if let Some(kind) = infer::get(bytes) {
        let detected = kind.mime_type();
        if detected.starts_with("image/") {
            return Ok(detected.to_string());
        }
        return Err(anyhow!(
            "{} is not an image (detected '{}')",
            path.display(),
            detected
        ));
    }
    extension_lower(path)
        .as_deref()
        .and_then(mime_from_extension)
        .map(|mime| mime.to_string())
        .ok_or_else(|| anyhow!("unable to detect image type for '{}'", path.display()))
}

/// Case-insensitive match against configured extensions, with or without
/// the leading dot.
pub fn has_extension(path: &Path, extensions: &[String]) -> bool {
    extension_lower(path)
        .map(|ext| {
            extensions
                .iter()
                .any(|candidate| candidate.trim_start_matches('.').eq_ignore_ascii_case(&ext))
        })
        .unwrap_or(false)
}

fn extension_lower(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_lowercase())
}

fn mime_from_extension(ext: &str) -> Option<&'static str> {
    match ext {
        "png" => Some(PNG_MIME),
        "jpg" | "jpeg" => Some(JPEG_MIME),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "bmp" => Some("image/bmp"),
        "tiff" | "tif" => Some("image/tiff"),
        _ => None,
    }
}

/// Output encoding picked from the destination file name, PNG when unknown.
pub fn image_format_for_path(path: &Path) -> ImageFormat {
    ImageFormat::from_path(path).unwrap_or(ImageFormat::Png)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_png() -> Vec<u8> {
        let image = image::RgbImage::from_pixel(2, 2, image::Rgb([255, 255, 255]));
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .expect("encode png");
        bytes
    }

    #[test]
    fn sniffs_png_regardless_of_extension() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("page.jpg");
        std::fs::write(&path, tiny_png()).expect("write");
        let attachment = load_image_attachment(&path).expect("load");
        assert_eq!(attachment.mime, PNG_MIME);
        assert_eq!(attachment.name.as_deref(), Some("page.jpg"));
    }

    #[test]
    fn rejects_non_images() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("notes.bin");
        std::fs::write(&path, b"plain words").expect("write");
        assert!(load_image_attachment(&path).is_err());
    }

    #[test]
    fn bmp_and_tiff_pages_are_shipped_as_png() {
        let dir = tempfile::tempdir().expect("tempdir");
        let page = image::RgbImage::from_pixel(3, 2, image::Rgb([10, 20, 30]));
        for (file, format) in [("p1.bmp", ImageFormat::Bmp), ("p2.tiff", ImageFormat::Tiff)] {
            let path = dir.path().join(file);
            page.save_with_format(&path, format).expect("save");
            let attachment = load_image_attachment(&path).expect("load");
            assert_eq!(attachment.mime, PNG_MIME);
            assert_eq!(attachment.name.as_deref(), Some(file));
            let decoded =
                image::load_from_memory_with_format(&attachment.bytes, ImageFormat::Png)
                    .expect("png");
            assert_eq!(decoded.to_rgb8().get_pixel(2, 1), &image::Rgb([10, 20, 30]));
        }
    }

    #[test]
    fn configured_extensions_ignore_dots_and_case() {
        let extensions = vec![".JPG".to_string(), "png".to_string()];
        assert!(has_extension(Path::new("p/01.jpg"), &extensions));
        assert!(has_extension(Path::new("p/02.PNG"), &extensions));
        assert!(!has_extension(Path::new("p/03.webp"), &extensions));
    }
}

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use image::{DynamicImage, GenericImageView, ImageFormat, Rgb, RgbImage};
use imageproc::geometric_transformations::{Interpolation, rotate};
use serde::Deserialize;
use serde_json::json;
use std::io::Cursor;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

use super::{AdapterFuture, TextExtractor};
use crate::error::{StageError, StageResult};
use crate::records::{BBox, ExtractedText, TextBox};

pub const DEFAULT_ROTATION_THRESHOLD: f32 = 5.0;
/// Any tilt above this is reported as rotated, even when the crop was not.
const ROTATED_FLAG_THRESHOLD: f32 = 0.1;

/// OCR served over HTTP, one request per box crop.
///
/// Request: `{"image": <base64 png>, "vertical": bool}`. Response:
/// `{"text": "..."}`.
#[derive(Debug, Clone)]
pub struct HttpOcr {
    client: reqwest::Client,
    endpoint: String,
    rotation_threshold: f32,
}

#[derive(Debug, Deserialize)]
struct OcrResponse {
    #[serde(default)]
    text: String,
}

impl HttpOcr {
    pub fn new(endpoint: impl Into<String>, rotation_threshold: f32) -> StageResult<Self> {
        let endpoint = endpoint.into();
        if endpoint.trim().is_empty() {
            return Err(StageError::Unavailable(
                "OCR endpoint is not configured".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|err| StageError::Unavailable(format!("OCR client: {}", err)))?;
        Ok(Self {
            client,
            endpoint,
            rotation_threshold,
        })
    }

    async fn recognize(&self, crop: &DynamicImage, vertical: bool) -> StageResult<String> {
        let mut bytes = Vec::new();
        crop.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
        let body = json!({
            "image": BASE64.encode(&bytes),
            "vertical": vertical,
        });
        let response = self.client.post(&self.endpoint).json(&body).send().await?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(StageError::Transport(format!(
                "OCR service error ({}): {}",
                status, text
            )));
        }
        let parsed: OcrResponse = serde_json::from_str(&text)?;
        Ok(parsed.text.trim().to_string())
    }

    async fn run(&self, image: &Path, boxes: &[TextBox]) -> StageResult<Vec<ExtractedText>> {
        let page = image::open(image)?;
        let mut extracted = Vec::with_capacity(boxes.len());
        for text_box in boxes {
            let crop = crop_box(&page, text_box, self.rotation_threshold);
            let text = match self.recognize(&crop, text_box.vertical).await {
                Ok(text) => text,
                Err(err) => {
                    warn!("OCR failed for box {}: {}", text_box.index, err);
                    continue;
                }
            };
            if text.is_empty() {
                debug!("box {} produced no text", text_box.index);
                continue;
            }
            extracted.push(extracted_record(text_box, text));
        }
        Ok(extracted)
    }
}

impl TextExtractor for HttpOcr {
    fn extract<'a>(
        &'a self,
        image: &'a Path,
        boxes: &'a [TextBox],
    ) -> AdapterFuture<'a, Vec<ExtractedText>> {
        Box::pin(self.run(image, boxes))
    }
}

pub(crate) fn extracted_record(text_box: &TextBox, text: String) -> ExtractedText {
    ExtractedText {
        box_index: text_box.index,
        bbox: text_box.bbox,
        rendered_bbox: text_box.bbox,
        text,
        angle: text_box.angle,
        vertical: text_box.vertical,
        was_rotated: text_box.angle.abs() > ROTATED_FLAG_THRESHOLD,
    }
}

/// Pixel region to OCR: the xyxy corners when present, else the xywh box,
/// clamped to the page and at least one pixel wide and tall.
pub(crate) fn crop_region(text_box: &TextBox, width: u32, height: u32) -> BBox {
    let (x1, y1, x2, y2) = match text_box.xyxy {
        Some(corners) => (corners.x1, corners.y1, corners.x2, corners.y2),
        None => (
            text_box.bbox.x,
            text_box.bbox.y,
            text_box.bbox.right(),
            text_box.bbox.bottom(),
        ),
    };
    let x1 = x1.min(width.saturating_sub(1));
    let y1 = y1.min(height.saturating_sub(1));
    let x2 = x2.clamp(x1 + 1, width.max(x1 + 1));
    let y2 = y2.clamp(y1 + 1, height.max(y1 + 1));
    BBox::new(x1, y1, x2 - x1, y2 - y1)
}

pub(crate) fn crop_box(page: &DynamicImage, text_box: &TextBox, threshold: f32) -> DynamicImage {
    let (width, height) = page.dimensions();
    let region = crop_region(text_box, width, height);
    if text_box.angle.abs() <= threshold {
        return page.crop_imm(region.x, region.y, region.w, region.h);
    }
    DynamicImage::ImageRgb8(deskew_region(&page.to_rgb8(), region, text_box.angle))
}

/// Cuts a window around `region` large enough to hold it at any angle,
/// rotates the window upright about the region centre and crops the region
/// back out.
fn deskew_region(page: &RgbImage, region: BBox, angle_deg: f32) -> RgbImage {
    let (page_w, page_h) = page.dimensions();
    let diagonal = ((region.w as f32).powi(2) + (region.h as f32).powi(2)).sqrt();
    let pad_x = ((diagonal - region.w as f32) / 2.0).ceil().max(0.0) as u32;
    let pad_y = ((diagonal - region.h as f32) / 2.0).ceil().max(0.0) as u32;
    let win_x = region.x.saturating_sub(pad_x);
    let win_y = region.y.saturating_sub(pad_y);
    let win_w = (region.right() + pad_x).min(page_w) - win_x;
    let win_h = (region.bottom() + pad_y).min(page_h) - win_y;
    let window = image::imageops::crop_imm(page, win_x, win_y, win_w, win_h).to_image();

    let (cx, cy) = region.center();
    let center = (cx - win_x as f32, cy - win_y as f32);
    let upright = rotate(
        &window,
        center,
        -angle_deg.to_radians(),
        Interpolation::Bilinear,
        Rgb([255, 255, 255]),
    );
    let left = (region.x - win_x).min(win_w.saturating_sub(1));
    let top = (region.y - win_y).min(win_h.saturating_sub(1));
    let w = region.w.min(win_w - left).max(1);
    let h = region.h.min(win_h - top).max(1);
    image::imageops::crop_imm(&upright, left, top, w, h).to_image()
}

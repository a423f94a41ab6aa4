use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::json;
use std::cmp::Reverse;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use super::{AdapterFuture, TextDetector};
use crate::data;
use crate::error::{StageError, StageResult};
use crate::records::{Corners, DetectionOutput, ImageSize, TextBox};

pub const DEFAULT_MIN_BOX_SIZE: u32 = 5;

/// Text-region detection served over HTTP.
///
/// Request: `{"image": <base64>, "mime": "...", "name": "..."}`.
/// Response: `{"blocks": [{"xyxy": [x1, y1, x2, y2], "angle", "vertical",
/// "font_size", "lines"}], "image_size": {"width", "height"}}`.
#[derive(Debug, Clone)]
pub struct HttpDetector {
    client: reqwest::Client,
    endpoint: String,
    min_box_size: u32,
}

impl HttpDetector {
    pub fn new(endpoint: impl Into<String>, min_box_size: u32) -> StageResult<Self> {
        let endpoint = endpoint.into();
        if endpoint.trim().is_empty() {
            return Err(StageError::Unavailable(
                "detection endpoint is not configured".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|err| StageError::Unavailable(format!("detection client: {}", err)))?;
        Ok(Self {
            client,
            endpoint,
            min_box_size,
        })
    }

    async fn call(&self, image: &Path) -> StageResult<DetectionOutput> {
        let attachment = data::load_image_attachment(image)?;
        let body = json!({
            "image": BASE64.encode(&attachment.bytes),
            "mime": attachment.mime,
            "name": attachment.name,
        });
        let response = self.client.post(&self.endpoint).json(&body).send().await?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(StageError::Transport(format!(
                "detection service error ({}): {}",
                status, text
            )));
        }
        let raw: RawDetection = serde_json::from_str(&text)?;
        let image_size = match raw.image_size {
            Some(size) => size,
            None => {
                let (width, height) = image::image_dimensions(image)?;
                ImageSize { width, height }
            }
        };
        let boxes = boxes_from_blocks(raw.blocks, self.min_box_size);
        debug!(
            "detected {} boxes in {}",
            boxes.len(),
            image.display()
        );
        Ok(DetectionOutput { boxes, image_size })
    }
}

impl TextDetector for HttpDetector {
    fn detect<'a>(&'a self, image: &'a Path) -> AdapterFuture<'a, DetectionOutput> {
        Box::pin(self.call(image))
    }
}

#[derive(Debug, Deserialize)]
struct RawDetection {
    #[serde(default)]
    blocks: Vec<RawBlock>,
    image_size: Option<ImageSize>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RawBlock {
    xyxy: [f64; 4],
    #[serde(default)]
    angle: f64,
    #[serde(default)]
    vertical: bool,
    font_size: Option<f64>,
    #[serde(default)]
    lines: Vec<Vec<[f64; 2]>>,
}

/// Converts raw blocks to boxes: origin clamped at zero, undersized boxes
/// dropped, sorted top-to-bottom then right-to-left, indexed in that order.
pub(crate) fn boxes_from_blocks(blocks: Vec<RawBlock>, min_box_size: u32) -> Vec<TextBox> {
    let mut boxes = blocks
        .into_iter()
        .filter_map(|block| {
            let [x1, y1, x2, y2] = block.xyxy.map(|value| value.max(0.0).round() as u32);
            let corners = Corners::new(x1, y1, x2, y2);
            let bbox = corners.to_bbox();
            if bbox.w < min_box_size || bbox.h < min_box_size {
                return None;
            }
            Some(TextBox {
                index: 0,
                bbox,
                xyxy: Some(corners),
                angle: block.angle as f32,
                vertical: block.vertical,
                font_size: block.font_size.map(|size| size as f32),
                polylines: block
                    .lines
                    .into_iter()
                    .map(|line| {
                        line.into_iter()
                            .map(|[x, y]| [x as f32, y as f32])
                            .collect()
                    })
                    .collect(),
            })
        })
        .collect::<Vec<_>>();
    boxes.sort_by_key(|text_box| (text_box.bbox.y, Reverse(text_box.bbox.x)));
    for (index, text_box) in boxes.iter_mut().enumerate() {
        text_box.index = index;
    }
    boxes
}

use serde::{Deserialize, Serialize};

/// Pixel box as (left, top, width, height). Serialized as `[x, y, w, h]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "[u32; 4]", into = "[u32; 4]")]
pub struct BBox {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl BBox {
    pub fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    pub fn center(&self) -> (f32, f32) {
        (
            self.x as f32 + self.w as f32 / 2.0,
            self.y as f32 + self.h as f32 / 2.0,
        )
    }

    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.w)
    }

    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.h)
    }
}

impl From<[u32; 4]> for BBox {
    fn from(value: [u32; 4]) -> Self {
        Self::new(value[0], value[1], value[2], value[3])
    }
}

impl From<BBox> for [u32; 4] {
    fn from(value: BBox) -> Self {
        [value.x, value.y, value.w, value.h]
    }
}

/// Pixel corners as (left, top, right, bottom). Serialized as `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[u32; 4]", into = "[u32; 4]")]
pub struct Corners {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl Corners {
    pub fn new(x1: u32, y1: u32, x2: u32, y2: u32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn to_bbox(&self) -> BBox {
        BBox::new(
            self.x1,
            self.y1,
            self.x2.saturating_sub(self.x1),
            self.y2.saturating_sub(self.y1),
        )
    }
}

impl From<[u32; 4]> for Corners {
    fn from(value: [u32; 4]) -> Self {
        Self::new(value[0], value[1], value[2], value[3])
    }
}

impl From<Corners> for [u32; 4] {
    fn from(value: Corners) -> Self {
        [value.x1, value.y1, value.x2, value.y2]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextDirection {
    #[default]
    Horizontal,
    Vertical,
}

impl TextDirection {
    pub fn from_vertical(vertical: bool) -> Self {
        if vertical {
            TextDirection::Vertical
        } else {
            TextDirection::Horizontal
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TextDirection::Horizontal => "horizontal",
            TextDirection::Vertical => "vertical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BubbleType {
    #[default]
    PureWhite,
    Textured,
    Transparent,
}

impl BubbleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BubbleType::PureWhite => "pure_white",
            BubbleType::Textured => "textured",
            BubbleType::Transparent => "transparent",
        }
    }
}

pub const DEFAULT_FONT_SIZE: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

/// One detected text region. Never mutated after detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBox {
    pub index: usize,
    pub bbox: BBox,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xyxy: Option<Corners>,
    #[serde(default)]
    pub angle: f32,
    #[serde(default)]
    pub vertical: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_size: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub polylines: Vec<Vec<[f32; 2]>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionOutput {
    pub boxes: Vec<TextBox>,
    pub image_size: ImageSize,
}

/// OCR result for one box. Boxes with empty text never become one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedText {
    pub box_index: usize,
    pub bbox: BBox,
    pub rendered_bbox: BBox,
    pub text: String,
    #[serde(default)]
    pub angle: f32,
    #[serde(default)]
    pub vertical: bool,
    #[serde(default)]
    pub was_rotated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReorderedText {
    pub original_index: usize,
    pub new_order: usize,
    pub bbox: BBox,
    pub text: String,
}

/// Final per-box record handed to the renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslatedText {
    pub original_index: usize,
    pub new_order: usize,
    pub original: String,
    pub translated: String,
    pub bbox: BBox,
    pub rendered_bbox: BBox,
    #[serde(default)]
    pub angle: f32,
    #[serde(default)]
    pub was_rotated: bool,
    #[serde(default)]
    pub text_direction: TextDirection,
    #[serde(default)]
    pub bubble_type: BubbleType,
    #[serde(default = "default_font_size")]
    pub estimated_font_size: u32,
}

impl TranslatedText {
    pub fn is_untranslated(&self) -> bool {
        self.original == self.translated
    }
}

fn default_font_size() -> u32 {
    DEFAULT_FONT_SIZE
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub original: String,
    pub translated: String,
}

impl From<&TranslatedText> for HistoryEntry {
    fn from(value: &TranslatedText) -> Self {
        Self {
            original: value.original.clone(),
            translated: value.translated.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bbox_serializes_as_array() {
        let value = serde_json::to_value(BBox::new(1, 2, 30, 40)).expect("serialize");
        assert_eq!(value, json!([1, 2, 30, 40]));
    }

    #[test]
    fn corners_convert_to_bbox() {
        let bbox = Corners::new(10, 20, 50, 25).to_bbox();
        assert_eq!(bbox, BBox::new(10, 20, 40, 5));
        assert_eq!(Corners::new(10, 20, 5, 5).to_bbox().w, 0);
    }

    #[test]
    fn translated_text_fills_defaults() {
        let record: TranslatedText = serde_json::from_value(json!({
            "original_index": 2,
            "new_order": 0,
            "original": "おはよう",
            "translated": "早安",
            "bbox": [0, 0, 10, 10],
            "rendered_bbox": [0, 0, 10, 10]
        }))
        .expect("deserialize");
        assert_eq!(record.text_direction, TextDirection::Horizontal);
        assert_eq!(record.bubble_type, BubbleType::PureWhite);
        assert_eq!(record.estimated_font_size, DEFAULT_FONT_SIZE);
        assert!(!record.is_untranslated());
    }

    #[test]
    fn enums_use_wire_names() {
        assert_eq!(
            serde_json::to_value(BubbleType::PureWhite).expect("serialize"),
            json!("pure_white")
        );
        assert_eq!(
            serde_json::to_value(TextDirection::Vertical).expect("serialize"),
            json!("vertical")
        );
    }
}

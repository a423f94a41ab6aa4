use anyhow::{Context, Result, anyhow};
use std::path::Path;
use std::sync::Arc;
use ttf_parser::{Face, name_id};
use usvg::fontdb;

/// Families tried in order when no font is configured.
pub(crate) const CJK_FALLBACK_FAMILIES: [&str; 5] = [
    "Noto Sans CJK TC",
    "Noto Sans TC",
    "Microsoft JhengHei",
    "PingFang TC",
    "sans-serif",
];

/// Advance widths of one face, used to wrap horizontal text.
#[derive(Clone)]
pub(crate) struct FontMetrics {
    data: Arc<Vec<u8>>,
    face_index: u32,
    units_per_em: u16,
    space_advance: u16,
    family: Option<String>,
}

impl std::fmt::Debug for FontMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FontMetrics")
            .field("family", &self.family)
            .field("face_index", &self.face_index)
            .field("units_per_em", &self.units_per_em)
            .finish()
    }
}

impl FontMetrics {
    pub(crate) fn family(&self) -> Option<&str> {
        self.family.as_deref()
    }

    pub(crate) fn data(&self) -> &[u8] {
        self.data.as_ref()
    }

    fn from_data(data: Vec<u8>, preferred_family: Option<&str>) -> Result<Self> {
        let data = Arc::new(data);
        let count = ttf_parser::fonts_in_collection(&data).unwrap_or(1);
        let mut first = None;
        for index in 0..count {
            let Ok(face) = Face::parse(&data, index) else {
                continue;
            };
            let units_per_em = face.units_per_em().max(1);
            let metrics = FontMetrics {
                data: Arc::clone(&data),
                face_index: index,
                units_per_em,
                space_advance: face
                    .glyph_index(' ')
                    .and_then(|id| face.glyph_hor_advance(id))
                    .unwrap_or(units_per_em / 2),
                family: family_name(&face),
            };
            match (preferred_family, metrics.family()) {
                (Some(preferred), Some(found)) if found.eq_ignore_ascii_case(preferred) => {
                    return Ok(metrics);
                }
                _ => {}
            }
            if first.is_none() {
                first = Some(metrics);
            }
        }
        first.ok_or_else(|| anyhow!("no usable face in font data"))
    }

    /// Width of `text` in pixels at `font_size`; newlines are ignored.
    pub(crate) fn text_width(&self, text: &str, font_size: f32) -> f32 {
        let Ok(face) = Face::parse(&self.data, self.face_index) else {
            return estimated_text_width(text, font_size);
        };
        let units = text
            .chars()
            .filter(|ch| *ch != '\n')
            .map(|ch| {
                face.glyph_index(ch)
                    .and_then(|glyph| face.glyph_hor_advance(glyph))
                    .unwrap_or(self.space_advance) as u32
            })
            .fold(0u32, u32::saturating_add);
        units as f32 * font_size / self.units_per_em as f32
    }
}

pub(crate) fn text_width_px(text: &str, font_size: f32, font: Option<&FontMetrics>) -> f32 {
    match font {
        Some(font) => font.text_width(text, font_size),
        None => estimated_text_width(text, font_size),
    }
}

fn estimated_text_width(text: &str, font_size: f32) -> f32 {
    text.chars().map(char_width_units).sum::<f32>() * font_size
}

fn char_width_units(ch: char) -> f32 {
    if ch.is_whitespace() {
        0.25
    } else if ch.is_ascii_alphanumeric() {
        0.55
    } else if ch.is_ascii() {
        0.35
    } else {
        1.0
    }
}

/// Loads `font_path` when given, otherwise the first installed family out of
/// `family` and the CJK fallbacks.
pub(crate) fn resolve_font(font_path: Option<&Path>, family: Option<&str>) -> Result<FontMetrics> {
    if let Some(path) = font_path {
        let data = std::fs::read(path)
            .with_context(|| format!("failed to read font: {}", path.display()))?;
        return FontMetrics::from_data(data, family)
            .with_context(|| format!("failed to parse font: {}", path.display()));
    }
    let mut db = fontdb::Database::new();
    db.load_system_fonts();
    family
        .into_iter()
        .chain(CJK_FALLBACK_FAMILIES)
        .find_map(|candidate| load_family(&db, candidate).ok())
        .ok_or_else(|| anyhow!("no CJK capable font found"))
}

fn load_family(db: &fontdb::Database, family: &str) -> Result<FontMetrics> {
    let families = if family.eq_ignore_ascii_case("sans-serif") {
        vec![fontdb::Family::SansSerif]
    } else {
        vec![fontdb::Family::Name(family)]
    };
    let query = fontdb::Query {
        families: &families,
        ..Default::default()
    };
    let id = db
        .query(&query)
        .ok_or_else(|| anyhow!("font not found: {}", family))?;
    let data = db
        .with_face_data(id, |data, _| data.to_vec())
        .ok_or_else(|| anyhow!("failed to load font data: {}", family))?;
    FontMetrics::from_data(data, Some(family))
}

fn family_name(face: &Face<'_>) -> Option<String> {
    let mut fallback = None;
    for name in face.names() {
        if name.name_id == name_id::TYPOGRAPHIC_FAMILY {
            if let Some(value) = name.to_string() {
                return Some(value);
            }
        } else if name.name_id == name_id::FAMILY && fallback.is_none() {
            fallback = name.to_string();
        }
    }
    fallback
}

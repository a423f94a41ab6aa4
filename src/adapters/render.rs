use anyhow::{Context, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use image::ImageFormat;
use serde::Serialize;
use std::fmt;
use std::fmt::Write as _;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tiny_skia::Pixmap;
use tracing::{debug, warn};
use usvg::{Options, Tree, fontdb};

use super::Renderer;
use super::font::{self, FontMetrics};
use crate::data::{self, PNG_MIME};
use crate::error::StageResult;
use crate::records::{BBox, BubbleType, TextDirection, TranslatedText};
use crate::storage;

const MAX_FONT_SIZE: u32 = 60;
const MIN_FONT_SIZE: u32 = 16;
const LINE_GAP_RATIO: f32 = 0.4;
const COLUMN_RATIO: f32 = 1.2;
const TEXTURED_FILL_OPACITY: f32 = 0.85;

/// Colours and font for the translated overlay.
#[derive(Debug, Clone)]
pub struct OverlayStyle {
    pub text_color: String,
    pub stroke_color: String,
    pub font_family: Option<String>,
    font: Option<FontMetrics>,
}

impl Default for OverlayStyle {
    fn default() -> Self {
        Self {
            text_color: "#000000".to_string(),
            stroke_color: "#ffffff".to_string(),
            font_family: None,
            font: None,
        }
    }
}

impl OverlayStyle {
    /// Resolves the font up front; a missing font degrades to estimated
    /// metrics and the rasterizer's default family.
    pub fn resolve(
        font_path: Option<&Path>,
        font_family: Option<&str>,
        text_color: &str,
        stroke_color: &str,
    ) -> Self {
        let font = match font::resolve_font(font_path, font_family) {
            Ok(font) => Some(font),
            Err(err) => {
                warn!("overlay font unavailable, using estimated metrics: {}", err);
                None
            }
        };
        let font_family = font
            .as_ref()
            .and_then(|font| font.family().map(|name| name.to_string()))
            .or_else(|| font_family.map(|name| name.to_string()));
        Self {
            text_color: text_color.to_string(),
            stroke_color: stroke_color.to_string(),
            font_family,
            font,
        }
    }
}

/// Draws translated text over the page and writes a JSON sidecar next to
/// the output image.
#[derive(Clone)]
pub struct OverlayRenderer {
    style: OverlayStyle,
    fontdb: Arc<fontdb::Database>,
}

#[derive(Debug, Serialize)]
struct RenderSidecar<'a> {
    input_file: String,
    output_file: String,
    translated_texts: &'a [TranslatedText],
    timestamp: String,
}

impl OverlayRenderer {
    /// Scans system fonts once; every page rendered afterwards shares the
    /// same database.
    pub fn new(style: OverlayStyle) -> Self {
        let mut db = fontdb::Database::new();
        db.load_system_fonts();
        if let Some(font) = style.font.as_ref() {
            db.load_font_data(font.data().to_vec());
        }
        debug!("overlay font database holds {} faces", db.len());
        Self {
            style,
            fontdb: Arc::new(db),
        }
    }

    pub fn style(&self) -> &OverlayStyle {
        &self.style
    }
}

impl Default for OverlayRenderer {
    fn default() -> Self {
        Self::new(OverlayStyle::default())
    }
}

impl fmt::Debug for OverlayRenderer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverlayRenderer")
            .field("style", &self.style)
            .field("font_faces", &self.fontdb.len())
            .finish()
    }
}

impl Renderer for OverlayRenderer {
    fn render(
        &self,
        image: &Path,
        records: &[TranslatedText],
        output: &Path,
    ) -> StageResult<PathBuf> {
        let page = image::open(image)?;
        let (width, height) = (page.width(), page.height());
        let mut page_png = Vec::new();
        page.write_to(&mut Cursor::new(&mut page_png), ImageFormat::Png)?;
        let svg = build_overlay_svg(&page_png, width, height, records, &self.style);
        let bytes = rasterize(&svg, data::image_format_for_path(output), &self.fontdb)?;
        storage::write_bytes_atomic(output, &bytes)?;

        let sidecar = RenderSidecar {
            input_file: image.display().to_string(),
            output_file: output.display().to_string(),
            translated_texts: records,
            timestamp: storage::now_rfc3339(),
        };
        storage::write_json_atomic(&sidecar_path(output), &sidecar)?;
        debug!("rendered {} -> {}", image.display(), output.display());
        Ok(output.to_path_buf())
    }
}

/// `<output>.json`, keeping the image extension in the name.
pub fn sidecar_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(".json");
    PathBuf::from(name)
}

/// `page_png` must be PNG encoded; the rasterizer only sees it through a
/// data URI.
pub(crate) fn build_overlay_svg(
    page_png: &[u8],
    width: u32,
    height: u32,
    records: &[TranslatedText],
    style: &OverlayStyle,
) -> String {
    let data_uri = format!("data:{};base64,{}", PNG_MIME, BASE64.encode(page_png));
    let mut svg = String::new();
    let _ = write!(
        svg,
        r#"<svg xmlns="http://www.w3.org/2000/svg" xmlns:xlink="http://www.w3.org/1999/xlink" width="{w}" height="{h}" viewBox="0 0 {w} {h}">"#,
        w = width,
        h = height
    );
    let _ = write!(
        svg,
        r#"<image href="{uri}" xlink:href="{uri}" x="0" y="0" width="{w}" height="{h}" preserveAspectRatio="none"/>"#,
        uri = data_uri,
        w = width,
        h = height
    );
    for record in records {
        if record.is_untranslated() || record.translated.trim().is_empty() {
            continue;
        }
        let area = clamp_to_page(record.rendered_bbox, width, height);
        if area.w == 0 || area.h == 0 {
            continue;
        }
        svg.push_str(&record_svg(record, area, style));
    }
    svg.push_str("</svg>");
    svg
}

fn clamp_to_page(bbox: BBox, width: u32, height: u32) -> BBox {
    let x = bbox.x.min(width.saturating_sub(1));
    let y = bbox.y.min(height.saturating_sub(1));
    BBox::new(x, y, bbox.w.min(width - x), bbox.h.min(height - y))
}

fn record_svg(record: &TranslatedText, area: BBox, style: &OverlayStyle) -> String {
    let text = prepare_text(&record.translated, record.text_direction);
    let min_size = record.estimated_font_size.clamp(1, MIN_FONT_SIZE);
    let mut group = String::new();
    if record.was_rotated {
        let (cx, cy) = area.center();
        let _ = write!(
            group,
            r#"<g transform="rotate({} {} {})">"#,
            record.angle, cx, cy
        );
    } else {
        group.push_str("<g>");
    }
    match record.bubble_type {
        BubbleType::PureWhite => {
            let _ = write!(
                group,
                r##"<rect x="{}" y="{}" width="{}" height="{}" fill="#ffffff"/>"##,
                area.x, area.y, area.w, area.h
            );
        }
        BubbleType::Textured => {
            let _ = write!(
                group,
                r##"<rect x="{}" y="{}" width="{}" height="{}" fill="#ffffff" fill-opacity="{}"/>"##,
                area.x, area.y, area.w, area.h, TEXTURED_FILL_OPACITY
            );
        }
        BubbleType::Transparent => {}
    }

    let glyphs = match record.text_direction {
        TextDirection::Horizontal => {
            let layout = layout_horizontal(&text, area, min_size, style.font.as_ref());
            horizontal_glyphs(&layout, area)
        }
        TextDirection::Vertical => {
            let layout = layout_vertical(&text, area, min_size);
            vertical_glyphs(&layout, area)
        }
    };
    let font_size = glyphs.font_size;
    let _ = write!(
        group,
        r#"<text font-size="{}" fill="{}""#,
        font_size,
        escape_xml(&style.text_color)
    );
    if let Some(family) = style.font_family.as_deref() {
        let _ = write!(group, r#" font-family="{}""#, escape_xml(family));
    }
    if record.bubble_type == BubbleType::Transparent {
        let _ = write!(
            group,
            r#" stroke="{}" stroke-width="{}" stroke-linejoin="round" paint-order="stroke""#,
            escape_xml(&style.stroke_color),
            (font_size as f32 * 0.15).max(1.0)
        );
    }
    group.push('>');
    for (x, y, run) in &glyphs.spans {
        let _ = write!(
            group,
            r#"<tspan x="{}" y="{}">{}</tspan>"#,
            x,
            y,
            escape_xml(run)
        );
    }
    group.push_str("</text></g>");
    group
}

struct GlyphSpans {
    font_size: u32,
    spans: Vec<(f32, f32, String)>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct HorizontalLayout {
    pub font_size: u32,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct VerticalLayout {
    pub font_size: u32,
    pub columns: Vec<Vec<char>>,
}

/// Largest size from 60 down to `min_size` whose wrapped lines, with a 40%
/// line gap, fit the box height.
pub(crate) fn layout_horizontal(
    text: &str,
    area: BBox,
    min_size: u32,
    font: Option<&FontMetrics>,
) -> HorizontalLayout {
    let max_width = area.w as f32 * 0.9;
    let mut size = MAX_FONT_SIZE;
    loop {
        let lines = wrap_to_width(text, max_width, size as f32, font);
        let rows = lines.len() as f32;
        let needed = rows * size as f32 + (rows - 1.0).max(0.0) * size as f32 * LINE_GAP_RATIO;
        if needed <= area.h as f32 || size <= min_size {
            return HorizontalLayout {
                font_size: size,
                lines,
            };
        }
        size = size.saturating_sub(2).max(min_size);
    }
}

/// Largest size whose right-to-left columns fit the box width.
pub(crate) fn layout_vertical(text: &str, area: BBox, min_size: u32) -> VerticalLayout {
    let chars = text.chars().filter(|ch| !ch.is_whitespace()).collect::<Vec<_>>();
    let mut size = MAX_FONT_SIZE;
    loop {
        let per_column = ((area.h as f32 / (size as f32 * COLUMN_RATIO)).floor() as usize).max(1);
        let columns = chars
            .chunks(per_column)
            .map(|column| column.to_vec())
            .collect::<Vec<_>>();
        let needed = columns.len() as f32 * size as f32 * COLUMN_RATIO;
        if needed <= area.w as f32 || size <= min_size {
            return VerticalLayout {
                font_size: size,
                columns,
            };
        }
        size = size.saturating_sub(2).max(min_size);
    }
}

fn wrap_to_width(text: &str, max_width: f32, size: f32, font: Option<&FontMetrics>) -> Vec<String> {
    let mut lines = Vec::new();
    for paragraph in text.lines() {
        let mut current = String::new();
        for ch in paragraph.chars() {
            current.push(ch);
            if current.chars().count() > 1 && font::text_width_px(&current, size, font) > max_width
            {
                current.pop();
                lines.push(std::mem::take(&mut current));
                current.push(ch);
            }
        }
        if !current.is_empty() {
            lines.push(current);
        }
    }
    if lines.is_empty() {
        lines.push(text.trim().to_string());
    }
    lines
}

fn horizontal_glyphs(layout: &HorizontalLayout, area: BBox) -> GlyphSpans {
    let size = layout.font_size as f32;
    let step = size * (1.0 + LINE_GAP_RATIO);
    let block = layout.lines.len() as f32 * step - size * LINE_GAP_RATIO;
    let top = area.y as f32 + ((area.h as f32 - block) / 2.0).max(0.0);
    let left = area.x as f32 + area.w as f32 * 0.05;
    let spans = layout
        .lines
        .iter()
        .enumerate()
        .map(|(row, line)| (left, top + size + row as f32 * step, line.clone()))
        .collect();
    GlyphSpans {
        font_size: layout.font_size,
        spans,
    }
}

fn vertical_glyphs(layout: &VerticalLayout, area: BBox) -> GlyphSpans {
    let size = layout.font_size as f32;
    let count = layout.columns.len().max(1) as f32;
    let spacing = if count > 1.0 {
        (area.w as f32 / count).max(size)
    } else {
        area.w as f32
    };
    let right = area.x as f32 + area.w as f32;
    let mut spans = Vec::new();
    for (index, column) in layout.columns.iter().enumerate() {
        let x = (right - (index as f32 + 1.0) * spacing + (spacing - size) / 2.0)
            .clamp(area.x as f32, (right - size).max(area.x as f32));
        for (row, ch) in column.iter().enumerate() {
            let y = area.y as f32 + (row as f32 + 1.0) * size;
            spans.push((x, y, ch.to_string()));
        }
    }
    GlyphSpans {
        font_size: layout.font_size,
        spans,
    }
}

/// Normalizes ellipses to `……` and, for vertical text, swaps horizontal
/// marks for their vertical forms.
pub(crate) fn prepare_text(text: &str, direction: TextDirection) -> String {
    let normalized = normalize_ellipsis(text.trim());
    match direction {
        TextDirection::Horizontal => normalized,
        TextDirection::Vertical => normalized
            .replace("……", "⋮⋮")
            .replace('…', "⋮")
            .replace("ーーー", "│")
            .replace("ーー", "│")
            .replace("──", "│")
            .replace("——", "│")
            .replace(['ー', '—', '─', '－'], "│"),
    }
}

fn normalize_ellipsis(text: &str) -> String {
    let chars = text.chars().collect::<Vec<_>>();
    let mut out = String::with_capacity(text.len());
    let mut index = 0;
    while index < chars.len() {
        let ch = chars[index];
        let run = chars[index..].iter().take_while(|next| **next == ch).count();
        let is_dots = match ch {
            '.' | '．' | '。' | '·' => run >= 2 && (ch != '·' || run >= 3),
            '…' => true,
            _ => false,
        };
        if is_dots {
            out.push_str("……");
        } else {
            out.extend(std::iter::repeat_n(ch, run));
        }
        index += run;
    }
    out
}

fn rasterize(
    svg: &str,
    format: ImageFormat,
    fontdb: &Arc<fontdb::Database>,
) -> anyhow::Result<Vec<u8>> {
    let options = Options {
        fontdb: Arc::clone(fontdb),
        ..Options::default()
    };
    let tree = Tree::from_str(svg, &options).with_context(|| "failed to parse overlay SVG")?;
    let size = tree.size().to_int_size();
    let mut pixmap =
        Pixmap::new(size.width(), size.height()).ok_or_else(|| anyhow!("empty SVG size"))?;
    resvg::render(&tree, tiny_skia::Transform::identity(), &mut pixmap.as_mut());
    let rgba = image::RgbaImage::from_raw(size.width(), size.height(), pixmap.data().to_vec())
        .ok_or_else(|| anyhow!("failed to build image buffer from SVG"))?;
    let page = image::DynamicImage::ImageRgba8(rgba);
    let page = match format {
        ImageFormat::Jpeg | ImageFormat::Bmp => image::DynamicImage::ImageRgb8(page.to_rgb8()),
        _ => page,
    };
    let mut bytes = Vec::new();
    page.write_to(&mut Cursor::new(&mut bytes), format)
        .with_context(|| format!("failed to encode {:?} output", format))?;
    Ok(bytes)
}

fn escape_xml(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(translated: &str, direction: TextDirection, bubble: BubbleType) -> TranslatedText {
        TranslatedText {
            original_index: 0,
            new_order: 0,
            original: "こんにちは".to_string(),
            translated: translated.to_string(),
            bbox: BBox::new(10, 10, 80, 120),
            rendered_bbox: BBox::new(10, 10, 80, 120),
            angle: 0.0,
            was_rotated: false,
            text_direction: direction,
            bubble_type: bubble,
            estimated_font_size: 16,
        }
    }

    #[test]
    fn skips_untranslated_records() {
        let mut same = record("こんにちは", TextDirection::Horizontal, BubbleType::PureWhite);
        same.translated = same.original.clone();
        let svg = build_overlay_svg(b"png", 200, 200, &[same], &OverlayStyle::default());
        assert!(!svg.contains("<rect"));
        assert!(!svg.contains("<text"));
    }

    #[test]
    fn background_follows_bubble_type() {
        let style = OverlayStyle::default();
        let textured = build_overlay_svg(
            b"png",
            200,
            200,
            &[record("你好", TextDirection::Horizontal, BubbleType::Textured)],
            &style,
        );
        assert!(textured.contains("fill-opacity=\"0.85\""));
        let transparent = build_overlay_svg(
            b"png",
            200,
            200,
            &[record("你好", TextDirection::Horizontal, BubbleType::Transparent)],
            &style,
        );
        assert!(!transparent.contains("<rect"));
        assert!(transparent.contains("paint-order=\"stroke\""));
    }

    #[test]
    fn rotated_records_are_wrapped_in_a_transform() {
        let mut tilted = record("你好", TextDirection::Horizontal, BubbleType::PureWhite);
        tilted.angle = 12.5;
        tilted.was_rotated = true;
        let svg = build_overlay_svg(b"png", 200, 200, &[tilted], &OverlayStyle::default());
        assert!(svg.contains("rotate(12.5 50 70)"));
    }

    #[test]
    fn vertical_columns_run_right_to_left() {
        let layout = layout_vertical("一二三四五六", BBox::new(0, 0, 100, 60), 16);
        assert_eq!(layout.font_size, 24);
        assert_eq!(layout.columns.len(), 3);
        let glyphs = vertical_glyphs(&layout, BBox::new(0, 0, 100, 60));
        let first_x = glyphs.spans[0].0;
        let last_x = glyphs.spans[glyphs.spans.len() - 1].0;
        assert!(first_x > last_x);
        assert_eq!(glyphs.spans[0].2, "一");
    }

    #[test]
    fn horizontal_layout_shrinks_until_it_fits() {
        let layout = layout_horizontal("你好世界", BBox::new(0, 0, 100, 40), 16, None);
        assert_eq!(layout.font_size, 22);
        assert_eq!(layout.lines, vec!["你好世界".to_string()]);
        let tiny = layout_horizontal("你好世界你好世界", BBox::new(0, 0, 20, 10), 12, None);
        assert_eq!(tiny.font_size, 12);
    }

    #[test]
    fn vertical_text_uses_vertical_marks() {
        assert_eq!(prepare_text("待って...", TextDirection::Horizontal), "待って……");
        assert_eq!(prepare_text("等等…", TextDirection::Vertical), "等等⋮⋮");
        assert_eq!(prepare_text("ちょっとーー", TextDirection::Vertical), "ちょっと│");
        assert_eq!(prepare_text("a.b", TextDirection::Horizontal), "a.b");
    }

    #[test]
    fn bmp_and_tiff_pages_keep_their_pixels() {
        let dir = tempfile::tempdir().expect("tempdir");
        let page = image::RgbImage::from_pixel(20, 20, image::Rgb([200, 0, 0]));
        let renderer = OverlayRenderer::default();
        for (file, format) in [
            ("page.png", ImageFormat::Png),
            ("page.bmp", ImageFormat::Bmp),
            ("page.tiff", ImageFormat::Tiff),
        ] {
            let input = dir.path().join(file);
            page.save_with_format(&input, format).expect("save page");
            let output = dir.path().join(format!("translated_{}.png", file));
            renderer.render(&input, &[], &output).expect("render");
            let rendered = image::open(&output).expect("open output").to_rgba8();
            assert_eq!(rendered.dimensions(), (20, 20), "{}", file);
            assert_eq!(
                rendered.get_pixel(10, 10),
                &image::Rgba([200, 0, 0, 255]),
                "{}",
                file
            );
            assert!(sidecar_path(&output).exists());
        }
    }

    #[test]
    fn sidecar_keeps_image_extension() {
        assert_eq!(
            sidecar_path(Path::new("out/translated_p1.png")),
            PathBuf::from("out/translated_p1.png.json")
        );
    }
}

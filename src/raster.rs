use crate::error::{CertError, Result};
use crate::font::{FontBook, LoadedFont, layout_glyphs};
use crate::readiness::StageResources;
use crate::render::{Node, NodeKind, TextStyle, VisualTree};
use crate::template::TextAlign;
use crate::types::{Color, Size};
use image::{RgbImage, RgbaImage};
use sha2::{Digest, Sha256};
use tiny_skia::{
    FillRule, FilterQuality, Paint, Path, PathBuilder, Pixmap, PixmapPaint, Transform,
};
use ttf_parser::{GlyphId, OutlineBuilder};

/// A captured bitmap: straight (non-premultiplied) RGBA rows, top to bottom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureResult {
    size: Size,
    scale: u32,
    rgba: Vec<u8>,
}

impl CaptureResult {
    pub fn new(size: Size, scale: u32, rgba: Vec<u8>) -> Result<Self> {
        let expected = size.width as usize * size.height as usize * 4;
        if rgba.len() != expected {
            return Err(CertError::InvalidConfiguration(format!(
                "capture buffer holds {} bytes, {}x{} needs {expected}",
                rgba.len(),
                size.width,
                size.height
            )));
        }
        Ok(Self { size, scale, rgba })
    }

    pub fn empty(scale: u32) -> Self {
        Self {
            size: Size::new(0, 0),
            scale,
            rgba: Vec::new(),
        }
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    pub fn is_empty(&self) -> bool {
        self.size.is_empty()
    }

    pub fn rgba(&self) -> &[u8] {
        &self.rgba
    }

    /// RGBA pixel at (x, y), if inside the bitmap.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.size.width || y >= self.size.height {
            return None;
        }
        let at = (y as usize * self.size.width as usize + x as usize) * 4;
        let px = self.rgba.get(at..at + 4)?;
        Some([px[0], px[1], px[2], px[3]])
    }

    /// Packed RGB with alpha composited over white.
    pub fn to_rgb_on_white(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.rgba.len() / 4 * 3);
        for px in self.rgba.chunks_exact(4) {
            let a = px[3] as u16;
            for c in &px[..3] {
                let v = (*c as u16 * a + 255 * (255 - a) + 127) / 255;
                out.push(v as u8);
            }
        }
        out
    }

    pub fn to_rgb_image(&self) -> Option<RgbImage> {
        RgbImage::from_raw(self.size.width, self.size.height, self.to_rgb_on_white())
    }

    pub fn to_rgba_image(&self) -> Option<RgbaImage> {
        RgbaImage::from_raw(self.size.width, self.size.height, self.rgba.clone())
    }

    pub fn encode_png(&self) -> Result<Vec<u8>> {
        let img = self.to_rgba_image().ok_or(CertError::EmptyCapture)?;
        let mut bytes = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .map_err(|e| CertError::Encode(format!("png encode failed: {e}")))?;
        Ok(bytes)
    }

    /// Hex SHA-256 of the dimensions and pixels.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.size.width.to_be_bytes());
        hasher.update(self.size.height.to_be_bytes());
        hasher.update(&self.rgba);
        let digest = hasher.finalize();
        let mut out = String::with_capacity(digest.len() * 2);
        for b in digest {
            use std::fmt::Write;
            let _ = write!(&mut out, "{:02x}", b);
        }
        out
    }
}

/// Paints a laid-out tree at `scale` pixels per authored pixel.
///
/// Reads the tree only. Output dimensions are the tree size times `scale`.
pub fn capture(
    tree: &VisualTree,
    resources: &StageResources,
    fonts: &FontBook,
    scale: u32,
) -> Result<CaptureResult> {
    if scale == 0 {
        return Err(CertError::InvalidConfiguration(
            "capture scale must be at least 1".to_string(),
        ));
    }
    let out = tree.size().scaled(scale);
    if out.is_empty() {
        return Ok(CaptureResult::empty(scale));
    }
    let mut pixmap = Pixmap::new(out.width, out.height).ok_or_else(|| {
        CertError::InvalidConfiguration(format!(
            "cannot allocate a {}x{} capture",
            out.width, out.height
        ))
    })?;
    pixmap.fill(tiny_skia::Color::WHITE);

    let s = scale as f32;
    let base = Transform::from_scale(s, s);
    let size = tree.size();

    if let Some(background) = resources.background() {
        draw_cover(&mut pixmap, background, size, base);
    }

    let mut missing_fonts = 0usize;
    for (handle, node) in tree.nodes() {
        match node.kind() {
            NodeKind::Background { .. } => {}
            NodeKind::Image { .. } => {
                if let Some(img) = resources.image(handle) {
                    draw_image(&mut pixmap, img, node, base);
                }
            }
            NodeKind::Text { style, .. } => {
                if !draw_text(&mut pixmap, node, style, fonts, base) {
                    missing_fonts += 1;
                }
            }
        }
    }
    if missing_fonts > 0 {
        log::debug!("{missing_fonts} text element(s) painted without a registered font");
    }

    Ok(CaptureResult {
        size: out,
        scale,
        rgba: unpremultiply(pixmap.data()),
    })
}

// CSS `background-size: cover` centered on the stage.
fn draw_cover(pixmap: &mut Pixmap, image: &Pixmap, stage: Size, base: Transform) {
    let (iw, ih) = (image.width() as f32, image.height() as f32);
    if iw <= 0.0 || ih <= 0.0 {
        return;
    }
    let k = (stage.width as f32 / iw).max(stage.height as f32 / ih);
    let ox = (stage.width as f32 - iw * k) / 2.0;
    let oy = (stage.height as f32 - ih * k) / 2.0;
    let placement = Transform::from_row(k, 0.0, 0.0, k, ox, oy);
    pixmap.draw_pixmap(0, 0, image.as_ref(), &image_paint(), base.pre_concat(placement), None);
}

fn draw_image(pixmap: &mut Pixmap, image: &Pixmap, node: &Node, base: Transform) {
    let (iw, ih) = (image.width() as f32, image.height() as f32);
    if iw <= 0.0 || ih <= 0.0 || node.height() <= 0.0 {
        return;
    }
    let sx = node.width() as f32 / iw;
    let sy = node.height() / ih;
    let placement = Transform::from_row(sx, 0.0, 0.0, sy, node.left() as f32, node.top() as f32);
    pixmap.draw_pixmap(0, 0, image.as_ref(), &image_paint(), base.pre_concat(placement), None);
}

fn image_paint() -> PixmapPaint {
    PixmapPaint {
        quality: FilterQuality::Bilinear,
        ..PixmapPaint::default()
    }
}

/// Returns false when the node's font role has no usable font.
fn draw_text(
    pixmap: &mut Pixmap,
    node: &Node,
    style: &TextStyle,
    fonts: &FontBook,
    base: Transform,
) -> bool {
    let Some(font) = fonts.font(style.font_role) else {
        return node.lines().is_empty();
    };
    let paint = fill_paint(style.color);
    let size = style.font_size;
    let line_h = size * style.line_height;
    let (ascent, descent) = fonts.vertical_metrics(style.font_role, size);
    let half_leading = (line_h - (ascent + descent)) / 2.0;

    for (i, line) in node.lines().iter().enumerate() {
        let (placements, advance) = layout_glyphs(&font.data, line, size, fonts.shape_text());
        let x = match style.align {
            TextAlign::Left => node.left() as f32,
            TextAlign::Center => node.left() as f32 + (node.width() as f32 - advance) / 2.0,
        };
        let baseline = node.top() as f32 + i as f32 * line_h + half_leading + ascent;
        fill_glyphs(pixmap, font, &placements, x, baseline, &paint, base);
    }
    true
}

fn fill_glyphs(
    pixmap: &mut Pixmap,
    font: &LoadedFont,
    placements: &[crate::font::GlyphPlacement],
    x: f32,
    baseline: f32,
    paint: &Paint<'_>,
    base: Transform,
) {
    let Ok(face) = ttf_parser::Face::parse(&font.data, 0) else {
        return;
    };
    for placement in placements {
        let mut builder = GlyphPathBuilder::new(
            x + placement.dx,
            baseline - placement.dy,
            placement.scale,
        );
        if face
            .outline_glyph(GlyphId(placement.glyph_id), &mut builder)
            .is_none()
        {
            continue;
        }
        let Some(path) = builder.finish() else {
            continue;
        };
        pixmap.fill_path(&path, paint, FillRule::Winding, base, None);
    }
}

fn fill_paint(color: Color) -> Paint<'static> {
    let mut paint = Paint::default();
    paint.set_color(
        tiny_skia::Color::from_rgba(
            color.r.clamp(0.0, 1.0),
            color.g.clamp(0.0, 1.0),
            color.b.clamp(0.0, 1.0),
            1.0,
        )
        .unwrap_or(tiny_skia::Color::BLACK),
    );
    paint.anti_alias = true;
    paint
}

fn unpremultiply(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for px in data.chunks_exact(4) {
        let a = px[3];
        if a == 0 {
            out.extend_from_slice(&[0, 0, 0, 0]);
        } else if a == 255 {
            out.extend_from_slice(px);
        } else {
            for c in &px[..3] {
                out.push(((*c as u16 * 255 + a as u16 / 2) / a as u16).min(255) as u8);
            }
            out.push(a);
        }
    }
    out
}

// Font units are y-up; the stage is y-down.
struct GlyphPathBuilder {
    builder: PathBuilder,
    origin_x: f32,
    origin_y: f32,
    scale: f32,
}

impl GlyphPathBuilder {
    fn new(origin_x: f32, origin_y: f32, scale: f32) -> Self {
        Self {
            builder: PathBuilder::new(),
            origin_x,
            origin_y,
            scale,
        }
    }

    fn finish(self) -> Option<Path> {
        self.builder.finish()
    }

    fn x(&self, x: f32) -> f32 {
        self.origin_x + x * self.scale
    }

    fn y(&self, y: f32) -> f32 {
        self.origin_y - y * self.scale
    }
}

impl OutlineBuilder for GlyphPathBuilder {
    fn move_to(&mut self, x: f32, y: f32) {
        let (x, y) = (self.x(x), self.y(y));
        self.builder.move_to(x, y);
    }

    fn line_to(&mut self, x: f32, y: f32) {
        let (x, y) = (self.x(x), self.y(y));
        self.builder.line_to(x, y);
    }

    fn quad_to(&mut self, x1: f32, y1: f32, x: f32, y: f32) {
        let (x1, y1, x, y) = (self.x(x1), self.y(y1), self.x(x), self.y(y));
        self.builder.quad_to(x1, y1, x, y);
    }

    fn curve_to(&mut self, x1: f32, y1: f32, x2: f32, y2: f32, x: f32, y: f32) {
        let (x1, y1) = (self.x(x1), self.y(y1));
        let (x2, y2) = (self.x(x2), self.y(y2));
        let (x, y) = (self.x(x), self.y(y));
        self.builder.cubic_to(x1, y1, x2, y2, x, y);
    }

    fn close(&mut self) {
        self.builder.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::png_data_uri;
    use crate::assets::tests::png_bytes;
    use crate::font::tests::dejavu_book;
    use crate::layout::layout;
    use crate::readiness::ResourceGate;
    use crate::record::FieldValueRecord;
    use crate::render::render;
    use crate::offsets::{OffsetMap, OriginalPositions, apply_offsets};
    use crate::template::{FIELD_RECIPIENT_NAME, FieldContent, TemplateLayout, builtin_template};

    fn record() -> FieldValueRecord {
        FieldValueRecord::from_pairs([
            ("organization", "Acme"),
            ("programName", "Excellence Award"),
            ("achievementText", "For outstanding work"),
            ("recipientName", "Jane Doe"),
            ("certificateDate", "Awarded January 2025"),
        ])
    }

    fn ready_tree(template: &TemplateLayout) -> (VisualTree, StageResources) {
        let fonts = FontBook::new();
        let mut tree = render(&record(), template, &OffsetMap::default()).unwrap();
        let resources = ResourceGate::new().await_ready(&tree, &fonts);
        layout(&mut tree, &fonts, &resources);
        (tree, resources)
    }

    #[test]
    fn output_dimensions_are_template_times_scale() {
        let template = builtin_template("pak").unwrap();
        let (tree, resources) = ready_tree(&template);
        let shot = capture(&tree, &resources, &FontBook::new(), 2).unwrap();
        assert_eq!(shot.size(), Size::new(1600, 1280));
        assert_eq!(shot.rgba().len(), 1600 * 1280 * 4);
        // broken background degrades to white
        assert_eq!(shot.pixel(5, 5), Some([255, 255, 255, 255]));
    }

    #[test]
    fn zero_scale_is_rejected() {
        let template = builtin_template("pak").unwrap();
        let (tree, resources) = ready_tree(&template);
        assert!(matches!(
            capture(&tree, &resources, &FontBook::new(), 0),
            Err(CertError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn background_covers_the_whole_stage() {
        let mut template = builtin_template("pak").unwrap();
        // 2:1 source on a 5:4 stage is cropped left and right, never letterboxed.
        template.background = Some(png_data_uri(&png_bytes(20, 10, [200, 0, 0, 255])));
        let (tree, resources) = ready_tree(&template);
        let shot = capture(&tree, &resources, &FontBook::new(), 1).unwrap();
        assert_eq!(shot.pixel(0, 0), Some([200, 0, 0, 255]));
        assert_eq!(shot.pixel(799, 639), Some([200, 0, 0, 255]));
    }

    #[test]
    fn image_elements_follow_their_applied_top() {
        let mut template = builtin_template("pak").unwrap();
        let uri = png_data_uri(&png_bytes(30, 3, [0, 0, 255, 255]));
        for field in &mut template.fields {
            if let FieldContent::Image { source, .. } = &mut field.content {
                *source = uri.clone();
            }
        }
        let (tree, resources) = ready_tree(&template);
        let signature = tree.field("signature").unwrap();
        // 300px wide at a 10:1 ratio
        assert_eq!(signature.height(), 30.0);
        let shot = capture(&tree, &resources, &FontBook::new(), 1).unwrap();
        assert_eq!(shot.pixel(472, 455), Some([0, 0, 255, 255]));
        assert_eq!(shot.pixel(472, 435), Some([255, 255, 255, 255]));
    }

    #[test]
    fn capture_does_not_touch_the_tree() {
        let template = builtin_template("pak").unwrap();
        let (tree, resources) = ready_tree(&template);
        let before = tree.clone();
        let first = capture(&tree, &resources, &FontBook::new(), 1).unwrap();
        let second = capture(&tree, &resources, &FontBook::new(), 1).unwrap();
        assert_eq!(tree, before);
        assert_eq!(first.fingerprint(), second.fingerprint());
    }

    fn recipient_only(fonts: &FontBook) -> (VisualTree, StageResources) {
        let mut template = builtin_template("pak").unwrap();
        template.background = None;
        template.fields.retain(|field| field.key == FIELD_RECIPIENT_NAME);
        template.fields[0].flow_after = None;
        let mut tree = render(&record(), &template, &OffsetMap::default()).unwrap();
        let resources = ResourceGate::new().await_ready(&tree, fonts);
        layout(&mut tree, fonts, &resources);
        (tree, resources)
    }

    /// Inclusive (x0, y0, x1, y1) of every pixel darker than near-white.
    fn ink_bounds(shot: &CaptureResult) -> Option<(u32, u32, u32, u32)> {
        let mut bounds: Option<(u32, u32, u32, u32)> = None;
        for y in 0..shot.size().height {
            for x in 0..shot.size().width {
                let [r, g, b, _] = shot.pixel(x, y).unwrap();
                if r.min(g).min(b) >= 250 {
                    continue;
                }
                bounds = Some(match bounds {
                    None => (x, y, x, y),
                    Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
                });
            }
        }
        bounds
    }

    #[test]
    fn text_is_inked_inside_its_line_box_and_centered() {
        let fonts = dejavu_book(true);
        let (tree, resources) = recipient_only(&fonts);
        let name = tree.field(FIELD_RECIPIENT_NAME).unwrap();
        assert_eq!(name.lines(), ["JANE DOE"]);
        let top = name.top() as u32;
        let bottom = top + name.height().ceil() as u32;

        let shot = capture(&tree, &resources, &fonts, 1).unwrap();
        let (x0, y0, x1, y1) = ink_bounds(&shot).unwrap();
        assert!(y0 >= top && y1 < bottom, "ink rows {y0}..={y1}, box {top}..{bottom}");
        // full cap height, upright
        assert!(y1 - y0 > 15, "ink rows {y0}..={y1}");
        let center = (x0 + x1) as f32 / 2.0;
        let box_center = name.left() as f32 + name.width() as f32 / 2.0;
        assert!((center - box_center).abs() <= 4.0, "ink centered at {center}");

        let blank = capture(&tree, &resources, &FontBook::new(), 1).unwrap();
        assert_eq!(ink_bounds(&blank), None);
    }

    #[test]
    fn offsets_move_text_ink_by_exactly_the_delta() {
        let fonts = dejavu_book(true);
        let (mut tree, resources) = recipient_only(&fonts);
        let before = ink_bounds(&capture(&tree, &resources, &fonts, 1).unwrap()).unwrap();

        let original = OriginalPositions::capture(&tree);
        let undo = apply_offsets(
            &mut tree,
            &original,
            &OffsetMap::from_pairs([(FIELD_RECIPIENT_NAME, -16)]),
        )
        .unwrap();
        let after = ink_bounds(&capture(&tree, &resources, &fonts, 1).unwrap()).unwrap();
        assert_eq!(after, (before.0, before.1 - 16, before.2, before.3 - 16));

        undo.undo(&mut tree);
        let restored = ink_bounds(&capture(&tree, &resources, &fonts, 1).unwrap()).unwrap();
        assert_eq!(restored, before);
    }

    #[test]
    fn unshaped_text_paints_the_same_line_box() {
        let shaped = dejavu_book(true);
        let unshaped = dejavu_book(false);
        let (tree, resources) = recipient_only(&shaped);
        let (plain_tree, plain_resources) = recipient_only(&unshaped);
        assert_eq!(
            tree.field(FIELD_RECIPIENT_NAME).unwrap().lines(),
            plain_tree.field(FIELD_RECIPIENT_NAME).unwrap().lines()
        );
        let a = ink_bounds(&capture(&tree, &resources, &shaped, 1).unwrap()).unwrap();
        let b = ink_bounds(&capture(&plain_tree, &plain_resources, &unshaped, 1).unwrap()).unwrap();
        assert_eq!((a.1, a.3), (b.1, b.3));
        assert!(a.0.abs_diff(b.0) <= 3 && a.2.abs_diff(b.2) <= 3, "{a:?} vs {b:?}");
    }

    #[test]
    fn rgb_flattening_composites_on_white() {
        let shot = CaptureResult::new(Size::new(2, 1), 1, vec![0, 0, 0, 0, 10, 20, 30, 255]).unwrap();
        assert_eq!(shot.to_rgb_on_white(), vec![255, 255, 255, 10, 20, 30]);
        assert!(CaptureResult::new(Size::new(2, 2), 1, vec![0; 4]).is_err());
        assert!(CaptureResult::empty(2).is_empty());
    }

    #[test]
    fn png_encoding_round_trips_dimensions() {
        let shot = CaptureResult::new(Size::new(3, 2), 1, vec![255; 24]).unwrap();
        let png = shot.encode_png().unwrap();
        let decoded = image::load_from_memory(&png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (3, 2));
        assert!(matches!(
            CaptureResult::empty(1).encode_png(),
            Err(CertError::EmptyCapture)
        ));
    }
}

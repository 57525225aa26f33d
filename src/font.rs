use crate::error::{CertError, Result};
use crate::template::FontRole;
use rustybuzz::{Direction as HbDirection, Face as HbFace, UnicodeBuffer};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use ttf_parser::GlyphId;

#[derive(Debug, Clone)]
enum FontSource {
    File(PathBuf),
    Bytes(Arc<Vec<u8>>),
}

impl FontSource {
    fn describe(&self) -> String {
        match self {
            FontSource::File(path) => path.display().to_string(),
            FontSource::Bytes(data) => format!("<{} embedded bytes>", data.len()),
        }
    }
}

#[derive(Debug)]
struct FontSlot {
    source: FontSource,
    loaded: OnceLock<Option<Arc<LoadedFont>>>,
}

#[derive(Debug)]
pub(crate) struct LoadedFont {
    pub(crate) name: String,
    pub(crate) data: Vec<u8>,
    pub(crate) units_per_em: f32,
    pub(crate) ascent: f32,
    pub(crate) descent: f32,
}

impl LoadedFont {
    fn parse(data: Vec<u8>, source: &str) -> Result<Self> {
        let face = ttf_parser::Face::parse(&data, 0)
            .map_err(|e| CertError::Asset(format!("invalid font data for {source}: {e}")))?;
        let name = face
            .names()
            .into_iter()
            .find(|n| n.name_id == ttf_parser::name_id::FULL_NAME && n.is_unicode())
            .and_then(|n| n.to_string())
            .unwrap_or_else(|| source.to_string());
        let units_per_em = face.units_per_em().max(1) as f32;
        let ascent = face.ascender() as f32;
        let descent = -(face.descender() as f32);
        Ok(Self {
            name,
            data,
            units_per_em,
            ascent,
            descent,
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct GlyphPlacement {
    pub(crate) glyph_id: u16,
    /// Pen offset from the run origin, in pixels, y pointing up.
    pub(crate) dx: f32,
    pub(crate) dy: f32,
    pub(crate) scale: f32,
}

/// Fonts by role, loaded at most once when the readiness gate settles them.
#[derive(Debug)]
pub struct FontBook {
    slots: BTreeMap<FontRole, FontSlot>,
    shape_text: bool,
}

impl Default for FontBook {
    fn default() -> Self {
        Self::new()
    }
}

impl FontBook {
    pub fn new() -> Self {
        Self {
            slots: BTreeMap::new(),
            shape_text: true,
        }
    }

    pub fn set_shape_text(&mut self, enabled: bool) {
        self.shape_text = enabled;
    }

    pub fn shape_text(&self) -> bool {
        self.shape_text
    }

    /// Registers a font file for `role`. The file is read when the book settles.
    pub fn register_file(&mut self, role: FontRole, path: impl AsRef<Path>) {
        self.slots.insert(
            role,
            FontSlot {
                source: FontSource::File(path.as_ref().to_path_buf()),
                loaded: OnceLock::new(),
            },
        );
    }

    pub fn register_bytes(&mut self, role: FontRole, data: Vec<u8>) -> Result<()> {
        ttf_parser::Face::parse(&data, 0).map_err(|e| {
            CertError::Asset(format!("invalid font data for role {}: {e}", role.as_str()))
        })?;
        self.slots.insert(
            role,
            FontSlot {
                source: FontSource::Bytes(Arc::new(data)),
                loaded: OnceLock::new(),
            },
        );
        Ok(())
    }

    pub fn roles(&self) -> impl Iterator<Item = FontRole> + '_ {
        self.slots.keys().copied()
    }

    /// Loads every registered slot. Failures settle as "unavailable".
    /// Returns the number of usable fonts.
    pub fn settle(&self) -> usize {
        let mut usable = 0;
        for (role, slot) in &self.slots {
            let loaded = slot.loaded.get_or_init(|| load_slot(*role, &slot.source));
            if loaded.is_some() {
                usable += 1;
            }
        }
        usable
    }

    pub fn is_settled(&self) -> bool {
        self.slots.values().all(|slot| slot.loaded.get().is_some())
    }

    pub(crate) fn font(&self, role: FontRole) -> Option<&Arc<LoadedFont>> {
        self.slots
            .get(&role)
            .and_then(|slot| slot.loaded.get())
            .and_then(Option::as_ref)
    }

    pub fn has_font(&self, role: FontRole) -> bool {
        self.font(role).is_some()
    }

    /// Advance width of `text` in pixels at `size`.
    pub fn measure(&self, role: FontRole, text: &str, size: f32) -> f32 {
        match self.font(role) {
            Some(font) => layout_glyphs(&font.data, text, size, self.shape_text).1,
            None => fallback_advance(text, size),
        }
    }

    /// Ascent and descent in pixels at `size`.
    pub fn vertical_metrics(&self, role: FontRole, size: f32) -> (f32, f32) {
        match self.font(role) {
            Some(font) => (
                font.ascent / font.units_per_em * size,
                font.descent / font.units_per_em * size,
            ),
            None => (size * 0.8, size * 0.2),
        }
    }

    /// Greedy word wrap into lines no wider than `max_width` where possible.
    /// A single word wider than the box stays on its own line.
    pub fn wrap(&self, role: FontRole, text: &str, size: f32, max_width: f32) -> Vec<String> {
        let mut lines = Vec::new();
        for paragraph in text.split('\n') {
            let mut current = String::new();
            for word in paragraph.split_whitespace() {
                if current.is_empty() {
                    current.push_str(word);
                    continue;
                }
                let candidate = format!("{current} {word}");
                if self.measure(role, &candidate, size) <= max_width {
                    current = candidate;
                } else {
                    lines.push(std::mem::take(&mut current));
                    current.push_str(word);
                }
            }
            if !current.is_empty() {
                lines.push(current);
            }
        }
        lines
    }
}

fn load_slot(role: FontRole, source: &FontSource) -> Option<Arc<LoadedFont>> {
    let data = match source {
        FontSource::File(path) => match std::fs::read(path) {
            Ok(data) => data,
            Err(err) => {
                log::warn!(
                    "font for role {} unavailable ({}): {err}",
                    role.as_str(),
                    path.display()
                );
                return None;
            }
        },
        FontSource::Bytes(data) => data.as_ref().clone(),
    };
    match LoadedFont::parse(data, &source.describe()) {
        Ok(font) => {
            log::debug!("font {:?} ready for role {}", font.name, role.as_str());
            Some(Arc::new(font))
        }
        Err(err) => {
            log::warn!("font for role {} unavailable: {err}", role.as_str());
            None
        }
    }
}

fn fallback_advance(text: &str, size: f32) -> f32 {
    text.chars().count() as f32 * size * 0.5
}

/// Glyph placements for one run, plus the run's total advance.
pub(crate) fn layout_glyphs(
    font_data: &[u8],
    text: &str,
    font_size: f32,
    shape_text: bool,
) -> (Vec<GlyphPlacement>, f32) {
    if !shape_text {
        return layout_glyphs_unshaped(font_data, text, font_size);
    }

    let Some(face) = HbFace::from_slice(font_data, 0) else {
        return layout_glyphs_unshaped(font_data, text, font_size);
    };
    let hb_units = face.units_per_em().max(1) as f32;
    let scale = font_size / hb_units;
    let mut buffer = UnicodeBuffer::new();
    buffer.set_direction(detect_direction(text));
    buffer.push_str(text);
    let output = rustybuzz::shape(&face, &[], buffer);
    let infos = output.glyph_infos();
    let positions = output.glyph_positions();
    if infos.len() != positions.len() {
        return layout_glyphs_unshaped(font_data, text, font_size);
    }

    let mut out = Vec::with_capacity(infos.len());
    let mut pen_x = 0.0f32;
    let mut pen_y = 0.0f32;
    for (info, pos) in infos.iter().zip(positions.iter()) {
        let gid = info.glyph_id as u16;
        if gid != 0 {
            out.push(GlyphPlacement {
                glyph_id: gid,
                dx: pen_x + pos.x_offset as f32 * scale,
                dy: pen_y + pos.y_offset as f32 * scale,
                scale,
            });
        }
        pen_x += pos.x_advance as f32 * scale;
        pen_y += pos.y_advance as f32 * scale;
    }
    (out, pen_x)
}

fn layout_glyphs_unshaped(font_data: &[u8], text: &str, font_size: f32) -> (Vec<GlyphPlacement>, f32) {
    let Ok(face) = ttf_parser::Face::parse(font_data, 0) else {
        return (Vec::new(), fallback_advance(text, font_size));
    };
    let units_per_em = face.units_per_em().max(1) as f32;
    let scale = font_size / units_per_em;

    let mut out = Vec::new();
    let mut pen_x = 0.0f32;
    for ch in text.chars() {
        let gid = face.glyph_index(ch).map(|id| id.0).unwrap_or(0);
        if gid == 0 {
            pen_x += font_size * 0.5;
            continue;
        }
        out.push(GlyphPlacement {
            glyph_id: gid,
            dx: pen_x,
            dy: 0.0,
            scale,
        });
        let advance_units = face.glyph_hor_advance(GlyphId(gid)).unwrap_or(0) as f32;
        let mut adv = advance_units * scale;
        if adv <= 0.0 {
            adv = font_size * 0.5;
        }
        pen_x += adv;
    }
    (out, pen_x)
}

fn detect_direction(text: &str) -> HbDirection {
    for ch in text.chars() {
        let code = ch as u32;
        let rtl = matches!(
            code,
            0x0590..=0x08FF | 0xFB1D..=0xFDFF | 0xFE70..=0xFEFF | 0x1EE00..=0x1EEFF
        );
        if rtl {
            return HbDirection::RightToLeft;
        }
    }
    HbDirection::LeftToRight
}

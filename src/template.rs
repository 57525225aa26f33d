//! Declarative certificate templates.
//!
//! A template is a background image plus a fixed list of absolutely
//! positioned elements. Elements are either bound to a record field, a
//! template constant line of text, or a template constant image. The export
//! pipeline never looks at field names beyond what this schema declares.

use crate::encode::ExportFormat;
use crate::error::{CertError, Result};
use crate::offsets::OffsetMap;
use crate::types::{Color, Size};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FontRole {
    Heading,
    Body,
    Signature,
}

impl FontRole {
    pub const ALL: [FontRole; 3] = [FontRole::Heading, FontRole::Body, FontRole::Signature];

    pub fn as_str(&self) -> &'static str {
        match self {
            FontRole::Heading => "heading",
            FontRole::Body => "body",
            FontRole::Signature => "signature",
        }
    }

    pub fn from_str(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "heading" => Some(FontRole::Heading),
            "body" => Some(FontRole::Body),
            "signature" => Some(FontRole::Signature),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextTransform {
    #[default]
    None,
    Uppercase,
    TitleCase,
}

impl TextTransform {
    pub fn apply(self, text: &str) -> String {
        match self {
            TextTransform::None => text.to_string(),
            TextTransform::Uppercase => text.to_uppercase(),
            TextTransform::TitleCase => title_case(text),
        }
    }
}

fn title_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut at_word_start = true;
    for ch in text.chars() {
        if ch.is_whitespace() {
            at_word_start = true;
            out.push(ch);
        } else if at_word_start {
            out.extend(ch.to_uppercase());
            at_word_start = false;
        } else {
            out.extend(ch.to_lowercase());
        }
    }
    out
}

/// Horizontal placement of an element box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Placement {
    /// Box starts at `x`; text is left aligned.
    Left { x: i32, width: u32 },
    /// Box is centered on `center_x`; text is centered.
    Centered { center_x: i32, width: u32 },
}

impl Placement {
    pub fn left(&self) -> i32 {
        match *self {
            Placement::Left { x, .. } => x,
            Placement::Centered { center_x, width } => center_x - (width / 2) as i32,
        }
    }

    pub fn width(&self) -> u32 {
        match *self {
            Placement::Left { width, .. } | Placement::Centered { width, .. } => width,
        }
    }

    pub fn align(&self) -> TextAlign {
        match self {
            Placement::Left { .. } => TextAlign::Left,
            Placement::Centered { .. } => TextAlign::Center,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextAlign {
    Left,
    Center,
}

/// Two-tier size rule: text longer than `threshold_chars` uses `font_size`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReducedSize {
    pub threshold_chars: usize,
    pub font_size: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FieldContent {
    Record,
    Static { text: String },
    Image { source: String, width: u32 },
}

/// Pushes an element below an earlier one when that element grows taller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowAnchor {
    pub field: String,
    #[serde(default)]
    pub gap: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldLayout {
    pub key: String,
    #[serde(default = "record_content")]
    pub content: FieldContent,
    /// Authored distance from the stage top, in pixels.
    pub top: i32,
    pub placement: Placement,
    #[serde(default = "body_role")]
    pub font_role: FontRole,
    #[serde(default = "default_font_size")]
    pub font_size: f32,
    #[serde(default)]
    pub reduced_size: Option<ReducedSize>,
    #[serde(default = "default_line_height")]
    pub line_height: f32,
    #[serde(default)]
    pub transform: TextTransform,
    #[serde(default)]
    pub color: Option<Color>,
    #[serde(default)]
    pub max_len: Option<usize>,
    #[serde(default)]
    pub flow_after: Option<FlowAnchor>,
}

fn record_content() -> FieldContent {
    FieldContent::Record
}

fn body_role() -> FontRole {
    FontRole::Body
}

fn default_font_size() -> f32 {
    16.0
}

fn default_line_height() -> f32 {
    1.2
}

impl FieldLayout {
    pub fn record(key: impl Into<String>, top: i32, placement: Placement) -> Self {
        Self {
            key: key.into(),
            content: FieldContent::Record,
            top,
            placement,
            font_role: FontRole::Body,
            font_size: default_font_size(),
            reduced_size: None,
            line_height: default_line_height(),
            transform: TextTransform::None,
            color: None,
            max_len: None,
            flow_after: None,
        }
    }

    pub fn static_text(
        key: impl Into<String>,
        text: impl Into<String>,
        top: i32,
        placement: Placement,
    ) -> Self {
        Self {
            content: FieldContent::Static { text: text.into() },
            ..Self::record(key, top, placement)
        }
    }

    pub fn image(key: impl Into<String>, source: impl Into<String>, top: i32, placement: Placement) -> Self {
        let width = placement.width();
        Self {
            content: FieldContent::Image {
                source: source.into(),
                width,
            },
            ..Self::record(key, top, placement)
        }
    }

    pub fn font(mut self, role: FontRole, size: f32, line_height: f32) -> Self {
        self.font_role = role;
        self.font_size = size;
        self.line_height = line_height;
        self
    }

    pub fn transform(mut self, transform: TextTransform) -> Self {
        self.transform = transform;
        self
    }

    pub fn reduced(mut self, threshold_chars: usize, font_size: f32) -> Self {
        self.reduced_size = Some(ReducedSize {
            threshold_chars,
            font_size,
        });
        self
    }

    pub fn max_len(mut self, max: usize) -> Self {
        self.max_len = Some(max);
        self
    }

    pub fn color(mut self, color: Color) -> Self {
        self.color = Some(color);
        self
    }

    pub fn flow_after(mut self, field: impl Into<String>, gap: i32) -> Self {
        self.flow_after = Some(FlowAnchor {
            field: field.into(),
            gap,
        });
        self
    }

    pub fn is_record(&self) -> bool {
        matches!(self.content, FieldContent::Record)
    }

    /// Font size for `text` under the fixed two-tier rule.
    pub fn font_size_for(&self, text: &str) -> f32 {
        match self.reduced_size {
            Some(rule) if text.chars().count() > rule.threshold_chars => rule.font_size,
            _ => self.font_size,
        }
    }
}

/// Per call site offset presets. Preview never uses these.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportOffsets {
    #[serde(default)]
    pub pdf: OffsetMap,
    #[serde(default)]
    pub jpeg: OffsetMap,
    #[serde(default)]
    pub batch_pdf: OffsetMap,
    #[serde(default)]
    pub batch_jpeg: OffsetMap,
}

impl ExportOffsets {
    pub fn single(&self, format: ExportFormat) -> &OffsetMap {
        match format {
            ExportFormat::Pdf => &self.pdf,
            ExportFormat::Jpeg => &self.jpeg,
        }
    }

    pub fn batch(&self, format: ExportFormat) -> &OffsetMap {
        match format {
            ExportFormat::Pdf => &self.batch_pdf,
            ExportFormat::Jpeg => &self.batch_jpeg,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateLayout {
    pub name: String,
    pub organization: String,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub background: Option<String>,
    #[serde(default = "default_text_color")]
    pub text_color: Color,
    pub recipient_field: String,
    pub fields: Vec<FieldLayout>,
    #[serde(default)]
    pub export_offsets: ExportOffsets,
}

fn default_text_color() -> Color {
    Color::BLACK
}

impl TemplateLayout {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let template: TemplateLayout = serde_json::from_str(raw)?;
        template.validate()?;
        Ok(template)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let template = Self::from_json_str(&raw)?;
        match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => Ok(template.with_asset_root(dir)),
            _ => Ok(template),
        }
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    pub fn field(&self, key: &str) -> Option<&FieldLayout> {
        self.fields.iter().find(|field| field.key == key)
    }

    /// Keys every record must carry, in declaration order.
    pub fn record_keys(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|field| field.is_record())
            .map(|field| field.key.as_str())
    }

    /// Resolves relative background and image sources against `root`.
    pub fn with_asset_root(mut self, root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        if let Some(bg) = self.background.take() {
            self.background = Some(resolve_source(root, bg));
        }
        for field in &mut self.fields {
            if let FieldContent::Image { source, .. } = &mut field.content {
                *source = resolve_source(root, std::mem::take(source));
            }
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(CertError::InvalidConfiguration(format!(
                "template {:?} has empty size {}x{}",
                self.name, self.width, self.height
            )));
        }
        let mut seen = BTreeSet::new();
        for field in &self.fields {
            if field.key.trim().is_empty() {
                return Err(CertError::InvalidConfiguration(format!(
                    "template {:?} declares an element with an empty key",
                    self.name
                )));
            }
            if field.placement.width() == 0 {
                return Err(CertError::InvalidConfiguration(format!(
                    "element {:?} has zero width",
                    field.key
                )));
            }
            if !(field.font_size > 0.0) || !(field.line_height > 0.0) {
                return Err(CertError::InvalidConfiguration(format!(
                    "element {:?} needs a positive font size and line height",
                    field.key
                )));
            }
            if let Some(rule) = field.reduced_size {
                if !(rule.font_size > 0.0) {
                    return Err(CertError::InvalidConfiguration(format!(
                        "element {:?} has a non-positive reduced font size",
                        field.key
                    )));
                }
            }
            if let FieldContent::Image { width: 0, .. } = field.content {
                return Err(CertError::InvalidConfiguration(format!(
                    "image element {:?} has zero width",
                    field.key
                )));
            }
            if let Some(anchor) = &field.flow_after {
                if !seen.contains(anchor.field.as_str()) {
                    return Err(CertError::InvalidConfiguration(format!(
                        "element {:?} flows after {:?}, which is not declared before it",
                        field.key, anchor.field
                    )));
                }
            }
            if !seen.insert(field.key.as_str()) {
                return Err(CertError::InvalidConfiguration(format!(
                    "duplicate element key {:?}",
                    field.key
                )));
            }
        }
        match self.field(&self.recipient_field) {
            Some(field) if field.is_record() => Ok(()),
            _ => Err(CertError::InvalidConfiguration(format!(
                "recipient field {:?} is not a record field of template {:?}",
                self.recipient_field, self.name
            ))),
        }
    }
}

fn resolve_source(root: &Path, source: String) -> String {
    if source.starts_with("data:") || Path::new(&source).is_absolute() {
        return source;
    }
    let mut path = PathBuf::from(root);
    path.push(&source);
    path.to_string_lossy().into_owned()
}

pub const FIELD_ORGANIZATION: &str = "organization";
pub const FIELD_PROGRAM_NAME: &str = "programName";
pub const FIELD_ACHIEVEMENT_TEXT: &str = "achievementText";
pub const FIELD_RECIPIENT_NAME: &str = "recipientName";
pub const FIELD_CERTIFICATE_DATE: &str = "certificateDate";
pub const FIELD_SIGNATURE: &str = "signature";
pub const FIELD_SIGNATORY: &str = "signatory";

const CERTIFICATE_GOLD: &str = "#695511";
const RECIPIENT_GREY: &str = "#363636";

fn standard_certificate(
    name: &str,
    organization: &str,
    slug: &str,
    signatory: &str,
) -> TemplateLayout {
    let gold = Color::from_hex(CERTIFICATE_GOLD).unwrap_or(Color::BLACK);
    let grey = Color::from_hex(RECIPIENT_GREY).unwrap_or(Color::BLACK);
    let full_width = Placement::Centered {
        center_x: 400,
        width: 800,
    };

    let fields = vec![
        FieldLayout::record(FIELD_ORGANIZATION, 90, full_width)
            .font(FontRole::Heading, 50.0, 1.2)
            .max_len(25),
        FieldLayout::record(FIELD_PROGRAM_NAME, 165, full_width)
            .font(FontRole::Body, 20.0, 1.3)
            .reduced(40, 16.0)
            .transform(TextTransform::TitleCase)
            .max_len(65),
        FieldLayout::record(
            FIELD_ACHIEVEMENT_TEXT,
            210,
            Placement::Centered {
                center_x: 400,
                width: 600,
            },
        )
        .font(FontRole::Body, 20.0, 1.4)
        .max_len(300),
        FieldLayout::record(FIELD_RECIPIENT_NAME, 320, full_width)
            .font(FontRole::Body, 32.0, 1.2)
            .transform(TextTransform::Uppercase)
            .color(grey)
            .max_len(15)
            .flow_after(FIELD_ACHIEVEMENT_TEXT, 8),
        FieldLayout::record(FIELD_CERTIFICATE_DATE, 370, full_width)
            .font(FontRole::Body, 18.0, 1.2)
            .transform(TextTransform::Uppercase)
            .max_len(22)
            .flow_after(FIELD_RECIPIENT_NAME, 10),
        FieldLayout::image(
            FIELD_SIGNATURE,
            format!("images/{slug}/signature.png"),
            440,
            Placement::Centered {
                center_x: 472,
                width: 300,
            },
        ),
        FieldLayout::static_text(
            FIELD_SIGNATORY,
            signatory,
            500,
            Placement::Centered {
                center_x: 496,
                width: 500,
            },
        )
        .font(FontRole::Body, 16.0, 2.0)
        .transform(TextTransform::Uppercase),
    ];

    let single = OffsetMap::from_pairs([
        (FIELD_ORGANIZATION, -30),
        (FIELD_PROGRAM_NAME, -14),
        (FIELD_ACHIEVEMENT_TEXT, -15),
        (FIELD_RECIPIENT_NAME, -16),
        (FIELD_CERTIFICATE_DATE, -10),
    ]);
    let batch = OffsetMap::from_pairs([
        (FIELD_ORGANIZATION, -30),
        (FIELD_PROGRAM_NAME, -15),
        (FIELD_ACHIEVEMENT_TEXT, -18),
        (FIELD_RECIPIENT_NAME, -16),
        (FIELD_CERTIFICATE_DATE, -8),
        (FIELD_SIGNATURE, 1),
        (FIELD_SIGNATORY, -10),
    ]);

    TemplateLayout {
        name: name.to_string(),
        organization: organization.to_string(),
        width: 800,
        height: 640,
        background: Some(format!("templates/{slug}/certificate-template.jpg")),
        text_color: gold,
        recipient_field: FIELD_RECIPIENT_NAME.to_string(),
        fields,
        export_offsets: ExportOffsets {
            pdf: single.clone(),
            jpeg: single,
            batch_pdf: batch.clone(),
            batch_jpeg: batch,
        },
    }
}

/// Templates shipped with the crate, keyed by their short name.
pub fn builtin_templates() -> Vec<TemplateLayout> {
    vec![
        standard_certificate(
            "pak",
            "Planned Acts of Kindness",
            "planned-acts-of-kindness",
            "Authorized by Lyle Benjamin, PAK Founder",
        ),
        standard_certificate(
            "opop",
            "One Planet One People",
            "one-planet-one-people",
            "Authorized by One Planet One People",
        ),
    ]
}

pub fn builtin_template(name: &str) -> Option<TemplateLayout> {
    builtin_templates()
        .into_iter()
        .find(|template| template.name.eq_ignore_ascii_case(name))
}

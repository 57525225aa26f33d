mod assets;
mod batch;
mod csv_source;
mod encode;
mod error;
mod font;
mod layout;
mod offsets;
mod perf;
mod raster;
mod readiness;
mod record;
mod render;
mod stage;
mod template;
mod types;

pub use assets::{SourceKind, decode_image_to_pixmap, load_image_pixmap, parse_data_uri, png_data_uri};
pub use batch::{
    ArchiveBuffer, BatchFailure, BatchReport, CancelToken, entry_file_name, run_batch_with,
    sanitize_file_stem,
};
pub use csv_source::{CsvOptions, read_records, read_records_from_path};
pub use encode::{ExportFormat, encode, to_jpeg, to_pdf};
pub use error::{CertError, Result};
pub use font::FontBook;
pub use layout::layout;
pub use offsets::{OffsetMap, OffsetUndo, OriginalPositions, apply_offsets};
pub use perf::PerfLogger;
pub use raster::{CaptureResult, capture};
pub use readiness::{ResourceGate, StageResources};
pub use record::{
    FieldValueRecord, FieldViolation, ViolationKind, awarded_date_label,
    current_awarded_date_label, validate_batch, validate_record,
};
pub use render::{
    NodeHandle, NodeKind, Node, ROOT_ID, TextStyle, VisualTree, field_node_id, render,
};
pub use stage::{
    CompositedStage, ContainerId, OFFSCREEN_LEFT, OffscreenStage, Preview, ReadyStage, StageHost,
};
pub use template::{
    ExportOffsets, FIELD_ACHIEVEMENT_TEXT, FIELD_CERTIFICATE_DATE, FIELD_ORGANIZATION,
    FIELD_PROGRAM_NAME, FIELD_RECIPIENT_NAME, FIELD_SIGNATORY, FIELD_SIGNATURE, FieldContent,
    FieldLayout, FlowAnchor, FontRole, Placement, ReducedSize, TemplateLayout, TextAlign,
    TextTransform, builtin_template, builtin_templates,
};
pub use types::{Color, Size};

use perf::Span;
use std::path::{Path, PathBuf};

/// The export pipeline: one stage host, one font book, fixed scales.
///
/// Every export runs mount, readiness, offsets, capture, undo, dispose and
/// encode, in that order. A preview passed in is only read.
#[derive(Debug)]
pub struct CertificateEngine {
    fonts: FontBook,
    host: StageHost,
    pdf_scale: u32,
    jpeg_scale: u32,
    jpeg_quality: u8,
    batch_jpeg_quality: u8,
    perf: Option<PerfLogger>,
}

#[derive(Debug, Clone)]
enum PendingFont {
    File(PathBuf),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct CertificateEngineBuilder {
    fonts: Vec<(FontRole, PendingFont)>,
    pdf_scale: u32,
    jpeg_scale: u32,
    jpeg_quality: u8,
    batch_jpeg_quality: u8,
    shape_text: bool,
    perf_path: Option<PathBuf>,
}

impl Default for CertificateEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CertificateEngineBuilder {
    pub fn new() -> Self {
        Self {
            fonts: Vec::new(),
            pdf_scale: 2,
            jpeg_scale: 2,
            jpeg_quality: 100,
            batch_jpeg_quality: 90,
            shape_text: true,
            perf_path: None,
        }
    }

    // Font file for a role; read when the first stage becomes ready.
    pub fn register_font_file(mut self, role: FontRole, path: impl AsRef<Path>) -> Self {
        self.fonts
            .push((role, PendingFont::File(path.as_ref().to_path_buf())));
        self
    }

    pub fn register_font_bytes(mut self, role: FontRole, data: Vec<u8>) -> Self {
        self.fonts.push((role, PendingFont::Bytes(data)));
        self
    }

    // Supersampling factor for PDF captures.
    pub fn pdf_scale(mut self, scale: u32) -> Self {
        self.pdf_scale = scale;
        self
    }

    pub fn jpeg_scale(mut self, scale: u32) -> Self {
        self.jpeg_scale = scale;
        self
    }

    // 1..=100, single JPEG exports.
    pub fn jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality;
        self
    }

    // 1..=100, JPEG entries of batch archives.
    pub fn batch_jpeg_quality(mut self, quality: u8) -> Self {
        self.batch_jpeg_quality = quality;
        self
    }

    // Disabling skips rustybuzz shaping and maps codepoints to glyphs directly.
    pub fn shape_text(mut self, enabled: bool) -> Self {
        self.shape_text = enabled;
        self
    }

    pub fn perf_log(mut self, path: impl AsRef<Path>) -> Self {
        self.perf_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn build(self) -> Result<CertificateEngine> {
        for (name, scale) in [("pdf_scale", self.pdf_scale), ("jpeg_scale", self.jpeg_scale)] {
            if scale == 0 {
                return Err(CertError::InvalidConfiguration(format!(
                    "{name} must be at least 1"
                )));
            }
        }
        for (name, quality) in [
            ("jpeg_quality", self.jpeg_quality),
            ("batch_jpeg_quality", self.batch_jpeg_quality),
        ] {
            if !(1..=100).contains(&quality) {
                return Err(CertError::InvalidConfiguration(format!(
                    "{name} must be within 1..=100, got {quality}"
                )));
            }
        }

        let mut fonts = FontBook::new();
        fonts.set_shape_text(self.shape_text);
        for (role, font) in self.fonts {
            match font {
                PendingFont::File(path) => fonts.register_file(role, path),
                PendingFont::Bytes(data) => fonts.register_bytes(role, data)?,
            }
        }
        let perf = match self.perf_path {
            Some(path) => Some(PerfLogger::new(path)?),
            None => None,
        };

        Ok(CertificateEngine {
            fonts,
            host: StageHost::new(),
            pdf_scale: self.pdf_scale,
            jpeg_scale: self.jpeg_scale,
            jpeg_quality: self.jpeg_quality,
            batch_jpeg_quality: self.batch_jpeg_quality,
            perf,
        })
    }
}

impl CertificateEngine {
    pub fn builder() -> CertificateEngineBuilder {
        CertificateEngineBuilder::new()
    }

    pub fn fonts(&self) -> &FontBook {
        &self.fonts
    }

    pub fn stage_host(&self) -> &StageHost {
        &self.host
    }

    pub fn scale_for(&self, format: ExportFormat) -> u32 {
        match format {
            ExportFormat::Pdf => self.pdf_scale,
            ExportFormat::Jpeg => self.jpeg_scale,
        }
    }

    /// The visible rendering, with no export offsets.
    pub fn render_preview(
        &self,
        template: &TemplateLayout,
        record: &FieldValueRecord,
    ) -> Result<Preview> {
        self.render_preview_with_offsets(template, record, &OffsetMap::default())
    }

    pub fn render_preview_with_offsets(
        &self,
        template: &TemplateLayout,
        record: &FieldValueRecord,
        offsets: &OffsetMap,
    ) -> Result<Preview> {
        Preview::render(template, record, offsets, &self.fonts, self.host.gate())
    }

    /// Captures `record` on a fresh offscreen stage.
    ///
    /// Original positions come from `preview` when given (it must show the
    /// same template and record), completed by the stage's own layout.
    pub fn capture(
        &self,
        template: &TemplateLayout,
        record: &FieldValueRecord,
        scale: u32,
        offsets: &OffsetMap,
        preview: Option<&Preview>,
    ) -> Result<CaptureResult> {
        self.capture_item(template, record, scale, offsets, preview, None)
    }

    fn capture_item(
        &self,
        template: &TemplateLayout,
        record: &FieldValueRecord,
        scale: u32,
        offsets: &OffsetMap,
        preview: Option<&Preview>,
        item: Option<usize>,
    ) -> Result<CaptureResult> {
        let perf = self.perf.as_ref();
        let stage = {
            let _span = Span::start(perf, "stage.mount", item);
            self.host.mount(template, record)?
        };
        let ready = {
            let _span = Span::start(perf, "stage.ready", item);
            stage.ready(&self.fonts)?
        };
        if let Some(perf) = perf {
            let resources = ready.resources();
            perf.log_counts(
                "stage.ready",
                item,
                &[
                    ("images", resources.settled_images() as u64),
                    ("broken_images", resources.broken_images() as u64),
                    ("fonts", resources.usable_fonts() as u64),
                ],
            );
        }

        let natural = ready.natural_positions()?;
        let original = match preview {
            Some(preview) => preview.positions().or_fallback(&natural),
            None => natural,
        };
        let composited = {
            let _span = Span::start(perf, "stage.offsets", item);
            ready.with_offsets_applied(&original, offsets)?
        };
        let shot = {
            let _span = Span::start(perf, "stage.capture", item);
            composited.capture(scale)
        };
        composited.restore()?.dispose();
        shot
    }

    /// Validates, captures at the format's scale and encodes.
    pub fn export(
        &self,
        template: &TemplateLayout,
        record: &FieldValueRecord,
        format: ExportFormat,
        offsets: &OffsetMap,
        preview: Option<&Preview>,
    ) -> Result<Vec<u8>> {
        let violations = validate_record(template, record, None);
        if !violations.is_empty() {
            return Err(CertError::Validation(violations));
        }
        let result = self
            .capture(template, record, self.scale_for(format), offsets, preview)
            .and_then(|shot| self.encode_item(&shot, format, self.jpeg_quality, None));
        if let Err(err) = &result {
            log::error!("{} export failed: {err}", format.as_str());
        }
        result
    }

    /// PDF with the template's single-export offsets.
    pub fn export_pdf(
        &self,
        template: &TemplateLayout,
        record: &FieldValueRecord,
        preview: Option<&Preview>,
    ) -> Result<Vec<u8>> {
        let offsets = template.export_offsets.single(ExportFormat::Pdf);
        self.export(template, record, ExportFormat::Pdf, offsets, preview)
    }

    pub fn export_jpeg(
        &self,
        template: &TemplateLayout,
        record: &FieldValueRecord,
        preview: Option<&Preview>,
    ) -> Result<Vec<u8>> {
        let offsets = template.export_offsets.single(ExportFormat::Jpeg);
        self.export(template, record, ExportFormat::Jpeg, offsets, preview)
    }

    /// Exports every record into one archive, sequentially.
    ///
    /// `offsets` defaults to the template's batch preset for `format`.
    pub fn run_batch(
        &self,
        records: &[FieldValueRecord],
        template: &TemplateLayout,
        offsets: Option<&OffsetMap>,
        format: ExportFormat,
        cancel: Option<&CancelToken>,
    ) -> Result<BatchReport> {
        let offsets = offsets.unwrap_or_else(|| template.export_offsets.batch(format));
        let scale = self.scale_for(format);
        let report = run_batch_with(
            records,
            template,
            format,
            cancel,
            self.perf.as_ref(),
            |index, record| {
                let shot = self.capture_item(template, record, scale, offsets, None, Some(index))?;
                self.encode_item(&shot, format, self.batch_jpeg_quality, Some(index))
            },
        );
        if let Some(perf) = &self.perf {
            perf.flush();
        }
        report
    }

    fn encode_item(
        &self,
        shot: &CaptureResult,
        format: ExportFormat,
        jpeg_quality: u8,
        item: Option<usize>,
    ) -> Result<Vec<u8>> {
        let name = match format {
            ExportFormat::Pdf => "encode.pdf",
            ExportFormat::Jpeg => "encode.jpeg",
        };
        let _span = Span::start(self.perf.as_ref(), name, item);
        encode(shot, format, jpeg_quality)
    }
}

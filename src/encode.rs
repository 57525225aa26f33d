//! Document encoders: one-page raster PDF and flattened JPEG.

use crate::error::{CertError, Result};
use crate::raster::CaptureResult;
use image::codecs::jpeg::JpegEncoder;
use lopdf::{Document as LoDocument, Object as LoObject, Stream as LoStream, dictionary};
use std::io::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExportFormat {
    Pdf,
    Jpeg,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Pdf => "pdf",
            ExportFormat::Jpeg => "jpeg",
        }
    }

    pub fn from_str(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pdf" => Some(ExportFormat::Pdf),
            "jpeg" | "jpg" => Some(ExportFormat::Jpeg),
            _ => None,
        }
    }

    /// Extension used for archive entries.
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Pdf => "pdf",
            ExportFormat::Jpeg => "jpg",
        }
    }

    /// Fixed download name of a single export.
    pub fn single_file_name(&self) -> &'static str {
        match self {
            ExportFormat::Pdf => "certificate.pdf",
            ExportFormat::Jpeg => "certificate.jpeg",
        }
    }

    pub fn archive_name(&self, organization: &str) -> String {
        let stem = crate::batch::sanitize_file_stem(organization);
        match self {
            ExportFormat::Pdf => format!("{stem}-certificates.zip"),
            ExportFormat::Jpeg => format!("{stem}-certificates-jpeg.zip"),
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            ExportFormat::Pdf => "application/pdf",
            ExportFormat::Jpeg => "image/jpeg",
        }
    }
}

/// Wraps the bitmap as the full content of a single page.
///
/// The page is `width x height` user units, one unit per bitmap pixel.
pub fn to_pdf(capture: &CaptureResult) -> Result<Vec<u8>> {
    if capture.is_empty() {
        return Err(CertError::EmptyCapture);
    }
    let size = capture.size();
    let (w, h) = (size.width as i64, size.height as i64);

    let mut doc = LoDocument::with_version("1.5");
    let pages_id = doc.new_object_id();
    let image_id = doc.add_object(LoStream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => w,
            "Height" => h,
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => 8i64,
            "Filter" => "FlateDecode",
        },
        flate_compress(&capture.to_rgb_on_white())?,
    ));
    let content = format!("q\n{w} 0 0 {h} 0 0 cm\n/Im1 Do\nQ\n").into_bytes();
    let content_id = doc.add_object(LoStream::new(dictionary! {}, content));
    let media_box = vec![
        LoObject::Integer(0),
        LoObject::Integer(0),
        LoObject::Integer(w),
        LoObject::Integer(h),
    ];
    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "Contents" => content_id,
        "Resources" => dictionary! {
            "XObject" => dictionary! { "Im1" => image_id },
        },
        "MediaBox" => LoObject::Array(media_box),
    });
    doc.objects.insert(
        pages_id,
        LoObject::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![LoObject::Reference(page_id)],
            "Count" => 1i64,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    let info_id = doc.add_object(dictionary! {
        "Producer" => LoObject::string_literal("certpress"),
    });
    doc.trailer.set("Root", catalog_id);
    doc.trailer.set("Info", info_id);

    let mut out = Vec::new();
    doc.save_to(&mut out)
        .map_err(|e| CertError::Encode(format!("pdf write failed: {e}")))?;
    Ok(out)
}

/// Baseline JPEG of the bitmap flattened on white. `quality` is 1..=100.
pub fn to_jpeg(capture: &CaptureResult, quality: u8) -> Result<Vec<u8>> {
    if capture.is_empty() {
        return Err(CertError::EmptyCapture);
    }
    if !(1..=100).contains(&quality) {
        return Err(CertError::InvalidConfiguration(format!(
            "jpeg quality {quality} outside 1..=100"
        )));
    }
    let rgb = capture.to_rgb_image().ok_or(CertError::EmptyCapture)?;
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode_image(&rgb)
        .map_err(|e| CertError::Encode(format!("jpeg encode failed: {e}")))?;
    Ok(out)
}

pub fn encode(capture: &CaptureResult, format: ExportFormat, jpeg_quality: u8) -> Result<Vec<u8>> {
    match format {
        ExportFormat::Pdf => to_pdf(capture),
        ExportFormat::Jpeg => to_jpeg(capture, jpeg_quality),
    }
}

fn flate_compress(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::Compression;
    use flate2::write::ZlibEncoder;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

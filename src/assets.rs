//! Image sources: `data:` URIs or filesystem paths, decoded to premultiplied pixmaps.

use crate::error::{CertError, Result};
use base64::Engine;
use std::path::Path;
use tiny_skia::Pixmap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    DataUri,
    File,
}

impl SourceKind {
    pub fn of(source: &str) -> Self {
        if source.starts_with("data:") {
            SourceKind::DataUri
        } else {
            SourceKind::File
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::DataUri => "data-uri",
            SourceKind::File => "file",
        }
    }
}

/// Reads and decodes an image source.
pub fn load_image_pixmap(source: &str) -> Result<Pixmap> {
    if let Some((mime, data)) = parse_data_uri(source)? {
        return decode_image_to_pixmap(&data, Some(&mime));
    }
    let bytes = std::fs::read(Path::new(source))
        .map_err(|e| CertError::Asset(format!("cannot read image {source}: {e}")))?;
    decode_image_to_pixmap(&bytes, None)
}

pub fn decode_image_to_pixmap(data: &[u8], mime: Option<&str>) -> Result<Pixmap> {
    let guessed_format = match mime {
        Some(mime) if mime.contains("png") => Some(image::ImageFormat::Png),
        Some(mime) if mime.contains("jpeg") || mime.contains("jpg") => {
            Some(image::ImageFormat::Jpeg)
        }
        Some(_) => None,
        None => image::guess_format(data).ok(),
    };

    let decoded = match guessed_format {
        Some(fmt) => image::load_from_memory_with_format(data, fmt),
        None => image::load_from_memory(data),
    }
    .map_err(|e| CertError::Asset(format!("image decode failed: {e}")))?;

    let rgba = decoded.to_rgba8();
    let (width, height) = rgba.dimensions();
    let mut pixmap = Pixmap::new(width, height)
        .ok_or_else(|| CertError::Asset(format!("image has unusable size {width}x{height}")))?;
    let src = rgba.as_raw();
    let dst = pixmap.data_mut();
    for (src_px, dst_px) in src.chunks_exact(4).zip(dst.chunks_exact_mut(4)) {
        let a = src_px[3];
        dst_px[0] = premul_u8(src_px[0], a);
        dst_px[1] = premul_u8(src_px[1], a);
        dst_px[2] = premul_u8(src_px[2], a);
        dst_px[3] = a;
    }
    Ok(pixmap)
}

pub(crate) fn premul_u8(channel: u8, alpha: u8) -> u8 {
    let prod = (channel as u16) * (alpha as u16) + 127;
    ((prod + (prod >> 8)) >> 8) as u8
}

/// `Ok(None)` when `uri` is not a data URI at all.
pub fn parse_data_uri(uri: &str) -> Result<Option<(String, Vec<u8>)>> {
    if !uri.starts_with("data:") {
        return Ok(None);
    }
    let (header, payload) = uri
        .split_once(',')
        .ok_or_else(|| CertError::Asset("data URI without payload".to_string()))?;
    let mime = header
        .trim_start_matches("data:")
        .split(';')
        .next()
        .filter(|v| !v.is_empty())
        .unwrap_or("application/octet-stream")
        .to_string();
    let data = if header.contains(";base64") {
        base64::engine::general_purpose::STANDARD
            .decode(payload.trim())
            .map_err(|e| CertError::Asset(format!("bad base64 in data URI: {e}")))?
    } else {
        payload.as_bytes().to_vec()
    };
    Ok(Some((mime, data)))
}

/// Encodes PNG bytes as a `data:image/png;base64,` URI.
pub fn png_data_uri(png: &[u8]) -> String {
    format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(png)
    )
}

//! Batch archiver.
//!
//! Drives one export per record, strictly in input order, and collects the
//! outputs into a single ZIP. Validation failures reject the whole batch up
//! front; a record that fails to render is skipped and counted.

use crate::encode::ExportFormat;
use crate::error::{CertError, Result};
use crate::perf::{PerfLogger, Span};
use crate::record::{FieldValueRecord, validate_batch};
use crate::template::TemplateLayout;
use std::io::{Cursor, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

const FALLBACK_STEM: &str = "certificate";

/// Filesystem-safe file stem. Inner spaces survive; path separators,
/// reserved punctuation and control characters become `_`.
pub fn sanitize_file_stem(raw: &str) -> String {
    let replaced: String = raw
        .chars()
        .map(|ch| match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            ch if ch.is_control() => '_',
            ch => ch,
        })
        .collect();
    let stem = replaced.trim().trim_start_matches('.').trim_start();
    if stem.is_empty() || stem.chars().all(|ch| ch == '_') {
        FALLBACK_STEM.to_string()
    } else {
        stem.to_string()
    }
}

/// `{stem}-{index + 1}.{ext}`, the stem taken from the recipient field.
pub fn entry_file_name(
    record: &FieldValueRecord,
    template: &TemplateLayout,
    index: usize,
    format: ExportFormat,
) -> String {
    let recipient = record.get(&template.recipient_field).unwrap_or("");
    format!(
        "{}-{}.{}",
        sanitize_file_stem(recipient),
        index + 1,
        format.extension()
    )
}

/// Named payloads on their way into one ZIP.
pub struct ArchiveBuffer {
    zip: ZipWriter<Cursor<Vec<u8>>>,
    options: SimpleFileOptions,
    entries: Vec<String>,
}

impl Default for ArchiveBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveBuffer {
    pub fn new() -> Self {
        Self {
            zip: ZipWriter::new(Cursor::new(Vec::new())),
            options: SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated),
            entries: Vec::new(),
        }
    }

    pub fn add(&mut self, name: &str, bytes: &[u8]) -> Result<()> {
        self.zip.start_file(name, self.options)?;
        self.zip.write_all(bytes)?;
        self.entries.push(name.to_string());
        Ok(())
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Finalizes the archive. Consumes the buffer, so this happens once.
    pub fn finish(self) -> Result<(Vec<u8>, Vec<String>)> {
        let cursor = self.zip.finish()?;
        Ok((cursor.into_inner(), self.entries))
    }
}

/// Cooperative cancellation, checked before each item.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub archive: Vec<u8>,
    pub succeeded: usize,
    pub failed: usize,
    /// 0-based input positions of skipped records.
    pub failed_indices: Vec<usize>,
    pub failures: Vec<BatchFailure>,
    /// Archive entry names, in archive order.
    pub entries: Vec<String>,
    pub cancelled: bool,
}

/// Runs `export_item` over `records` and archives the results.
///
/// `export_item` receives the 0-based index and the record, and returns the
/// encoded document bytes.
pub fn run_batch_with<F>(
    records: &[FieldValueRecord],
    template: &TemplateLayout,
    format: ExportFormat,
    cancel: Option<&CancelToken>,
    perf: Option<&PerfLogger>,
    mut export_item: F,
) -> Result<BatchReport>
where
    F: FnMut(usize, &FieldValueRecord) -> Result<Vec<u8>>,
{
    let violations = validate_batch(template, records);
    if !violations.is_empty() {
        log::warn!(
            "batch rejected: {} violation(s) across {} record(s)",
            violations.len(),
            records.len()
        );
        return Err(CertError::Validation(violations));
    }

    let mut archive = ArchiveBuffer::new();
    let mut failures = Vec::new();
    let mut cancelled = false;

    for (index, record) in records.iter().enumerate() {
        if cancel.is_some_and(CancelToken::is_cancelled) {
            log::info!("batch cancelled before item {}", index + 1);
            cancelled = true;
            break;
        }
        let _span = Span::start(perf, "batch.item", Some(index));
        let name = entry_file_name(record, template, index, format);
        let outcome = export_item(index, record).and_then(|bytes| archive.add(&name, &bytes));
        match outcome {
            Ok(()) => log::debug!("archived {name}"),
            Err(err) => {
                log::error!("item {} ({name}) skipped: {err}", index + 1);
                failures.push(BatchFailure {
                    index,
                    reason: err.to_string(),
                });
            }
        }
    }

    let (bytes, entries) = {
        let _span = Span::start(perf, "batch.finalize", None);
        archive.finish()?
    };
    let report = BatchReport {
        archive: bytes,
        succeeded: entries.len(),
        failed: failures.len(),
        failed_indices: failures.iter().map(|f| f.index).collect(),
        failures,
        entries,
        cancelled,
    };
    if let Some(perf) = perf {
        perf.log_counts(
            "batch.finalize",
            None,
            &[
                ("succeeded", report.succeeded as u64),
                ("failed", report.failed as u64),
            ],
        );
    }
    log::info!(
        "batch done: {} archived, {} failed{}",
        report.succeeded,
        report.failed,
        if report.cancelled { ", cancelled" } else { "" }
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::builtin_template;
    use std::collections::BTreeSet;
    use zip::ZipArchive;

    fn record(name: &str) -> FieldValueRecord {
        FieldValueRecord::from_pairs([
            ("organization", "Acme"),
            ("programName", "Excellence Award"),
            ("achievementText", "For outstanding work"),
            ("recipientName", name),
            ("certificateDate", "Awarded January 2025"),
        ])
    }

    fn archive_names(bytes: &[u8]) -> Vec<String> {
        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect()
    }

    #[test]
    fn sanitize_keeps_spaces_and_replaces_reserved_characters() {
        assert_eq!(sanitize_file_stem("Jane Doe"), "Jane Doe");
        assert_eq!(sanitize_file_stem("  a/b:c  "), "a_b_c");
        assert_eq!(sanitize_file_stem("   "), FALLBACK_STEM);
        assert_eq!(sanitize_file_stem("../.."), "_..");
        assert_eq!(sanitize_file_stem("..."), FALLBACK_STEM);
        assert_eq!(sanitize_file_stem("??"), FALLBACK_STEM);
    }

    #[test]
    fn ordinal_suffix_is_always_present() {
        let template = builtin_template("pak").unwrap();
        let records = [record("Jane Doe"), record("  "), record("John Roe")];
        let report = run_batch_with(&records, &template, ExportFormat::Pdf, None, None, |_, _| {
            Ok(b"%PDF".to_vec())
        })
        .unwrap();
        assert_eq!(
            report.entries,
            vec!["Jane Doe-1.pdf", "certificate-2.pdf", "John Roe-3.pdf"]
        );
        assert_eq!(archive_names(&report.archive), report.entries);
    }

    #[test]
    fn duplicate_and_empty_names_stay_distinct() {
        let template = builtin_template("pak").unwrap();
        let records = [record("Sam"), record("Sam"), record(""), record("")];
        let report = run_batch_with(&records, &template, ExportFormat::Jpeg, None, None, |_, _| {
            Ok(vec![0xFF, 0xD8])
        })
        .unwrap();
        let unique: BTreeSet<_> = report.entries.iter().collect();
        assert_eq!(unique.len(), 4);
        assert!(report.entries.iter().all(|name| name.ends_with(".jpg")));
    }

    #[test]
    fn validation_failure_rejects_the_whole_batch() {
        let template = builtin_template("pak").unwrap();
        let mut long = record("Jane");
        long.set("programName", "p".repeat(70));
        let mut calls = 0;
        let err = run_batch_with(
            &[record("Ok"), long],
            &template,
            ExportFormat::Pdf,
            None,
            None,
            |_, _| {
                calls += 1;
                Ok(Vec::new())
            },
        )
        .unwrap_err();
        assert_eq!(calls, 0);
        let violations = err.violations();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].to_string(), "Row 2: \"programName\" exceeds 65 chars");
    }

    #[test]
    fn failed_items_are_skipped_and_counted() {
        let template = builtin_template("pak").unwrap();
        let records = [record("A"), record("B"), record("C")];
        let report = run_batch_with(&records, &template, ExportFormat::Pdf, None, None, |i, _| {
            if i == 1 {
                Err(CertError::EmptyCapture)
            } else {
                Ok(vec![i as u8])
            }
        })
        .unwrap();
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failed_indices, vec![1]);
        assert_eq!(archive_names(&report.archive), vec!["A-1.pdf", "C-3.pdf"]);
    }

    #[test]
    fn all_failures_still_produce_an_empty_archive() {
        let template = builtin_template("pak").unwrap();
        let report = run_batch_with(
            &[record("A")],
            &template,
            ExportFormat::Pdf,
            None,
            None,
            |_, _| Err(CertError::EmptyCapture),
        )
        .unwrap();
        assert_eq!(report.succeeded, 0);
        assert!(archive_names(&report.archive).is_empty());
    }

    #[test]
    fn cancellation_finalizes_what_is_done() {
        let template = builtin_template("pak").unwrap();
        let token = CancelToken::new();
        let records = [record("A"), record("B"), record("C")];
        let report = run_batch_with(
            &records,
            &template,
            ExportFormat::Pdf,
            Some(&token),
            None,
            |i, _| {
                if i == 1 {
                    token.cancel();
                }
                Ok(vec![1])
            },
        )
        .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.entries, vec!["A-1.pdf", "B-2.pdf"]);
        assert_eq!(archive_names(&report.archive).len(), 2);
    }
}

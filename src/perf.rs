//! JSON-lines timing log for export runs.
//!
//! Every span and count goes to the log as it happens. When the last handle
//! drops, a `{stem}_hot.log` file next to it ranks the totals.

use serde_json::json;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

#[derive(Clone)]
pub struct PerfLogger {
    inner: Arc<Mutex<PerfState>>,
}

impl std::fmt::Debug for PerfLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerfLogger").finish_non_exhaustive()
    }
}

struct PerfState {
    writer: BufWriter<File>,
    path: PathBuf,
    span_totals: HashMap<String, f64>,
    span_counts: HashMap<String, u64>,
    count_totals: HashMap<String, u64>,
}

impl PerfLogger {
    pub fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(PerfState {
                writer: BufWriter::new(file),
                path,
                span_totals: HashMap::new(),
                span_counts: HashMap::new(),
                count_totals: HashMap::new(),
            })),
        })
    }

    pub fn log_span_ms(&self, name: &str, item: Option<usize>, ms: f64) {
        let line = json!({
            "type": "perf.span",
            "name": name,
            "item": item,
            "unit": "ms",
            "ms": (ms * 1000.0).round() / 1000.0,
        });
        if let Ok(mut state) = self.inner.lock() {
            *state.span_totals.entry(name.to_string()).or_insert(0.0) += ms;
            let entry = state.span_counts.entry(name.to_string()).or_insert(0);
            *entry = entry.saturating_add(1);
            let _ = writeln!(state.writer, "{line}");
        }
    }

    pub fn log_counts(&self, name: &str, item: Option<usize>, counts: &[(&str, u64)]) {
        let fields: serde_json::Map<String, serde_json::Value> = counts
            .iter()
            .map(|(key, value)| (key.to_string(), json!(value)))
            .collect();
        let line = json!({
            "type": "perf.counts",
            "name": name,
            "item": item,
            "counts": fields,
        });
        if let Ok(mut state) = self.inner.lock() {
            for (key, value) in counts {
                let entry = state.count_totals.entry(format!("{name}.{key}")).or_insert(0);
                *entry = entry.saturating_add(*value);
            }
            let _ = writeln!(state.writer, "{line}");
        }
    }

    pub fn flush(&self) {
        if let Ok(mut state) = self.inner.lock() {
            let _ = state.writer.flush();
        }
    }
}

/// Times one pipeline step and reports it to an optional logger.
pub(crate) struct Span<'a> {
    perf: Option<&'a PerfLogger>,
    name: &'static str,
    item: Option<usize>,
    started: Instant,
}

impl<'a> Span<'a> {
    pub(crate) fn start(perf: Option<&'a PerfLogger>, name: &'static str, item: Option<usize>) -> Self {
        Self {
            perf,
            name,
            item,
            started: Instant::now(),
        }
    }
}

impl Drop for Span<'_> {
    fn drop(&mut self) {
        let ms = self.started.elapsed().as_secs_f64() * 1000.0;
        log::trace!("{} took {ms:.3}ms", self.name);
        if let Some(perf) = self.perf {
            perf.log_span_ms(self.name, self.item, ms);
        }
    }
}

impl Drop for PerfState {
    fn drop(&mut self) {
        let _ = self.writer.flush();
        let hot_path = hot_path_for(&self.path);
        let Ok(file) = File::create(&hot_path) else {
            return;
        };
        let mut writer = BufWriter::new(file);

        let mut spans: Vec<(&String, &f64)> = self.span_totals.iter().collect();
        spans.sort_by(|a, b| b.1.partial_cmp(a.1).unwrap_or(std::cmp::Ordering::Equal));
        for (rank, (name, ms)) in spans.into_iter().take(100).enumerate() {
            let count = *self.span_counts.get(name).unwrap_or(&1);
            let avg = if count == 0 { 0.0 } else { ms / count as f64 };
            let line = json!({
                "type": "perf.hot.span",
                "rank": rank + 1,
                "name": name,
                "unit": "ms",
                "agg": "sum",
                "ms": ms,
                "count": count,
                "avg_ms": avg,
            });
            let _ = writeln!(writer, "{line}");
        }

        let mut counts: Vec<(&String, &u64)> = self.count_totals.iter().collect();
        counts.sort_by(|a, b| b.1.cmp(a.1));
        for (rank, (name, value)) in counts.into_iter().take(100).enumerate() {
            let line = json!({
                "type": "perf.hot.count",
                "rank": rank + 1,
                "name": name,
                "value": value,
            });
            let _ = writeln!(writer, "{line}");
        }
    }
}

fn hot_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("certpress_perf.log");
    let stem = file_name
        .rsplit_once('.')
        .map(|(s, _)| s)
        .unwrap_or(file_name);
    path.with_file_name(format!("{stem}_hot.log"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hot_path_replaces_extension() {
        assert_eq!(
            hot_path_for(Path::new("/tmp/run.log")),
            PathBuf::from("/tmp/run_hot.log")
        );
        assert_eq!(
            hot_path_for(Path::new("/tmp/run")),
            PathBuf::from("/tmp/run_hot.log")
        );
    }

    #[test]
    fn spans_and_counts_are_json_lines_with_hot_summary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perf.log");
        {
            let perf = PerfLogger::new(&path).unwrap();
            perf.log_span_ms("stage.capture", Some(0), 2.5);
            perf.log_span_ms("stage.capture", Some(1), 1.5);
            perf.log_counts("batch.finalize", None, &[("succeeded", 2), ("failed", 1)]);
            {
                let _span = Span::start(Some(&perf), "encode.pdf", None);
            }
            perf.flush();
        }

        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = raw
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0]["type"], "perf.span");
        assert_eq!(lines[0]["item"], 0);
        assert_eq!(lines[2]["counts"]["succeeded"], 2);

        let hot = std::fs::read_to_string(dir.path().join("perf_hot.log")).unwrap();
        let first: serde_json::Value = serde_json::from_str(hot.lines().next().unwrap()).unwrap();
        assert_eq!(first["name"], "stage.capture");
        assert_eq!(first["count"], 2);
        assert!(hot.contains("batch.finalize.succeeded"));
    }
}

//! certpress - render certificates to PDF/JPEG, singly or as ZIP batches.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand, ValueEnum};

use certpress::{
    CertError, CertificateEngine, CertificateEngineBuilder, CsvOptions, ExportFormat,
    FIELD_CERTIFICATE_DATE, FIELD_ORGANIZATION, FieldValueRecord, FontRole, OffsetMap,
    TemplateLayout, builtin_template, builtin_templates, current_awarded_date_label,
    read_records_from_path, validate_batch,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Pdf,
    Jpeg,
}

impl From<FormatArg> for ExportFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Pdf => ExportFormat::Pdf,
            FormatArg::Jpeg => ExportFormat::Jpeg,
        }
    }
}

#[derive(Parser)]
#[command(name = "certpress")]
#[command(author, version, about = "Certificate export engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct EngineArgs {
    /// Font for a role, as ROLE=PATH (roles: heading, body, signature)
    #[arg(long = "font", value_name = "ROLE=PATH")]
    fonts: Vec<String>,

    /// Capture scale, overriding the per-format default of 2
    #[arg(long)]
    scale: Option<u32>,

    /// Ignore the template's export offset presets
    #[arg(long)]
    no_offsets: bool,

    /// Write JSON-lines timing spans to this file
    #[arg(long)]
    perf_log: Option<PathBuf>,

    /// Map codepoints to glyphs without shaping
    #[arg(long)]
    no_shaping: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Export one certificate
    Single {
        /// Built-in template name or template JSON file
        #[arg(short, long)]
        template: String,

        /// Field value, as KEY=VALUE
        #[arg(short = 's', long = "set", value_name = "KEY=VALUE")]
        values: Vec<String>,

        #[arg(short, long, value_enum, default_value = "pdf")]
        format: FormatArg,

        /// Output file (defaults to certificate.pdf / certificate.jpeg)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Also write the unshifted preview as PNG
        #[arg(long)]
        preview_png: Option<PathBuf>,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Export every row of a CSV file into one ZIP archive
    Batch {
        #[arg(short, long)]
        template: String,

        /// CSV file; the header row names the field keys
        input: PathBuf,

        #[arg(short, long, value_enum, default_value = "pdf")]
        format: FormatArg,

        /// Output archive (defaults to {organization}-certificates.zip)
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// List built-in templates, or print one as JSON
    Templates {
        /// Print this template as JSON
        #[arg(long)]
        json: Option<String>,
    },

    /// Validate a CSV file against a template without rendering
    Check {
        #[arg(short, long)]
        template: String,

        input: PathBuf,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Single {
            template,
            values,
            format,
            output,
            preview_png,
            engine,
        } => cmd_single(&template, &values, format.into(), output, preview_png, &engine),
        Commands::Batch {
            template,
            input,
            format,
            output,
            engine,
        } => cmd_batch(&template, &input, format.into(), output, &engine),
        Commands::Templates { json } => cmd_templates(json.as_deref()),
        Commands::Check { template, input } => cmd_check(&template, &input),
    }
}

fn load_template(arg: &str) -> Result<TemplateLayout> {
    let path = Path::new(arg);
    if path.extension().is_some_and(|ext| ext == "json") || path.is_file() {
        return TemplateLayout::from_json_file(path)
            .with_context(|| format!("Failed to load template {}", path.display()));
    }
    builtin_template(arg).ok_or_else(|| {
        let known: Vec<String> = builtin_templates().into_iter().map(|t| t.name).collect();
        anyhow!("Unknown template {arg:?} (built-in: {})", known.join(", "))
    })
}

fn split_pair(raw: &str) -> Result<(&str, &str)> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim(), v))
        .ok_or_else(|| anyhow!("Expected KEY=VALUE, got {raw:?}"))
}

fn build_engine(args: &EngineArgs) -> Result<CertificateEngine> {
    let mut builder: CertificateEngineBuilder = CertificateEngine::builder().shape_text(!args.no_shaping);
    for raw in &args.fonts {
        let (role, path) = split_pair(raw)?;
        let role = FontRole::from_str(role).ok_or_else(|| anyhow!("Unknown font role {role:?}"))?;
        builder = builder.register_font_file(role, path);
    }
    if let Some(scale) = args.scale {
        builder = builder.pdf_scale(scale).jpeg_scale(scale);
    }
    if let Some(path) = &args.perf_log {
        builder = builder.perf_log(path);
    }
    builder.build().context("Invalid engine configuration")
}

/// Every row carries the template's organization and, when blank, today's
/// awarded-date label.
fn batch_csv_options(template: &TemplateLayout) -> CsvOptions {
    CsvOptions::default()
        .with_override(FIELD_ORGANIZATION, template.organization.clone())
        .with_default(FIELD_CERTIFICATE_DATE, current_awarded_date_label())
}

fn report_violations(err: &CertError) {
    for violation in err.violations() {
        eprintln!("  {violation}");
    }
}

fn cmd_single(
    template: &str,
    values: &[String],
    format: ExportFormat,
    output: Option<PathBuf>,
    preview_png: Option<PathBuf>,
    args: &EngineArgs,
) -> Result<()> {
    let template = load_template(template)?;
    let engine = build_engine(args)?;

    let mut record = FieldValueRecord::new();
    for raw in values {
        let (key, value) = split_pair(raw)?;
        record.set(key, value);
    }
    let record = record
        .with_default(FIELD_ORGANIZATION, template.organization.clone())
        .with_default(FIELD_CERTIFICATE_DATE, current_awarded_date_label())
        .conform(&template);

    let preview = engine.render_preview(&template, &record)?;
    if let Some(path) = preview_png {
        let png = preview.capture(engine.fonts(), 1)?.encode_png()?;
        fs::write(&path, png).with_context(|| format!("Failed to write {}", path.display()))?;
    }

    let offsets = if args.no_offsets {
        OffsetMap::default()
    } else {
        template.export_offsets.single(format).clone()
    };
    let bytes = match engine.export(&template, &record, format, &offsets, Some(&preview)) {
        Ok(bytes) => bytes,
        Err(err @ CertError::Validation(_)) => {
            eprintln!("Validation failed:");
            report_violations(&err);
            bail!("certificate not exported");
        }
        Err(err) => return Err(err.into()),
    };

    let output = output.unwrap_or_else(|| PathBuf::from(format.single_file_name()));
    fs::write(&output, &bytes).with_context(|| format!("Failed to write {}", output.display()))?;
    println!("Wrote {} ({} bytes)", output.display(), bytes.len());
    Ok(())
}

fn cmd_batch(
    template: &str,
    input: &Path,
    format: ExportFormat,
    output: Option<PathBuf>,
    args: &EngineArgs,
) -> Result<()> {
    let template = load_template(template)?;
    let engine = build_engine(args)?;
    let options = batch_csv_options(&template);
    let records = read_records_from_path(input, &template, &options)
        .with_context(|| format!("Failed to read {}", input.display()))?;
    if records.is_empty() {
        bail!("{} has no data rows", input.display());
    }

    let offsets = args.no_offsets.then(OffsetMap::default);
    let report = match engine.run_batch(&records, &template, offsets.as_ref(), format, None) {
        Ok(report) => report,
        Err(err @ CertError::Validation(_)) => {
            eprintln!(
                "{} of {} record(s) have fields that are too long:",
                err.violations()
                    .iter()
                    .filter_map(|v| v.row)
                    .collect::<std::collections::BTreeSet<_>>()
                    .len(),
                records.len()
            );
            report_violations(&err);
            bail!("batch not exported");
        }
        Err(err) => return Err(err.into()),
    };

    let output = output.unwrap_or_else(|| PathBuf::from(format.archive_name(&template.organization)));
    fs::write(&output, &report.archive)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!(
        "Wrote {} ({} certificate(s), {} failed)",
        output.display(),
        report.succeeded,
        report.failed
    );
    for failure in &report.failures {
        eprintln!("  row {}: {}", failure.index + 1, failure.reason);
    }
    Ok(())
}

fn cmd_templates(json: Option<&str>) -> Result<()> {
    if let Some(name) = json {
        let template = load_template(name)?;
        println!("{}", template.to_json_string()?);
        return Ok(());
    }
    for template in builtin_templates() {
        println!(
            "{:<6} {} ({}x{})",
            template.name, template.organization, template.width, template.height
        );
    }
    Ok(())
}

fn cmd_check(template: &str, input: &Path) -> Result<()> {
    let template = load_template(template)?;
    let options = batch_csv_options(&template);
    let records = read_records_from_path(input, &template, &options)
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let violations = validate_batch(&template, &records);
    if violations.is_empty() {
        println!("{} record(s) OK", records.len());
        return Ok(());
    }
    for violation in &violations {
        println!("{violation}");
    }
    bail!("{} violation(s) found", violations.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use certpress::read_records;

    #[test]
    fn batch_rows_without_a_date_get_the_awarded_label() {
        let template = load_template("pak").unwrap();
        let data = "recipientName,programName\nJane Doe,Excellence Award\n";
        let records =
            read_records(data.as_bytes(), &template, &batch_csv_options(&template)).unwrap();
        let date = records[0].get(FIELD_CERTIFICATE_DATE).unwrap();
        assert_eq!(date, current_awarded_date_label());
        assert!(date.starts_with("Awarded "));
        assert_eq!(records[0].get(FIELD_ORGANIZATION), Some(template.organization.as_str()));
    }
}

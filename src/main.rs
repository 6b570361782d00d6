use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use http_scan_jobs::engine::ScanEngine;
use http_scan_jobs::events::BroadcastPublisher;
use http_scan_jobs::server::{self, AppState};
use http_scan_jobs::settings::RuntimeSettings;
use http_scan_jobs::store::MemoryStore;
use http_scan_jobs::templates;
use http_scan_jobs::types::{NewScan, Scan, Target};
use http_scan_jobs::worker::HttpProbeWorker;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// http-scan-jobs: run template checks against a raw HTTP request, as a one-shot scan or behind a small JSON API.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "http-scan-jobs",
    version,
    about = "Run template checks against a raw HTTP request, one-shot or behind a small JSON API.",
    long_about = None
)]
struct Cli {
    /// Address for the JSON API.
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: String,

    /// Scan timeout in milliseconds; a run still going after this is marked timed out.
    #[arg(
        long = "timeout-ms",
        default_value_t = 60_000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    timeout_ms: u64,

    /// Path to a JSON templates file. Built-in templates are used if it is missing or empty.
    #[arg(long, default_value = "templates.json")]
    templates: PathBuf,

    /// Max templates probed in parallel per scan.
    #[arg(long, default_value_t = 8)]
    concurrency: usize,

    /// Per-connection connect/read/write timeout in milliseconds.
    #[arg(long = "io-timeout-ms", default_value_t = 5_000)]
    io_timeout_ms: u64,

    /// Raw HTTP request file for a one-shot scan.
    #[arg(long)]
    request: Option<PathBuf>,

    /// Target host for the one-shot scan.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Target port for the one-shot scan (0 picks 80 or 443).
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Use TLS for the one-shot scan.
    #[arg(long, default_value_t = false)]
    tls: bool,

    /// Write the one-shot scan as pretty JSON to this path (optional).
    #[arg(long)]
    output: Option<PathBuf>,

    /// Serve the JSON API.
    #[arg(long, default_value_t = false)]
    serve: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let templates = templates::load_templates_or_default(&cli.templates)?;
    info!(
        templates = templates.len(),
        timeout_ms = cli.timeout_ms,
        concurrency = cli.concurrency,
        io_timeout_ms = cli.io_timeout_ms,
        "configuration loaded"
    );

    let settings = Arc::new(RuntimeSettings::new(cli.timeout_ms));
    let events = BroadcastPublisher::default();
    let worker = HttpProbeWorker::new(
        templates,
        cli.concurrency,
        Duration::from_millis(cli.io_timeout_ms),
    )?;
    let engine = ScanEngine::new(
        Arc::new(MemoryStore::new()),
        settings.clone(),
        Arc::new(worker),
        Arc::new(events.clone()),
    );

    if let Some(path) = cli.request.as_deref() {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read request file: {}", path.display()))?;
        let target = Target {
            request: Some(raw),
            host: cli.host.clone(),
            port: cli.port,
            tls: cli.tls,
        };
        let scan = engine
            .create_scan(NewScan {
                name: Some(path.display().to_string()),
                target,
            })
            .await?;
        match engine.run_scan(scan.id).await {
            Ok(scan) => print_results_table(&scan),
            Err(e) => warn!(error = %e, "scan failed"),
        }
        let scan = engine.get_scan(scan.id).await?;
        if let Some(out) = cli.output.as_deref() {
            if let Err(e) = write_scan_json(out, &scan) {
                eprintln!("Failed to write JSON to {}: {}", out.display(), e);
            } else {
                println!("Wrote JSON results to {}", out.display());
            }
        }
    }

    if cli.serve {
        let state = AppState::new(engine, settings, events);
        tokio::select! {
            res = server::spawn_server(&cli.bind, state) => res?,
            _ = tokio::signal::ctrl_c() => info!("shutting down"),
        }
    } else if cli.request.is_none() {
        println!("Nothing to do: pass --request <file> for a one-shot scan or --serve for the API.");
    }

    Ok(())
}

fn print_results_table(scan: &Scan) {
    let mut id_w = "template".len();
    let mut name_w = "name".len();
    for r in &scan.results {
        id_w = id_w.max(r.template_id.len());
        name_w = name_w.max(r.template_name.len().min(48));
    }
    let sev_w = "severity".len();
    let status_w = "status".len();

    let matched = scan.results.iter().filter(|r| r.matched).count();
    println!(
        "\nScan {} {:?}: {} of {} templates matched",
        scan.id,
        scan.state,
        matched,
        scan.results.len()
    );
    println!(
        "{:<id_w$}  {:<name_w$}  {:<sev_w$}  {:>status_w$}  result",
        "template", "name", "severity", "status",
    );
    println!(
        "{:-<id_w$}  {:-<name_w$}  {:-<sev_w$}  {:-<status_w$}  ------",
        "", "", "", "",
    );
    for r in &scan.results {
        let name: String = r.template_name.chars().take(48).collect();
        let outcome = match (&r.error, r.matched) {
            (Some(e), _) => format!("error: {e}"),
            (None, true) => "MATCH".to_string(),
            (None, false) => "-".to_string(),
        };
        println!(
            "{:<id_w$}  {:<name_w$}  {:<sev_w$}  {:>status_w$}  {}",
            r.template_id,
            name,
            format!("{:?}", r.severity).to_lowercase(),
            r.status_code.as_deref().unwrap_or("-"),
            outcome,
        );
    }
}

fn write_scan_json(path: &Path, scan: &Scan) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, scan)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_must_be_positive() {
        assert!(Cli::try_parse_from(["http-scan-jobs", "--timeout-ms", "0"]).is_err());
        let cli = Cli::try_parse_from(["http-scan-jobs", "--timeout-ms", "1"]).unwrap();
        assert_eq!(cli.timeout_ms, 1);
        let cli = Cli::try_parse_from(["http-scan-jobs"]).unwrap();
        assert_eq!(cli.timeout_ms, 60_000);
    }
}

use crate::message::{parse_http_request, parse_http_response, ParsedRequest, ParsedResponse};
use crate::templates::Template;
use crate::types::{Scan, Target, TemplateResult};
use ::time::OffsetDateTime;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time;
use tokio_native_tls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Upper bound on bytes read from a single response.
pub const MAX_RESPONSE_BYTES: u64 = 1 << 20;

/// Executes the checks of a scan.
///
/// `cancel` is a request to stop early. Implementations should observe it,
/// but callers never rely on that for correctness.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn execute(&self, scan: &Scan, cancel: CancellationToken) -> Result<Vec<TemplateResult>>;
}

/// Sends the target request once per template and matches the responses.
///
/// - Limits concurrent probes with a `Semaphore`.
/// - Bounds connect, write and read with `tokio::time::timeout`.
/// - Speaks TLS when the target asks for it; certificates are not verified.
/// - Network errors become results with `error` set instead of failing the run.
pub struct HttpProbeWorker {
    templates: Arc<Vec<Template>>,
    concurrency: usize,
    io_timeout: Duration,
    tls: TlsConnector,
}

impl HttpProbeWorker {
    pub fn new(templates: Vec<Template>, concurrency: usize, io_timeout: Duration) -> Result<Self> {
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .context("failed to build TLS connector")?;
        Ok(Self {
            templates: Arc::new(templates),
            concurrency: concurrency.clamp(1, 256),
            io_timeout,
            tls: TlsConnector::from(tls),
        })
    }

    pub fn templates(&self) -> &[Template] {
        &self.templates
    }
}

#[async_trait]
impl Worker for HttpProbeWorker {
    async fn execute(&self, scan: &Scan, cancel: CancellationToken) -> Result<Vec<TemplateResult>> {
        let raw = scan
            .target
            .request
            .as_deref()
            .ok_or_else(|| anyhow!("scan {} has no request", scan.id))?;
        let base = parse_http_request(raw).context("target request does not parse")?;
        let target = Arc::new(scan.target.clone());

        let sem = Arc::new(Semaphore::new(self.concurrency));
        let mut set = JoinSet::new();

        for (idx, template) in self.templates.iter().enumerate() {
            let permit = tokio::select! {
                permit = sem.clone().acquire_owned() => Some(permit.context("probe semaphore closed")?),
                _ = cancel.cancelled() => None,
            };
            let Some(permit) = permit else {
                break;
            };

            let raw = prepare_request(template.apply(&base), &target);
            let template = template.clone();
            let target = target.clone();
            let tls = self.tls.clone();
            let io_timeout = self.io_timeout;
            let cancel = cancel.clone();

            set.spawn(async move {
                let _permit = permit; // keep permit until the probe finishes
                let outcome = tokio::select! {
                    res = exchange(&target, &raw, io_timeout, &tls) => res,
                    _ = cancel.cancelled() => Err(anyhow!("cancelled")),
                };
                (idx, evaluate(&template, outcome))
            });
        }

        let mut results = Vec::with_capacity(self.templates.len());
        while let Some(joined) = set.join_next().await {
            results.push(joined.context("probe task failed")?);
        }
        if cancel.is_cancelled() {
            bail!("scan {} cancelled", scan.id);
        }
        results.sort_by_key(|(idx, _)| *idx);
        Ok(results.into_iter().map(|(_, r)| r).collect())
    }
}

/// Finalize headers for a one-shot exchange and render the wire text.
pub fn prepare_request(mut req: ParsedRequest, target: &Target) -> String {
    if !req.headers.contains_key("host") && !target.host.is_empty() {
        let host = if target.port == 0 || target.port == default_port(target.tls) {
            target.host.clone()
        } else {
            format!("{}:{}", target.host, target.port)
        };
        req.headers.insert("host".into(), host);
    }
    req.headers.insert("connection".into(), "close".into());
    if req.body.is_empty() {
        req.headers.remove("content-length");
    } else {
        req.headers
            .insert("content-length".into(), req.body.len().to_string());
    }
    req.to_raw()
}

fn default_port(tls: bool) -> u16 {
    if tls {
        443
    } else {
        80
    }
}

async fn exchange(
    target: &Target,
    raw: &str,
    io_timeout: Duration,
    tls: &TlsConnector,
) -> Result<ParsedResponse> {
    if target.host.is_empty() {
        bail!("target has no host");
    }
    let port = match target.port {
        0 => default_port(target.tls),
        p => p,
    };
    let addr = format!("{}:{}", target.host, port);
    let stream = time::timeout(io_timeout, TcpStream::connect(&addr))
        .await
        .with_context(|| format!("connect to {addr} timed out"))?
        .with_context(|| format!("connect to {addr} failed"))?;

    let bytes = if target.tls {
        let stream = time::timeout(io_timeout, tls.connect(&target.host, stream))
            .await
            .with_context(|| format!("TLS handshake with {addr} timed out"))?
            .with_context(|| format!("TLS handshake with {addr} failed"))?;
        roundtrip(stream, raw, io_timeout).await?
    } else {
        roundtrip(stream, raw, io_timeout).await?
    };
    debug!(%addr, bytes = bytes.len(), "probe response received");

    let text = String::from_utf8_lossy(&bytes);
    parse_http_response(&text).context("unparseable response")
}

/// Write the request, then read until EOF, the size cap, or the timeout.
/// A timeout after some bytes arrived keeps what was read.
async fn roundtrip<S>(mut stream: S, raw: &str, io_timeout: Duration) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    time::timeout(io_timeout, stream.write_all(raw.as_bytes()))
        .await
        .context("request write timed out")?
        .context("request write failed")?;

    let mut buf = Vec::new();
    let mut limited = (&mut stream).take(MAX_RESPONSE_BYTES);
    let read = time::timeout(io_timeout, limited.read_to_end(&mut buf)).await;
    match read {
        Ok(Err(e)) if buf.is_empty() => return Err(e).context("response read failed"),
        Err(_) if buf.is_empty() => bail!("response read timed out"),
        _ => {}
    }
    Ok(buf)
}

fn evaluate(template: &Template, outcome: Result<ParsedResponse>) -> TemplateResult {
    let (matched, status_code, error) = match outcome {
        Ok(resp) => (template.matches(&resp), Some(resp.status_code), None),
        Err(e) => (false, None, Some(format!("{e:#}"))),
    };
    TemplateResult {
        id: 0,
        template_id: template.id.clone(),
        template_name: template.name.clone(),
        severity: template.severity,
        matched,
        status_code,
        error,
        checked_at: OffsetDateTime::now_utc(),
    }
}

use crate::message::{Headers, ParsedRequest, ParsedResponse};
use crate::types::Severity;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

/// One check run against a scan target.
///
/// The target request is sent with the optional `method`/`path` overrides and
/// extra `headers`; the template matches when every matcher holds for the
/// response.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub matchers: Vec<Matcher>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Matcher {
    Status { codes: Vec<u16> },
    /// Header present and its value contains `contains` (case-insensitive).
    Header {
        name: String,
        #[serde(default)]
        contains: String,
    },
    Body { contains: String },
}

impl Matcher {
    pub fn matches(&self, response: &ParsedResponse) -> bool {
        match self {
            Matcher::Status { codes } => response
                .status_code
                .parse::<u16>()
                .map(|code| codes.contains(&code))
                .unwrap_or(false),
            Matcher::Header { name, contains } => response
                .headers
                .get(&name.to_ascii_lowercase())
                .map(|v| v.to_ascii_lowercase().contains(&contains.to_ascii_lowercase()))
                .unwrap_or(false),
            Matcher::Body { contains } => response.body.contains(contains.as_str()),
        }
    }
}

impl Template {
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            bail!("template id is empty");
        }
        if self.name.trim().is_empty() {
            bail!("template {}: name is empty", self.id);
        }
        if self.matchers.is_empty() {
            bail!("template {}: no matchers", self.id);
        }
        for m in &self.matchers {
            match m {
                Matcher::Status { codes } => {
                    if codes.is_empty() {
                        bail!("template {}: status matcher without codes", self.id);
                    }
                    if let Some(c) = codes.iter().find(|c| !(100..=599).contains(*c)) {
                        bail!("template {}: status code out of range: {c}", self.id);
                    }
                }
                Matcher::Header { name, .. } if name.trim().is_empty() => {
                    bail!("template {}: header matcher without a name", self.id);
                }
                _ => {}
            }
        }
        if let Some(path) = &self.path {
            if path.is_empty() || path.chars().any(char::is_whitespace) {
                bail!("template {}: invalid path override: {path:?}", self.id);
            }
        }
        if let Some(method) = &self.method {
            if !is_token(method) {
                bail!("template {}: invalid method override: {method:?}", self.id);
            }
        }
        for (name, value) in &self.headers {
            if !is_token(name.trim()) {
                bail!("template {}: invalid header name: {name:?}", self.id);
            }
            if value.chars().any(|c| c == '\r' || c == '\n') {
                bail!("template {}: line break in header {name:?}", self.id);
            }
        }
        Ok(())
    }

    pub fn matches(&self, response: &ParsedResponse) -> bool {
        self.matchers.iter().all(|m| m.matches(response))
    }

    /// Build the request this template sends, starting from the target's.
    pub fn apply(&self, base: &ParsedRequest) -> ParsedRequest {
        let mut req = base.clone();
        if let Some(method) = &self.method {
            req.method = method.to_ascii_uppercase();
        }
        if let Some(path) = &self.path {
            req.uri = path.clone();
        }
        let extra: Headers = self
            .headers
            .iter()
            .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
            .collect();
        req.headers.extend(extra);
        req
    }
}

/// Non-empty, no whitespace or control characters, no header separator.
fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| !c.is_whitespace() && !c.is_control() && c != ':')
}

/// Parse a JSON array of templates and validate each one plus id uniqueness.
pub fn parse_templates_str(s: &str) -> Result<Vec<Template>> {
    let templates: Vec<Template> =
        serde_json::from_str(s).context("templates must be a JSON array")?;
    let mut seen = HashSet::new();
    for (idx, t) in templates.iter().enumerate() {
        t.validate()
            .with_context(|| format!("template #{}", idx + 1))?;
        if !seen.insert(t.id.as_str()) {
            bail!("duplicate template id: {}", t.id);
        }
    }
    Ok(templates)
}

pub fn load_templates_from_path(path: impl AsRef<Path>) -> Result<Vec<Template>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read templates file: {}", path.as_ref().display()))?;
    parse_templates_str(&content)
        .with_context(|| format!("invalid templates file: {}", path.as_ref().display()))
}

/// Load templates from a file, falling back to the built-in set when the file
/// is missing or empty. A file that exists but does not validate is an error.
pub fn load_templates_or_default(path: impl AsRef<Path>) -> Result<Vec<Template>> {
    if !path.as_ref().exists() {
        return Ok(default_templates());
    }
    let templates = load_templates_from_path(path)?;
    if templates.is_empty() {
        return Ok(default_templates());
    }
    Ok(templates)
}

/// A small passive set of information-disclosure checks.
pub fn default_templates() -> Vec<Template> {
    fn header(name: &str) -> Matcher {
        Matcher::Header {
            name: name.into(),
            contains: String::new(),
        }
    }
    vec![
        Template {
            id: "server-banner".into(),
            name: "Server header discloses software".into(),
            severity: Severity::Info,
            method: None,
            path: None,
            headers: BTreeMap::new(),
            matchers: vec![header("server")],
        },
        Template {
            id: "x-powered-by".into(),
            name: "X-Powered-By header discloses framework".into(),
            severity: Severity::Low,
            method: None,
            path: None,
            headers: BTreeMap::new(),
            matchers: vec![header("x-powered-by")],
        },
        Template {
            id: "directory-listing".into(),
            name: "Directory listing enabled".into(),
            severity: Severity::Medium,
            method: None,
            path: None,
            headers: BTreeMap::new(),
            matchers: vec![
                Matcher::Status { codes: vec![200] },
                Matcher::Body {
                    contains: "Index of /".into(),
                },
            ],
        },
        Template {
            id: "trace-enabled".into(),
            name: "TRACE method reflects the request".into(),
            severity: Severity::Medium,
            method: Some("TRACE".into()),
            path: None,
            headers: BTreeMap::from([("x-trace-probe".to_string(), "hsj-probe".to_string())]),
            matchers: vec![
                Matcher::Status { codes: vec![200] },
                Matcher::Body {
                    contains: "hsj-probe".into(),
                },
            ],
        },
    ]
}

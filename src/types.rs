use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub type ScanId = u64;

/// Lifecycle state of a scan.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl ScanState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ScanState::Completed | ScanState::Failed | ScanState::TimedOut | ScanState::Cancelled
        )
    }
}

/// What a scan is pointed at: a raw HTTP request plus where to send it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Target {
    #[serde(default)]
    pub request: Option<String>,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Low,
    Medium,
    High,
    Critical,
}

/// Outcome of one template check against the target.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TemplateResult {
    /// Position within the parent scan's results, starting at 1.
    pub id: u64,
    pub template_id: String,
    pub template_name: String,
    pub severity: Severity,
    pub matched: bool,
    pub status_code: Option<String>,
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Scan {
    pub id: ScanId,
    #[serde(default)]
    pub name: Option<String>,
    pub state: ScanState,
    pub target: Target,
    pub results: Vec<TemplateResult>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    pub error: Option<String>,
}

impl Scan {
    /// A fresh pending scan. The store assigns the real id on insert.
    pub fn pending(name: Option<String>, target: Target) -> Self {
        Self {
            id: 0,
            name,
            state: ScanState::Pending,
            target,
            results: Vec::new(),
            started_at: OffsetDateTime::now_utc(),
            finished_at: None,
            error: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == ScanState::Running
    }

    pub fn result(&self, result_id: u64) -> Option<&TemplateResult> {
        self.results.iter().find(|r| r.id == result_id)
    }
}

/// Request body for creating a scan.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NewScan {
    #[serde(default)]
    pub name: Option<String>,
    pub target: Target,
}

/// User-editable fields of a stored scan.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub target: Option<Target>,
}

/// Partial update applied by the store. Absent fields are left untouched;
/// `Some(None)` clears an optional field.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ScanState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Target>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<TemplateResult>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "patch_timestamp"
    )]
    pub finished_at: Option<Option<OffsetDateTime>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Option<String>>,
}

impl ScanPatch {
    pub fn apply(self, scan: &mut Scan) {
        if let Some(name) = self.name {
            scan.name = Some(name);
        }
        if let Some(state) = self.state {
            scan.state = state;
        }
        if let Some(target) = self.target {
            scan.target = target;
        }
        if let Some(mut results) = self.results {
            for (idx, result) in results.iter_mut().enumerate() {
                result.id = idx as u64 + 1;
            }
            scan.results = results;
        }
        if let Some(finished_at) = self.finished_at {
            scan.finished_at = finished_at;
        }
        if let Some(error) = self.error {
            scan.error = error;
        }
    }
}

impl From<ScanUpdate> for ScanPatch {
    fn from(update: ScanUpdate) -> Self {
        Self {
            name: update.name,
            target: update.target,
            ..Self::default()
        }
    }
}

/// `finished_at` inside a patch: absent, cleared (`null`) or set (RFC 3339).
mod patch_timestamp {
    use serde::{Deserializer, Serializer};
    use time::OffsetDateTime;

    pub fn serialize<S>(value: &Option<Option<OffsetDateTime>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(Some(at)) => time::serde::rfc3339::serialize(at, serializer),
            _ => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Option<OffsetDateTime>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        time::serde::rfc3339::option::deserialize(deserializer).map(Some)
    }
}

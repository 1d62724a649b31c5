use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A configured MISP server. `name` is stable for the process life;
/// `api_key` must never be logged (see `Display` below).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    #[serde(default)]
    pub case_template: Option<String>,
    #[serde(default)]
    pub artifact_tags: Vec<String>,
}

impl std::fmt::Display for InstanceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "InstanceConfig {{ name: {}, base_url: {}, api_key: <redacted> }}", self.name, self.base_url)
    }
}

/// Header of a remote event as seen in the index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MispEventSummary {
    pub source: String,
    pub source_ref: String,
    pub publish_timestamp: i64,
    pub info: String,
    #[serde(default)]
    pub threat_level: Option<i64>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// One attribute on a remote event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MispAttribute {
    pub id: String,
    #[serde(rename = "type")]
    pub attr_type: String,
    pub category: String,
    pub value: String,
    #[serde(default)]
    pub comment: String,
    /// Seconds since epoch; the attribute's update time.
    pub date: i64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub deleted: bool,
}

/// Traffic Light Protocol, 0=white .. 3=red.
pub type Tlp = u8;

#[derive(Debug, Clone)]
pub struct AttachmentFile {
    pub name: String,
    pub path: PathBuf,
    pub content_type: String,
}

/// Exactly one of the three variants is set, enforced by construction.
#[derive(Debug, Clone)]
pub enum ArtifactValue {
    Data(String),
    Attachment(AttachmentFile),
    RemoteAttachment {
        filename: String,
        reference: String,
        attr_type: String,
    },
}

/// Platform-side observable.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub data_type: String,
    pub value: ArtifactValue,
    pub tags: Vec<String>,
    pub tlp: Tlp,
    pub message: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertStatus {
    New,
    Updated,
    Imported,
    Ignored,
}

/// Platform record for a MISP event. `(type, source, source_ref)` is unique;
/// `last_sync_date` is monotonic per alert.
#[derive(Debug, Clone)]
pub struct Alert {
    pub id: String,
    pub source: String,
    pub source_ref: String,
    pub last_sync_date: i64,
    pub status: AlertStatus,
    pub follow: bool,
    pub artifacts: Vec<Artifact>,
    pub case_template: Option<String>,
    pub case_id: Option<String>,
}

impl Alert {
    pub const TYPE: &'static str = "misp";
}

#[derive(Debug, Clone)]
pub struct Case {
    pub id: String,
    pub title: String,
    pub severity: i64,
    pub start_date: DateTime<Utc>,
    pub status: String,
    pub artifacts: Vec<Artifact>,
}

/// Staging record during export. `value` is either inline text or a
/// binary attachment handle.
#[derive(Debug, Clone)]
pub struct ExportedAttribute {
    pub category: String,
    pub attr_type: String,
    pub value: ExportValue,
    pub comment: String,
}

#[derive(Debug, Clone)]
pub enum ExportValue {
    Data(String),
    Attachment(AttachmentFile),
}

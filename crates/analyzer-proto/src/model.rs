use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// Backend identifier of an analyzer.  Opaque to the dashboard: the backend
/// hands out integers today, but any JSON number or string is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<i64> for EntityId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl Serialize for EntityId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Int(i64),
            Str(String),
        }

        Ok(match RawId::deserialize(deserializer)? {
            RawId::Int(n) => Self(n.to_string()),
            RawId::Str(s) => Self(s),
        })
    }
}

/// A monitored stream source, as returned by `GET /api/analyzers/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    #[serde(default)]
    pub stream_url: String,
    #[serde(default)]
    pub schema_fields: Vec<String>,
}

/// Body of a create/update call.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EntityFields {
    pub name: String,
    pub stream_url: String,
    #[serde(default)]
    pub schema_fields: Vec<String>,
}

impl EntityFields {
    /// Build fields from the create/edit form, where the schema is typed as a
    /// comma separated list.
    pub fn from_form(name: &str, stream_url: &str, schema_csv: &str) -> Self {
        Self {
            name: name.trim().to_string(),
            stream_url: stream_url.trim().to_string(),
            schema_fields: schema_csv
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }
}

/// The two kinds of generated artifact an analyzer publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Report,
    Summary,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 2] = [ArtifactKind::Report, ArtifactKind::Summary];

    /// Path segment of the filename listing endpoint.
    pub fn listing_segment(self) -> &'static str {
        match self {
            ArtifactKind::Report => "report-files",
            ArtifactKind::Summary => "summary-files",
        }
    }

    /// Path segment under which single artifacts are served.
    pub fn content_segment(self) -> &'static str {
        match self {
            ArtifactKind::Report => "reports",
            ArtifactKind::Summary => "summaries",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ArtifactKind::Report => "report",
            ArtifactKind::Summary => "summary",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "report" | "reports" => Some(ArtifactKind::Report),
            "summary" | "summaries" => Some(ArtifactKind::Summary),
            _ => None,
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Payload of one artifact.  The backend serves JSON for both kinds today,
/// but anything that does not parse is kept as text.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ArtifactContent {
    /// Explicit error marker written in place of content that failed to load.
    Failed { error: String },
    Structured(Value),
    Text(String),
}

const PREVIEW_TEXT_LIMIT: usize = 1000;
const PREVIEW_MEMBER_LIMIT: usize = 8;

/// Abbreviated rendering of an artifact for the card preview.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtifactPreview {
    /// Top-level keys, when the payload is a JSON object.
    pub keys: Option<Vec<String>>,
    pub short: String,
}

impl ArtifactContent {
    /// Interpret a raw response body.
    pub fn from_body(body: &str) -> Self {
        match serde_json::from_str::<Value>(body) {
            Ok(value) => ArtifactContent::Structured(value),
            Err(_) => ArtifactContent::Text(body.to_string()),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        ArtifactContent::Failed {
            error: message.into(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, ArtifactContent::Failed { .. })
    }

    pub fn preview(&self) -> ArtifactPreview {
        match self {
            ArtifactContent::Structured(Value::Object(map)) => {
                let elided: serde_json::Map<String, Value> = map
                    .iter()
                    .map(|(k, v)| (k.clone(), elide_large(v)))
                    .collect();
                ArtifactPreview {
                    keys: Some(map.keys().cloned().collect()),
                    short: serde_json::to_string_pretty(&Value::Object(elided))
                        .unwrap_or_default(),
                }
            }
            ArtifactContent::Structured(Value::Array(items)) => {
                let elided: Vec<Value> = items.iter().map(elide_large).collect();
                ArtifactPreview {
                    keys: None,
                    short: serde_json::to_string_pretty(&Value::Array(elided))
                        .unwrap_or_default(),
                }
            }
            ArtifactContent::Structured(Value::String(s)) | ArtifactContent::Text(s) => {
                ArtifactPreview {
                    keys: None,
                    short: truncate_chars(s, PREVIEW_TEXT_LIMIT),
                }
            }
            ArtifactContent::Structured(other) => ArtifactPreview {
                keys: None,
                short: truncate_chars(&other.to_string(), PREVIEW_TEXT_LIMIT),
            },
            ArtifactContent::Failed { error } => ArtifactPreview {
                keys: None,
                short: error.clone(),
            },
        }
    }
}

/// Collapse nested containers with too many members into `"[...]"`.
fn elide_large(value: &Value) -> Value {
    match value {
        Value::Object(map) if map.len() > PREVIEW_MEMBER_LIMIT => Value::String("[...]".into()),
        Value::Array(items) if items.len() > PREVIEW_MEMBER_LIMIT => {
            Value::String("[...]".into())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), elide_large(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(elide_large).collect()),
        other => other.clone(),
    }
}

fn truncate_chars(s: &str, limit: usize) -> String {
    s.chars().take(limit).collect()
}

/// The one retained artifact for an (entity, kind) slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    pub filename: String,
    pub content: ArtifactContent,
}

impl CacheEntry {
    /// An entry is only fresh for the selection it was fetched for.
    pub fn is_fresh_for(&self, selection: Option<&str>) -> bool {
        selection == Some(self.filename.as_str())
    }
}

/// Filename listings for one entity.  `None` means "not fetched yet", which
/// is distinct from an empty listing.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Manifest {
    pub report_files: Option<Vec<String>>,
    pub summary_files: Option<Vec<String>>,
}

/// What the UI should show for one listing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ManifestStatus<'a> {
    Loading,
    Empty,
    Available(&'a [String]),
}

impl Manifest {
    pub fn files(&self, kind: ArtifactKind) -> Option<&[String]> {
        match kind {
            ArtifactKind::Report => self.report_files.as_deref(),
            ArtifactKind::Summary => self.summary_files.as_deref(),
        }
    }

    pub fn set_files(&mut self, kind: ArtifactKind, files: Vec<String>) {
        match kind {
            ArtifactKind::Report => self.report_files = Some(files),
            ArtifactKind::Summary => self.summary_files = Some(files),
        }
    }

    pub fn status(&self, kind: ArtifactKind) -> ManifestStatus<'_> {
        match self.files(kind) {
            None => ManifestStatus::Loading,
            Some([]) => ManifestStatus::Empty,
            Some(files) => ManifestStatus::Available(files),
        }
    }
}

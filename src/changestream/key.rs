use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// How change events are serialized for clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsonMode {
    #[default]
    Relaxed,
    /// Numbers carry their type, e.g. `{"$numberLong": "1"}`
    Extended,
}

impl FromStr for JsonMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "relaxed" => Ok(Self::Relaxed),
            "extended" => Ok(Self::Extended),
            other => Err(format!("unknown json mode '{other}'")),
        }
    }
}

impl fmt::Display for JsonMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Relaxed => f.write_str("relaxed"),
            Self::Extended => f.write_str("extended"),
        }
    }
}

/// Identity of a change-stream worker.
///
/// Two requests share a worker when their normalized stream URL, their
/// aggregation variables and their output mode are equal. Variables compare
/// by canonical serialization, so key order in `avars` does not matter.
#[derive(Debug, Clone)]
pub struct ChangeStreamWorkerKey {
    url: String,
    avars: Value,
    canonical_avars: String,
    mode: JsonMode,
}

impl ChangeStreamWorkerKey {
    pub fn new(url: &str, avars: Value, mode: JsonMode) -> Self {
        // serde_json maps keep their keys sorted
        let canonical_avars = avars.to_string();
        Self {
            url: normalize_url(url),
            avars,
            canonical_avars,
            mode,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn avars(&self) -> &Value {
        &self.avars
    }

    pub fn mode(&self) -> JsonMode {
        self.mode
    }
}

impl PartialEq for ChangeStreamWorkerKey {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url && self.mode == other.mode && self.canonical_avars == other.canonical_avars
    }
}

impl Eq for ChangeStreamWorkerKey {}

impl Hash for ChangeStreamWorkerKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.url.hash(state);
        self.canonical_avars.hash(state);
        self.mode.hash(state);
    }
}

impl fmt::Display for ChangeStreamWorkerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}?avars={}&jsonMode={}", self.url, self.canonical_avars, self.mode)
    }
}

fn normalize_url(url: &str) -> String {
    let segments: Vec<&str> = url.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}

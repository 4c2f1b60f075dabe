use chrono::{DateTime, NaiveDateTime, Utc};
use connector_core::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

/// Naive forms the feed emits for `modified`/`created`; read as UTC.
const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// A resume point. Keeps the text exactly as it was seen so it can be handed
/// back to the feed unchanged, and orders by the instant it denotes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watermark {
    instant: DateTime<Utc>,
    raw: String,
}

impl Watermark {
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The `modified` value of a raw record, falling back to `created`.
    pub fn of_record(record: &Value) -> Option<Self> {
        let candidate = ["modified", "created"].into_iter().find_map(|field| {
            record
                .get(field)
                .and_then(Value::as_str)
                .filter(|s| !s.trim().is_empty())
        })?;

        match candidate.parse() {
            Ok(watermark) => Some(watermark),
            Err(_) => {
                debug!(value = candidate, "Ignoring unparseable record timestamp");
                None
            }
        }
    }
}

impl FromStr for Watermark {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let raw = s.trim();
        let instant = DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NAIVE_FORMATS
                    .iter()
                    .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
                    .map(|naive| naive.and_utc())
            })
            .ok_or_else(|| Error::Validation(format!("not an ISO-8601 timestamp: {raw:?}")))?;

        Ok(Self {
            instant,
            raw: raw.to_string(),
        })
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Ord for Watermark {
    fn cmp(&self, other: &Self) -> Ordering {
        self.instant
            .cmp(&other.instant)
            .then_with(|| self.raw.cmp(&other.raw))
    }
}

impl PartialOrd for Watermark {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Picks where extraction starts: explicit override, then the persisted value,
/// then the configured default. `None` means a full sync. The configured text
/// is only parsed when nothing earlier in the chain applies.
pub fn resolve_resume_point(
    explicit: Option<Watermark>,
    persisted: Option<Watermark>,
    configured: Option<&str>,
) -> Result<Option<Watermark>> {
    match explicit.or(persisted) {
        Some(watermark) => Ok(Some(watermark)),
        None => configured.map(str::parse).transpose(),
    }
}

/// Running maximum over every record seen in a run, seeded with the resume point.
#[derive(Debug, Clone)]
pub struct WatermarkTracker {
    seed: Option<Watermark>,
    current: Option<Watermark>,
}

impl WatermarkTracker {
    pub fn new(seed: Option<Watermark>) -> Self {
        Self {
            current: seed.clone(),
            seed,
        }
    }

    pub fn observe(&mut self, record: &Value) {
        if let Some(candidate) = Watermark::of_record(record) {
            self.offer(candidate);
        }
    }

    pub fn offer(&mut self, candidate: Watermark) {
        if self.current.as_ref().map_or(true, |current| candidate > *current) {
            self.current = Some(candidate);
        }
    }

    pub fn current(&self) -> Option<&Watermark> {
        self.current.as_ref()
    }

    /// True once something newer than the seed has been seen.
    pub fn advanced(&self) -> bool {
        self.current != self.seed
    }

    pub fn into_current(self) -> Option<Watermark> {
        self.current
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WatermarkState {
    modified_since: Option<String>,
}

/// The resume point persisted between invocations.
#[derive(Debug, Clone)]
pub struct WatermarkFile {
    path: PathBuf,
}

impl WatermarkFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing or unreadable file is treated as "no watermark".
    pub async fn load(&self) -> Option<Watermark> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No persisted watermark");
                return None;
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Could not read watermark file");
                return None;
            }
        };

        let state: WatermarkState = match serde_json::from_str(&contents) {
            Ok(state) => state,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring corrupt watermark file");
                return None;
            }
        };

        match state.modified_since.as_deref().map(Watermark::from_str) {
            Some(Ok(watermark)) => Some(watermark),
            Some(Err(e)) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring corrupt watermark file");
                None
            }
            None => None,
        }
    }

    /// Writes through a sibling temp file and renames it into place.
    pub async fn save(&self, watermark: &Watermark) -> Result<()> {
        let state = WatermarkState {
            modified_since: Some(watermark.as_str().to_string()),
        };
        let body = serde_json::to_string_pretty(&state)?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| Error::Persistence(format!("{}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| Error::Persistence(format!("{}: {e}", self.path.display())))?;

        Ok(())
    }
}

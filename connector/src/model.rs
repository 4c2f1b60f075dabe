use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use uuid::Uuid;

/// A stored document: sanitized pulse fields plus the ingestion envelope.
pub type Document = Map<String, Value>;

/// Opaque continuation handed back by the feed. Only the source that issued it
/// knows how to interpret it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One page as the feed returned it.
#[derive(Debug, Clone, Default)]
pub struct FeedPage {
    pub records: Vec<Value>,
    pub next: Option<Cursor>,
}

/// A fetched page together with its 1-based position in the run.
#[derive(Debug, Clone)]
pub struct Page {
    pub number: u32,
    pub records: Vec<Value>,
    pub next: Option<Cursor>,
}

impl Page {
    pub fn has_next(&self) -> bool {
        self.next.is_some()
    }
}

/// Who the credential belongs to, as reported by the identity endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Identity {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub pulse_count: Option<u64>,
    #[serde(default)]
    pub indicator_count: Option<u64>,
}

/// Per-invocation state threaded through extraction, normalization and load.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub source: String,
}

impl RunContext {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            source: source.into(),
        }
    }

    /// Envelope for a record fetched on `page_no`, stamped with the current time.
    pub fn envelope(&self, page_no: u32) -> Envelope {
        Envelope {
            source: self.source.clone(),
            ingested_at: Utc::now(),
            run_id: self.run_id,
            page_no,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub source: String,
    pub ingested_at: DateTime<Utc>,
    pub run_id: Uuid,
    pub page_no: u32,
}

impl Envelope {
    /// Writes the envelope fields into `doc`, replacing same-named record fields.
    pub fn attach(&self, doc: &mut Document) {
        doc.insert("_source".into(), Value::String(self.source.clone()));
        doc.insert(
            "ingested_at".into(),
            Value::String(self.ingested_at.to_rfc3339_opts(SecondsFormat::Micros, false)),
        );
        doc.insert("run_id".into(), Value::String(self.run_id.to_string()));
        doc.insert("page_no".into(), Value::from(self.page_no));
    }
}

/// A record after key sanitization, ready to be loaded.
#[derive(Debug, Clone)]
pub struct NormalizedPulse {
    /// Sanitized record fields, without the envelope.
    pub body: Document,
    pub envelope: Envelope,
}

impl NormalizedPulse {
    pub fn id(&self) -> Option<&Value> {
        self.body.get("id").filter(|v| !v.is_null())
    }

    pub fn revision(&self) -> Option<&Value> {
        self.body.get("revision").filter(|v| !v.is_null())
    }

    /// The document as stored: record fields plus envelope.
    pub fn to_document(&self) -> Document {
        let mut doc = self.body.clone();
        self.envelope.attach(&mut doc);
        doc
    }
}

use crate::ingest::{FeedSource, PageRequest};
use crate::model::{Cursor, Document, FeedPage, Identity, NormalizedPulse};
use crate::store::{NaturalKey, PulseSink};
use async_trait::async_trait;
use connector_core::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// Serves a fixed chain of pages linked by `page-N` cursors.
pub struct ScriptedSource {
    pages: Vec<Vec<Value>>,
    auth_status: Option<u16>,
    failing_page: Option<(u32, u16)>,
    requests: Mutex<Vec<PageRequest>>,
    auth_calls: AtomicU32,
}

impl ScriptedSource {
    pub fn chain(pages: Vec<Vec<Value>>) -> Self {
        Self {
            pages,
            auth_status: None,
            failing_page: None,
            requests: Mutex::new(Vec::new()),
            auth_calls: AtomicU32::new(0),
        }
    }

    /// The identity check answers with `status` instead of 200.
    pub fn rejecting_auth(mut self, status: u16) -> Self {
        self.auth_status = Some(status);
        self
    }

    /// Fetching page `number` fails with `status`.
    pub fn failing_at(mut self, number: u32, status: u16) -> Self {
        self.failing_page = Some((number, status));
        self
    }

    pub fn requests(&self) -> Vec<PageRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn auth_calls(&self) -> u32 {
        self.auth_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedSource for ScriptedSource {
    async fn authenticate(&self) -> Result<Identity> {
        self.auth_calls.fetch_add(1, Ordering::SeqCst);
        match self.auth_status {
            Some(status) => Err(Error::Authentication {
                status,
                body: "Authentication required".into(),
            }),
            None => Ok(Identity {
                username: Some("tester".into()),
                pulse_count: Some(self.pages.iter().map(Vec::len).sum::<usize>() as u64),
                indicator_count: Some(0),
            }),
        }
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<FeedPage> {
        self.requests.lock().unwrap().push(request.clone());

        let number: u32 = match request {
            PageRequest::First { .. } => 1,
            PageRequest::Follow(cursor) => cursor
                .as_str()
                .strip_prefix("page-")
                .and_then(|n| n.parse().ok())
                .ok_or_else(|| Error::Validation(format!("unknown cursor {}", cursor.as_str())))?,
        };

        if let Some((failing, status)) = self.failing_page {
            if failing == number {
                return Err(Error::Extraction {
                    status,
                    body: "scripted failure".into(),
                });
            }
        }

        let records = self
            .pages
            .get((number as usize).saturating_sub(1))
            .cloned()
            .unwrap_or_default();
        let next = ((number as usize) < self.pages.len())
            .then(|| Cursor::new(format!("page-{}", number + 1)));

        Ok(FeedPage { records, next })
    }

    fn source_id(&self) -> &str {
        "scripted_feed"
    }
}

/// Keeps documents in a map keyed like the real collection.
#[derive(Default)]
pub struct MemorySink {
    documents: Mutex<HashMap<NaturalKey, Document>>,
    upserts: AtomicU32,
    transient_failures: AtomicU32,
    broken: bool,
}

impl MemorySink {
    /// Every upsert fails with a non-retryable error.
    pub fn broken() -> Self {
        Self {
            broken: true,
            ..Self::default()
        }
    }

    /// The first `n` upserts fail with a retryable error.
    pub fn flaky(n: u32) -> Self {
        Self {
            transient_failures: AtomicU32::new(n),
            ..Self::default()
        }
    }

    pub fn documents(&self) -> HashMap<NaturalKey, Document> {
        self.documents.lock().unwrap().clone()
    }

    pub fn upserts(&self) -> u32 {
        self.upserts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PulseSink for MemorySink {
    async fn upsert(&self, key: &NaturalKey, pulse: &NormalizedPulse) -> Result<()> {
        self.upserts.fetch_add(1, Ordering::SeqCst);

        if self.broken {
            return Err(Error::Validation("document rejected".into()));
        }
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset",
            )));
        }

        self.documents
            .lock()
            .unwrap()
            .insert(key.clone(), pulse.to_document());
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

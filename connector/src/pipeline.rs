use crate::ingest::{page_stream, FeedSource};
use crate::model::{Page, RunContext};
use crate::normalize::normalize;
use crate::store::{NaturalKey, PulseSink};
use crate::watermark::{Watermark, WatermarkTracker};
use connector_core::backoff::{retry_with_backoff, RetryPolicy};
use connector_core::config::FeedConfig;
use connector_core::Result;
use futures::TryStreamExt;
use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument};

/// Knobs the pipeline needs from the feed section of the config.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub page_limit: u32,
    pub page_delay: Duration,
    pub retry: RetryPolicy,
}

impl From<&FeedConfig> for PipelineSettings {
    fn from(config: &FeedConfig) -> Self {
        Self {
            page_limit: config.page_limit,
            page_delay: Duration::from_millis(config.page_delay_ms),
            retry: RetryPolicy::from_secs_f64(config.max_retries, config.backoff_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub pages: u32,
    pub fetched: u64,
    /// Records normalized and loaded (or, in a dry run, that would have been).
    pub ingested: u64,
    pub skipped: u64,
    pub watermark: Option<Watermark>,
    pub advanced: bool,
    pub dry_run: bool,
}

pub struct Pipeline {
    source: Arc<dyn FeedSource>,
    /// `None` in a dry run: records are extracted and normalized only.
    sink: Option<Arc<dyn PulseSink>>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn FeedSource>,
        sink: Option<Arc<dyn PulseSink>>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            source,
            sink,
            settings,
        }
    }

    #[instrument(skip(self, ctx), fields(run_id = %ctx.run_id))]
    pub async fn run(&self, ctx: &RunContext, resume: Option<Watermark>) -> Result<RunSummary> {
        let mut tracker = WatermarkTracker::new(resume.clone());
        let mut summary = RunSummary {
            pages: 0,
            fetched: 0,
            ingested: 0,
            skipped: 0,
            watermark: None,
            advanced: false,
            dry_run: self.sink.is_none(),
        };

        info!(
            modified_since = resume.as_ref().map(Watermark::as_str).unwrap_or("<full sync>"),
            limit = self.settings.page_limit,
            "Starting extraction"
        );

        let mut pages = std::pin::pin!(page_stream(
            Arc::clone(&self.source),
            self.settings.page_limit,
            resume,
        ));

        let mut fetch_started = Instant::now();
        while let Some(page) = pages.try_next().await? {
            histogram!("connector_page_fetch_duration_ms")
                .record(fetch_started.elapsed().as_millis() as f64);
            counter!("connector_pages_fetched").increment(1);

            let fetched = page.records.len();
            let has_next = page.has_next();
            let number = page.number;

            self.process_page(ctx, page, &mut tracker, &mut summary)
                .await?;

            summary.pages = number;
            summary.fetched += fetched as u64;

            info!(
                page = number,
                fetched,
                total = summary.ingested,
                next = has_next,
                "[page {}] fetched={} total={} next={}",
                number,
                fetched,
                summary.ingested,
                has_next
            );

            // Politeness delay between requests to the feed
            tokio::time::sleep(self.settings.page_delay).await;
            fetch_started = Instant::now();
        }

        summary.advanced = tracker.advanced();
        summary.watermark = tracker.into_current();
        Ok(summary)
    }

    async fn process_page(
        &self,
        ctx: &RunContext,
        page: Page,
        tracker: &mut WatermarkTracker,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let mode = if self.sink.is_some() { "store" } else { "dry_run" };

        for record in page.records {
            tracker.observe(&record);

            let Some(pulse) = normalize(record, ctx.envelope(page.number)) else {
                summary.skipped += 1;
                continue;
            };

            if let Some(sink) = &self.sink {
                let key = NaturalKey::for_pulse(&pulse)?;
                retry_with_backoff(
                    || sink.upsert(&key, &pulse),
                    &self.settings.retry,
                    "upsert_pulse",
                )
                .await?;
                debug!(key = %key, page = page.number, "Upserted pulse");
            }

            summary.ingested += 1;
            counter!("connector_pulses_loaded", "mode" => mode).increment(1);
        }

        Ok(())
    }
}

use crate::ingest::{FeedSource, OtxSource};
use crate::model::RunContext;
use crate::pipeline::{Pipeline, PipelineSettings, RunSummary};
use crate::store::{PgStore, PulseSink};
use crate::watermark::{resolve_resume_point, Watermark, WatermarkFile};
use connector_core::{Config, Result};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// What the command line asked for.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub since: Option<Watermark>,
    pub ignore_persisted: bool,
    pub dry_run: bool,
}

pub struct App {
    config: Config,
    source: Arc<dyn FeedSource>,
    watermark_file: WatermarkFile,
}

impl App {
    pub fn new(config: Config) -> Result<Self> {
        let source = Arc::new(OtxSource::new(&config.feed)?);
        Ok(Self::with_source(config, source))
    }

    pub fn with_source(config: Config, source: Arc<dyn FeedSource>) -> Self {
        let watermark_file = WatermarkFile::new(config.watermark.path.clone());
        Self {
            config,
            source,
            watermark_file,
        }
    }

    #[instrument(skip(self))]
    pub async fn run(&self, options: &RunOptions) -> Result<RunSummary> {
        let resume = self.resolve_resume_point(options).await?;

        let identity = self.source.authenticate().await?;
        info!(
            username = identity.username.as_deref().unwrap_or("<unknown>"),
            pulses = ?identity.pulse_count,
            indicators = ?identity.indicator_count,
            "Authenticated as {}",
            identity.username.as_deref().unwrap_or("<unknown>")
        );

        let sink: Option<Arc<dyn PulseSink>> = if options.dry_run {
            None
        } else {
            Some(Arc::new(PgStore::connect(&self.config.storage).await?))
        };

        self.sync(resume, sink).await
    }

    async fn resolve_resume_point(&self, options: &RunOptions) -> Result<Option<Watermark>> {
        let persisted = if options.ignore_persisted {
            None
        } else {
            self.watermark_file.load().await
        };

        resolve_resume_point(
            options.since.clone(),
            persisted,
            self.config.feed.modified_since.as_deref(),
        )
    }

    /// Extract and load from `resume`, then report and persist the new watermark.
    pub(crate) async fn sync(
        &self,
        resume: Option<Watermark>,
        sink: Option<Arc<dyn PulseSink>>,
    ) -> Result<RunSummary> {
        let ctx = RunContext::new(self.source.source_id());
        let destination = sink.as_ref().map(|s| s.describe());

        let pipeline = Pipeline::new(
            Arc::clone(&self.source),
            sink,
            PipelineSettings::from(&self.config.feed),
        );
        let summary = pipeline.run(&ctx, resume).await?;

        if summary.dry_run {
            info!(
                pages = summary.pages,
                fetched = summary.fetched,
                skipped = summary.skipped,
                watermark_advanced = summary.advanced,
                "[dry-run] Would ingest {} pulse docs",
                summary.ingested
            );
        } else {
            info!(
                pages = summary.pages,
                fetched = summary.fetched,
                skipped = summary.skipped,
                watermark_advanced = summary.advanced,
                "[done] Ingested/updated {} pulse docs into {}",
                summary.ingested,
                destination.as_deref().unwrap_or("storage")
            );
        }

        if let Some(watermark) = &summary.watermark {
            match self.watermark_file.save(watermark).await {
                Ok(()) => info!(
                    modified_since = %watermark,
                    path = %self.watermark_file.path().display(),
                    advanced = summary.advanced,
                    "[watermark] saved"
                ),
                Err(e) => warn!(error = %e, "Watermark not persisted"),
            }
        }

        Ok(summary)
    }
}

use std::time::Duration;

use log::{debug, info, warn};

use crate::analysis::BuildFilter;
use crate::auth::Token;
use crate::config::Config;
use crate::error::Result;

use super::cache::{BuildCache, SaveReport};
use super::client::{BuildSource, BuildkiteClient};
use super::fetcher::{FetchSummary, Fetcher};
use super::store::BuildStore;

/// Result of bringing the local cache up to date.
pub struct SyncOutcome {
    pub store: BuildStore,
    /// `None` when the remote fetch was skipped
    pub fetch: Option<FetchSummary>,
    pub saved: Option<SaveReport>,
}

/// Buildkite build history for one pipeline, backed by a local cache.
pub struct BuildkiteProvider {
    pub client: BuildkiteClient,
    pub cache: BuildCache,
    pub organization: String,
    pub pipeline: String,
}

impl BuildkiteProvider {
    /// Creates a provider for `organization`/`pipeline`.
    ///
    /// # Errors
    ///
    /// Returns an error if the API URL is invalid or the cache directory
    /// cannot be created.
    pub fn new(
        config: &Config,
        organization: String,
        pipeline: String,
        token: Option<Token>,
    ) -> Result<Self> {
        let client = BuildkiteClient::new(&config.buildkite, &organization, &pipeline, token)?;
        let cache = BuildCache::new(config.cache.dir.as_deref(), &organization, &pipeline)?;

        Ok(Self {
            client,
            cache,
            organization,
            pipeline,
        })
    }

    /// Loads the cache, forward-fills it from Buildkite and writes it back.
    ///
    /// # Errors
    ///
    /// Returns `CacheCorrupt` for an unreadable cache, `Persistence` if the
    /// cache cannot be written, and `Fetch` if pagination failed. In the last
    /// case the builds merged before the failure are already on disk.
    pub async fn sync(
        &self,
        filter: &BuildFilter,
        max_cache_age: Option<Duration>,
    ) -> Result<SyncOutcome> {
        info!(
            "Syncing builds for pipeline {}/{} (cache: {})",
            self.organization,
            self.pipeline,
            self.cache.path().display()
        );
        sync_pipeline(
            &self.client,
            &self.cache,
            &self.pipeline,
            filter,
            max_cache_age,
        )
        .await
    }
}

async fn sync_pipeline<S: BuildSource>(
    source: &S,
    cache: &BuildCache,
    pipeline: &str,
    filter: &BuildFilter,
    max_cache_age: Option<Duration>,
) -> Result<SyncOutcome> {
    let mut store = cache.load()?;

    if let (Some(max_age), Some(age)) = (max_cache_age, cache.age()) {
        if age < max_age && !store.is_empty() {
            #[allow(clippy::cast_precision_loss)]
            let minutes = age.as_secs_f64() / 60.0;
            info!("Skip remote fetch: cache written {minutes:.1} minutes ago");
            return Ok(SyncOutcome {
                store,
                fetch: None,
                saved: None,
            });
        }
    }

    let report = Fetcher::new(source, filter, pipeline)
        .forward_fill(&mut store)
        .await;

    if report.error.is_some() {
        warn!(
            "Persisting {} builds merged before the fetch failure",
            report.stats.inserted + report.stats.updated
        );
    }
    if let Some(newest) = store.newest_number().and_then(|number| store.get(number)) {
        debug!(
            "Newest build in store: #{} ({:?}, created {})",
            newest.number, newest.state, newest.created_at
        );
    }
    let saved = cache.save(&store)?;
    let fetch = report.into_result()?;

    Ok(SyncOutcome {
        store,
        fetch: Some(fetch),
        saved: Some(saved),
    })
}

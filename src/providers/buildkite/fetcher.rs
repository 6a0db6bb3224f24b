use log::{error, info, warn};
use serde::Serialize;

use crate::analysis::BuildFilter;
use crate::error::BkLensError;

use super::client::BuildSource;
use super::store::{BuildStore, MergeStats};
use super::types::Build;

/// What a forward-fill did, including the error that ended it early, if any.
#[derive(Debug, Default)]
pub struct FetchReport {
    /// Page requests that returned data
    pub pages: usize,
    /// Builds seen across all processed pages
    pub seen: usize,
    /// Builds excluded from the merge by the filter
    pub filtered: usize,
    pub stats: MergeStats,
    /// Set when a page could not be fetched; earlier pages are already merged
    pub error: Option<BkLensError>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct FetchSummary {
    pub pages: usize,
    pub seen: usize,
    pub filtered: usize,
    pub stats: MergeStats,
}

impl FetchReport {
    /// Splits the report into its summary and the deferred error.
    pub fn into_result(self) -> Result<FetchSummary, BkLensError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(FetchSummary {
                pages: self.pages,
                seen: self.seen,
                filtered: self.filtered,
                stats: self.stats,
            }),
        }
    }
}

/// Walks the newest-first build listing and merges everything newer than the
/// cache into a [`BuildStore`].
pub struct Fetcher<'a, S> {
    source: &'a S,
    filter: &'a BuildFilter,
    pipeline: &'a str,
}

impl<'a, S: BuildSource> Fetcher<'a, S> {
    pub fn new(source: &'a S, filter: &'a BuildFilter, pipeline: &'a str) -> Self {
        Self {
            source,
            filter,
            pipeline,
        }
    }

    /// Fetches pages until one contains a finished build at or below the
    /// newest cached number, or the provider runs out of pages.
    ///
    /// Every build on a processed page goes through the filter and is merged
    /// page by page, so a failure on a later page keeps the progress made so
    /// far in `store`. The filter never influences when pagination stops.
    pub async fn forward_fill(&self, store: &mut BuildStore) -> FetchReport {
        let newest_cached = store.newest_number();
        match newest_cached {
            Some(number) => info!("Newest build in cache: #{number}, forward-filling"),
            None => info!("Cache is empty, fetching the complete build history"),
        }

        let mut report = FetchReport::default();
        let mut cursor = None;

        loop {
            let page = match self.source.fetch_page(cursor).await {
                Ok(page) => page,
                Err(e) => {
                    error!("Fetching page failed after {} page(s): {e}", report.pages);
                    report.error = Some(BkLensError::Fetch {
                        pages: report.pages,
                        reason: e.to_string(),
                    });
                    break;
                }
            };
            report.pages += 1;
            info!("Got {} builds in page {}", page.builds.len(), report.pages);

            self.sanity_check(&page.builds);

            let reached_cache = newest_cached.is_some_and(|newest| {
                page.builds
                    .iter()
                    .any(|build| build.number <= newest && build.is_finished())
            });

            report.seen += page.builds.len();
            let (kept, dropped): (Vec<_>, Vec<_>) = page
                .builds
                .into_iter()
                .partition(|build| self.filter.keeps(build));
            report.filtered += dropped.len();
            report.stats.absorb(store.merge(kept));

            if reached_cache {
                info!("Page contains already cached finished builds, stop fetching");
                break;
            }

            match page.next_page {
                Some(next) => cursor = Some(next),
                None => {
                    info!("Last page says there is no next page");
                    break;
                }
            }
        }

        info!(
            "Fetched {} page(s), merged {} builds: {} inserted, {} updated, {} unchanged, {} filtered",
            report.pages,
            report.stats.total(),
            report.stats.inserted,
            report.stats.updated,
            report.stats.unchanged,
            report.filtered
        );

        report
    }

    fn sanity_check(&self, builds: &[Build]) {
        if builds.windows(2).any(|pair| pair[0].number <= pair[1].number) {
            warn!("Page is not ordered newest-first; the stop condition relies on that order");
        }

        for build in builds {
            if let Some(slug) = build.pipeline_slug.as_deref() {
                if slug != self.pipeline {
                    error!(
                        "Got unexpected build #{} in response, with pipeline slug {slug}",
                        build.number
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::providers::buildkite::client::BuildsPage;
    use crate::providers::buildkite::types::BuildState;
    use chrono::{Duration, TimeZone, Utc};
    use std::cell::RefCell;

    /// Provider serving builds `1..=newest` newest-first in fixed-size pages.
    struct SyntheticProvider {
        builds: Vec<Build>,
        page_size: usize,
        fail_on_page: Option<u32>,
        requests: RefCell<Vec<u32>>,
    }

    impl SyntheticProvider {
        fn new(newest: u64, page_size: usize) -> Self {
            Self {
                builds: (1..=newest).rev().map(|n| create_build(n, true)).collect(),
                page_size,
                fail_on_page: None,
                requests: RefCell::new(Vec::new()),
            }
        }

        fn request_count(&self) -> usize {
            self.requests.borrow().len()
        }
    }

    impl BuildSource for SyntheticProvider {
        async fn fetch_page(&self, page: Option<u32>) -> Result<BuildsPage> {
            let page = page.unwrap_or(1);
            self.requests.borrow_mut().push(page);

            if self.fail_on_page == Some(page) {
                return Err(BkLensError::ApiErrorAfterRetries {
                    status: 503,
                    retries: 3,
                });
            }

            let start = (page as usize - 1) * self.page_size;
            let end = (start + self.page_size).min(self.builds.len());
            let builds = self.builds[start.min(end)..end].to_vec();
            let next_page = (end < self.builds.len()).then_some(page + 1);

            Ok(BuildsPage { builds, next_page })
        }
    }

    fn create_build(number: u64, finished: bool) -> Build {
        let created_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
            + Duration::hours(i64::try_from(number).unwrap());
        Build {
            number,
            state: if finished {
                BuildState::Passed
            } else {
                BuildState::Running
            },
            pipeline_slug: Some("web".to_string()),
            created_at,
            started_at: Some(created_at),
            finished_at: finished.then(|| created_at + Duration::minutes(10)),
            steps: vec![],
        }
    }

    fn cached_store(numbers: impl Iterator<Item = u64>) -> BuildStore {
        numbers.map(|n| create_build(n, true)).collect()
    }

    #[tokio::test]
    async fn test_empty_cache_fetches_until_cursor_exhausted() {
        let provider = SyntheticProvider::new(25, 10);
        let filter = BuildFilter::default();
        let mut store = BuildStore::new();

        let report = Fetcher::new(&provider, &filter, "web")
            .forward_fill(&mut store)
            .await;

        assert!(report.error.is_none());
        assert_eq!(provider.request_count(), 3);
        assert_eq!(report.pages, 3);
        assert_eq!(report.stats.inserted, 25);
        assert_eq!(store.len(), 25);
        assert_eq!(store.newest_number(), Some(25));
    }

    #[tokio::test]
    async fn test_stops_at_first_page_with_cached_finished_build() {
        let provider = SyntheticProvider::new(95, 10);
        let filter = BuildFilter::default();
        let mut store = cached_store(1..=50);

        let report = Fetcher::new(&provider, &filter, "web")
            .forward_fill(&mut store)
            .await;

        // Pages hold 95..86, 85..76, ..., 55..46: build 50 is on page 5
        assert_eq!(*provider.requests.borrow(), vec![1, 2, 3, 4, 5]);
        assert_eq!(report.seen, 50);
        assert_eq!(report.stats.inserted, 45);
        assert_eq!(report.stats.unchanged, 5);
        assert_eq!(store.len(), 95);
    }

    #[tokio::test]
    async fn test_fully_cached_pipeline_costs_one_request() {
        let provider = SyntheticProvider::new(30, 10);
        let filter = BuildFilter::default();
        let mut store = cached_store(1..=30);
        let before = store.clone();

        let report = Fetcher::new(&provider, &filter, "web")
            .forward_fill(&mut store)
            .await;

        assert_eq!(provider.request_count(), 1);
        assert_eq!(report.stats.inserted, 0);
        assert_eq!(report.stats.unchanged, 10);
        assert_eq!(store, before);
    }

    #[tokio::test]
    async fn test_unfinished_cached_builds_are_refreshed() {
        let provider = SyntheticProvider::new(35, 5);
        let filter = BuildFilter::default();
        let mut store = cached_store(1..=27);
        store.merge((28..=30).map(|n| create_build(n, false)));

        let report = Fetcher::new(&provider, &filter, "web")
            .forward_fill(&mut store)
            .await;

        // Page 2 holds 30..26 and contains finished builds <= 30
        assert_eq!(provider.request_count(), 2);
        assert_eq!(report.stats.inserted, 5);
        assert_eq!(report.stats.updated, 3);
        assert_eq!(report.stats.unchanged, 2);
        assert!(store.iter().all(Build::is_finished));
    }

    #[tokio::test]
    async fn test_filter_does_not_change_stop_condition() {
        let provider = SyntheticProvider::new(40, 10);
        // Every synthetic build runs 10 minutes
        let filter = BuildFilter {
            longer_than: Some(std::time::Duration::from_secs(60)),
            ..BuildFilter::default()
        };
        let mut store = cached_store(1..=25);

        let report = Fetcher::new(&provider, &filter, "web")
            .forward_fill(&mut store)
            .await;

        assert_eq!(provider.request_count(), 2);
        assert_eq!(report.seen, 20);
        assert_eq!(report.filtered, 20);
        assert_eq!(report.stats.total(), 0);
        assert_eq!(store.len(), 25);
    }

    #[tokio::test]
    async fn test_failure_keeps_merged_progress() {
        let mut provider = SyntheticProvider::new(100, 10);
        provider.fail_on_page = Some(3);
        let filter = BuildFilter::default();
        let mut store = BuildStore::new();

        let report = Fetcher::new(&provider, &filter, "web")
            .forward_fill(&mut store)
            .await;

        assert_eq!(report.pages, 2);
        assert_eq!(store.len(), 20);
        assert_eq!(store.newest_number(), Some(100));

        let err = report.into_result().unwrap_err();
        assert!(matches!(err, BkLensError::Fetch { pages: 2, .. }));
        assert!(err.to_string().contains("503"));
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analysis::Analysis;
use crate::providers::buildkite::{FetchSummary, MergeStats};

/// Everything one run learned about a pipeline, as written to `insights.json`.
#[derive(Debug, Serialize, Deserialize)]
pub struct PipelineInsights {
    pub provider: String,
    pub organization: String,
    pub pipeline: String,
    pub collected_at: DateTime<Utc>,
    pub cached_builds: usize,
    pub fetch: Option<FetchInsights>,
    pub analysis: Analysis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchInsights {
    pub pages: usize,
    pub seen: usize,
    pub filtered: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl From<FetchSummary> for FetchInsights {
    fn from(summary: FetchSummary) -> Self {
        let MergeStats {
            inserted,
            updated,
            unchanged,
        } = summary.stats;
        Self {
            pages: summary.pages,
            seen: summary.seen,
            filtered: summary.filtered,
            inserted,
            updated,
            unchanged,
        }
    }
}

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of a build or of one of its steps, as reported by Buildkite.
///
/// States the tool does not know about deserialize to `Unknown` instead of
/// failing, so a new provider state never poisons a cache file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    Scheduled,
    Running,
    Passed,
    Failed,
    Blocked,
    Canceling,
    Canceled,
    Skipped,
    NotRun,
    Finished,
    #[serde(other)]
    Unknown,
}

/// Steps report the same vocabulary of states as builds.
pub type StepState = BuildState;

impl BuildState {
    pub fn is_passed(self) -> bool {
        self == Self::Passed
    }
}

/// One Buildkite build (a single run of a pipeline).
///
/// Once `finished_at` is set the record is immutable; only unfinished builds
/// may be replaced by a later fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    /// Provider-assigned, increasing build number
    pub number: u64,
    pub state: BuildState,
    /// Slug of the pipeline the provider says this build belongs to
    #[serde(default)]
    pub pipeline_slug: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Steps (Buildkite "jobs") in provider order
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Build {
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Wall-clock duration from start to finish, if both are known.
    pub fn duration(&self) -> Option<Duration> {
        Some(self.finished_at? - self.started_at?)
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn duration_seconds(&self) -> Option<f64> {
        self.duration()
            .map(|d| d.num_milliseconds() as f64 / 1000.0)
    }
}

/// One named unit of work inside a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    /// Buildkite job type (`script`, `waiter`, `manual`, `trigger`)
    pub kind: String,
    /// Stable key from the pipeline definition; absent for waiters and the
    /// pipeline upload step
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub state: Option<StepState>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Step {
    #[allow(clippy::cast_precision_loss)]
    pub fn duration_seconds(&self) -> Option<f64> {
        let duration = self.finished_at? - self.started_at?;
        Some(duration.num_milliseconds() as f64 / 1000.0)
    }
}

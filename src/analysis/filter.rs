use std::time::Duration;

use chrono::{NaiveDate, NaiveTime};
use log::info;

use crate::providers::buildkite::Build;

/// Exclusion rules shared by the fetcher and the analyzer.
///
/// Builds without a known duration or finish time are never excluded by the
/// rule that needs that value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildFilter {
    pub shorter_than: Option<Duration>,
    pub longer_than: Option<Duration>,
    /// Drop builds that finished before midnight UTC of this date
    pub before: Option<NaiveDate>,
}

impl BuildFilter {
    pub fn is_active(&self) -> bool {
        self.shorter_than.is_some() || self.longer_than.is_some() || self.before.is_some()
    }

    pub fn keeps(&self, build: &Build) -> bool {
        if let Some(duration) = build.duration() {
            // Clock skew can make a duration negative; count it as zero
            let duration = duration.to_std().unwrap_or(Duration::ZERO);

            if self.shorter_than.is_some_and(|min| duration < min) {
                return false;
            }
            if self.longer_than.is_some_and(|max| duration > max) {
                return false;
            }
        }

        if let (Some(date), Some(finished_at)) = (self.before, build.finished_at) {
            if finished_at < date.and_time(NaiveTime::MIN).and_utc() {
                return false;
            }
        }

        true
    }

    /// Returns the builds that survive every rule, logging how many were dropped.
    pub fn apply<'a, I>(&self, builds: I) -> Vec<&'a Build>
    where
        I: IntoIterator<Item = &'a Build>,
    {
        let builds: Vec<&Build> = builds.into_iter().collect();
        if !self.is_active() {
            return builds;
        }

        let total = builds.len();
        let kept: Vec<&Build> = builds.into_iter().filter(|b| self.keeps(b)).collect();
        info!("Survived filter: {}", kept.len());
        info!("Dropped by filter: {}", total - kept.len());
        kept
    }
}

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use log::debug;
use serde::Serialize;

use super::types::Build;

/// Counts reported by [`BuildStore::merge`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl MergeStats {
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.unchanged
    }

    pub fn absorb(&mut self, other: MergeStats) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
    }
}

/// Build records of one pipeline, keyed by build number.
///
/// Lives for a single run: loaded from the cache file, grown by merges while
/// fetching, written back, then dropped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildStore {
    builds: BTreeMap<u64, Build>,
}

impl BuildStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest build number present, `None` for an empty store.
    pub fn newest_number(&self) -> Option<u64> {
        self.builds.keys().next_back().copied()
    }

    /// Merges fetched builds into the store.
    ///
    /// Absent numbers are inserted. A present number is replaced only if the
    /// stored record has no `finished_at`, since a running build may have
    /// finished in the meantime. Finished records are never touched.
    pub fn merge<I>(&mut self, builds: I) -> MergeStats
    where
        I: IntoIterator<Item = Build>,
    {
        let mut stats = MergeStats::default();

        for build in builds {
            match self.builds.entry(build.number) {
                Entry::Vacant(slot) => {
                    slot.insert(build);
                    stats.inserted += 1;
                }
                Entry::Occupied(mut slot) => {
                    if slot.get().is_finished() {
                        stats.unchanged += 1;
                    } else {
                        debug!("Replacing unfinished build #{}", build.number);
                        slot.insert(build);
                        stats.updated += 1;
                    }
                }
            }
        }

        stats
    }

    pub fn len(&self) -> usize {
        self.builds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.builds.is_empty()
    }

    pub fn get(&self, number: u64) -> Option<&Build> {
        self.builds.get(&number)
    }

    /// All builds, ascending by number.
    pub fn iter(&self) -> impl Iterator<Item = &Build> {
        self.builds.values()
    }

    /// Finished builds, ascending by number.
    pub fn finished(&self) -> impl Iterator<Item = &Build> {
        self.iter().filter(|build| build.is_finished())
    }
}

impl FromIterator<Build> for BuildStore {
    fn from_iter<T: IntoIterator<Item = Build>>(iter: T) -> Self {
        let mut store = Self::new();
        store.merge(iter);
        store
    }
}

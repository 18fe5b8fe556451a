use indexmap::IndexMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::config::EngineConfig;
use crate::types::DatasetItem;
use crate::types::ItemId;
use crate::types::ResultSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MergeMark {
    count: usize,
    at:    Instant,
}

/// Union of every result set received during a session, keyed by item id.
///
/// Insertion order is preserved; replacing an item keeps its original position. Items are never dropped by a merge,
/// which keeps priority or previously loaded items around when a later, narrower fetch doesn't bring them back.
#[derive(Debug, Clone, Default)]
pub struct MergedDataset {
    items:      IndexMap<ItemId, DatasetItem>,
    last_merge: Option<MergeMark>,
}

impl MergedDataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: &ItemId) -> Option<&DatasetItem> {
        self.items.get(id)
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        self.items.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DatasetItem> {
        self.items.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &ItemId> {
        self.items.keys()
    }

    /// Cardinality of the incoming set of the last applied merge.
    pub fn last_merge_count(&self) -> Option<usize> {
        self.last_merge.map(|m| m.count)
    }

    pub fn last_merged_at(&self) -> Option<Instant> {
        self.last_merge.map(|m| m.at)
    }

    /// Unconditional union, incoming items win. Doesn't touch the merge bookkeeping.
    pub fn absorb(&mut self, incoming: &ResultSet) {
        for item in incoming {
            self.items.insert(item.id.clone(), item.clone());
        }
    }
}

impl PartialEq for MergedDataset {
    fn eq(&self, other: &Self) -> bool {
        self.items == other.items
    }
}

impl FromIterator<DatasetItem> for MergedDataset {
    fn from_iter<T: IntoIterator<Item = DatasetItem>>(iter: T) -> Self {
        Self {
            items:      iter.into_iter().map(|item| (item.id.clone(), item)).collect(),
            last_merge: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStatus {
    Applied,
    /// A merge of an equally sized set happened moments ago; the dataset was left as is.
    StaleMergeSkipped,
}

#[derive(Debug, Clone)]
pub struct MergeResult {
    pub dataset: MergedDataset,
    pub status:  MergeStatus,
}

#[derive(Debug, Clone, Copy)]
pub struct ResultMerger {
    window: Duration,
}

impl ResultMerger {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.merge_window())
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn merge(&self, existing: &MergedDataset, incoming: &ResultSet) -> MergeResult {
        let mut dataset = existing.clone();
        let status = self.merge_into_at(&mut dataset, incoming, Instant::now());
        MergeResult { dataset, status }
    }

    pub fn merge_into(&self, dataset: &mut MergedDataset, incoming: &ResultSet) -> MergeStatus {
        self.merge_into_at(dataset, incoming, Instant::now())
    }

    pub fn merge_into_at(&self, dataset: &mut MergedDataset, incoming: &ResultSet, now: Instant) -> MergeStatus {
        if let Some(mark) = dataset.last_merge {
            if mark.count == incoming.len() && now.saturating_duration_since(mark.at) < self.window {
                debug!(incoming = incoming.len(), "skipping redundant merge");
                return MergeStatus::StaleMergeSkipped;
            }
        }

        let before = dataset.len();
        dataset.absorb(incoming);
        dataset.last_merge = Some(MergeMark {
            count: incoming.len(),
            at:    now,
        });
        debug!(
            incoming = incoming.len(),
            added = dataset.len() - before,
            total = dataset.len(),
            "merged result set"
        );
        MergeStatus::Applied
    }
}

impl Default for ResultMerger {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn item(id: &str, title: &str) -> DatasetItem {
        DatasetItem::new(id, title)
    }

    fn set(items: &[(&str, &str)]) -> ResultSet {
        items.iter().map(|(id, title)| item(id, title)).collect()
    }

    #[test]
    fn union_with_incoming_winning() {
        let merger = ResultMerger::new(Duration::ZERO);
        let existing: MergedDataset = [item("1", "one"), item("2", "two (old)")].into_iter().collect();
        let incoming = set(&[("2", "two (new)"), ("3", "three")]);

        let result = merger.merge(&existing, &incoming);
        assert_eq!(result.status, MergeStatus::Applied);

        let ids: Vec<_> = result.dataset.ids().map(ItemId::as_str).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(
            result.dataset.get(&ItemId::from("2")).map(|i| i.title.as_str()),
            Some("two (new)")
        );
    }

    #[test]
    fn merging_twice_changes_nothing() {
        let merger = ResultMerger::new(Duration::ZERO);
        let existing: MergedDataset = [item("1", "one"), item("5", "five")].into_iter().collect();
        let incoming = set(&[("5", "FIVE"), ("6", "six"), ("7", "seven")]);

        let once = merger.merge(&existing, &incoming).dataset;
        let twice = merger.merge(&once, &incoming).dataset;
        assert_eq!(once, twice);
        assert_eq!(twice.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn same_cardinality_within_window_is_skipped() {
        let merger = ResultMerger::new(Duration::from_millis(100));
        let mut dataset = MergedDataset::new();

        assert_eq!(
            merger.merge_into(&mut dataset, &set(&[("1", "a"), ("2", "b")])),
            MergeStatus::Applied
        );

        tokio::time::advance(Duration::from_millis(50)).await;
        assert_eq!(
            merger.merge_into(&mut dataset, &set(&[("3", "c"), ("4", "d")])),
            MergeStatus::StaleMergeSkipped
        );
        assert_eq!(dataset.len(), 2);

        // A different cardinality is never considered redundant.
        assert_eq!(
            merger.merge_into(&mut dataset, &set(&[("3", "c"), ("4", "d"), ("5", "e")])),
            MergeStatus::Applied
        );

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(
            merger.merge_into(&mut dataset, &set(&[("6", "f"), ("7", "g"), ("8", "h")])),
            MergeStatus::Applied
        );
        assert_eq!(dataset.len(), 8);
        assert_eq!(dataset.last_merge_count(), Some(3));
    }

    #[test]
    fn skipped_merge_returns_existing_unchanged() {
        let merger = ResultMerger::new(Duration::from_secs(60));
        let start = Instant::now();
        let mut dataset = MergedDataset::new();
        merger.merge_into_at(&mut dataset, &set(&[("1", "a")]), start);

        let result = merger.merge(&dataset, &set(&[("2", "b")]));
        assert_eq!(result.status, MergeStatus::StaleMergeSkipped);
        assert_eq!(result.dataset, dataset);
        assert_eq!(result.dataset.last_merged_at(), Some(start));
    }
}

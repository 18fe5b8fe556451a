use async_trait::async_trait;
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::error::SourceError;
use crate::traits::DataSource;
use crate::types::DatasetItem;
use crate::types::FetchCriteria;
use crate::types::ItemId;

/// [`DataSource`] over an in-memory list of items.
///
/// Predicates follow the directory's query semantics:
///
/// - `query` is a case-insensitive substring match against the title;
/// - `city` and `statuses` compare case-insensitively;
/// - an item matches `categories` if it carries at least one of them;
/// - `exclude_ids` are never returned;
/// - `priority_ids` are returned first, in their listed order, as long as they satisfy the other filters;
/// - [`FetchMode::Bounded`](crate::types::FetchMode) truncates the answer.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    items: Vec<DatasetItem>,
}

impl MemorySource {
    pub fn new(items: Vec<DatasetItem>) -> Self {
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn select(&self, requested: &FetchCriteria) -> Vec<DatasetItem> {
        let criteria = requested.normalized();
        let excluded: HashSet<&ItemId> = criteria.exclude_ids.iter().collect();
        let matches = |item: &DatasetItem| !excluded.contains(&item.id) && Self::matches(&criteria, item);

        let mut out: Vec<DatasetItem> = Vec::new();
        let mut taken: HashSet<&ItemId> = HashSet::new();

        for id in &criteria.priority_ids {
            if let Some(item) = self.items.iter().find(|item| &item.id == id && matches(item)) {
                taken.insert(&item.id);
                out.push(item.clone());
            }
        }

        out.extend(
            self.items
                .iter()
                .filter(|item| !taken.contains(&item.id) && matches(item))
                .cloned(),
        );

        if let Some(limit) = criteria.mode.limit() {
            out.truncate(limit);
        }
        out
    }

    fn matches(criteria: &FetchCriteria, item: &DatasetItem) -> bool {
        if let Some(query) = criteria.query.as_deref() {
            if !item.title.to_lowercase().contains(query) {
                return false;
            }
        }

        if let Some(city) = criteria.city.as_deref() {
            if !item.city.as_deref().is_some_and(|c| c.eq_ignore_ascii_case(city)) {
                return false;
            }
        }

        if !criteria.statuses.is_empty()
            && !item
                .status
                .as_deref()
                .is_some_and(|s| criteria.statuses.iter().any(|wanted| s.eq_ignore_ascii_case(wanted)))
        {
            return false;
        }

        if !criteria.categories.is_empty()
            && !item
                .categories
                .iter()
                .any(|c| criteria.categories.iter().any(|wanted| c.eq_ignore_ascii_case(wanted)))
        {
            return false;
        }

        true
    }
}

#[async_trait]
impl DataSource for MemorySource {
    #[instrument(level = "trace", skip(self, cancel))]
    async fn query(
        &self,
        criteria: &FetchCriteria,
        cancel: &CancellationToken,
    ) -> Result<Vec<DatasetItem>, SourceError> {
        if cancel.is_cancelled() {
            return Err(SourceError::new("query cancelled before it started"));
        }
        Ok(self.select(criteria))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

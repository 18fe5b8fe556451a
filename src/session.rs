use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;
use tracing::info;
use tracing::instrument;

use crate::error::FetchResult;
use crate::merger::MergeStatus;
use crate::merger::MergedDataset;
use crate::merger::ResultMerger;
use crate::progressive::ProgressiveLoader;
use crate::types::CacheKey;
use crate::types::DatasetItem;
use crate::types::FetchCriteria;
use crate::types::LoadOutcome;
use crate::types::ResultSet;
use crate::types::ViewportState;
use crate::window::ViewportWindower;

#[derive(Debug, Default)]
struct Current {
    key:     Option<CacheKey>,
    dataset: Arc<MergedDataset>,
}

// Applies a result set to the session. Results for another session key either start a new dataset or are dropped.
#[derive(Debug, Clone)]
struct Applier {
    current: Arc<RwLock<Current>>,
    merger:  ResultMerger,
}

impl Applier {
    fn apply(&self, key: &CacheKey, incoming: &ResultSet, may_switch: bool) -> Option<MergeStatus> {
        let mut current = self.current.write();

        if current.key.as_ref() != Some(key) {
            if !may_switch {
                debug!(key = %key, "result for an inactive session dropped");
                return None;
            }
            let mut dataset = MergedDataset::new();
            let status = self.merger.merge_into(&mut dataset, incoming);
            info!(key = %key, items = dataset.len(), "session switched");
            current.key = Some(key.clone());
            current.dataset = Arc::new(dataset);
            return Some(status);
        }

        let merged = self.merger.merge(&current.dataset, incoming);
        if merged.status == MergeStatus::Applied {
            current.dataset = Arc::new(merged.dataset);
        }
        Some(merged.status)
    }
}

/// Holds the dataset behind one filter context and windows it for the map.
///
/// Loads with criteria that only differ in fetch mode extend the same dataset. Any other change of criteria replaces
/// the dataset as a whole once the new initial result arrives; readers always see either the old or the new one.
#[derive(Debug)]
pub struct DatasetSession {
    loader:   ProgressiveLoader,
    applier:  Applier,
    windower: ViewportWindower,
}

impl DatasetSession {
    pub fn new(loader: ProgressiveLoader) -> Self {
        let config = loader.config();
        let applier = Applier {
            current: Arc::new(RwLock::new(Current::default())),
            merger:  ResultMerger::from_config(config),
        };
        let windower = ViewportWindower::new(config.zoom_caps());
        Self {
            loader,
            applier,
            windower,
        }
    }

    pub fn loader(&self) -> &ProgressiveLoader {
        &self.loader
    }

    #[instrument(level = "debug", skip_all, fields(criteria = ?criteria))]
    pub async fn load(&self, criteria: &FetchCriteria) -> FetchResult<LoadOutcome> {
        let key = self.loader.session_key(criteria);

        let on_initial = {
            let applier = self.applier.clone();
            let key = key.clone();
            move |initial: Arc<ResultSet>| {
                applier.apply(&key, &initial, true);
            }
        };
        let on_full = {
            let applier = self.applier.clone();
            move |full: Arc<ResultSet>| {
                applier.apply(&key, &full, false);
            }
        };

        self.loader.load_progressive(criteria, on_initial, on_full).await
    }

    /// Current dataset. Cheap; the snapshot is never modified afterwards.
    pub fn snapshot(&self) -> Arc<MergedDataset> {
        Arc::clone(&self.applier.current.read().dataset)
    }

    pub fn current_key(&self) -> Option<CacheKey> {
        self.applier.current.read().key.clone()
    }

    pub fn visible(&self, viewport: &ViewportState) -> Vec<DatasetItem> {
        self.windower.visible(&self.snapshot(), viewport)
    }

    /// Forgets the dataset and abandons any pending full fetch.
    pub fn reset(&self) {
        self.loader.cancel_background();
        let mut current = self.applier.current.write();
        current.key = None;
        current.dataset = Arc::new(MergedDataset::new());
    }
}

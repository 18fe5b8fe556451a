use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt::Display;
use std::sync::Arc;

/// Stable identifier of a [`DatasetItem`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    pub fn new<S: ToString>(id: S) -> Self {
        Self(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ItemId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Cache key produced by the [`Fingerprinter`](crate::fingerprint::Fingerprinter).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub(crate) fn from_parts(prefix: &str, digest: &str) -> Self {
        Self(format!("{prefix}{digest}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn starts_with(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// Geographic bounding box. When `west > east` the box crosses the antimeridian.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub south: f64,
    pub west:  f64,
    pub north: f64,
    pub east:  f64,
}

impl Bounds {
    pub fn new(south: f64, west: f64, north: f64, east: f64) -> Self {
        Self {
            south,
            west,
            north,
            east,
        }
    }

    pub fn contains(&self, point: &GeoPoint) -> bool {
        if point.lat < self.south || point.lat > self.north {
            return false;
        }

        if self.west <= self.east {
            point.lng >= self.west && point.lng <= self.east
        }
        else {
            point.lng >= self.west || point.lng <= self.east
        }
    }
}

/// How many rows a fetch may bring back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FetchMode {
    /// Cheap, row-limited fetch used for the initial response.
    Bounded { limit: usize },
    Full,
}

impl FetchMode {
    pub fn limit(&self) -> Option<usize> {
        match self {
            Self::Bounded { limit } => Some(*limit),
            Self::Full => None,
        }
    }
}

impl Default for FetchMode {
    fn default() -> Self {
        Self::Full
    }
}

impl Display for FetchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bounded { limit } => write!(f, "bounded({limit})"),
            Self::Full => f.write_str("full"),
        }
    }
}

/// Logical dimensions of a directory query.
///
/// List-valued dimensions carry set semantics: their order never matters. Use [`FetchCriteria::normalized`] to obtain
/// the canonical form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchCriteria {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query:        Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city:         Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub statuses:     Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories:   Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub priority_ids: Vec<ItemId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_ids:  Vec<ItemId>,
    #[serde(default)]
    pub mode:         FetchMode,
}

impl FetchCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_query<S: ToString>(mut self, query: S) -> Self {
        self.query = Some(query.to_string());
        self
    }

    pub fn with_city<S: ToString>(mut self, city: S) -> Self {
        self.city = Some(city.to_string());
        self
    }

    pub fn with_status<S: ToString>(mut self, status: S) -> Self {
        self.statuses.push(status.to_string());
        self
    }

    pub fn with_category<S: ToString>(mut self, category: S) -> Self {
        self.categories.push(category.to_string());
        self
    }

    pub fn with_priority_id<I: Into<ItemId>>(mut self, id: I) -> Self {
        self.priority_ids.push(id.into());
        self
    }

    pub fn with_excluded_id<I: Into<ItemId>>(mut self, id: I) -> Self {
        self.exclude_ids.push(id.into());
        self
    }

    pub fn with_mode(mut self, mode: FetchMode) -> Self {
        self.mode = mode;
        self
    }

    /// Canonical form: text trimmed and lowercased, empty text dropped, lists sorted and deduplicated.
    ///
    /// Priority ids are the exception: their order decides the order of the answer, so it is kept and only repeated
    /// ids are dropped.
    pub fn normalized(&self) -> Self {
        fn text(value: &Option<String>) -> Option<String> {
            value
                .as_deref()
                .map(|v| v.trim().to_lowercase())
                .filter(|v| !v.is_empty())
        }

        fn tags(values: &[String]) -> Vec<String> {
            let mut out: Vec<String> = values
                .iter()
                .map(|v| v.trim().to_lowercase())
                .filter(|v| !v.is_empty())
                .collect();
            out.sort();
            out.dedup();
            out
        }

        fn ids(values: &[ItemId]) -> Vec<ItemId> {
            let mut out = values.to_vec();
            out.sort();
            out.dedup();
            out
        }

        fn ranked(values: &[ItemId]) -> Vec<ItemId> {
            let mut seen = HashSet::new();
            values.iter().filter(|id| seen.insert(*id)).cloned().collect()
        }

        Self {
            query:        text(&self.query),
            city:         text(&self.city),
            statuses:     tags(&self.statuses),
            categories:   tags(&self.categories),
            priority_ids: ranked(&self.priority_ids),
            exclude_ids:  ids(&self.exclude_ids),
            mode:         self.mode,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetItem {
    pub id:         ItemId,
    pub title:      String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city:       Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status:     Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location:   Option<GeoPoint>,
}

impl DatasetItem {
    pub fn new<I: Into<ItemId>, S: ToString>(id: I, title: S) -> Self {
        Self {
            id:         id.into(),
            title:      title.to_string(),
            city:       None,
            status:     None,
            categories: Vec::new(),
            location:   None,
        }
    }

    pub fn with_city<S: ToString>(mut self, city: S) -> Self {
        self.city = Some(city.to_string());
        self
    }

    pub fn with_status<S: ToString>(mut self, status: S) -> Self {
        self.status = Some(status.to_string());
        self
    }

    pub fn with_category<S: ToString>(mut self, category: S) -> Self {
        self.categories.push(category.to_string());
        self
    }

    pub fn with_location(mut self, lat: f64, lng: f64) -> Self {
        self.location = Some(GeoPoint::new(lat, lng));
        self
    }
}

/// Items returned by a single fetch. Ids are unique within a set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<DatasetItem>", into = "Vec<DatasetItem>")]
pub struct ResultSet {
    items: Vec<DatasetItem>,
}

impl ResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[DatasetItem] {
        &self.items
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DatasetItem> {
        self.items.iter()
    }

    pub fn into_items(self) -> Vec<DatasetItem> {
        self.items
    }
}

impl From<Vec<DatasetItem>> for ResultSet {
    // A later duplicate replaces the earlier one in place.
    fn from(items: Vec<DatasetItem>) -> Self {
        let mut unique: IndexMap<ItemId, DatasetItem> = IndexMap::with_capacity(items.len());
        for item in items {
            unique.insert(item.id.clone(), item);
        }
        Self {
            items: unique.into_values().collect(),
        }
    }
}

impl From<ResultSet> for Vec<DatasetItem> {
    fn from(set: ResultSet) -> Self {
        set.items
    }
}

impl FromIterator<DatasetItem> for ResultSet {
    fn from_iter<T: IntoIterator<Item = DatasetItem>>(iter: T) -> Self {
        Self::from(iter.into_iter().collect::<Vec<_>>())
    }
}

impl<'a> IntoIterator for &'a ResultSet {
    type IntoIter = std::slice::Iter<'a, DatasetItem>;
    type Item = &'a DatasetItem;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// What the map currently shows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewportState {
    pub zoom:   f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Bounds>,
    /// Hovered and selected items. They stay visible no matter what.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pinned: Vec<ItemId>,
}

impl ViewportState {
    pub fn at_zoom(zoom: f64) -> Self {
        Self {
            zoom,
            ..Default::default()
        }
    }

    pub fn with_bounds(mut self, bounds: Bounds) -> Self {
        self.bounds = Some(bounds);
        self
    }

    pub fn with_pinned<I: Into<ItemId>>(mut self, id: I) -> Self {
        self.pinned.push(id.into());
        self
    }
}

/// Shared, immutable handle to a fetched result.
pub type SharedResult = Arc<ResultSet>;

/// Outcome of a progressive load.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    /// The initial fetch resolved with this many items; the full fetch has been handed to the scheduler.
    Loaded { initial: usize },
    /// An identical load was issued moments ago. Nothing was fetched.
    Skipped,
}

impl LoadOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }
}

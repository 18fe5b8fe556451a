//! Viewport windowing.
//!
//! Reduces the merged dataset to what is worth materializing for the current map view: a zoom-dependent number of
//! items, restricted to the visible bounds, plus whatever the user is pointing at.

use std::collections::HashSet;

use crate::error::ConfigError;
use crate::merger::MergedDataset;
use crate::types::DatasetItem;
use crate::types::ItemId;
use crate::types::ViewportState;

/// Monotonic step function from zoom level to the maximum number of items to show.
///
/// A tier `(below, cap)` applies to every zoom strictly lower than `below` that isn't covered by an earlier tier.
/// Zooms past the last tier get `beyond`.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoomCaps {
    tiers:  Vec<(f64, usize)>,
    beyond: usize,
}

impl ZoomCaps {
    pub fn new(tiers: Vec<(f64, usize)>, beyond: usize) -> Result<Self, ConfigError> {
        for pair in tiers.windows(2) {
            let (previous, prev_cap) = pair[0];
            let (zoom, cap) = pair[1];
            if zoom <= previous {
                return Err(ConfigError::UnsortedZoomTiers { previous, zoom });
            }
            if cap < prev_cap {
                return Err(ConfigError::ShrinkingZoomCaps {
                    previous: prev_cap,
                    cap,
                    zoom,
                });
            }
        }

        if let Some(&(zoom, last)) = tiers.last() {
            if beyond < last {
                return Err(ConfigError::ShrinkingZoomCaps {
                    previous: last,
                    cap: beyond,
                    zoom,
                });
            }
        }

        Ok(Self { tiers, beyond })
    }

    /// No cap at any zoom.
    pub fn unbounded() -> Self {
        Self {
            tiers:  Vec::new(),
            beyond: usize::MAX,
        }
    }

    pub fn cap_for(&self, zoom: f64) -> usize {
        self.tiers
            .iter()
            .find(|(below, _)| zoom < *below)
            .map_or(self.beyond, |(_, cap)| *cap)
    }
}

impl Default for ZoomCaps {
    fn default() -> Self {
        Self {
            tiers:  vec![(8.0, 100), (10.0, 200), (12.0, 300), (14.0, 600)],
            beyond: usize::MAX,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ViewportWindower {
    caps: ZoomCaps,
}

impl ViewportWindower {
    pub fn new(caps: ZoomCaps) -> Self {
        Self { caps }
    }

    pub fn caps(&self) -> &ZoomCaps {
        &self.caps
    }

    /// Items to render for `viewport`.
    ///
    /// Output order is the dataset order followed by missing pinned items in pinned order, so identical inputs always
    /// give identical outputs. Pinned items may push the output past the zoom cap.
    pub fn visible(&self, dataset: &MergedDataset, viewport: &ViewportState) -> Vec<DatasetItem> {
        let cap = self.caps.cap_for(viewport.zoom).min(dataset.len());

        let mut visible: Vec<DatasetItem> = dataset
            .iter()
            .take(cap)
            .filter(|item| match (&viewport.bounds, &item.location) {
                (None, _) => true,
                (Some(bounds), Some(location)) => bounds.contains(location),
                (Some(_), None) => false,
            })
            .cloned()
            .collect();

        if !viewport.pinned.is_empty() {
            let mut present: HashSet<&ItemId> = visible.iter().map(|item| &item.id).collect();
            let mut missing = Vec::new();
            for id in &viewport.pinned {
                if present.contains(id) {
                    continue;
                }
                if let Some(item) = dataset.get(id) {
                    present.insert(id);
                    missing.push(item.clone());
                }
            }
            visible.extend(missing);
        }

        visible
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::sample_items;
    use crate::types::Bounds;
    use crate::types::ResultSet;

    fn dataset(n: usize) -> MergedDataset {
        let mut dataset = MergedDataset::new();
        dataset.absorb(&ResultSet::from(sample_items(n)));
        dataset
    }

    #[test]
    fn caps_are_a_step_function() {
        let caps = ZoomCaps::default();
        assert_eq!(caps.cap_for(3.0), 100);
        assert_eq!(caps.cap_for(8.0), 200);
        assert_eq!(caps.cap_for(11.9), 300);
        assert_eq!(caps.cap_for(13.0), 600);
        assert_eq!(caps.cap_for(18.0), usize::MAX);

        let mut previous = 0;
        for z in 0..22 {
            let cap = caps.cap_for(z as f64);
            assert!(cap >= previous);
            previous = cap;
        }
    }

    #[test]
    fn invalid_caps_are_rejected() {
        assert_eq!(
            ZoomCaps::new(vec![(10.0, 100), (8.0, 200)], 500),
            Err(ConfigError::UnsortedZoomTiers {
                previous: 10.0,
                zoom:     8.0,
            })
        );
        assert!(matches!(
            ZoomCaps::new(vec![(8.0, 300), (10.0, 200)], 500),
            Err(ConfigError::ShrinkingZoomCaps { .. })
        ));
        assert!(matches!(
            ZoomCaps::new(vec![(8.0, 300)], 100),
            Err(ConfigError::ShrinkingZoomCaps { .. })
        ));
        assert!(ZoomCaps::new(vec![(5.0, 10), (9.0, 10)], 10).is_ok());
    }

    #[test]
    fn cap_never_exceeds_dataset() {
        let windower = ViewportWindower::default();
        let visible = windower.visible(&dataset(40), &ViewportState::at_zoom(11.0));
        assert_eq!(visible.len(), 40);
    }

    #[test]
    fn zoom_cap_limits_output() {
        let windower = ViewportWindower::default();
        let visible = windower.visible(&dataset(1_000), &ViewportState::at_zoom(11.0));
        assert_eq!(visible.len(), 300);
        assert_eq!(visible[0].id, ItemId::from("item-0"));
    }

    #[test]
    fn bounds_filter_after_cap() {
        let windower = ViewportWindower::default();
        // sample_items spreads items over a lattice; this box only covers a part of it.
        let bounds = Bounds::new(34.0, -118.5, 34.05, -118.0);
        let data = dataset(1_000);
        let visible = windower.visible(&data, &ViewportState::at_zoom(11.0).with_bounds(bounds));

        assert!(!visible.is_empty());
        assert!(visible.len() < 300);
        assert!(visible
            .iter()
            .all(|item| item.location.is_some_and(|l| bounds.contains(&l))));
    }

    #[test]
    fn pinned_item_outside_cap_and_bounds_is_kept() {
        let windower = ViewportWindower::default();
        let data = dataset(1_000);
        let far_away = Bounds::new(-1.0, -1.0, 1.0, 1.0);
        let viewport = ViewportState::at_zoom(11.0)
            .with_bounds(far_away)
            .with_pinned("item-999")
            .with_pinned("item-998")
            .with_pinned("missing");

        let visible = windower.visible(&data, &viewport);
        let ids: Vec<_> = visible.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["item-999", "item-998"]);
    }

    #[test]
    fn pinned_item_may_exceed_cap() {
        let windower = ViewportWindower::default();
        let viewport = ViewportState::at_zoom(11.0).with_pinned("item-700");
        let visible = windower.visible(&dataset(1_000), &viewport);

        assert_eq!(visible.len(), 301);
        assert_eq!(visible.last().map(|i| i.id.as_str()), Some("item-700"));
    }

    #[test]
    fn pinned_item_already_visible_is_not_duplicated() {
        let windower = ViewportWindower::default();
        let viewport = ViewportState::at_zoom(11.0).with_pinned("item-3").with_pinned("item-3");
        let visible = windower.visible(&dataset(1_000), &viewport);
        assert_eq!(visible.len(), 300);
    }

    #[test]
    fn output_is_deterministic() {
        let windower = ViewportWindower::default();
        let data = dataset(500);
        let viewport = ViewportState::at_zoom(9.0)
            .with_bounds(Bounds::new(33.0, -119.0, 35.0, -117.0))
            .with_pinned("item-450");

        let first = windower.visible(&data, &viewport);
        for _ in 0..5 {
            assert_eq!(windower.visible(&data, &viewport), first);
        }
    }
}

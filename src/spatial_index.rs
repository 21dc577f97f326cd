//! Bounding-box index over polygon features.
//!
//! This is a broad-phase filter only. A feature matches a raster when their
//! bounding boxes intersect, even if the polygon itself never touches the
//! raster's data.

use geo::Rect;
use rstar::{AABB, RTree, RTreeObject};

use crate::layer::{FeatureId, PolygonFeature};

/// One indexed feature.
#[derive(Debug)]
struct IndexEntry {
    /// The feature's id.
    id: FeatureId,
    /// The feature's position in its layer.
    position: usize,
    /// The feature's bounding box.
    envelope: AABB<[f64; 2]>,
}

impl RTreeObject for IndexEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// A feature returned by [`SpatialIndex::query`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexHit {
    /// The feature's id.
    pub id: FeatureId,
    /// The feature's position in the layer the index was built from.
    pub position: usize,
}

/// An R-tree over feature bounding boxes. Immutable once built.
pub struct SpatialIndex {
    tree: RTree<IndexEntry>,
}

impl SpatialIndex {
    /// Index every feature. Duplicate ids are kept as separate entries.
    pub fn build<'a>(features: impl IntoIterator<Item = &'a PolygonFeature>) -> Self {
        let entries = features
            .into_iter()
            .enumerate()
            .map(|(position, feature)| IndexEntry {
                id: feature.id,
                position,
                envelope: rect_to_aabb(&feature.envelope()),
            })
            .collect();
        Self {
            tree: RTree::bulk_load(entries),
        }
    }

    /// Number of indexed features.
    pub fn len(&self) -> usize {
        self.tree.size()
    }

    /// Find every feature whose bounding box intersects `extent`, in layer
    /// order.
    pub fn query(&self, extent: &Rect<f64>) -> Vec<IndexHit> {
        let mut hits = self
            .tree
            .locate_in_envelope_intersecting(&rect_to_aabb(extent))
            .map(|entry| IndexHit {
                id: entry.id,
                position: entry.position,
            })
            .collect::<Vec<_>>();
        hits.sort_by_key(|hit| hit.position);
        hits
    }

    /// Like [`SpatialIndex::query`], but only returns ids.
    pub fn intersecting_ids(&self, extent: &Rect<f64>) -> Vec<FeatureId> {
        self.query(extent).into_iter().map(|hit| hit.id).collect()
    }
}

fn rect_to_aabb(rect: &Rect<f64>) -> AABB<[f64; 2]> {
    AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y])
}

//! Centroid tracking: stable identities for per-frame detection boxes.
//!
//! Every [`CentroidTracker::update`] matches the new box centroids against
//! the registered objects greedily, always taking the globally closest
//! remaining pair first. Candidate pairs are enumerated in row-major order
//! (registered objects by ascending id, then input boxes in the given order)
//! and sorted stably, so equal distances resolve to the first pair in that
//! order.

use std::collections::BTreeMap;

use tracing::debug;

/// Integer pixel position.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Centroid {
    pub x: i32,
    pub y: i32,
}

impl Centroid {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Centroid) -> f64 {
        let dx = f64::from(self.x) - f64::from(other.x);
        let dy = f64::from(self.y) - f64::from(other.y);
        dx.hypot(dy)
    }
}

/// Axis-aligned box with integer pixel corners.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundingBox {
    pub x_min: i32,
    pub y_min: i32,
    pub x_max: i32,
    pub y_max: i32,
}

impl BoundingBox {
    pub fn new(x_min: i32, y_min: i32, x_max: i32, y_max: i32) -> Self {
        Self {
            x_min,
            y_min,
            x_max,
            y_max,
        }
    }

    /// Box midpoint, truncated toward zero.
    pub fn centroid(&self) -> Centroid {
        let cx = (i64::from(self.x_min) + i64::from(self.x_max)) / 2;
        let cy = (i64::from(self.y_min) + i64::from(self.y_max)) / 2;
        Centroid::new(cx as i32, cy as i32)
    }

    pub fn width(&self) -> i32 {
        self.x_max - self.x_min
    }

    pub fn height(&self) -> i32 {
        self.y_max - self.y_min
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackedObject {
    pub id: u64,
    pub centroid: Centroid,
    /// Consecutive updates without a matching box.
    pub disappeared: u32,
}

/// Registry of tracked objects keyed by id.
///
/// Ids start at 1 and are never reused. An object is evicted during the
/// update in which its `disappeared` count first exceeds `max_disappeared`.
#[derive(Debug)]
pub struct CentroidTracker {
    objects: BTreeMap<u64, TrackedObject>,
    next_id: u64,
    max_disappeared: u32,
}

impl CentroidTracker {
    pub fn new(max_disappeared: u32) -> Self {
        Self {
            objects: BTreeMap::new(),
            next_id: 1,
            max_disappeared,
        }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<&TrackedObject> {
        self.objects.get(&id)
    }

    /// Registered objects in ascending id order.
    pub fn objects(&self) -> impl Iterator<Item = &TrackedObject> {
        self.objects.values()
    }

    /// Feed one frame's boxes and return every live id with its centroid.
    pub fn update(&mut self, boxes: &[BoundingBox]) -> BTreeMap<u64, Centroid> {
        let inputs: Vec<Centroid> = boxes.iter().map(BoundingBox::centroid).collect();

        if self.objects.is_empty() {
            for centroid in inputs {
                self.register(centroid);
            }
            return self.snapshot();
        }

        if inputs.is_empty() {
            let ids: Vec<u64> = self.objects.keys().copied().collect();
            for id in ids {
                self.mark_missing(id);
            }
            return self.snapshot();
        }

        let ids: Vec<u64> = self.objects.keys().copied().collect();
        let mut pairs = Vec::with_capacity(ids.len() * inputs.len());
        for (row, id) in ids.iter().enumerate() {
            let existing = self.objects[id].centroid;
            for (col, input) in inputs.iter().enumerate() {
                pairs.push((existing.distance(input), row, col));
            }
        }
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut used_rows = vec![false; ids.len()];
        let mut used_cols = vec![false; inputs.len()];
        let mut remaining = ids.len().min(inputs.len());
        for (_, row, col) in pairs {
            if remaining == 0 {
                break;
            }
            if used_rows[row] || used_cols[col] {
                continue;
            }
            if let Some(object) = self.objects.get_mut(&ids[row]) {
                object.centroid = inputs[col];
                object.disappeared = 0;
            }
            used_rows[row] = true;
            used_cols[col] = true;
            remaining -= 1;
        }

        for (row, id) in ids.iter().enumerate() {
            if !used_rows[row] {
                self.mark_missing(*id);
            }
        }
        for (col, centroid) in inputs.into_iter().enumerate() {
            if !used_cols[col] {
                self.register(centroid);
            }
        }

        self.snapshot()
    }

    fn register(&mut self, centroid: Centroid) {
        let id = self.next_id;
        self.next_id += 1;
        debug!("tracker: registered object {id} at ({}, {})", centroid.x, centroid.y);
        self.objects.insert(
            id,
            TrackedObject {
                id,
                centroid,
                disappeared: 0,
            },
        );
    }

    fn mark_missing(&mut self, id: u64) {
        let evict = match self.objects.get_mut(&id) {
            Some(object) => {
                object.disappeared = object.disappeared.saturating_add(1);
                object.disappeared > self.max_disappeared
            }
            None => false,
        };
        if evict {
            self.objects.remove(&id);
            debug!("tracker: evicted object {id}");
        }
    }

    fn snapshot(&self) -> BTreeMap<u64, Centroid> {
        self.objects
            .iter()
            .map(|(id, object)| (*id, object.centroid))
            .collect()
    }
}

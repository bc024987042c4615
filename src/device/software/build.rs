//! SAH-based BVH builder.
//!
//! Builds a flat node array over any list of primitive bounds, used for both
//! bottom levels (triangles) and top levels (instances). Split candidates are
//! evaluated with the binned Surface Area Heuristic.

use bytemuck::Zeroable;

use super::bvh::{Aabb, BvhNode};

/// Number of SAH bins for split evaluation.
const NUM_BINS: usize = 12;

/// Cost ratio: traversal vs intersection.
const TRAVERSAL_COST: f32 = 1.0;
const INTERSECT_COST: f32 = 1.0;

/// Maximum primitives per leaf before forcing a split.
const MAX_LEAF_SIZE: usize = 4;

/// Built BVH result.
#[derive(Debug, Clone)]
pub struct Bvh {
    /// Flat node array (index 0 = root).
    pub nodes: Vec<BvhNode>,
    /// Primitive order; leaves reference ranges of this list.
    pub prim_indices: Vec<usize>,
}

impl Bvh {
    /// Upper bound on the node count for `prim_count` primitives.
    pub fn max_nodes(prim_count: usize) -> usize {
        (2 * prim_count).max(1)
    }
}

#[derive(Clone, Copy)]
struct Bin {
    bounds: Aabb,
    count: usize,
}

impl Default for Bin {
    fn default() -> Self {
        Self {
            bounds: Aabb::EMPTY,
            count: 0,
        }
    }
}

/// Pending node range on the build stack.
struct Task {
    node: usize,
    start: usize,
    end: usize,
}

/// Build a BVH over primitive bounds.
///
/// The input slice is not reordered; `prim_indices` maps leaf slots back into it.
#[tracing::instrument(level = "debug", skip_all, fields(prims = bounds.len()))]
pub fn build_bvh(bounds: &[Aabb]) -> Bvh {
    let n = bounds.len();
    if n == 0 {
        return Bvh {
            nodes: vec![BvhNode::leaf(&Aabb { min: [0.0; 3], max: [0.0; 3] }, 0, 0)],
            prim_indices: vec![],
        };
    }

    let centroids: Vec<[f32; 3]> = bounds.iter().map(Aabb::centroid).collect();
    let mut indices: Vec<usize> = (0..n).collect();
    let mut nodes: Vec<BvhNode> = Vec::with_capacity(Bvh::max_nodes(n));
    nodes.push(BvhNode::zeroed());

    let mut stack = vec![Task { node: 0, start: 0, end: n }];

    while let Some(Task { node, start, end }) = stack.pop() {
        let count = end - start;

        let mut node_bounds = Aabb::EMPTY;
        let mut centroid_bounds = Aabb::EMPTY;
        for &idx in &indices[start..end] {
            node_bounds.grow(&bounds[idx]);
            centroid_bounds.grow_point(centroids[idx]);
        }

        if count <= MAX_LEAF_SIZE {
            nodes[node] = BvhNode::leaf(&node_bounds, start, count);
            continue;
        }

        let split = find_best_split(&indices[start..end], bounds, &centroids, &centroid_bounds);
        let leaf_cost = count as f32 * INTERSECT_COST * node_bounds.area();

        let Some((axis, pos, cost)) = split else {
            // Degenerate centroids: every primitive lands in one bin
            nodes[node] = BvhNode::leaf(&node_bounds, start, count);
            continue;
        };
        if cost >= leaf_cost {
            nodes[node] = BvhNode::leaf(&node_bounds, start, count);
            continue;
        }

        let mid = start + partition(&mut indices[start..end], |&idx| centroids[idx][axis] < pos);
        let mid = if mid == start || mid == end {
            (start + end) / 2
        } else {
            mid
        };

        let left = nodes.len();
        nodes.push(BvhNode::zeroed());
        nodes.push(BvhNode::zeroed());
        nodes[node] = BvhNode::interior(&node_bounds, left);

        // Right first so the left subtree is laid out first
        stack.push(Task { node: left + 1, start: mid, end });
        stack.push(Task { node: left, start, end: mid });
    }

    Bvh {
        nodes,
        prim_indices: indices,
    }
}

/// Binned SAH split search across all 3 axes.
/// Returns `(axis, split position, cost)`, or `None` when every axis is degenerate.
fn find_best_split(
    indices: &[usize],
    bounds: &[Aabb],
    centroids: &[[f32; 3]],
    centroid_bounds: &Aabb,
) -> Option<(usize, f32, f32)> {
    let mut best: Option<(usize, f32, f32)> = None;

    for axis in 0..3 {
        let extent = centroid_bounds.max[axis] - centroid_bounds.min[axis];
        if extent < 1e-8 {
            continue;
        }

        let mut bins = [Bin::default(); NUM_BINS];
        let scale = NUM_BINS as f32 / extent;
        for &idx in indices {
            let slot = ((centroids[idx][axis] - centroid_bounds.min[axis]) * scale) as usize;
            let bin = &mut bins[slot.min(NUM_BINS - 1)];
            bin.bounds.grow(&bounds[idx]);
            bin.count += 1;
        }

        // Prefix sweep from the left
        let mut left_area = [0.0f32; NUM_BINS - 1];
        let mut left_count = [0usize; NUM_BINS - 1];
        let mut sweep = Aabb::EMPTY;
        let mut sweep_count = 0;
        for i in 0..NUM_BINS - 1 {
            sweep.grow(&bins[i].bounds);
            sweep_count += bins[i].count;
            left_area[i] = sweep.area();
            left_count[i] = sweep_count;
        }

        // Suffix sweep from the right, evaluating each plane
        sweep = Aabb::EMPTY;
        sweep_count = 0;
        for i in (1..NUM_BINS).rev() {
            sweep.grow(&bins[i].bounds);
            sweep_count += bins[i].count;
            if left_count[i - 1] == 0 || sweep_count == 0 {
                continue;
            }
            let cost = TRAVERSAL_COST
                + INTERSECT_COST
                    * (left_count[i - 1] as f32 * left_area[i - 1]
                        + sweep_count as f32 * sweep.area());

            if best.map_or(true, |(_, _, c)| cost < c) {
                let pos = centroid_bounds.min[axis] + (i as f32 / NUM_BINS as f32) * extent;
                best = Some((axis, pos, cost));
            }
        }
    }

    best
}

/// Partition slice in-place. Returns count of elements where predicate is true.
fn partition<T, F>(slice: &mut [T], pred: F) -> usize
where
    F: Fn(&T) -> bool,
{
    let mut left = 0;
    let mut right = slice.len();
    while left < right {
        if pred(&slice[left]) {
            left += 1;
        } else {
            right -= 1;
            slice.swap(left, right);
        }
    }
    left
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_box(x: f32) -> Aabb {
        Aabb {
            min: [x - 0.5, -0.5, 0.0],
            max: [x + 0.5, 0.5, 0.0],
        }
    }

    #[test]
    fn test_empty_bvh() {
        let bvh = build_bvh(&[]);
        assert_eq!(bvh.nodes.len(), 1);
        assert!(bvh.prim_indices.is_empty());
    }

    #[test]
    fn test_single_leaf() {
        let bvh = build_bvh(&[unit_box(0.0), unit_box(1.0), unit_box(2.0)]);
        assert_eq!(bvh.nodes.len(), 1);
        assert_eq!(bvh.nodes[0].count, 3);
    }

    #[test]
    fn test_many_prims_build_tree() {
        let boxes: Vec<Aabb> = (0..100).map(|i| unit_box(i as f32 * 2.0)).collect();
        let bvh = build_bvh(&boxes);

        assert!(bvh.nodes.len() > 1, "BVH should have internal nodes");
        assert!(bvh.nodes.len() <= Bvh::max_nodes(100));

        let mut sorted = bvh.prim_indices.clone();
        sorted.sort();
        assert_eq!(sorted, (0..100).collect::<Vec<_>>());

        let root = &bvh.nodes[0];
        assert!(root.aabb_min[0] < 0.0);
        assert!(root.aabb_max[0] > 198.0);

        // Every leaf slot is covered exactly once
        let covered: usize = bvh.nodes.iter().filter(|n| n.is_leaf()).map(|n| n.count as usize).sum();
        assert_eq!(covered, 100);
    }

    #[test]
    fn test_coincident_prims_stay_one_leaf() {
        let boxes = vec![unit_box(0.0); 9];
        let bvh = build_bvh(&boxes);
        assert_eq!(bvh.nodes[0].count, 9);
    }
}

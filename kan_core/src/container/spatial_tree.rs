//! Quantized multi-dimensional spatial tree.
//!
//! Axis-aligned objects are indexed by the quantized path of their bounding
//! box: every coordinate maps to a `u32` road whose bits select children from
//! the most significant bit down. Nodes live in an arena and children are
//! allocated as one contiguous block of `2^N` slots, so walking up is an
//! explicit `parent` link rather than pointer arithmetic.
//!
//! Three iteration modes are provided: shape (every node intersecting a box,
//! reported post-order), ray (nodes crossed by a parametric segment) and
//! insertion (descend to the target height, creating nodes on the way).

use std::fmt;

pub type Road = u32;

const FIRST_HEIGHT_SHIFT: u32 = 31;
const SUB_NODE_SLICE: usize = 4;
pub const MAX_HEIGHT: u8 = 30;

/// Index of a node inside the tree arena.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Per-dimension quantized coordinate addressing the cell hierarchy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct QuantizedPath<const N: usize> {
    pub roads: [Road; N],
}

struct Node<T> {
    height: u8,
    index_in_parent: u8,
    parent: Option<NodeId>,
    /// Base id of the contiguous block of `2^N` children.
    children: Option<NodeId>,
    sub_nodes: Vec<T>,
}

pub struct SpatialTree<T, const N: usize> {
    nodes: Vec<Node<T>>,
    free_blocks: Vec<NodeId>,
    global_min: f64,
    global_max: f64,
    last_level_height: u8,
}

/// Shape iteration state: walks every existing node intersecting the box.
pub struct ShapeIterator<const N: usize> {
    min_path: QuantizedPath<N>,
    max_path: QuantizedPath<N>,
    current_path: QuantizedPath<N>,
    current_node: Option<NodeId>,
    is_inner_node: bool,
}

impl<const N: usize> ShapeIterator<N> {
    pub fn node(&self) -> Option<NodeId> {
        self.current_node
    }

    pub fn is_finished(&self) -> bool {
        self.current_node.is_none()
    }

    /// True when the current node lies strictly inside the box at the node's
    /// prior-height prefix in every dimension.
    pub fn is_inner_node(&self) -> bool {
        self.is_inner_node
    }
}

/// Insertion iteration state: visits (and creates) every cell at the target
/// height covered by the bounding box.
pub struct InsertionIterator<const N: usize> {
    base: ShapeIterator<N>,
    target_height: u8,
}

impl<const N: usize> InsertionIterator<N> {
    pub fn is_finished(&self) -> bool {
        self.base.current_node.is_none()
    }
}

/// Ray iteration state: steps from cell to cell along the smallest positive
/// per-dimension border-crossing time in quantized space.
pub struct RayIterator<const N: usize> {
    current_path: QuantizedPath<N>,
    next_path: QuantizedPath<N>,
    previous_path_on_level: QuantizedPath<N>,
    has_previous_path_on_level: bool,
    position: [f64; N],
    direction: [f64; N],
    travelled_time: f64,
    max_time: f64,
    current_node: Option<NodeId>,
}

impl<const N: usize> RayIterator<N> {
    pub fn node(&self) -> Option<NodeId> {
        self.current_node
    }

    pub fn is_finished(&self) -> bool {
        self.current_node.is_none()
    }

    pub fn travelled_time(&self) -> f64 {
        self.travelled_time
    }
}

struct RayTarget {
    road: Road,
    time: f64,
    out_of_bounds: bool,
}

struct RayTargetAndDimension {
    dimension: usize,
    target: Road,
    time: f64,
    out_of_bounds: bool,
}

fn make_height_mask(height: u8) -> Road {
    debug_assert!(height as u32 <= FIRST_HEIGHT_SHIFT);
    1 << (FIRST_HEIGHT_SHIFT - height as u32)
}

fn root_to_height_mask(height_mask: Road) -> Road {
    debug_assert!(height_mask > 0);
    !(height_mask - 1)
}

impl<T, const N: usize> SpatialTree<T, N> {
    const ROOT: NodeId = NodeId(0);

    /// Builds an empty tree covering `[global_min, global_max]` along every
    /// dimension. `target_leaf_cell_size` drives how deep the hierarchy goes.
    pub fn new(global_min: f64, global_max: f64, target_leaf_cell_size: f64) -> Self {
        assert!(N >= 1 && N <= 4, "supported dimension counts are 1 to 4");
        assert!(global_max > global_min);
        assert!(target_leaf_cell_size > 0.0);

        let half_width = 0.5 * (global_max - global_min);
        let mut last_level_height = 1u8;
        let mut root_child_size = target_leaf_cell_size;

        while root_child_size < half_width && last_level_height < MAX_HEIGHT {
            root_child_size *= 2.0;
            last_level_height += 1;
        }

        SpatialTree {
            nodes: vec![Node {
                height: 0,
                index_in_parent: 0,
                parent: None,
                children: None,
                sub_nodes: Vec::new(),
            }],
            free_blocks: Vec::new(),
            global_min,
            global_max,
            last_level_height,
        }
    }

    pub fn root(&self) -> NodeId {
        Self::ROOT
    }

    pub fn last_level_height(&self) -> u8 {
        self.last_level_height
    }

    /// True when every non-root node has been deallocated again.
    pub fn is_empty(&self) -> bool {
        let root = &self.nodes[Self::ROOT.index()];
        root.children.is_none() && root.sub_nodes.is_empty()
    }

    pub fn sub_nodes(&self, node: NodeId) -> &[T] {
        &self.nodes[node.index()].sub_nodes
    }

    pub fn sub_nodes_mut(&mut self, node: NodeId) -> &mut [T] {
        &mut self.nodes[node.index()].sub_nodes
    }

    pub fn node_height(&self, node: NodeId) -> u8 {
        self.nodes[node.index()].height
    }

    pub fn node_parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes[node.index()].parent
    }

    pub fn node_index_in_parent(&self, node: NodeId) -> u8 {
        self.nodes[node.index()].index_in_parent
    }

    fn quantize(&self, value: f64) -> Road {
        let normalized = (value - self.global_min) / (self.global_max - self.global_min);
        let clamped = if normalized < 0.0 {
            0.0
        } else if normalized > 1.0 {
            1.0
        } else {
            normalized
        };
        (clamped * Road::max_value() as f64) as Road
    }

    fn to_quantized_space(&self, value: f64) -> f64 {
        let normalized = (value - self.global_min) / (self.global_max - self.global_min);
        let clamped = if normalized < 0.0 {
            0.0
        } else if normalized > 1.0 {
            1.0
        } else {
            normalized
        };
        clamped * Road::max_value() as f64
    }

    pub fn quantize_sequence(&self, sequence: &[f64; N]) -> QuantizedPath<N> {
        let mut roads = [0 as Road; N];
        for dimension in 0..N {
            roads[dimension] = self.quantize(sequence[dimension]);
        }
        QuantizedPath { roads }
    }

    fn node_height_mask(&self, node: NodeId) -> Road {
        make_height_mask(self.nodes[node.index()].height)
    }

    fn child_node_index(&self, parent: NodeId, path: &QuantizedPath<N>) -> u8 {
        let height_mask = self.node_height_mask(parent);
        let mut index = 0u8;
        for dimension in 0..N {
            if path.roads[dimension] & height_mask != 0 {
                index |= 1 << dimension;
            }
        }
        index
    }

    fn child_id(&self, parent: NodeId, child_index: u8) -> Option<NodeId> {
        self.nodes[parent.index()]
            .children
            .map(|base| NodeId(base.0 + child_index as u32))
    }

    // Shape stepping.

    fn shape_reset_dimension(
        iterator: &mut ShapeIterator<N>,
        dimension: usize,
        root_mask: Road,
        height_mask: Road,
    ) {
        let masked_current = iterator.current_path.roads[dimension] & root_mask;
        let masked_min = iterator.min_path.roads[dimension] & root_mask;

        if masked_current > masked_min {
            iterator.current_path.roads[dimension] &= !height_mask;
        } else if masked_current < masked_min {
            iterator.current_path.roads[dimension] |= height_mask;
        }
    }

    fn shape_reset_dimensions_after(
        iterator: &mut ShapeIterator<N>,
        after_dimension: usize,
        root_mask: Road,
        height_mask: Road,
    ) {
        for dimension in after_dimension + 1..N {
            Self::shape_reset_dimension(iterator, dimension, root_mask, height_mask);
        }
    }

    fn shape_reset_all_dimensions(
        iterator: &mut ShapeIterator<N>,
        root_mask: Road,
        height_mask: Road,
    ) {
        for dimension in 0..N {
            Self::shape_reset_dimension(iterator, dimension, root_mask, height_mask);
        }
    }

    fn shape_try_step_in_dimension(
        iterator: &mut ShapeIterator<N>,
        dimension: usize,
        height_mask: Road,
    ) -> bool {
        let root_mask = root_to_height_mask(height_mask);
        let can_increase = iterator.current_path.roads[dimension] & height_mask == 0;
        let want_increase = (iterator.current_path.roads[dimension] & root_mask)
            < (iterator.max_path.roads[dimension] & root_mask);

        if can_increase && want_increase {
            iterator.current_path.roads[dimension] |= height_mask;
            Self::shape_reset_dimensions_after(iterator, dimension, root_mask, height_mask);
            return true;
        }

        false
    }

    fn shape_try_step_on_height(iterator: &mut ShapeIterator<N>, height_mask: Road) -> bool {
        for dimension in (0..N).rev() {
            if Self::shape_try_step_in_dimension(iterator, dimension, height_mask) {
                return true;
            }
        }

        false
    }

    fn shape_update_is_inner_node(&self, iterator: &mut ShapeIterator<N>) {
        let node = match iterator.current_node {
            Some(node) if self.nodes[node.index()].height > 0 => node,
            _ => {
                iterator.is_inner_node = false;
                return;
            }
        };

        let mask =
            root_to_height_mask(make_height_mask(self.nodes[node.index()].height - 1));
        let mut is_inner = true;

        for dimension in 0..N {
            let current = iterator.current_path.roads[dimension] & mask;
            is_inner &= (iterator.min_path.roads[dimension] & mask) < current
                && current < (iterator.max_path.roads[dimension] & mask);
        }

        iterator.is_inner_node = is_inner;
    }

    fn shape_next(&self, iterator: &mut ShapeIterator<N>) {
        let mut parent: Option<NodeId> = None;

        loop {
            // Three situations are possible here: continuing from a reported
            // node (current is set), starting from scratch (current and parent
            // both unset), or retrying after stumbling at a missing child
            // while following the path (current unset, parent kept).
            let mut go_further = true;

            if let Some(current) = iterator.current_node {
                debug_assert!(parent.is_none());
                parent = self.nodes[current.index()].parent;

                if parent.is_none() {
                    // Root reported, iteration is complete.
                    debug_assert_eq!(current, Self::ROOT);
                    iterator.current_node = None;
                    self.shape_update_is_inner_node(iterator);
                    return;
                }
            }

            let mut parent_node = match parent {
                Some(node) => node,
                None => {
                    go_further = false;
                    Self::ROOT
                }
            };

            if go_further {
                debug_assert!(self.nodes[parent_node.index()].height < self.last_level_height);
                let height_mask = self.node_height_mask(parent_node);

                if !Self::shape_try_step_on_height(iterator, height_mask) {
                    // Nothing more to visit below, report the parent itself.
                    iterator.current_node = Some(parent_node);
                    self.shape_update_is_inner_node(iterator);
                    return;
                }
            }

            let mut child_index = self.child_node_index(parent_node, &iterator.current_path);
            while let Some(child) = self.child_id(parent_node, child_index) {
                if self.nodes[child.index()].height == self.last_level_height {
                    iterator.current_node = Some(child);
                    self.shape_update_is_inner_node(iterator);
                    return;
                }

                parent_node = child;
                let child_height_mask = self.node_height_mask(child);
                Self::shape_reset_all_dimensions(
                    iterator,
                    root_to_height_mask(child_height_mask),
                    child_height_mask,
                );
                child_index = self.child_node_index(parent_node, &iterator.current_path);
            }

            // Reached a missing child; reposition in the next cycle.
            iterator.current_node = None;
            parent = Some(parent_node);
        }
    }

    pub fn shape_start(&self, min: &[f64; N], max: &[f64; N]) -> ShapeIterator<N> {
        let min_path = self.quantize_sequence(min);
        let mut iterator = ShapeIterator {
            min_path,
            max_path: self.quantize_sequence(max),
            current_path: min_path,
            current_node: None,
            is_inner_node: false,
        };

        self.shape_next(&mut iterator);
        iterator
    }

    pub fn shape_move_to_next_node(&self, iterator: &mut ShapeIterator<N>) {
        self.shape_next(iterator);
    }

    /// For an object with quantized minimum `object_min`, checks whether the
    /// iterator's current node is the canonical first visit for this query.
    pub fn shape_is_first_occurrence(
        &self,
        object_min: QuantizedPath<N>,
        iterator: &ShapeIterator<N>,
    ) -> bool {
        let node = iterator
            .current_node
            .expect("first occurrence queried on a finished iterator");

        if self.nodes[node.index()].height == 0 {
            return true;
        }

        let mask =
            root_to_height_mask(make_height_mask(self.nodes[node.index()].height - 1));

        for dimension in 0..N {
            let expected = (object_min.roads[dimension] & mask)
                .max(iterator.min_path.roads[dimension] & mask);

            if expected != iterator.current_path.roads[dimension] & mask {
                return false;
            }
        }

        true
    }

    // Insertion.

    fn calculate_insertion_target_height(&self, min: &[f64; N], max: &[f64; N]) -> u8 {
        let mut average_dimension_size = 0.0;
        for dimension in 0..N {
            average_dimension_size += (max[dimension] - min[dimension]) / N as f64;
        }

        let mut child_node_size = 0.125 * (self.global_max - self.global_min);
        let mut target_height = 1u8;

        while average_dimension_size < child_node_size && target_height < self.last_level_height {
            target_height += 1;
            child_node_size *= 0.5;
        }

        target_height
    }

    fn get_or_create_child(&mut self, parent: NodeId, child_index: u8) -> NodeId {
        debug_assert!(self.nodes[parent.index()].height != self.last_level_height);

        if let Some(base) = self.nodes[parent.index()].children {
            return NodeId(base.0 + child_index as u32);
        }

        let child_height = self.nodes[parent.index()].height + 1;
        let children_count = 1usize << N;

        let base = match self.free_blocks.pop() {
            Some(base) => base,
            None => {
                let base = NodeId(self.nodes.len() as u32);
                for _ in 0..children_count {
                    self.nodes.push(Node {
                        height: 0,
                        index_in_parent: 0,
                        parent: None,
                        children: None,
                        sub_nodes: Vec::new(),
                    });
                }
                base
            }
        };

        for index in 0..children_count {
            let child = &mut self.nodes[base.index() + index];
            child.height = child_height;
            child.index_in_parent = index as u8;
            child.parent = Some(parent);
            child.children = None;
            child.sub_nodes = Vec::new();
        }

        self.nodes[parent.index()].children = Some(base);
        NodeId(base.0 + child_index as u32)
    }

    fn insertion_next(&mut self, iterator: &mut InsertionIterator<N>) {
        loop {
            let start_parent;
            if let Some(current) = iterator.base.current_node {
                match self.nodes[current.index()].parent {
                    None => {
                        // Root reached, every covered cell was visited.
                        debug_assert_eq!(current, Self::ROOT);
                        iterator.base.current_node = None;
                        return;
                    }
                    Some(parent) => {
                        debug_assert!(
                            self.nodes[parent.index()].height < iterator.target_height
                        );
                        let height_mask = self.node_height_mask(parent);

                        if !Self::shape_try_step_on_height(&mut iterator.base, height_mask) {
                            iterator.base.current_node = Some(parent);
                            continue;
                        }

                        start_parent = parent;
                    }
                }
            } else {
                start_parent = Self::ROOT;
            }

            let mut parent_node = start_parent;
            let mut child_index = self.child_node_index(parent_node, &iterator.base.current_path);
            let mut child = self.get_or_create_child(parent_node, child_index);

            while self.nodes[child.index()].height < iterator.target_height {
                parent_node = child;
                let child_height_mask = self.node_height_mask(child);
                Self::shape_reset_all_dimensions(
                    &mut iterator.base,
                    root_to_height_mask(child_height_mask),
                    child_height_mask,
                );
                child_index = self.child_node_index(parent_node, &iterator.base.current_path);
                child = self.get_or_create_child(parent_node, child_index);
            }

            iterator.base.current_node = Some(child);
            return;
        }
    }

    pub fn insertion_start(&mut self, min: &[f64; N], max: &[f64; N]) -> InsertionIterator<N> {
        let min_path = self.quantize_sequence(min);
        let mut iterator = InsertionIterator {
            base: ShapeIterator {
                min_path,
                max_path: self.quantize_sequence(max),
                current_path: min_path,
                current_node: None,
                is_inner_node: false,
            },
            target_height: self.calculate_insertion_target_height(min, max),
        };

        self.insertion_next(&mut iterator);
        iterator
    }

    /// Stores `value` as a sub-node of the current cell, grows storage in
    /// slices, and advances to the next covered cell. Returns the node that
    /// received the value.
    pub fn insertion_insert_and_move(
        &mut self,
        iterator: &mut InsertionIterator<N>,
        value: T,
    ) -> NodeId {
        let node = iterator
            .base
            .current_node
            .expect("insertion iterator is finished");

        let sub_nodes = &mut self.nodes[node.index()].sub_nodes;
        if sub_nodes.len() == sub_nodes.capacity() {
            sub_nodes.reserve_exact(SUB_NODE_SLICE);
        }
        sub_nodes.push(value);

        self.insertion_next(iterator);
        node
    }

    // Ray.

    fn ray_target_in_dimension(
        iterator: &RayIterator<N>,
        dimension: usize,
        height_mask: Road,
        root_mask: Road,
        direction_sign: f64,
    ) -> RayTarget {
        let direction = direction_sign * iterator.direction[dimension];
        let road;
        let border_value;
        let mut out_of_bounds = false;

        if direction > 0.0 {
            let masked_current = iterator.current_path.roads[dimension] & root_mask;
            let (next_road, overflowed) = masked_current.overflowing_add(height_mask);
            road = next_road;

            if overflowed {
                border_value = Road::max_value() as f64;
                out_of_bounds = true;
            } else {
                border_value = next_road as f64;
            }
        } else if direction < 0.0 {
            let masked_current = iterator.current_path.roads[dimension] | !root_mask;
            let (next_road, underflowed) = masked_current.overflowing_sub(height_mask);
            road = next_road;

            if underflowed {
                border_value = 0.0;
                out_of_bounds = true;
            } else {
                border_value = next_road as f64;
            }
        } else {
            return RayTarget {
                road: 0,
                time: f64::MAX,
                out_of_bounds: true,
            };
        }

        let distance_to_border = border_value - iterator.position[dimension];
        let time = distance_to_border / direction;
        debug_assert!(time >= 0.0);

        RayTarget {
            road,
            time,
            out_of_bounds,
        }
    }

    fn ray_smallest_target(
        iterator: &RayIterator<N>,
        height_mask: Road,
        root_mask: Road,
        direction_sign: f64,
    ) -> RayTargetAndDimension {
        let mut smallest = RayTargetAndDimension {
            dimension: N,
            target: 0,
            time: f64::MAX,
            out_of_bounds: true,
        };

        // Highest dimension wins exact ties.
        for dimension in (0..N).rev() {
            let target = Self::ray_target_in_dimension(
                iterator,
                dimension,
                height_mask,
                root_mask,
                direction_sign,
            );

            if target.time < smallest.time {
                smallest.dimension = dimension;
                smallest.target = target.road;
                smallest.time = target.time;
                smallest.out_of_bounds = target.out_of_bounds;
            }
        }

        smallest
    }

    fn ray_update_previous_path_on_level(&self, iterator: &mut RayIterator<N>) {
        let node = match iterator.current_node {
            // Skip the calculation when there are no sub nodes anyway.
            Some(node)
                if self.nodes[node.index()].height > 0
                    && !self.nodes[node.index()].sub_nodes.is_empty() =>
            {
                node
            }
            _ => {
                iterator.has_previous_path_on_level = false;
                return;
            }
        };

        let height_mask = make_height_mask(self.nodes[node.index()].height - 1);
        let root_mask = root_to_height_mask(height_mask);
        let smallest = Self::ray_smallest_target(iterator, height_mask, root_mask, -1.0);

        if smallest.out_of_bounds {
            iterator.has_previous_path_on_level = false;
            return;
        }

        if iterator.travelled_time < smallest.time {
            // Never been that far back, so there is no previous cell.
            iterator.has_previous_path_on_level = false;
            return;
        }

        iterator.has_previous_path_on_level = true;
        iterator.previous_path_on_level = iterator.current_path;
        iterator.previous_path_on_level.roads[smallest.dimension] = smallest.target;
    }

    fn ray_next(&self, iterator: &mut RayIterator<N>) {
        let mut parent: Option<NodeId> = None;

        loop {
            let mut go_further = true;

            if let Some(current) = iterator.current_node {
                parent = self.nodes[current.index()].parent;

                if parent.is_none() {
                    debug_assert_eq!(current, Self::ROOT);
                    iterator.current_node = None;
                    self.ray_update_previous_path_on_level(iterator);
                    return;
                }
            }

            let mut parent_node = match parent {
                Some(node) => node,
                None => {
                    go_further = false;
                    Self::ROOT
                }
            };

            if go_further {
                let height_mask = self.node_height_mask(parent_node);
                let root_mask = root_to_height_mask(height_mask);

                if iterator.current_path == iterator.next_path {
                    if iterator.travelled_time >= iterator.max_time {
                        // Full ray time checked; walk through parents up to
                        // the root.
                        iterator.current_node = Some(parent_node);
                        self.ray_update_previous_path_on_level(iterator);
                        return;
                    }

                    let smallest =
                        Self::ray_smallest_target(iterator, height_mask, root_mask, 1.0);

                    if smallest.out_of_bounds {
                        iterator.travelled_time = iterator.max_time;
                        parent = Some(parent_node);
                        continue;
                    }

                    iterator.travelled_time += smallest.time;
                    iterator.next_path.roads[smallest.dimension] = smallest.target;

                    for dimension in 0..N {
                        iterator.position[dimension] +=
                            iterator.direction[dimension] * smallest.time;
                        if dimension != smallest.dimension {
                            iterator.next_path.roads[dimension] =
                                iterator.position[dimension] as Road;
                        }
                    }
                }
            }

            let height_mask = self.node_height_mask(parent_node);
            let root_mask = root_to_height_mask(height_mask);
            let root_to_before_height_mask = root_mask ^ height_mask;

            let mut next_is_not_child = false;
            for dimension in 0..N {
                next_is_not_child |= iterator.next_path.roads[dimension]
                    & root_to_before_height_mask
                    != iterator.current_path.roads[dimension] & root_to_before_height_mask;
            }

            if next_is_not_child {
                // The next cell is outside this parent; report the parent and
                // continue upward on the following call.
                iterator.current_node = Some(parent_node);
                self.ray_update_previous_path_on_level(iterator);
                return;
            }

            iterator.current_path = iterator.next_path;
            let mut child_index = self.child_node_index(parent_node, &iterator.current_path);

            while let Some(child) = self.child_id(parent_node, child_index) {
                if self.nodes[child.index()].height == self.last_level_height {
                    iterator.current_node = Some(child);
                    self.ray_update_previous_path_on_level(iterator);
                    return;
                }

                parent_node = child;
                child_index = self.child_node_index(parent_node, &iterator.current_path);
            }

            iterator.current_node = None;
            parent = Some(parent_node);
        }
    }

    pub fn ray_start(
        &self,
        origin: &[f64; N],
        direction: &[f64; N],
        max_time: f64,
    ) -> RayIterator<N> {
        assert!(
            direction.iter().any(|component| *component != 0.0),
            "ray direction must be non-zero"
        );
        assert!(max_time > 0.0);

        let origin_path = self.quantize_sequence(origin);
        let factor = Road::max_value() as f64 / (self.global_max - self.global_min);

        let mut position = [0.0; N];
        let mut quantized_direction = [0.0; N];
        for dimension in 0..N {
            position[dimension] = self.to_quantized_space(origin[dimension]);
            quantized_direction[dimension] = factor * direction[dimension];
        }

        let mut iterator = RayIterator {
            current_path: origin_path,
            next_path: origin_path,
            previous_path_on_level: origin_path,
            has_previous_path_on_level: false,
            position,
            direction: quantized_direction,
            travelled_time: 0.0,
            max_time,
            current_node: None,
        };

        self.ray_next(&mut iterator);
        iterator
    }

    pub fn ray_move_to_next_node(&self, iterator: &mut RayIterator<N>) {
        self.ray_next(iterator);
    }

    /// A hit is new iff the previous cell on this level did not already
    /// overlap the object's quantized bounds in every dimension.
    pub fn ray_is_first_occurrence(
        &self,
        object_min: QuantizedPath<N>,
        object_max: QuantizedPath<N>,
        iterator: &RayIterator<N>,
    ) -> bool {
        if !iterator.has_previous_path_on_level {
            return true;
        }

        if object_min == object_max {
            // Single-cell objects are stored exactly once.
            return true;
        }

        let node = iterator
            .current_node
            .expect("first occurrence queried on a finished iterator");
        let mask =
            root_to_height_mask(make_height_mask(self.nodes[node.index()].height - 1));

        for dimension in 0..N {
            let previous = iterator.previous_path_on_level.roads[dimension] & mask;
            if previous < object_min.roads[dimension] & mask
                || previous > object_max.roads[dimension] & mask
            {
                return true;
            }
        }

        false
    }

    // Maintenance.

    /// True iff moving the object would change its target height or any
    /// height-mask bucket of its bound coordinates.
    pub fn is_re_insert_needed(
        &self,
        old_min: &[f64; N],
        old_max: &[f64; N],
        new_min: &[f64; N],
        new_max: &[f64; N],
    ) -> bool {
        let old_height = self.calculate_insertion_target_height(old_min, old_max);
        let new_height = self.calculate_insertion_target_height(new_min, new_max);

        if old_height != new_height {
            return true;
        }

        let old_min_path = self.quantize_sequence(old_min);
        let old_max_path = self.quantize_sequence(old_max);
        let new_min_path = self.quantize_sequence(new_min);
        let new_max_path = self.quantize_sequence(new_max);
        let height_mask = make_height_mask(old_height);

        for dimension in 0..N {
            if old_min_path.roads[dimension] & height_mask
                != new_min_path.roads[dimension] & height_mask
            {
                return true;
            }

            if old_max_path.roads[dimension] & height_mask
                != new_max_path.roads[dimension] & height_mask
            {
                return true;
            }
        }

        false
    }

    /// True iff all coordinate pairs agree on the root-to-before-height
    /// prefix at the bounds' target height.
    pub fn is_contained_in_one_sub_node(&self, min: &[f64; N], max: &[f64; N]) -> bool {
        let height = self.calculate_insertion_target_height(min, max);
        let min_path = self.quantize_sequence(min);
        let max_path = self.quantize_sequence(max);
        let height_mask = make_height_mask(height);
        let root_to_before_height_mask = root_to_height_mask(height_mask) ^ height_mask;

        for dimension in 0..N {
            if min_path.roads[dimension] & root_to_before_height_mask
                != max_path.roads[dimension] & root_to_before_height_mask
            {
                return false;
            }
        }

        true
    }

    fn is_node_empty(&self, node: NodeId) -> bool {
        let data = &self.nodes[node.index()];
        if !data.sub_nodes.is_empty() {
            return false;
        }

        if let Some(base) = data.children {
            // Bottom-to-top walk only, so children of children are already
            // known to be gone when this is reached.
            for index in 0..1usize << N {
                let child = &self.nodes[base.index() + index];
                if !child.sub_nodes.is_empty() || child.children.is_some() {
                    return false;
                }
            }
        }

        true
    }

    fn shutdown_empty_node(&mut self, node: NodeId) {
        let data = &mut self.nodes[node.index()];
        data.sub_nodes = Vec::new();

        if let Some(base) = data.children.take() {
            self.free_blocks.push(base);
        }
    }

    /// Swap-removes the sub-node at `sub_node_index`, shrinks storage in
    /// slices, then walks up deallocating emptied nodes.
    pub fn delete(&mut self, node: NodeId, sub_node_index: usize) {
        let sub_nodes = &mut self.nodes[node.index()].sub_nodes;
        assert!(
            sub_node_index < sub_nodes.len(),
            "sub node index out of range"
        );

        sub_nodes.swap_remove(sub_node_index);
        if !sub_nodes.is_empty()
            && sub_nodes.capacity() - sub_nodes.len() >= 2 * SUB_NODE_SLICE
        {
            let target = sub_nodes.capacity() - SUB_NODE_SLICE;
            sub_nodes.shrink_to(target);
        }

        let mut current = node;
        while current != Self::ROOT && self.is_node_empty(current) {
            let parent = self.nodes[current.index()]
                .parent
                .expect("non-root node always has a parent");
            self.shutdown_empty_node(current);
            current = parent;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_object_nodes(tree: &mut SpatialTree<u32, 2>, min: [f64; 2], max: [f64; 2], tag: u32) -> Vec<NodeId> {
        let mut nodes = Vec::new();
        let mut iterator = tree.insertion_start(&min, &max);
        while !iterator.is_finished() {
            nodes.push(tree.insertion_insert_and_move(&mut iterator, tag));
        }
        nodes
    }

    #[test]
    fn insert_then_delete_everything_returns_to_empty_root() {
        let mut tree: SpatialTree<u32, 2> = SpatialTree::new(0.0, 100.0, 1.0);
        assert!(tree.is_empty());

        let first = collect_object_nodes(&mut tree, [10.0, 10.0], [12.0, 12.0], 1);
        let second = collect_object_nodes(&mut tree, [70.0, 40.0], [90.0, 60.0], 2);
        assert!(!tree.is_empty());

        for node in first {
            let index = tree
                .sub_nodes(node)
                .iter()
                .position(|tag| *tag == 1)
                .expect("tag stored in node");
            tree.delete(node, index);
        }

        for node in second {
            let index = tree
                .sub_nodes(node)
                .iter()
                .position(|tag| *tag == 2)
                .expect("tag stored in node");
            tree.delete(node, index);
        }

        assert!(tree.is_empty());
    }

    #[test]
    fn shape_reports_first_occurrence_exactly_once() {
        let mut tree: SpatialTree<u32, 2> = SpatialTree::new(0.0, 100.0, 1.0);
        let object_min = [10.0, 10.0];
        let object_max = [30.0, 30.0];
        collect_object_nodes(&mut tree, object_min, object_max, 77);

        let object_min_path = tree.quantize_sequence(&object_min);
        let mut first_occurrences = 0;
        let mut visits_with_object = 0;

        let mut iterator = tree.shape_start(&[0.0, 0.0], &[100.0, 100.0]);
        while let Some(node) = iterator.node() {
            if tree.sub_nodes(node).contains(&77) {
                visits_with_object += 1;
                if tree.shape_is_first_occurrence(object_min_path, &iterator) {
                    first_occurrences += 1;
                }
            }
            tree.shape_move_to_next_node(&mut iterator);
        }

        assert!(visits_with_object >= 1);
        assert_eq!(first_occurrences, 1);
    }

    #[test]
    fn shape_over_empty_tree_visits_only_root() {
        let tree: SpatialTree<u32, 2> = SpatialTree::new(0.0, 100.0, 1.0);
        let mut iterator = tree.shape_start(&[0.0, 0.0], &[100.0, 100.0]);

        assert_eq!(iterator.node(), Some(tree.root()));
        assert!(!iterator.is_inner_node());
        tree.shape_move_to_next_node(&mut iterator);
        assert!(iterator.is_finished());
    }

    #[test]
    fn insertion_start_is_idempotent_on_node_set() {
        let mut tree: SpatialTree<u32, 2> = SpatialTree::new(0.0, 100.0, 1.0);

        let mut iterator = tree.insertion_start(&[20.0, 20.0], &[22.0, 22.0]);
        while !iterator.is_finished() {
            tree.insertion_next(&mut iterator);
        }
        let nodes_after_first = tree.nodes.len();
        let free_after_first = tree.free_blocks.len();

        let mut iterator = tree.insertion_start(&[20.0, 20.0], &[22.0, 22.0]);
        while !iterator.is_finished() {
            tree.insertion_next(&mut iterator);
        }

        assert_eq!(tree.nodes.len(), nodes_after_first);
        assert_eq!(tree.free_blocks.len(), free_after_first);
    }

    #[test]
    fn re_insert_not_needed_for_identical_bounds() {
        let tree: SpatialTree<u32, 3> = SpatialTree::new(-50.0, 50.0, 1.0);
        assert!(!tree.is_re_insert_needed(
            &[1.0, 2.0, 3.0],
            &[4.0, 5.0, 6.0],
            &[1.0, 2.0, 3.0],
            &[4.0, 5.0, 6.0],
        ));

        assert!(tree.is_re_insert_needed(
            &[1.0, 2.0, 3.0],
            &[4.0, 5.0, 6.0],
            &[-40.0, 2.0, 3.0],
            &[-37.0, 5.0, 6.0],
        ));
    }

    #[test]
    fn small_far_apart_bounds_are_not_one_sub_node() {
        let tree: SpatialTree<u32, 2> = SpatialTree::new(0.0, 100.0, 1.0);
        assert!(!tree.is_contained_in_one_sub_node(&[10.0, 10.0], &[90.0, 90.0]));
    }

    #[test]
    fn node_count_shrinks_back_after_partial_deletes() {
        let mut tree: SpatialTree<u32, 1> = SpatialTree::new(0.0, 64.0, 1.0);
        let nodes_a = {
            let mut iterator = tree.insertion_start(&[3.0], &[4.0]);
            let mut stored = Vec::new();
            while !iterator.is_finished() {
                stored.push(tree.insertion_insert_and_move(&mut iterator, 1));
            }
            stored
        };

        for node in nodes_a {
            let index = tree.sub_nodes(node).iter().position(|tag| *tag == 1).unwrap();
            tree.delete(node, index);
        }

        assert!(tree.is_empty());
    }
}

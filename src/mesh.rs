//! Mesh, entity grouping and partition data consumed by the kernel.
//!
//! The assembly core only relies on ID/index lookups, element-to-node
//! connectivity, labeled per-node field arrays and ownership queries; this
//! module provides a concrete 2D triangle mesh backing that interface. The
//! mesh is authoritative on the master rank; after partitioning each rank
//! works on its owned elements plus the shared (ghost) nodes they touch.

use std::collections::BTreeSet;

use nalgebra::Point2;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::Real;

pub mod procedural;

/// A named, ID'd group of same-type volumetric elements sharing a physics
/// assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub id: u64,
    pub name: String,
    /// Element indices, in insertion order. Assembly traverses this order.
    pub elements: Vec<usize>,
}

/// A named, ID'd group of boundary facets (2-node segments).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SideSet {
    pub id: u64,
    pub name: String,
    /// Facets as pairs of node indices.
    pub facets: Vec<[usize; 2]>,
}

impl SideSet {
    /// The distinct node indices referenced by this side set, ascending.
    pub fn nodes(&self) -> Vec<usize> {
        let set: BTreeSet<usize> = self.facets.iter().flatten().copied().collect();
        set.into_iter().collect()
    }
}

/// One labeled per-node data array.
#[derive(Debug, Clone)]
pub struct Field<T> {
    pub components: usize,
    pub values: Vec<T>,
}

/// Per-rank ownership of elements and nodes.
///
/// Every rank holds the same ownership tables, so ownership queries never
/// require communication.
#[derive(Debug, Clone)]
pub struct Partition {
    num_ranks: usize,
    element_owner: Vec<usize>,
    node_owner: Vec<usize>,
}

impl Partition {
    fn single_rank(num_elements: usize, num_nodes: usize) -> Self {
        Self {
            num_ranks: 1,
            element_owner: vec![0; num_elements],
            node_owner: vec![0; num_nodes],
        }
    }

    pub fn num_ranks(&self) -> usize {
        self.num_ranks
    }

    pub fn element_owner(&self, element: usize) -> usize {
        self.element_owner[element]
    }

    pub fn node_owner(&self, node: usize) -> usize {
        self.node_owner[node]
    }
}

/// A 2D triangle mesh with stable entity IDs.
#[derive(Debug, Clone)]
pub struct Mesh<T: Real> {
    node_ids: Vec<u64>,
    positions: Vec<Point2<T>>,
    node_index: FxHashMap<u64, usize>,

    element_ids: Vec<u64>,
    connectivity: Vec<[usize; 3]>,
    element_block: Vec<usize>,

    blocks: Vec<Block>,
    block_index: FxHashMap<u64, usize>,
    sidesets: Vec<SideSet>,
    sideset_index: FxHashMap<u64, usize>,

    fields: FxHashMap<String, Field<T>>,
    partition: Partition,
}

impl<T: Real> Default for Mesh<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Real> Mesh<T> {
    pub fn new() -> Self {
        Self {
            node_ids: Vec::new(),
            positions: Vec::new(),
            node_index: FxHashMap::default(),
            element_ids: Vec::new(),
            connectivity: Vec::new(),
            element_block: Vec::new(),
            blocks: Vec::new(),
            block_index: FxHashMap::default(),
            sidesets: Vec::new(),
            sideset_index: FxHashMap::default(),
            fields: FxHashMap::default(),
            partition: Partition::single_rank(0, 0),
        }
    }

    pub fn add_node(&mut self, id: u64, position: Point2<T>) -> usize {
        let index = self.node_ids.len();
        let previous = self.node_index.insert(id, index);
        assert!(previous.is_none(), "duplicate node id {}", id);
        self.node_ids.push(id);
        self.positions.push(position);
        self.partition.node_owner.push(0);
        index
    }

    pub fn add_block(&mut self, id: u64, name: &str) -> usize {
        let index = self.blocks.len();
        let previous = self.block_index.insert(id, index);
        assert!(previous.is_none(), "duplicate block id {}", id);
        self.blocks.push(Block {
            id,
            name: name.to_string(),
            elements: Vec::new(),
        });
        index
    }

    pub fn add_element(&mut self, id: u64, block_id: u64, nodes: [u64; 3]) -> usize {
        let block_index = *self
            .block_index
            .get(&block_id)
            .unwrap_or_else(|| panic!("element {} references unknown block {}", id, block_id));
        let connectivity = nodes.map(|node_id| {
            *self
                .node_index
                .get(&node_id)
                .unwrap_or_else(|| panic!("element {} references unknown node {}", id, node_id))
        });
        let index = self.element_ids.len();
        self.element_ids.push(id);
        self.connectivity.push(connectivity);
        self.element_block.push(block_index);
        self.blocks[block_index].elements.push(index);
        self.partition.element_owner.push(0);
        index
    }

    pub fn add_sideset(&mut self, id: u64, name: &str, facets: &[[u64; 2]]) -> usize {
        let index = self.sidesets.len();
        let previous = self.sideset_index.insert(id, index);
        assert!(previous.is_none(), "duplicate side set id {}", id);
        let facets = facets
            .iter()
            .map(|facet| {
                facet.map(|node_id| {
                    *self
                        .node_index
                        .get(&node_id)
                        .unwrap_or_else(|| panic!("side set {} references unknown node {}", id, node_id))
                })
            })
            .collect();
        self.sidesets.push(SideSet {
            id,
            name: name.to_string(),
            facets,
        });
        index
    }

    pub fn num_nodes(&self) -> usize {
        self.node_ids.len()
    }

    pub fn num_elements(&self) -> usize {
        self.element_ids.len()
    }

    pub fn node_id(&self, index: usize) -> u64 {
        self.node_ids[index]
    }

    pub fn node_index(&self, id: u64) -> Option<usize> {
        self.node_index.get(&id).copied()
    }

    pub fn node_position(&self, index: usize) -> &Point2<T> {
        &self.positions[index]
    }

    pub fn element_id(&self, index: usize) -> u64 {
        self.element_ids[index]
    }

    pub fn element_connectivity(&self, index: usize) -> [usize; 3] {
        self.connectivity[index]
    }

    pub fn element_block(&self, index: usize) -> usize {
        self.element_block[index]
    }

    pub fn has_block(&self, id: u64) -> bool {
        self.block_index.contains_key(&id)
    }

    pub fn block_index(&self, id: u64) -> Option<usize> {
        self.block_index.get(&id).copied()
    }

    pub fn block(&self, index: usize) -> &Block {
        &self.blocks[index]
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn has_sideset(&self, id: u64) -> bool {
        self.sideset_index.contains_key(&id)
    }

    pub fn sideset_index(&self, id: u64) -> Option<usize> {
        self.sideset_index.get(&id).copied()
    }

    pub fn sideset(&self, index: usize) -> &SideSet {
        &self.sidesets[index]
    }

    // --- labeled field storage -------------------------------------------

    /// Creates the field if absent and sizes it to the current node count.
    pub fn ensure_field(&mut self, label: &str, components: usize) {
        let num_values = self.num_nodes() * components;
        let field = self.fields.entry(label.to_string()).or_insert(Field {
            components,
            values: Vec::new(),
        });
        assert_eq!(
            field.components, components,
            "field '{}' already exists with {} components",
            label, field.components
        );
        field.values.resize(num_values, T::zero());
    }

    pub fn has_field(&self, label: &str) -> bool {
        self.fields.contains_key(label)
    }

    pub fn field(&self, label: &str) -> Option<&Field<T>> {
        self.fields.get(label)
    }

    pub fn field_mut(&mut self, label: &str) -> Option<&mut Field<T>> {
        self.fields.get_mut(label)
    }

    pub fn field_value(&self, label: &str, node: usize, component: usize) -> T {
        let field = self
            .fields
            .get(label)
            .unwrap_or_else(|| panic!("unknown field '{}'", label));
        field.values[node * field.components + component]
    }

    pub fn set_field_value(&mut self, label: &str, node: usize, component: usize, value: T) {
        let field = self
            .fields
            .get_mut(label)
            .unwrap_or_else(|| panic!("unknown field '{}'", label));
        field.values[node * field.components + component] = value;
    }

    /// Copies the values of field `source` over field `destination`.
    pub fn copy_field(&mut self, source: &str, destination: &str) -> eyre::Result<()> {
        let source_values = self
            .fields
            .get(source)
            .ok_or_else(|| eyre::eyre!("unknown field '{}'", source))?
            .values
            .clone();
        let destination_field = self
            .fields
            .get_mut(destination)
            .ok_or_else(|| eyre::eyre!("unknown field '{}'", destination))?;
        eyre::ensure!(
            destination_field.values.len() == source_values.len(),
            "fields '{}' and '{}' have different sizes",
            source,
            destination
        );
        destination_field.values = source_values;
        Ok(())
    }

    // --- partition -------------------------------------------------------

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Partitions elements into `num_ranks` contiguous chunks and derives
    /// node ownership as the minimum owner among adjacent elements.
    ///
    /// Deterministic, so every rank computes the identical partition from
    /// the same mesh without negotiation.
    pub fn partition_uniform(&mut self, num_ranks: usize) {
        assert!(num_ranks > 0, "partition needs at least one rank");
        let num_elements = self.num_elements();
        let element_owner: Vec<usize> = (0..num_elements)
            .map(|e| (e * num_ranks / num_elements.max(1)).min(num_ranks - 1))
            .collect();
        let mut node_owner = vec![usize::MAX; self.num_nodes()];
        for (element, &owner) in element_owner.iter().enumerate() {
            for node in self.connectivity[element] {
                node_owner[node] = node_owner[node].min(owner);
            }
        }
        for owner in &mut node_owner {
            if *owner == usize::MAX {
                *owner = 0;
            }
        }
        self.partition = Partition {
            num_ranks,
            element_owner,
            node_owner,
        };
    }

    /// Element indices owned by `rank`, in mesh order.
    pub fn owned_elements(&self, rank: usize) -> impl Iterator<Item = usize> + '_ {
        self.partition
            .element_owner
            .iter()
            .enumerate()
            .filter(move |(_, &owner)| owner == rank)
            .map(|(index, _)| index)
    }

    /// Node indices referenced by elements owned by `rank`, ascending.
    pub fn nodes_touched_by_rank(&self, rank: usize) -> Vec<usize> {
        let mut touched = BTreeSet::new();
        for element in self.owned_elements(rank) {
            touched.extend(self.connectivity[element]);
        }
        touched.into_iter().collect()
    }

    /// Whether `node` is duplicated on `rank` but owned elsewhere.
    pub fn is_ghost_node(&self, node: usize, rank: usize) -> bool {
        self.partition.node_owner(node) != rank
            && self
                .owned_elements(rank)
                .any(|element| self.connectivity[element].contains(&node))
    }
}

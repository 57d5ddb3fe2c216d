//! Two-phase kernel configuration.
//!
//! A [`KernelParametersDraft`] is a mutable builder, meaningful only on the
//! authoritative (master) rank. The immutable [`KernelParameters`] value is
//! valid on every rank and can only be produced by the collective
//! [`KernelParameters::distribute`] step, which flattens the draft to a
//! numeric array on the master, broadcasts it, and rebuilds it identically
//! everywhere. "Valid only after broadcast" is thereby a type-level fact.

use core::fmt;
use std::error::Error;

use ferrox_comm::Communicator;
use serde::{Deserialize, Serialize};

use crate::weakform::DomainType;

/// How per-group integration orders are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntegrationScheme {
    /// Use each selection's integration order as given.
    Full,
    /// Single-point (reduced) integration everywhere.
    Reduced,
}

impl IntegrationScheme {
    fn to_wire(self) -> u64 {
        match self {
            IntegrationScheme::Full => 0,
            IntegrationScheme::Reduced => 1,
        }
    }

    fn from_wire(value: u64) -> Result<Self, ParameterError> {
        match value {
            0 => Ok(IntegrationScheme::Full),
            1 => Ok(IntegrationScheme::Reduced),
            _ => Err(ParameterError::InvalidEncoding),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSelection {
    pub block_id: u64,
    pub domain_type: DomainType,
    pub dofs_per_node: usize,
    pub dofs_per_edge: usize,
    pub integration_order: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideSetSelection {
    pub sideset_id: u64,
    pub domain_type: DomainType,
    pub integration_order: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParameterError {
    NoSelectedRanks,
    RankOutsideGroup { rank: usize, size: usize },
    DuplicateBlockSelection { block_id: u64 },
    DuplicateSideSetSelection { sideset_id: u64 },
    ZeroDofs { block_id: u64 },
    UnsupportedIntegrationOrder { order: usize },
    /// The draft was missing on the master, or present on a worker.
    DraftOnWrongRank { rank: usize },
    InvalidEncoding,
}

impl fmt::Display for ParameterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterError::NoSelectedRanks => {
                write!(f, "at least one process rank must be selected")
            }
            ParameterError::RankOutsideGroup { rank, size } => {
                write!(f, "selected rank {} outside process group of {}", rank, size)
            }
            ParameterError::DuplicateBlockSelection { block_id } => {
                write!(f, "block {} selected more than once", block_id)
            }
            ParameterError::DuplicateSideSetSelection { sideset_id } => {
                write!(f, "side set {} selected more than once", sideset_id)
            }
            ParameterError::ZeroDofs { block_id } => {
                write!(f, "block {} selected with zero DOFs per node", block_id)
            }
            ParameterError::UnsupportedIntegrationOrder { order } => {
                write!(f, "unsupported integration order {}", order)
            }
            ParameterError::DraftOnWrongRank { rank } => {
                write!(f, "parameter draft presence is wrong on rank {}", rank)
            }
            ParameterError::InvalidEncoding => {
                write!(f, "received a corrupt parameter encoding")
            }
        }
    }
}

impl Error for ParameterError {}

/// Mutable parameter builder; meaningful only on the master rank.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KernelParametersDraft {
    selected_ranks: Vec<usize>,
    blocks: Vec<BlockSelection>,
    sidesets: Vec<SideSetSelection>,
    scheme: Option<IntegrationScheme>,
}

impl KernelParametersDraft {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select_ranks(&mut self, ranks: &[usize]) -> &mut Self {
        self.selected_ranks = ranks.to_vec();
        self
    }

    pub fn select_block(&mut self, selection: BlockSelection) -> &mut Self {
        self.blocks.push(selection);
        self
    }

    pub fn select_sideset(&mut self, selection: SideSetSelection) -> &mut Self {
        self.sidesets.push(selection);
        self
    }

    pub fn set_integration_scheme(&mut self, scheme: IntegrationScheme) -> &mut Self {
        self.scheme = Some(scheme);
        self
    }

    fn validate(&self, size: usize) -> Result<(), ParameterError> {
        if self.selected_ranks.is_empty() {
            return Err(ParameterError::NoSelectedRanks);
        }
        for &rank in &self.selected_ranks {
            if rank >= size {
                return Err(ParameterError::RankOutsideGroup { rank, size });
            }
        }
        for (i, block) in self.blocks.iter().enumerate() {
            if self.blocks[..i].iter().any(|b| b.block_id == block.block_id) {
                return Err(ParameterError::DuplicateBlockSelection {
                    block_id: block.block_id,
                });
            }
            if block.dofs_per_node == 0 && block.dofs_per_edge == 0 {
                return Err(ParameterError::ZeroDofs {
                    block_id: block.block_id,
                });
            }
            if !(1..=3).contains(&block.integration_order) {
                return Err(ParameterError::UnsupportedIntegrationOrder {
                    order: block.integration_order,
                });
            }
        }
        for (i, sideset) in self.sidesets.iter().enumerate() {
            if self.sidesets[..i]
                .iter()
                .any(|s| s.sideset_id == sideset.sideset_id)
            {
                return Err(ParameterError::DuplicateSideSetSelection {
                    sideset_id: sideset.sideset_id,
                });
            }
            if !(1..=3).contains(&sideset.integration_order) {
                return Err(ParameterError::UnsupportedIntegrationOrder {
                    order: sideset.integration_order,
                });
            }
        }
        Ok(())
    }

    fn encode(&self) -> Vec<u64> {
        let mut wire = vec![
            self.selected_ranks.len() as u64,
            self.blocks.len() as u64,
            self.sidesets.len() as u64,
            self.scheme.unwrap_or(IntegrationScheme::Full).to_wire(),
        ];
        wire.extend(self.selected_ranks.iter().map(|&r| r as u64));
        for block in &self.blocks {
            wire.extend([
                block.block_id,
                block.domain_type.to_wire(),
                block.dofs_per_node as u64,
                block.dofs_per_edge as u64,
                block.integration_order as u64,
            ]);
        }
        for sideset in &self.sidesets {
            wire.extend([
                sideset.sideset_id,
                sideset.domain_type.to_wire(),
                sideset.integration_order as u64,
            ]);
        }
        wire
    }
}

/// Immutable parameters, bit-identical on every rank of the group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelParameters {
    selected_ranks: Vec<usize>,
    blocks: Vec<BlockSelection>,
    sidesets: Vec<SideSetSelection>,
    scheme: IntegrationScheme,
}

impl KernelParameters {
    /// The collective distribution step.
    ///
    /// The master passes `Some(draft)`, every other rank `None`. The draft
    /// is validated before broadcast; every rank rebuilds the parameters
    /// from the same wire encoding.
    pub fn distribute<C: Communicator>(
        draft: Option<KernelParametersDraft>,
        comm: &C,
    ) -> Result<Self, ParameterError> {
        let wire = if comm.is_master() {
            let draft = draft.ok_or(ParameterError::DraftOnWrongRank { rank: comm.rank() })?;
            draft.validate(comm.size())?;
            Some(draft.encode())
        } else {
            if draft.is_some() {
                return Err(ParameterError::DraftOnWrongRank { rank: comm.rank() });
            }
            None
        };
        let wire = comm.broadcast_vec(wire, 0);
        Self::decode(&wire)
    }

    fn decode(wire: &[u64]) -> Result<Self, ParameterError> {
        if wire.len() < 4 {
            return Err(ParameterError::InvalidEncoding);
        }
        let num_ranks = wire[0] as usize;
        let num_blocks = wire[1] as usize;
        let num_sidesets = wire[2] as usize;
        let scheme = IntegrationScheme::from_wire(wire[3])?;
        let expected = 4 + num_ranks + 5 * num_blocks + 3 * num_sidesets;
        if wire.len() != expected {
            return Err(ParameterError::InvalidEncoding);
        }

        let mut cursor = 4;
        let selected_ranks = wire[cursor..cursor + num_ranks]
            .iter()
            .map(|&r| r as usize)
            .collect();
        cursor += num_ranks;

        let mut blocks = Vec::with_capacity(num_blocks);
        for _ in 0..num_blocks {
            let entry = &wire[cursor..cursor + 5];
            blocks.push(BlockSelection {
                block_id: entry[0],
                domain_type: DomainType::from_wire(entry[1])
                    .map_err(|_| ParameterError::InvalidEncoding)?,
                dofs_per_node: entry[2] as usize,
                dofs_per_edge: entry[3] as usize,
                integration_order: entry[4] as usize,
            });
            cursor += 5;
        }

        let mut sidesets = Vec::with_capacity(num_sidesets);
        for _ in 0..num_sidesets {
            let entry = &wire[cursor..cursor + 3];
            sidesets.push(SideSetSelection {
                sideset_id: entry[0],
                domain_type: DomainType::from_wire(entry[1])
                    .map_err(|_| ParameterError::InvalidEncoding)?,
                integration_order: entry[2] as usize,
            });
            cursor += 3;
        }

        Ok(Self {
            selected_ranks,
            blocks,
            sidesets,
            scheme,
        })
    }

    pub fn selected_ranks(&self) -> &[usize] {
        &self.selected_ranks
    }

    pub fn blocks(&self) -> &[BlockSelection] {
        &self.blocks
    }

    pub fn sidesets(&self) -> &[SideSetSelection] {
        &self.sidesets
    }

    pub fn integration_scheme(&self) -> IntegrationScheme {
        self.scheme
    }

    /// The integration order to use for a block selection under the chosen
    /// scheme.
    pub fn effective_integration_order(&self, selection: &BlockSelection) -> usize {
        match self.scheme {
            IntegrationScheme::Full => selection.integration_order,
            IntegrationScheme::Reduced => 1,
        }
    }
}

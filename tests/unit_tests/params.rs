use ferrox::params::{
    BlockSelection, IntegrationScheme, KernelParameters, KernelParametersDraft, ParameterError,
    SideSetSelection,
};
use ferrox::weakform::DomainType;
use ferrox_comm::{Communicator, SerialComm};

use super::spmd;

fn example_draft() -> KernelParametersDraft {
    let mut draft = KernelParametersDraft::new();
    draft
        .select_ranks(&[0, 1, 2])
        .set_integration_scheme(IntegrationScheme::Full)
        .select_block(BlockSelection {
            block_id: 10,
            domain_type: DomainType::Superconducting,
            dofs_per_node: 1,
            dofs_per_edge: 0,
            integration_order: 2,
        })
        .select_block(BlockSelection {
            block_id: 11,
            domain_type: DomainType::Air,
            dofs_per_node: 1,
            dofs_per_edge: 0,
            integration_order: 1,
        })
        .select_sideset(SideSetSelection {
            sideset_id: 20,
            domain_type: DomainType::FixedPotential,
            integration_order: 1,
        });
    draft
}

#[test]
fn serial_distribution_preserves_the_draft() {
    let comm = SerialComm::new();
    let mut draft = KernelParametersDraft::new();
    draft.select_ranks(&[0]).select_block(BlockSelection {
        block_id: 1,
        domain_type: DomainType::Air,
        dofs_per_node: 2,
        dofs_per_edge: 0,
        integration_order: 3,
    });
    let params = KernelParameters::distribute(Some(draft), &comm).unwrap();
    assert_eq!(params.selected_ranks(), &[0]);
    assert_eq!(params.blocks().len(), 1);
    assert_eq!(params.blocks()[0].block_id, 1);
    assert_eq!(params.blocks()[0].dofs_per_node, 2);
    assert_eq!(params.blocks()[0].domain_type, DomainType::Air);
    assert_eq!(params.integration_scheme(), IntegrationScheme::Full);
}

#[test]
fn distributed_parameters_are_identical_on_every_rank() {
    let results = spmd(3, |comm| {
        let draft = comm.is_master().then(example_draft);
        KernelParameters::distribute(draft, comm).unwrap()
    });
    // Bit-identical selections everywhere, including the master.
    for params in &results {
        assert_eq!(params, &results[0]);
    }
    assert_eq!(results[0].selected_ranks(), &[0, 1, 2]);
    assert_eq!(results[0].blocks().len(), 2);
    assert_eq!(results[0].sidesets().len(), 1);
    assert_eq!(results[0].sidesets()[0].domain_type, DomainType::FixedPotential);
}

#[test]
fn empty_rank_selection_is_rejected() {
    let comm = SerialComm::new();
    let draft = KernelParametersDraft::new();
    assert_eq!(
        KernelParameters::distribute(Some(draft), &comm),
        Err(ParameterError::NoSelectedRanks)
    );
}

#[test]
fn rank_outside_group_is_rejected() {
    let comm = SerialComm::new();
    let mut draft = KernelParametersDraft::new();
    draft.select_ranks(&[0, 1]);
    assert_eq!(
        KernelParameters::distribute(Some(draft), &comm),
        Err(ParameterError::RankOutsideGroup { rank: 1, size: 1 })
    );
}

#[test]
fn duplicate_block_selection_is_rejected() {
    let comm = SerialComm::new();
    let mut draft = KernelParametersDraft::new();
    draft.select_ranks(&[0]);
    for _ in 0..2 {
        draft.select_block(BlockSelection {
            block_id: 5,
            domain_type: DomainType::Air,
            dofs_per_node: 1,
            dofs_per_edge: 0,
            integration_order: 1,
        });
    }
    assert_eq!(
        KernelParameters::distribute(Some(draft), &comm),
        Err(ParameterError::DuplicateBlockSelection { block_id: 5 })
    );
}

#[test]
fn zero_dof_selection_is_rejected() {
    let comm = SerialComm::new();
    let mut draft = KernelParametersDraft::new();
    draft.select_ranks(&[0]).select_block(BlockSelection {
        block_id: 5,
        domain_type: DomainType::Air,
        dofs_per_node: 0,
        dofs_per_edge: 0,
        integration_order: 1,
    });
    assert_eq!(
        KernelParameters::distribute(Some(draft), &comm),
        Err(ParameterError::ZeroDofs { block_id: 5 })
    );
}

#[test]
fn unsupported_integration_order_is_rejected() {
    let comm = SerialComm::new();
    let mut draft = KernelParametersDraft::new();
    draft.select_ranks(&[0]).select_block(BlockSelection {
        block_id: 5,
        domain_type: DomainType::Air,
        dofs_per_node: 1,
        dofs_per_edge: 0,
        integration_order: 4,
    });
    assert_eq!(
        KernelParameters::distribute(Some(draft), &comm),
        Err(ParameterError::UnsupportedIntegrationOrder { order: 4 })
    );
}

#[test]
fn draft_on_a_worker_rank_is_rejected() {
    let results = spmd(2, |comm| {
        // Both ranks supply a draft; only the master may.
        KernelParameters::distribute(Some(example_draft()), comm)
    });
    assert!(results[0].is_ok());
    assert_eq!(
        results[1],
        Err(ParameterError::DraftOnWrongRank { rank: 1 })
    );
}

#[test]
fn reduced_scheme_forces_single_point_integration() {
    let comm = SerialComm::new();
    let mut draft = example_draft();
    draft
        .select_ranks(&[0])
        .set_integration_scheme(IntegrationScheme::Reduced);
    let params = KernelParameters::distribute(Some(draft), &comm).unwrap();
    for selection in params.blocks() {
        assert_eq!(params.effective_integration_order(selection), 1);
    }
}

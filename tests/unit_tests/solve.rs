use ferrox::dof::{TransientProblem, TransientStrategy};
use ferrox::kernel::Kernel;
use ferrox::mesh::procedural::unit_square;
use ferrox::nonlinear::{
    NonlinearAlgorithm, NonlinearController, NonlinearError, NonlinearSettings,
};
use ferrox::params::{
    BlockSelection, KernelParameters, KernelParametersDraft, SideSetSelection,
};
use ferrox::weakform::{DomainType, PhysicsModule, PhysicsTag, WeakFormModule};
use ferrox_comm::SerialComm;
use ferrox_sparse::{CgParameters, CgSolver, DenseLuSolver};

use super::unit_square_boundary_facets;

fn square_with_boundary(nx: usize, ny: usize) -> ferrox::mesh::Mesh<f64> {
    let mut mesh = unit_square(nx, ny, 1);
    mesh.add_sideset(100, "outer", &unit_square_boundary_facets(nx, ny));
    mesh
}

fn magnetic_params(domain: DomainType) -> KernelParameters {
    let mut draft = KernelParametersDraft::new();
    draft
        .select_ranks(&[0])
        .select_block(BlockSelection {
            block_id: 1,
            domain_type: domain,
            dofs_per_node: 1,
            dofs_per_edge: 0,
            integration_order: 2,
        })
        .select_sideset(SideSetSelection {
            sideset_id: 100,
            domain_type: DomainType::FixedPotential,
            integration_order: 1,
        });
    KernelParameters::distribute(Some(draft), &SerialComm::new()).unwrap()
}

fn settings() -> NonlinearSettings<f64> {
    NonlinearSettings {
        tolerance: 1e-10,
        max_iterations: 20,
        min_iterations: 2,
        relaxation: 1.0,
        newton_after: None,
    }
}

/// A constant Dirichlet potential on the whole boundary of a source-free
/// linear region must reproduce the constant everywhere.
#[test]
fn constant_boundary_potential_fills_the_domain() {
    let comm = SerialComm::new();
    let mut kernel = Kernel::new(square_with_boundary(2, 2), magnetic_params(DomainType::Air));
    assert!(kernel.is_master(&comm));
    assert!(kernel.is_selected(&comm));

    let equation = kernel.create_field(PhysicsTag::MagnetodynamicsAz).unwrap();
    let (dofs, mesh) = kernel.problem_parts(equation);
    {
        let PhysicsModule::Magnetodynamics(module) = dofs.module_mut() else {
            unreachable!("factory resolved a different physics");
        };
        module.set_timestep(1.0);
        module.set_boundary_excitation(2.0, 0.0);
    }
    dofs.initialize(mesh, &comm).unwrap();

    let mut problem = TransientProblem {
        dofs,
        mesh,
        comm: &comm,
        strategy: TransientStrategy::Backend(Box::new(DenseLuSolver::new())),
    };
    let mut controller = NonlinearController::new(settings(), NonlinearAlgorithm::Picard);
    let report = controller.solve_time_step(&mut problem).unwrap();
    assert_eq!(report.iterations, 2);

    let mesh = kernel.mesh();
    for node in 0..mesh.num_nodes() {
        assert!(
            (mesh.field_value("az", node, 0) - 2.0).abs() < 1e-10,
            "node {} off: {}",
            node,
            mesh.field_value("az", node, 0)
        );
    }
}

/// The Krylov backend reproduces the direct solution.
#[test]
fn cg_and_lu_backends_agree() {
    let comm = SerialComm::new();
    let solve_with = |strategy: TransientStrategy<f64>| {
        let mut kernel =
            Kernel::new(square_with_boundary(3, 3), magnetic_params(DomainType::Air));
        let equation = kernel.create_field(PhysicsTag::MagnetodynamicsAz).unwrap();
        let (dofs, mesh) = kernel.problem_parts(equation);
        {
            let PhysicsModule::Magnetodynamics(module) = dofs.module_mut() else {
                unreachable!();
            };
            module.set_timestep(1.0);
            module.set_boundary_excitation(1.0, 0.0);
        }
        dofs.initialize(mesh, &comm).unwrap();
        let mut problem = TransientProblem {
            dofs,
            mesh,
            comm: &comm,
            strategy,
        };
        let mut controller = NonlinearController::new(settings(), NonlinearAlgorithm::Picard);
        controller.solve_time_step(&mut problem).unwrap();
        (0..kernel.mesh().num_nodes())
            .map(|node| kernel.mesh().field_value("az", node, 0))
            .collect::<Vec<_>>()
    };

    let direct = solve_with(TransientStrategy::Backend(Box::new(DenseLuSolver::new())));
    let krylov = solve_with(TransientStrategy::Backend(Box::new(CgSolver::default())));
    for (a, b) in direct.iter().zip(&krylov) {
        assert!((a - b).abs() < 1e-8, "{} vs {}", a, b);
    }
}

/// A nonzero backend status is fatal and surfaces the backend diagnostic.
#[test]
fn backend_failure_is_surfaced_through_the_controller() {
    let comm = SerialComm::new();
    let mut kernel = Kernel::new(square_with_boundary(2, 2), magnetic_params(DomainType::Air));
    let equation = kernel.create_field(PhysicsTag::MagnetodynamicsAz).unwrap();
    let (dofs, mesh) = kernel.problem_parts(equation);
    {
        let PhysicsModule::Magnetodynamics(module) = dofs.module_mut() else {
            unreachable!();
        };
        module.set_timestep(1.0);
        module.set_boundary_excitation(1.0, 0.0);
    }
    dofs.initialize(mesh, &comm).unwrap();

    // A Krylov budget far too small to converge.
    let starved = CgSolver::new(CgParameters {
        rel_tolerance: 1e-14,
        max_iterations: 1,
    });
    let mut problem = TransientProblem {
        dofs,
        mesh,
        comm: &comm,
        strategy: TransientStrategy::Backend(Box::new(starved)),
    };
    let mut controller = NonlinearController::new(settings(), NonlinearAlgorithm::Picard);
    match controller.solve_time_step(&mut problem) {
        Err(NonlinearError::LinearSolve(err)) => {
            let message = err.to_string();
            assert!(message.contains("pcg"), "message: {}", message);
        }
        other => panic!("expected a linear solve failure, got {:?}", other.map(|_| ())),
    }
}

/// Heat conduction through the same kernel plumbing: a uniform temperature
/// state is stationary.
#[test]
fn uniform_temperature_state_is_stationary() {
    let comm = SerialComm::new();
    let mut draft = KernelParametersDraft::new();
    draft
        .select_ranks(&[0])
        .select_block(BlockSelection {
            block_id: 1,
            domain_type: DomainType::Conductor,
            dofs_per_node: 1,
            dofs_per_edge: 0,
            integration_order: 2,
        })
        .select_sideset(SideSetSelection {
            sideset_id: 100,
            domain_type: DomainType::FixedTemperature,
            integration_order: 1,
        });
    let params = KernelParameters::distribute(Some(draft), &SerialComm::new()).unwrap();

    let mut kernel = Kernel::new(square_with_boundary(2, 2), params);
    let equation = kernel.create_field(PhysicsTag::HeatConduction).unwrap();
    let (dofs, mesh) = kernel.problem_parts(equation);
    {
        let PhysicsModule::Heat(module) = dofs.module_mut() else {
            unreachable!();
        };
        module.set_timestep(0.1);
        module.set_boundary_temperature(300.0);
    }
    dofs.initialize(mesh, &comm).unwrap();
    for node in 0..mesh.num_nodes() {
        mesh.set_field_value("temperature", node, 0, 300.0);
    }

    let mut problem = TransientProblem {
        dofs,
        mesh,
        comm: &comm,
        strategy: TransientStrategy::Backend(Box::new(DenseLuSolver::new())),
    };
    let mut controller = NonlinearController::new(settings(), NonlinearAlgorithm::Picard);
    controller.solve_time_step(&mut problem).unwrap();

    let mesh = kernel.mesh();
    for node in 0..mesh.num_nodes() {
        assert!((mesh.field_value("temperature", node, 0) - 300.0).abs() < 1e-8);
    }
}

use ferrox::weakform::heat::HeatConduction;
use ferrox::weakform::magnetodynamics::{MagnetodynamicsAz, MagnetodynamicsMaterial, MaterialRegime};
use ferrox::weakform::{create_module, DomainType, PhysicsModule, PhysicsTag, WeakFormModule};

use super::three_block_mesh;

#[test]
fn factory_resolves_each_tag_to_its_module() {
    let module: PhysicsModule<f64> = create_module(PhysicsTag::MagnetodynamicsAz);
    assert_eq!(module.name(), "magnetodynamics-az");
    assert_eq!(module.fields()[0].label, "az");

    let module: PhysicsModule<f64> = create_module(PhysicsTag::HeatConduction);
    assert_eq!(module.name(), "heat-conduction");
    assert_eq!(module.fields()[0].label, "temperature");
}

#[test]
fn history_labels_derive_from_field_labels() {
    let module: PhysicsModule<f64> = create_module(PhysicsTag::MagnetodynamicsAz);
    assert_eq!(module.fields()[0].history_label(), "az_prev");
}

#[test]
fn magnetodynamics_rejects_non_magnetic_block_domains() {
    let mut module: MagnetodynamicsAz<f64> = MagnetodynamicsAz::new();
    assert!(module.set_blocks(&[1], &[DomainType::Superconducting]).is_ok());
    assert!(module.set_blocks(&[1], &[DomainType::FixedPotential]).is_err());
    assert!(module.set_blocks(&[1, 2], &[DomainType::Air]).is_err());
}

#[test]
fn magnetodynamics_rejects_non_potential_boundaries() {
    let mut module: MagnetodynamicsAz<f64> = MagnetodynamicsAz::new();
    assert!(module.set_sidesets(&[4], &[DomainType::FixedPotential]).is_ok());
    assert!(module.set_sidesets(&[4], &[DomainType::FixedTemperature]).is_err());
}

#[test]
fn heat_rejects_magnetic_regimes() {
    let mut module: HeatConduction<f64> = HeatConduction::new();
    assert!(module.set_blocks(&[1], &[DomainType::Conductor]).is_ok());
    assert!(module.set_blocks(&[1], &[DomainType::Superconducting]).is_err());
}

#[test]
fn regime_resolution_rejects_boundary_domains() {
    assert!(MaterialRegime::from_domain(DomainType::Air).is_ok());
    assert!(MaterialRegime::from_domain(DomainType::Ferromagnetic).is_ok());
    assert!(MaterialRegime::from_domain(DomainType::Superconducting).is_ok());
    assert!(MaterialRegime::from_domain(DomainType::FixedPotential).is_err());
    assert!(MaterialRegime::from_domain(DomainType::Conductor).is_err());
}

#[test]
fn saturation_law_rises_from_initial_to_saturated_reluctivity() {
    // Exercised through the assembled Jacobian elsewhere; here the law's
    // endpoints via the material defaults.
    let material = MagnetodynamicsMaterial::<f64> {
        reluctivity: 100.0,
        initial_reluctivity_ratio: 0.1,
        saturation_knee: 1.0,
        conductivity: 0.0,
        creep_field: 1.0,
        creep_exponent: 0.0,
        source_density: 0.0,
    };
    // nu(b2) = nu0 * (alpha + (1 - alpha) b2/(b2 + tau))
    let nu_at = |b2: f64| {
        material.reluctivity
            * (material.initial_reluctivity_ratio
                + (1.0 - material.initial_reluctivity_ratio) * b2 / (b2 + material.saturation_knee))
    };
    assert_eq!(nu_at(0.0), 10.0);
    assert!(nu_at(1.0) > nu_at(0.1));
    assert!((nu_at(1e9) - 100.0).abs() < 0.01);
}

#[test]
fn boundary_excitation_ramps_then_holds() {
    let mut mesh = three_block_mesh();
    mesh.add_sideset(4, "outer", &[[1, 2]]);

    let mut module: MagnetodynamicsAz<f64> = MagnetodynamicsAz::new();
    module.set_sidesets(&[4], &[DomainType::FixedPotential]).unwrap();
    module.set_boundary_excitation(2.0, 4.0);

    let at = |time: f64| {
        let constraints = module.compute_boundary_conditions(time, &mesh).unwrap();
        assert_eq!(constraints.len(), 2);
        assert_eq!(constraints[0].node_id, 1);
        assert_eq!(constraints[1].node_id, 2);
        constraints[0].value
    };
    assert_eq!(at(0.0), 0.0);
    assert_eq!(at(1.0), 0.5);
    assert_eq!(at(4.0), 2.0);
    assert_eq!(at(100.0), 2.0);
}

#[test]
fn absent_sidesets_contribute_no_constraints() {
    let mesh = three_block_mesh();
    let mut module: MagnetodynamicsAz<f64> = MagnetodynamicsAz::new();
    // Registered, but the mesh (partition) does not hold side set 9.
    module.set_sidesets(&[9], &[DomainType::FixedPotential]).unwrap();
    let constraints = module.compute_boundary_conditions(1.0, &mesh).unwrap();
    assert!(constraints.is_empty());
}

#[test]
#[should_panic(expected = "must lie in [0, 1]")]
fn euler_blend_outside_unit_interval_is_a_contract_violation() {
    let mut module: MagnetodynamicsAz<f64> = MagnetodynamicsAz::new();
    module.set_euler_method(1.5);
}

#[test]
#[should_panic(expected = "timestep must be positive")]
fn nonpositive_timestep_is_a_contract_violation() {
    let mut module: HeatConduction<f64> = HeatConduction::new();
    module.set_timestep(0.0);
}

//! Transient magnetic diffusion in terms of the out-of-plane vector
//! potential component.
//!
//! Strong form: `σ ∂A/∂t − ∇·(ν ∇A) = J_s`, discretized with linear
//! triangles and a θ-blend in time. The per-element coefficient law is
//! selected once per block link from the material regime of the block
//! handle, so the per-element path is branch-free on regime.

use eyre::{ensure, eyre};
use itertools::izip;
use nalgebra::{DMatrixViewMut, DVectorViewMut, Vector2};
use numeric_literals::replace_float_literals;

use crate::dof::BlockHandle;
use crate::element::Tri3Element;
use crate::mesh::Mesh;
use crate::nonlinear::NonlinearAlgorithm;
use crate::weakform::{DomainType, ElementContext, FieldSpec, NodalConstraint, WeakFormModule};
use crate::Real;

/// The material regimes this formulation distinguishes.
///
/// Regime is constant over a block, so dispatch on it is resolved when the
/// module links to the block, not per element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterialRegime {
    Air,
    Ferromagnetic,
    Superconducting,
}

impl MaterialRegime {
    pub fn from_domain(domain: DomainType) -> eyre::Result<Self> {
        match domain {
            DomainType::Air => Ok(MaterialRegime::Air),
            DomainType::Ferromagnetic => Ok(MaterialRegime::Ferromagnetic),
            DomainType::Superconducting => Ok(MaterialRegime::Superconducting),
            other => Err(eyre!(
                "domain type {:?} is not a magnetodynamic block regime",
                other
            )),
        }
    }

    fn law<T: Real>(self) -> CoefficientLaw<T> {
        match self {
            MaterialRegime::Air => air_coefficients,
            MaterialRegime::Ferromagnetic => ferromagnetic_coefficients,
            MaterialRegime::Superconducting => superconducting_coefficients,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MagnetodynamicsMaterial<T> {
    /// Saturated reluctivity ν₀.
    pub reluctivity: T,
    /// Ratio ν(0)/ν₀ in (0, 1] for the saturation law.
    pub initial_reluctivity_ratio: T,
    /// Knee of the saturation law, in units of |B|².
    pub saturation_knee: T,
    /// Base conductivity σ₀.
    pub conductivity: T,
    /// Electric-field scale of the flux-creep law, in units of |E|².
    pub creep_field: T,
    /// Exponent of the flux-creep law.
    pub creep_exponent: T,
    /// Impressed source current density J_s.
    pub source_density: T,
}

impl<T: Real> MagnetodynamicsMaterial<T> {
    /// Free space: linear, nonconducting.
    #[replace_float_literals(T::from_f64(literal).expect("Literal must fit in T"))]
    pub fn air() -> Self {
        let mu0 = 4.0e-7 * T::pi();
        Self {
            reluctivity: 1.0 / mu0,
            initial_reluctivity_ratio: 1.0,
            saturation_knee: 1.0,
            conductivity: 0.0,
            creep_field: 1.0,
            creep_exponent: 0.0,
            source_density: 0.0,
        }
    }

    /// A soft iron with a saturation knee around 1.5 T.
    #[replace_float_literals(T::from_f64(literal).expect("Literal must fit in T"))]
    pub fn ferromagnet() -> Self {
        let mu0 = 4.0e-7 * T::pi();
        Self {
            reluctivity: 1.0 / mu0,
            initial_reluctivity_ratio: 1.0e-3,
            saturation_knee: 2.25,
            conductivity: 1.0e6,
            creep_field: 1.0,
            creep_exponent: 0.0,
            source_density: 0.0,
        }
    }

    /// A technical superconductor with a flux-creep conductivity law.
    #[replace_float_literals(T::from_f64(literal).expect("Literal must fit in T"))]
    pub fn superconductor() -> Self {
        let mu0 = 4.0e-7 * T::pi();
        Self {
            reluctivity: 1.0 / mu0,
            initial_reluctivity_ratio: 1.0,
            saturation_knee: 1.0,
            conductivity: 1.0e10,
            creep_field: 1.0e-8,
            creep_exponent: 0.48,
            source_density: 0.0,
        }
    }

    fn for_regime(regime: MaterialRegime) -> Self {
        match regime {
            MaterialRegime::Air => Self::air(),
            MaterialRegime::Ferromagnetic => Self::ferromagnet(),
            MaterialRegime::Superconducting => Self::superconductor(),
        }
    }
}

/// Coefficients of the discrete operator at one quadrature point.
#[derive(Debug, Clone, Copy)]
pub struct Coefficients<T> {
    pub sigma: T,
    pub nu: T,
    /// dν/d|B|², nonzero only for field-dependent reluctivity.
    pub dnu_db2: T,
}

/// Resolved once per block link; evaluated per quadrature point with the
/// squared flux density and squared electric field of the previous iterate.
type CoefficientLaw<T> = fn(&MagnetodynamicsMaterial<T>, T, T) -> Coefficients<T>;

fn air_coefficients<T: Real>(material: &MagnetodynamicsMaterial<T>, _b2: T, _e2: T) -> Coefficients<T> {
    Coefficients {
        sigma: material.conductivity,
        nu: material.reluctivity,
        dnu_db2: T::zero(),
    }
}

#[replace_float_literals(T::from_f64(literal).expect("Literal must fit in T"))]
fn ferromagnetic_coefficients<T: Real>(
    material: &MagnetodynamicsMaterial<T>,
    b2: T,
    _e2: T,
) -> Coefficients<T> {
    // Brauer-type saturation: nu rises from alpha*nu0 towards nu0.
    let nu0 = material.reluctivity;
    let alpha = material.initial_reluctivity_ratio;
    let tau = material.saturation_knee;
    let denominator = b2 + tau;
    Coefficients {
        sigma: material.conductivity,
        nu: nu0 * (alpha + (1.0 - alpha) * b2 / denominator),
        dnu_db2: nu0 * (1.0 - alpha) * tau / (denominator * denominator),
    }
}

#[replace_float_literals(T::from_f64(literal).expect("Literal must fit in T"))]
fn superconducting_coefficients<T: Real>(
    material: &MagnetodynamicsMaterial<T>,
    _b2: T,
    e2: T,
) -> Coefficients<T> {
    // Flux-creep effective conductivity, monotone decreasing in |E|.
    let sigma = material.conductivity
        * (1.0 + e2 / material.creep_field).powf(-material.creep_exponent);
    Coefficients {
        sigma,
        nu: material.reluctivity,
        dnu_db2: T::zero(),
    }
}

#[derive(Debug)]
struct LinkedBlock<T: Real> {
    block_id: u64,
    material: MagnetodynamicsMaterial<T>,
    law: CoefficientLaw<T>,
}

#[derive(Debug)]
pub struct MagnetodynamicsAz<T: Real> {
    dt: T,
    theta: T,
    blocks: Vec<(u64, DomainType)>,
    sidesets: Vec<(u64, DomainType)>,
    custom_materials: Vec<MagnetodynamicsMaterial<T>>,
    boundary_amplitude: T,
    boundary_ramp_time: T,
    linked: Option<LinkedBlock<T>>,
}

impl<T: Real> MagnetodynamicsAz<T> {
    const FIELDS: &'static [FieldSpec] = &[FieldSpec {
        label: "az",
        components: 1,
    }];

    #[replace_float_literals(T::from_f64(literal).expect("Literal must fit in T"))]
    pub fn new() -> Self {
        Self {
            dt: 1.0,
            theta: 1.0,
            blocks: Vec::new(),
            sidesets: Vec::new(),
            custom_materials: Vec::new(),
            boundary_amplitude: 0.0,
            boundary_ramp_time: 0.0,
            linked: None,
        }
    }

    /// Registers a material override; the returned slot index can be placed
    /// on a block handle.
    pub fn add_material(&mut self, material: MagnetodynamicsMaterial<T>) -> usize {
        self.custom_materials.push(material);
        self.custom_materials.len() - 1
    }

    /// Prescribed potential on `FixedPotential` side sets: ramps linearly
    /// from zero to `amplitude` over `ramp_time`, then holds.
    pub fn set_boundary_excitation(&mut self, amplitude: T, ramp_time: T) {
        self.boundary_amplitude = amplitude;
        self.boundary_ramp_time = ramp_time;
    }

    fn boundary_value(&self, time: T) -> T {
        if self.boundary_ramp_time > T::zero() {
            let ramp = (time / self.boundary_ramp_time).min(T::one());
            self.boundary_amplitude * ramp
        } else {
            self.boundary_amplitude
        }
    }
}

impl<T: Real> Default for MagnetodynamicsAz<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Real> WeakFormModule<T> for MagnetodynamicsAz<T> {
    fn name(&self) -> &'static str {
        "magnetodynamics-az"
    }

    fn fields(&self) -> &[FieldSpec] {
        Self::FIELDS
    }

    fn set_blocks(&mut self, ids: &[u64], domain_types: &[DomainType]) -> eyre::Result<()> {
        ensure!(
            ids.len() == domain_types.len(),
            "{} block ids but {} domain types",
            ids.len(),
            domain_types.len()
        );
        for &domain in domain_types {
            // Fails early for tags this formulation has no regime for.
            MaterialRegime::from_domain(domain)?;
        }
        self.blocks = ids.iter().copied().zip(domain_types.iter().copied()).collect();
        Ok(())
    }

    fn set_sidesets(&mut self, ids: &[u64], domain_types: &[DomainType]) -> eyre::Result<()> {
        ensure!(
            ids.len() == domain_types.len(),
            "{} side set ids but {} domain types",
            ids.len(),
            domain_types.len()
        );
        for &domain in domain_types {
            ensure!(
                domain == DomainType::FixedPotential,
                "domain type {:?} is not a magnetodynamic boundary condition",
                domain
            );
        }
        self.sidesets = ids.iter().copied().zip(domain_types.iter().copied()).collect();
        Ok(())
    }

    fn link_to_block(&mut self, handle: &BlockHandle) -> eyre::Result<()> {
        let regime = MaterialRegime::from_domain(handle.domain_type)?;
        let material = match handle.material {
            Some(slot) => *self.custom_materials.get(slot).ok_or_else(|| {
                eyre!("block {} references unknown material slot {}", handle.block_id, slot)
            })?,
            None => MagnetodynamicsMaterial::for_regime(regime),
        };
        self.linked = Some(LinkedBlock {
            block_id: handle.block_id,
            material,
            law: regime.law(),
        });
        Ok(())
    }

    fn set_timestep(&mut self, dt: T) {
        assert!(dt > T::zero(), "timestep must be positive");
        self.dt = dt;
    }

    fn timestep(&self) -> T {
        self.dt
    }

    fn set_euler_method(&mut self, theta: T) {
        assert!(
            theta >= T::zero() && theta <= T::one(),
            "Euler blend parameter must lie in [0, 1]"
        );
        self.theta = theta;
    }

    fn shift_fields(&mut self, mesh: &mut Mesh<T>) -> eyre::Result<()> {
        mesh.copy_field("az", "az_prev")
    }

    fn compute_boundary_conditions(
        &self,
        time: T,
        mesh: &Mesh<T>,
    ) -> eyre::Result<Vec<NodalConstraint<T>>> {
        let value = self.boundary_value(time);
        let mut constraints = Vec::new();
        for &(id, domain) in &self.sidesets {
            debug_assert_eq!(domain, DomainType::FixedPotential);
            // Side sets may be absent on ranks that do not own them.
            let Some(index) = mesh.sideset_index(id) else {
                continue;
            };
            for node in mesh.sideset(index).nodes() {
                constraints.push(NodalConstraint {
                    node_id: mesh.node_id(node),
                    component: 0,
                    value,
                });
            }
        }
        Ok(constraints)
    }

    #[replace_float_literals(T::from_f64(literal).expect("Literal must fit in T"))]
    fn compute_jacobian_and_rhs(
        &self,
        context: &ElementContext<'_, T>,
        mut jacobian: DMatrixViewMut<'_, T>,
        mut rhs: DVectorViewMut<'_, T>,
        algorithm: NonlinearAlgorithm,
    ) -> eyre::Result<()> {
        let linked = self
            .linked
            .as_ref()
            .ok_or_else(|| eyre!("module invoked without a linked block"))?;
        ensure!(
            jacobian.nrows() == 3 && jacobian.ncols() == 3 && rhs.nrows() == 3,
            "element {}: output buffers not sized for a 3-node element",
            context.element_id
        );
        ensure!(
            context.u_iter.len() == 3 && context.u_step.len() == 3,
            "element {}: nodal state buffers not sized for a 3-node element",
            context.element_id
        );

        let element = Tri3Element::from_vertices(context.vertices);
        let gradients = element
            .physical_gradients()
            .ok_or_else(|| eyre!("element {} is degenerate", context.element_id))?;
        let det = element.jacobian_determinant().abs();
        let dt = self.dt;
        let theta = self.theta;

        // The previous-iterate flux density; constant over a linear element.
        let mut grad_a = Vector2::zeros();
        for i in 0..3 {
            grad_a += gradients.column(i) * context.u_iter[i];
        }
        let b2 = grad_a.norm_squared();

        for (&w, xi) in izip!(context.quadrature.weights(), context.quadrature.points()) {
            let basis = element.evaluate_basis(xi);
            let weight = w * det;

            let mut a_iter = 0.0;
            let mut a_step = 0.0;
            for i in 0..3 {
                a_iter += basis[i] * context.u_iter[i];
                a_step += basis[i] * context.u_step[i];
            }
            let e = (a_iter - a_step) / dt;
            let coefficients = (linked.law)(&linked.material, b2, e * e);

            for i in 0..3 {
                let g_i = gradients.column(i);
                let grad_a_i = g_i.dot(&grad_a);
                for j in 0..3 {
                    let g_j = gradients.column(j);
                    let mass = coefficients.sigma * basis[i] * basis[j] * weight;
                    let stiffness = coefficients.nu * g_i.dot(&g_j) * weight;
                    let tangent = match algorithm {
                        NonlinearAlgorithm::NewtonRaphson => {
                            2.0 * coefficients.dnu_db2 * grad_a_i * g_j.dot(&grad_a) * weight
                        }
                        NonlinearAlgorithm::Picard => 0.0,
                    };
                    jacobian[(i, j)] += mass / dt + theta * (stiffness + tangent);
                    // The tangent contribution is balanced on the right-hand
                    // side so the converged fixed point matches Picard.
                    rhs[i] += (mass / dt - (1.0 - theta) * stiffness) * context.u_step[j]
                        + theta * tangent * context.u_iter[j];
                }
                rhs[i] += linked.material.source_density * basis[i] * weight;
            }
        }

        log::trace!(
            "element {}: assembled under block {} ({:?})",
            context.element_id,
            linked.block_id,
            algorithm
        );
        Ok(())
    }
}

//! Transient heat conduction.
//!
//! Strong form: `ρc ∂T/∂t − ∇·(k ∇T) = q` on linear triangles with a
//! θ-blend in time. Linear coefficients throughout; the module mainly
//! exercises the factory with a second physics.

use eyre::{ensure, eyre};
use itertools::izip;
use nalgebra::{DMatrixViewMut, DVectorViewMut};
use numeric_literals::replace_float_literals;

use crate::dof::BlockHandle;
use crate::element::Tri3Element;
use crate::mesh::Mesh;
use crate::nonlinear::NonlinearAlgorithm;
use crate::weakform::{DomainType, ElementContext, FieldSpec, NodalConstraint, WeakFormModule};
use crate::Real;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeatMaterial<T> {
    /// Volumetric heat capacity ρc.
    pub volumetric_capacity: T,
    /// Thermal conductivity k.
    pub conductivity: T,
    /// Volumetric source q.
    pub source: T,
}

impl<T: Real> HeatMaterial<T> {
    #[replace_float_literals(T::from_f64(literal).expect("Literal must fit in T"))]
    pub fn conductor() -> Self {
        Self {
            volumetric_capacity: 3.4e6,
            conductivity: 400.0,
            source: 0.0,
        }
    }

    #[replace_float_literals(T::from_f64(literal).expect("Literal must fit in T"))]
    pub fn air() -> Self {
        Self {
            volumetric_capacity: 1.2e3,
            conductivity: 0.026,
            source: 0.0,
        }
    }

    fn for_domain(domain: DomainType) -> eyre::Result<Self> {
        match domain {
            DomainType::Conductor => Ok(Self::conductor()),
            DomainType::Air => Ok(Self::air()),
            other => Err(eyre!("domain type {:?} is not a heat conduction region", other)),
        }
    }
}

#[derive(Debug)]
pub struct HeatConduction<T: Real> {
    dt: T,
    theta: T,
    blocks: Vec<(u64, DomainType)>,
    sidesets: Vec<(u64, DomainType)>,
    custom_materials: Vec<HeatMaterial<T>>,
    boundary_temperature: T,
    linked: Option<(u64, HeatMaterial<T>)>,
}

impl<T: Real> HeatConduction<T> {
    const FIELDS: &'static [FieldSpec] = &[FieldSpec {
        label: "temperature",
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
            boundary_temperature: 0.0,
            linked: None,
        }
    }

    pub fn add_material(&mut self, material: HeatMaterial<T>) -> usize {
        self.custom_materials.push(material);
        self.custom_materials.len() - 1
    }

    pub fn set_boundary_temperature(&mut self, temperature: T) {
        self.boundary_temperature = temperature;
    }
}

impl<T: Real> Default for HeatConduction<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Real> WeakFormModule<T> for HeatConduction<T> {
    fn name(&self) -> &'static str {
        "heat-conduction"
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
            HeatMaterial::<T>::for_domain(domain)?;
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
                domain == DomainType::FixedTemperature,
                "domain type {:?} is not a heat boundary condition",
                domain
            );
        }
        self.sidesets = ids.iter().copied().zip(domain_types.iter().copied()).collect();
        Ok(())
    }

    fn link_to_block(&mut self, handle: &BlockHandle) -> eyre::Result<()> {
        let material = match handle.material {
            Some(slot) => *self.custom_materials.get(slot).ok_or_else(|| {
                eyre!("block {} references unknown material slot {}", handle.block_id, slot)
            })?,
            None => HeatMaterial::for_domain(handle.domain_type)?,
        };
        self.linked = Some((handle.block_id, material));
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
        mesh.copy_field("temperature", "temperature_prev")
    }

    fn compute_boundary_conditions(
        &self,
        _time: T,
        mesh: &Mesh<T>,
    ) -> eyre::Result<Vec<NodalConstraint<T>>> {
        let mut constraints = Vec::new();
        for &(id, _) in &self.sidesets {
            let Some(index) = mesh.sideset_index(id) else {
                continue;
            };
            for node in mesh.sideset(index).nodes() {
                constraints.push(NodalConstraint {
                    node_id: mesh.node_id(node),
                    component: 0,
                    value: self.boundary_temperature,
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
        _algorithm: NonlinearAlgorithm,
    ) -> eyre::Result<()> {
        let (block_id, material) = self
            .linked
            .as_ref()
            .ok_or_else(|| eyre!("module invoked without a linked block"))?;
        ensure!(
            jacobian.nrows() == 3 && jacobian.ncols() == 3 && rhs.nrows() == 3,
            "element {}: output buffers not sized for a 3-node element",
            context.element_id
        );

        let element = Tri3Element::from_vertices(context.vertices);
        let gradients = element
            .physical_gradients()
            .ok_or_else(|| eyre!("element {} is degenerate", context.element_id))?;
        let det = element.jacobian_determinant().abs();
        let dt = self.dt;
        let theta = self.theta;

        for (&w, xi) in izip!(context.quadrature.weights(), context.quadrature.points()) {
            let basis = element.evaluate_basis(xi);
            let weight = w * det;
            for i in 0..3 {
                let g_i = gradients.column(i);
                for j in 0..3 {
                    let mass = material.volumetric_capacity * basis[i] * basis[j] * weight;
                    let stiffness = material.conductivity * g_i.dot(&gradients.column(j)) * weight;
                    jacobian[(i, j)] += mass / dt + theta * stiffness;
                    rhs[i] += (mass / dt - (1.0 - theta) * stiffness) * context.u_step[j];
                }
                rhs[i] += material.source * basis[i] * weight;
            }
        }

        log::trace!("element {}: assembled under block {}", context.element_id, block_id);
        Ok(())
    }
}

//! Read-only measurement view over a downloaded field snapshot.
//!
//! Fields are stored field-major: field `m` of voxel `(x, y, z)` lives at
//! `m * voxel_count + (z * voxel_y + y) * voxel_x + x`. The lattice is
//! hexagonal in-plane: grid axes `i` and `j` are 120 degrees apart, so
//! continuous sample positions go through cube-coordinate rounding.

use crate::config::SimulationParameters;
use crate::seed::dirichlet_values;

/// Frozen (1) or vapour (0).
pub const FIELD_OCCUPANCY: usize = 0;
/// Vapour mass free to diffuse.
pub const FIELD_DIFFUSIVE_MASS: usize = 1;
/// Quasi-liquid mass held at the crystal boundary.
pub const FIELD_BOUNDARY_MASS: usize = 2;
/// Number of solver fields.
pub const SOLVER_FIELD_COUNT: usize = 3;

/// Snapshot of every solver field at one timestep.
///
/// Only lent to measurement callbacks; the borrow ends with the call.
pub struct SimulationState<'a> {
    fields: &'a [f32],
    parameters: &'a SimulationParameters,
}

impl<'a> SimulationState<'a> {
    /// Wrap `fields` (`SOLVER_FIELD_COUNT * voxel_count` values).
    ///
    /// # Panics
    /// If `fields` has the wrong length.
    pub fn new(fields: &'a [f32], parameters: &'a SimulationParameters) -> Self {
        assert_eq!(fields.len(), SOLVER_FIELD_COUNT * parameters.voxel_count(), "field snapshot size");
        Self { fields, parameters }
    }

    /// Parameters of the run.
    pub fn parameters(&self) -> &SimulationParameters {
        self.parameters
    }

    /// Occupancy at a continuous position relative to the grid centre.
    pub fn occupancy(&self, x: f32, y: f32, z: f32) -> f32 {
        self.sample_all(x, y, z)[FIELD_OCCUPANCY]
    }

    /// Diffusive mass at a continuous position relative to the grid centre.
    pub fn diffusive_mass(&self, x: f32, y: f32, z: f32) -> f32 {
        self.sample_all(x, y, z)[FIELD_DIFFUSIVE_MASS]
    }

    /// Boundary mass at a continuous position relative to the grid centre.
    pub fn boundary_mass(&self, x: f32, y: f32, z: f32) -> f32 {
        self.sample_all(x, y, z)[FIELD_BOUNDARY_MASS]
    }

    /// Raw value of `field` at grid indices.
    pub fn voxel(&self, field: usize, ix: u32, iy: u32, iz: u32) -> f32 {
        let p = self.parameters;
        let idx = (iz as usize * p.voxel_y as usize + iy as usize) * p.voxel_x as usize + ix as usize;
        self.fields[field * p.voxel_count() + idx]
    }

    /// One whole field.
    pub fn field(&self, field: usize) -> &[f32] {
        let n = self.parameters.voxel_count();
        &self.fields[field * n..(field + 1) * n]
    }

    /// Number of frozen voxels.
    pub fn frozen_count(&self) -> usize {
        self.field(FIELD_OCCUPANCY).iter().filter(|&&v| v >= 0.5).count()
    }

    /// Total water mass: frozen voxels count as one unit each, plus all
    /// diffusive and boundary mass.
    pub fn total_mass(&self) -> f64 {
        let occupancy = self.field(FIELD_OCCUPANCY);
        let diffusive = self.field(FIELD_DIFFUSIVE_MASS);
        let boundary = self.field(FIELD_BOUNDARY_MASS);
        occupancy
            .iter()
            .zip(diffusive)
            .zip(boundary)
            .map(|((&o, &d), &b)| if o >= 0.5 { 1.0 } else { d as f64 + b as f64 })
            .sum()
    }

    fn sample_all(&self, x: f32, y: f32, z: f32) -> [f32; SOLVER_FIELD_COUNT] {
        let p = self.parameters;

        // Cube coordinates of the position.
        let i = x / 3f32.sqrt() * 2.0;
        let j = y - 0.5 * i;
        let h = -(i + j);

        // Far or non-finite positions never reach integer arithmetic.
        let limit = (p.radius_t().max(p.radius_z()).max(0) + 2) as f32;
        if !(i.abs() <= limit && j.abs() <= limit && z.abs() <= limit) {
            return dirichlet_values(p);
        }

        let mut ri = i.round() as i64;
        let mut rj = j.round() as i64;
        let rh = h.round() as i64;
        let di = (ri as f32 - i).abs();
        let dj = (rj as f32 - j).abs();
        let dh = (rh as f32 - h).abs();
        // Recompute the coordinate with the largest rounding error.
        if di > dj && di > dh {
            ri = -(rj + rh);
        } else if dj > dh {
            rj = -(ri + rh);
        }

        let bk = z.round() as i64;
        if outside_growth_region(ri, rj, bk, p.radius_t() as i64, p.radius_z() as i64) {
            return dirichlet_values(p);
        }

        let xs = p.voxel_x as i64;
        let ys = p.voxel_y as i64;
        let zs = p.voxel_z as i64;
        let idx = ((bk + zs / 2) * ys + (rj + ys / 2)) * xs + (ri + xs / 2);
        let n = p.voxel_count();
        std::array::from_fn(|m| self.fields[m * n + idx as usize])
    }
}

/// Whether hexagonal coordinates `(bi, bj, bk)` relative to the centre lie
/// outside the prism the solver updates.
pub fn outside_growth_region(bi: i64, bj: i64, bk: i64, radius_t: i64, radius_z: i64) -> bool {
    -(bi + bj) > radius_t
        || -bi > radius_t
        || -bj > radius_t
        || bi + bj >= radius_t
        || bi >= radius_t
        || bj >= radius_t
        || -bk > radius_z
        || bk >= radius_z
}

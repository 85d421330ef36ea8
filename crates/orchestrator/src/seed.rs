//! Initial field values: quiescent medium plus the seed crystal.

use crate::config::SimulationParameters;
use crate::state::{SOLVER_FIELD_COUNT, FIELD_OCCUPANCY};

/// Values of `[occupancy, diffusive mass, boundary mass]` in undisturbed
/// medium. Also the Dirichlet condition outside the growth region.
pub fn dirichlet_values(params: &SimulationParameters) -> [f32; SOLVER_FIELD_COUNT] {
    [0.0, params.medium.rho as f32, 0.0]
}

/// Fill `fields` (all solver fields, field-major) with the quiescent medium
/// and freeze the seed crystal around the centre voxel.
///
/// # Panics
/// If `fields` is not `SOLVER_FIELD_COUNT * voxel_count` long.
pub fn seed_fields(params: &SimulationParameters, fields: &mut [f32]) {
    let n = params.voxel_count();
    assert_eq!(fields.len(), SOLVER_FIELD_COUNT * n, "field buffer size");

    for (field, value) in fields.chunks_exact_mut(n).zip(dirichlet_values(params)) {
        field.fill(value);
    }

    let x = params.voxel_x as i64;
    let y = params.voxel_y as i64;
    let z = params.voxel_z as i64;
    let centre = ((z / 2) * y + y / 2) * x + x / 2;

    let r = params.seed.radius as i64;
    let t = params.seed.thickness as i64;
    let occupancy = &mut fields[FIELD_OCCUPANCY * n..(FIELD_OCCUPANCY + 1) * n];
    let mut frozen = 0usize;
    for k in -(t / 2)..(t - t / 2) {
        for j in -r..=r {
            for i in -r..=r {
                if (i + j).abs() > r {
                    continue;
                }
                occupancy[(centre + (k * y + j) * x + i) as usize] = 1.0;
                frozen += 1;
            }
        }
    }
    tracing::debug!("seeded {} frozen voxels (radius {}, thickness {})", frozen, r, t);
}

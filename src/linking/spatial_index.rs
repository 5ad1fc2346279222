//! # Grid spatial index
//!
//! Uniform grid over the tangent plane of a set of sky positions, used to bound the candidate
//! pairs considered by the pairwise linker and by the stationary-source filter.
//!
//! Positions are projected onto the [`TangentPlane`] centered on their mean direction and
//! hashed into square cells. A query returns every point stored in the cells overlapping the
//! search box; it is a **superset** of the points within the angular radius, so callers
//! apply their exact acceptance test on the returned candidates.
//!
//! The gnomonic projection stretches distances by at most `1 + ρ²` (ρ being the planar
//! distance from the tangent point, in radians), so the search radius is inflated by that
//! factor to keep the superset guarantee away from the center.
use std::collections::HashMap;

use ahash::RandomState;

use crate::{
    constants::Degree,
    sky::{mean_position, TangentPlane},
};

/// Uniform grid of projected positions.
#[derive(Debug, Clone)]
pub struct GridIndex {
    plane: TangentPlane,
    cell_size: Degree,
    cells: HashMap<(i64, i64), Vec<usize>, RandomState>,
    max_rho: f64,
    len: usize,
}

impl GridIndex {
    /// Index `positions` (degrees) with square cells of `cell_size` degrees.
    ///
    /// Return
    /// ----------
    /// * `None` if `positions` is empty or if some position cannot be projected around the
    ///   mean direction (points spread over more than a hemisphere); callers fall back to an
    ///   exhaustive scan.
    pub fn build(positions: &[(Degree, Degree)], cell_size: Degree) -> Option<Self> {
        let (ra0, dec0) = mean_position(positions.iter().copied())?;
        let plane = TangentPlane::new(ra0, dec0);
        let cell_size = cell_size.max(1e-7);

        let mut cells: HashMap<(i64, i64), Vec<usize>, RandomState> =
            HashMap::with_hasher(RandomState::new());
        let mut max_rho: f64 = 0.0;
        for (idx, &(ra, dec)) in positions.iter().enumerate() {
            let (xi, eta) = plane.project(ra, dec)?;
            max_rho = max_rho.max(xi.hypot(eta).to_radians());
            cells
                .entry(Self::cell_of(xi, eta, cell_size))
                .or_default()
                .push(idx);
        }

        Some(GridIndex {
            plane,
            cell_size,
            cells,
            max_rho,
            len: positions.len(),
        })
    }

    #[inline]
    fn cell_of(xi: Degree, eta: Degree, cell_size: Degree) -> (i64, i64) {
        (
            (xi / cell_size).floor() as i64,
            (eta / cell_size).floor() as i64,
        )
    }

    /// Candidate indices within `radius` degrees of `(ra, dec)`, ascending.
    pub fn query(&self, ra: Degree, dec: Degree, radius: Degree) -> Vec<usize> {
        let Some((xi, eta)) = self.plane.project(ra, dec) else {
            return (0..self.len).collect();
        };

        let rho = xi.hypot(eta).to_radians().max(self.max_rho);
        let reach = radius * (1.0 + rho * rho) * (1.0 + 1e-9) + 1e-12;

        let (cx_min, cy_min) = Self::cell_of(xi - reach, eta - reach, self.cell_size);
        let (cx_max, cy_max) = Self::cell_of(xi + reach, eta + reach, self.cell_size);

        // Very large radii relative to the cell size: scanning the occupied cells is cheaper.
        let box_cells = (cx_max - cx_min + 1).saturating_mul(cy_max - cy_min + 1);
        let mut found: Vec<usize> = if box_cells as usize > self.cells.len() {
            self.cells
                .iter()
                .filter(|(&(cx, cy), _)| {
                    (cx_min..=cx_max).contains(&cx) && (cy_min..=cy_max).contains(&cy)
                })
                .flat_map(|(_, idxs)| idxs.iter().copied())
                .collect()
        } else {
            let mut found = Vec::new();
            for cx in cx_min..=cx_max {
                for cy in cy_min..=cy_max {
                    if let Some(idxs) = self.cells.get(&(cx, cy)) {
                        found.extend_from_slice(idxs);
                    }
                }
            }
            found
        };
        found.sort_unstable();
        found
    }
}

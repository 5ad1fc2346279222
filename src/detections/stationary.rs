//! # Stationary-source flagging
//!
//! Stars, galaxies and detector artifacts show up at the same sky position in every exposure
//! of a field. Left in the store they produce a flood of slow, low-residual pairs, so they
//! are flagged once after loading and skipped by the pairwise linker.
//!
//! A detection is **stationary** when at least `min_matches` *other* exposures, each taken at
//! least `min_time_separation` away from its own exposure, contain a detection within
//! `tolerance` arcseconds of it. The time separation keeps slow movers from matching
//! themselves in back-to-back exposures.
use log::debug;
use rayon::prelude::*;

use crate::{
    constants::{ArcSec, ARCSEC_PER_DEG, HOURS_PER_DAY},
    detections::{Detection, DetectionStore},
    linking::spatial_index::GridIndex,
    sky::angular_separation,
};

/// Settings of [`flag_stationary`].
#[derive(Debug, Clone, PartialEq)]
pub struct StationaryParams {
    /// Matching radius (arcseconds).
    pub tolerance: ArcSec,
    /// Minimum time (days) between two exposures for a match to count.
    pub min_time_separation: f64,
    /// Matching exposures required to flag a detection; `0` disables flagging.
    pub min_matches: usize,
}

impl Default for StationaryParams {
    fn default() -> Self {
        StationaryParams {
            tolerance: 0.5,
            min_time_separation: 2.0 / HOURS_PER_DAY,
            min_matches: 2,
        }
    }
}

/// Flag the stationary detections of `store`.
///
/// Arguments
/// -----------------
/// * `store`: the freshly built detection store; flags from a previous call are replaced.
/// * `params`: matching radius, time separation and match count.
///
/// Return
/// ----------
/// * The number of detections flagged.
pub fn flag_stationary(store: &mut DetectionStore, params: &StationaryParams) -> usize {
    if params.min_matches == 0 || store.is_empty() {
        store.set_stationary(vec![false; store.len()]);
        return 0;
    }

    let radius = params.tolerance / ARCSEC_PER_DEG;
    let indexes: Vec<Option<GridIndex>> = store
        .exposures()
        .par_iter()
        .map(|exposure| {
            let positions: Vec<_> = store
                .exposure_detections(exposure)
                .iter()
                .map(|d| (d.ra, d.dec))
                .collect();
            GridIndex::build(&positions, radius)
        })
        .collect();

    let exposures = store.exposures();
    let flags: Vec<bool> = exposures
        .par_iter()
        .enumerate()
        .flat_map_iter(|(i, exposure)| {
            let partners: Vec<usize> = exposures
                .iter()
                .enumerate()
                .filter(|(j, other)| {
                    *j != i
                        && (other.mid_mjd - exposure.mid_mjd).abs() >= params.min_time_separation
                })
                .map(|(j, _)| j)
                .collect();

            store
                .exposure_detections(exposure)
                .iter()
                .map(|det| {
                    let matches = partners
                        .iter()
                        .filter(|&&j| {
                            let others = store.exposure_detections(&exposures[j]);
                            has_match(det, others, indexes[j].as_ref(), radius)
                        })
                        .count();
                    matches >= params.min_matches
                })
                .collect::<Vec<_>>()
        })
        .collect();

    let flagged = flags.iter().filter(|&&f| f).count();
    store.set_stationary(flags);
    debug!(
        "Flagged {flagged} stationary detection(s) out of {} (tolerance {:.2}\", {} match(es))",
        store.len(),
        params.tolerance,
        params.min_matches
    );
    flagged
}

fn has_match(det: &Detection, others: &[Detection], index: Option<&GridIndex>, radius: f64) -> bool {
    let within = |o: &Detection| angular_separation(det.ra, det.dec, o.ra, o.dec) <= radius;
    match index {
        Some(index) => index
            .query(det.ra, det.dec, radius)
            .into_iter()
            .any(|k| within(&others[k])),
        None => others.iter().any(within),
    }
}

//! # Pairwise linking
//!
//! Propose [`Link`]s between the detections of two exposures: ordered pairs that could be the
//! same moving object.
//!
//! For a pair `(a, b)` with `b` observed after `a`, the offset of `b` relative to `a` is
//! measured on the tangent plane at `a` (east, north; arcseconds) and divided by the time
//! baseline to obtain the implied angular velocity. The pair is kept when:
//!
//! * the detections are distinct and come from different exposures,
//! * `b.mjd > a.mjd` and the two positions are not identical,
//! * `min_speed ≤ |v| ≤ max_speed`,
//! * the pair residual `sqrt(σa² + σb²)` is at most `max_position_error`,
//! * `|mag_a − mag_b| ≤ max_magnitude_difference`.
//!
//! ## Spatial index
//!
//! Every pair is examined when `|A|·|B|` is small. Above `spatial_index_threshold`, the
//! detections of `B` are indexed on a grid ([`GridIndex`]) and each `a` only visits the
//! detections within `max_speed · Δt_max`. The tangent-plane offset is never shorter than the
//! great-circle separation, so both strategies accept exactly the same pairs.
use std::borrow::Borrow;

use itertools::Itertools;
use log::debug;
use nalgebra::Vector2;
use rayon::prelude::*;

use crate::{
    constants::{
        ArcSec, ArcSecPerHour, DetectionId, NightId, ARCSEC_PER_DEG, HOURS_PER_DAY,
        ZERO_SEPARATION_DEG,
    },
    detections::{Detection, DetectionStore},
    linking::{spatial_index::GridIndex, LinkingParams},
    sky::{angular_separation, offset_arcsec},
};

/// A candidate motion vector between two detections.
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    /// Earlier detection.
    pub from: DetectionId,
    /// Later detection.
    pub to: DetectionId,
    /// Time baseline in days (> 0).
    pub dt: f64,
    /// Tangent-plane rates `(east, north)` in arcsec/hour.
    pub velocity: Vector2<f64>,
    /// Norm of `velocity`.
    pub speed: ArcSecPerHour,
    /// Pair residual `sqrt(σa² + σb²)`.
    pub residual: ArcSec,
}

/// Evaluate one ordered pair.
///
/// Return
/// ----------
/// * `Some(Link)` when the pair satisfies every acceptance rule, `None` otherwise.
pub fn try_link(a: &Detection, b: &Detection, params: &LinkingParams) -> Option<Link> {
    if a.id == b.id || a.exposure_id == b.exposure_id {
        return None;
    }
    let dt = b.mjd - a.mjd;
    if dt <= 0.0 {
        return None;
    }

    let residual = a.sigma.hypot(b.sigma);
    if residual > params.max_position_error {
        return None;
    }
    if (a.mag - b.mag).abs() > params.max_magnitude_difference {
        return None;
    }
    if angular_separation(a.ra, a.dec, b.ra, b.dec) < ZERO_SEPARATION_DEG {
        return None;
    }

    let (dx, dy) = offset_arcsec(a.ra, a.dec, b.ra, b.dec)?;
    let velocity = Vector2::new(dx, dy) / (dt * HOURS_PER_DAY);
    let speed = velocity.norm();
    if !(params.min_speed..=params.max_speed).contains(&speed) {
        return None;
    }

    Some(Link {
        from: a.id,
        to: b.id,
        dt,
        velocity,
        speed,
        residual,
    })
}

/// Link the detections of an earlier exposure set `a` to a later set `b`.
///
/// Arguments
/// -----------------
/// * `a`, `b`: detections (owned or borrowed), usually one exposure each.
/// * `params`: linking thresholds.
///
/// Return
/// ----------
/// * All accepted links, sorted by `(from, to)`.
pub fn link<D>(a: &[D], b: &[D], params: &LinkingParams) -> Vec<Link>
where
    D: Borrow<Detection> + Sync,
{
    if a.is_empty() || b.is_empty() {
        return Vec::new();
    }

    let index = if a.len().saturating_mul(b.len()) > params.spatial_index_threshold {
        search_radius(a, b, params).and_then(|radius| {
            let positions: Vec<_> = b
                .iter()
                .map(|d| (d.borrow().ra, d.borrow().dec))
                .collect();
            GridIndex::build(&positions, radius).map(|grid| (grid, radius))
        })
    } else {
        None
    };

    let mut links: Vec<Link> = match &index {
        Some((grid, radius)) => a
            .par_iter()
            .flat_map_iter(|da| {
                let da = da.borrow();
                grid.query(da.ra, da.dec, *radius)
                    .into_iter()
                    .filter_map(move |k| try_link(da, b[k].borrow(), params))
            })
            .collect(),
        None => a
            .par_iter()
            .flat_map_iter(|da| {
                b.iter()
                    .filter_map(move |db| try_link(da.borrow(), db.borrow(), params))
            })
            .collect(),
    };

    links.sort_by(|x, y| (x.from, x.to).cmp(&(y.from, y.to)));
    links
}

/// Largest separation (degrees) an accepted pair between `a` and `b` can have.
fn search_radius<D: Borrow<Detection>>(a: &[D], b: &[D], params: &LinkingParams) -> Option<f64> {
    let earliest = a.iter().map(|d| d.borrow().mjd).min_by(f64::total_cmp)?;
    let latest = b.iter().map(|d| d.borrow().mjd).max_by(f64::total_cmp)?;
    let dt_max = latest - earliest;
    (dt_max > 0.0).then(|| params.max_speed * dt_max * HOURS_PER_DAY / ARCSEC_PER_DEG)
}

/// Link every ordered exposure pair of one night.
///
/// Stationary detections are skipped. Exposures are taken in time order, so every pair is
/// linked from the earlier to the later exposure.
///
/// Return
/// ----------
/// * The links of the night, sorted by `(from, to)`.
pub fn link_night(store: &DetectionStore, night: NightId, params: &LinkingParams) -> Vec<Link> {
    let movable: Vec<Vec<&Detection>> = store
        .night_exposures(night)
        .map(|exposure| {
            store
                .exposure_detections(exposure)
                .iter()
                .filter(|d| !store.is_stationary(d.id))
                .collect()
        })
        .collect();

    let mut links: Vec<Link> = movable
        .iter()
        .tuple_combinations()
        .flat_map(|(a, b)| link(a, b, params))
        .collect();
    links.sort_by(|x, y| (x.from, x.to).cmp(&(y.from, y.to)));

    debug!(
        "{night}: {} exposure(s), {} link(s)",
        movable.len(),
        links.len()
    );
    links
}

#[cfg(test)]
mod pairwise_test {
    use super::*;
    use crate::detections::{ExposureCatalog, RawDetection, StoreParams};
    use approx::assert_abs_diff_eq;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn det(id: u32, exposure: &str, ra: f64, dec: f64, mjd: f64) -> Detection {
        Detection {
            id: DetectionId(id),
            exposure_id: exposure.to_string(),
            ra,
            dec,
            mjd,
            mag: 22.0,
            sigma: 0.2,
        }
    }

    fn random_exposure(rng: &mut StdRng, first_id: u32, exposure: &str, mjd: f64) -> Vec<Detection> {
        (0..200)
            .map(|k| {
                det(
                    first_id + k,
                    exposure,
                    30.0 + rng.random_range(0.0..0.05),
                    10.0 + rng.random_range(0.0..0.05),
                    mjd,
                )
            })
            .collect()
    }

    #[test]
    fn test_velocity_and_speed() {
        let a = det(0, "e0", 100.0, 0.0, 57000.0);
        let b = det(1, "e1", 100.0 + 10.0 / ARCSEC_PER_DEG, 0.0, 57000.0 + 2.0 / 24.0);
        let link = try_link(&a, &b, &LinkingParams::default()).unwrap();
        assert_abs_diff_eq!(link.velocity.x, 5.0, epsilon = 1e-6);
        assert_abs_diff_eq!(link.velocity.y, 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(link.speed, 5.0, epsilon = 1e-6);
        assert_abs_diff_eq!(link.residual, 0.2_f64.hypot(0.2), epsilon = 1e-12);
    }

    #[test]
    fn test_degenerate_pairs_rejected() {
        let params = LinkingParams::default();
        let a = det(0, "e0", 100.0, 0.0, 57000.0);

        let same_place = det(1, "e1", 100.0, 0.0, 57000.1);
        assert!(try_link(&a, &same_place, &params).is_none());

        let same_exposure = det(1, "e0", 100.001, 0.0, 57000.0);
        assert!(try_link(&a, &same_exposure, &params).is_none());

        let earlier = det(1, "e1", 100.001, 0.0, 56999.9);
        assert!(try_link(&a, &earlier, &params).is_none());
        assert!(try_link(&a, &a, &params).is_none());
    }

    #[test]
    fn test_thresholds() {
        let a = det(0, "e0", 100.0, 0.0, 57000.0);
        // 40"/h: too fast for the default 15"/h.
        let fast = det(1, "e1", 100.0 + 40.0 / ARCSEC_PER_DEG, 0.0, 57000.0 + 1.0 / 24.0);
        assert!(try_link(&a, &fast, &LinkingParams::default()).is_none());

        let slow = det(1, "e1", 100.0 + 1.0 / ARCSEC_PER_DEG, 0.0, 57000.0 + 1.0 / 24.0);
        let params = LinkingParams::builder().min_speed(2.0).build().unwrap();
        assert!(try_link(&a, &slow, &params).is_none());

        let mut noisy = slow.clone();
        noisy.sigma = 2.0;
        assert!(try_link(&a, &noisy, &LinkingParams::default()).is_none());

        let mut faint = slow.clone();
        faint.mag = 24.0;
        let params = LinkingParams::builder()
            .max_magnitude_difference(1.0)
            .build()
            .unwrap();
        assert!(try_link(&a, &faint, &params).is_none());
        assert!(try_link(&a, &faint, &LinkingParams::default()).is_some());
    }

    #[test]
    fn test_link_invariants_and_order() {
        let mut rng = StdRng::seed_from_u64(42);
        let a = random_exposure(&mut rng, 0, "e0", 57000.30);
        let b = random_exposure(&mut rng, 200, "e1", 57000.35);
        let params = LinkingParams::default();

        let links = link(&a, &b, &params);
        assert!(!links.is_empty());
        for l in &links {
            assert!(l.dt > 0.0);
            assert!(l.speed <= params.max_speed);
            assert!(l.residual <= params.max_position_error);
        }
        assert!(links.windows(2).all(|w| (w[0].from, w[0].to) < (w[1].from, w[1].to)));
    }

    #[test]
    fn test_grid_matches_exhaustive_search() {
        let mut rng = StdRng::seed_from_u64(3);
        let a = random_exposure(&mut rng, 0, "e0", 57000.30);
        let b = random_exposure(&mut rng, 200, "e1", 57000.40);

        let exhaustive = LinkingParams::builder()
            .spatial_index_threshold(usize::MAX)
            .build()
            .unwrap();
        let indexed = LinkingParams::builder()
            .spatial_index_threshold(0)
            .build()
            .unwrap();

        let expected = link(&a, &b, &exhaustive);
        assert!(!expected.is_empty());
        assert_eq!(link(&a, &b, &indexed), expected);
    }

    #[test]
    fn test_three_exposures_on_a_line() {
        let catalogs = (0..3)
            .map(|k| {
                let h = k as f64;
                ExposureCatalog::new(
                    format!("e{k}"),
                    vec![RawDetection {
                        ra: 200.0 + 3.0 * h / ARCSEC_PER_DEG,
                        dec: 1.0 * h / ARCSEC_PER_DEG,
                        mjd: 57000.30 + h / 24.0,
                        mag: 22.0,
                        sigma: 0.1,
                    }],
                )
            })
            .collect::<Vec<_>>();
        let store = DetectionStore::from_catalogs(catalogs, StoreParams::default()).unwrap();
        let night = store.nights()[0];

        let links = link_night(&store, night, &LinkingParams::default());
        let pairs: Vec<_> = links.iter().map(|l| (l.from.0, l.to.0)).collect();
        assert_eq!(pairs, vec![(0, 1), (0, 2), (1, 2)]);
        for l in &links {
            assert_abs_diff_eq!(l.speed, 10.0_f64.sqrt(), epsilon = 1e-4);
        }
    }
}

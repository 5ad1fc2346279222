//! # Tracklet builder
//!
//! Chain the pairwise [`Link`]s of one night into [`Tracklet`]s: short sequences of
//! detections from distinct exposures sharing a consistent linear motion.
//!
//! ## Algorithm
//!
//! The builder is greedy and fully deterministic:
//!
//! 1. Every link gets a **support**: the number of other links sharing one of its detections
//!    whose velocity is consistent with its own. Seeds are taken by decreasing support, then
//!    increasing `(residual, speed, from, to)`. A seed touching an already claimed detection
//!    is skipped.
//! 2. The chain grows in both time directions. Any link between a chain member and a
//!    detection outside the chain is a valid extension when
//!    * the outside detection is unclaimed and belongs to an exposure not yet in the chain,
//!    * the link velocity is within `max_angle_difference` of the chain velocity,
//!    * the link speed differs from the chain speed by at most
//!      `max_speed_difference_fraction × chain speed`.
//!
//!    Among valid extensions the one closest to the chain velocity wins, then the lowest pair
//!    residual, then the lowest detection id. The detection is inserted in time order and the
//!    chain is refitted. An extension whose refit exceeds `max_tracklet_residual` is discarded
//!    for this seed and the next best candidate is tried.
//! 3. The finished chain is fitted with [`motion_fit::fit_linear_motion`]. Chains shorter than
//!    `min_tracklet_length`, or whose RMS residual exceeds `max_tracklet_residual`, are
//!    dropped; their detections stay available to later seeds. A short chain counts as a fit
//!    failure when one of its extensions was discarded.
//! 4. An accepted chain claims its detections.
//!
//! Since every choice is made on a total order, the same set of links always yields the same
//! tracklets, whatever their input order.
pub mod motion_fit;

use std::collections::{HashMap, HashSet};
use std::fmt;

use ahash::RandomState;
use log::debug;
use nalgebra::Vector2;
use smallvec::SmallVec;

use crate::{
    constants::{ArcSec, DetectionId, NightId, TrackletId, MJD},
    detections::{Detection, DetectionStore},
    linking::{pairwise::Link, LinkingParams},
};
use motion_fit::{fit_linear_motion, LinearMotion};

/// A within-night sequence of detections with a fitted linear motion.
#[derive(Debug, Clone, PartialEq)]
pub struct Tracklet {
    pub id: TrackletId,
    /// Detections in strictly increasing time order, at most one per exposure.
    pub detections: SmallVec<[DetectionId; 4]>,
    pub motion: LinearMotion,
    /// Time of the first detection.
    pub start_mjd: MJD,
    /// Time of the last detection.
    pub end_mjd: MJD,
}

impl Tracklet {
    pub fn night(&self) -> NightId {
        self.id.night
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    /// RMS residual of the linear fit (arcsec).
    pub fn residual(&self) -> ArcSec {
        self.motion.rms
    }

    /// First detection of the tracklet.
    pub fn first_detection(&self) -> Option<DetectionId> {
        self.detections.first().copied()
    }
}

impl fmt::Display for Tracklet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] rate=({:.3}, {:.3})\"/h rms={:.3}\"",
            self.id,
            self.detections.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(", "),
            self.motion.rate.x,
            self.motion.rate.y,
            self.motion.rms
        )
    }
}

/// Result of [`build`] for one night.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackletBuild {
    pub tracklets: Vec<Tracklet>,
    /// Chains dropped because the fit failed or exceeded `max_tracklet_residual`.
    pub fit_failures: usize,
}

type Adjacency = HashMap<DetectionId, Vec<usize>, RandomState>;

/// Build the tracklets of `night` from its links.
///
/// Arguments
/// -----------------
/// * `night`: the night the links belong to (used for tracklet identifiers).
/// * `links`: the output of [`link_night`](crate::linking::pairwise::link_night).
/// * `store`: the detection store the links refer to.
/// * `params`: velocity consistency, minimum length and residual thresholds.
///
/// Return
/// ----------
/// * The accepted tracklets, numbered in acceptance order, and the number of fit failures.
pub fn build(
    night: NightId,
    links: &[Link],
    store: &DetectionStore,
    params: &LinkingParams,
) -> TrackletBuild {
    let mut outgoing: Adjacency = HashMap::with_hasher(RandomState::new());
    let mut incoming: Adjacency = HashMap::with_hasher(RandomState::new());
    for (i, link) in links.iter().enumerate() {
        outgoing.entry(link.from).or_default().push(i);
        incoming.entry(link.to).or_default().push(i);
    }

    let support: Vec<usize> = links
        .iter()
        .enumerate()
        .map(|(i, link)| {
            [link.from, link.to]
                .iter()
                .flat_map(|id| incident(*id, &outgoing, &incoming))
                .filter(|&j| j != i && velocity_consistent(&links[j].velocity, &link.velocity, params))
                .count()
        })
        .collect();

    let mut seeds: Vec<usize> = (0..links.len()).collect();
    seeds.sort_by(|&a, &b| {
        let (la, lb) = (&links[a], &links[b]);
        support[b]
            .cmp(&support[a])
            .then(la.residual.total_cmp(&lb.residual))
            .then(la.speed.total_cmp(&lb.speed))
            .then((la.from, la.to).cmp(&(lb.from, lb.to)))
    });

    let mut claimed: HashSet<DetectionId, RandomState> = HashSet::with_hasher(RandomState::new());
    let mut result = TrackletBuild::default();

    for seed in seeds {
        let seed = &links[seed];
        if claimed.contains(&seed.from) || claimed.contains(&seed.to) {
            continue;
        }

        let mut chain: Vec<&Detection> = vec![store.detection(seed.from), store.detection(seed.to)];
        let mut velocity = seed.velocity;
        let mut rejected: HashSet<DetectionId, RandomState> =
            HashSet::with_hasher(RandomState::new());

        while let Some(next) = best_extension(
            &chain, links, &outgoing, &incoming, &claimed, &rejected, velocity, store, params,
        ) {
            let mut trial = chain.clone();
            let at = trial.partition_point(|d| d.mjd < next.mjd);
            trial.insert(at, next);
            match fit_linear_motion(&trial) {
                Ok(motion) if motion.rms <= params.max_tracklet_residual => {
                    velocity = motion.rate;
                    chain = trial;
                }
                _ => {
                    rejected.insert(next.id);
                }
            }
        }

        if chain.len() < params.min_tracklet_length {
            if !rejected.is_empty() {
                debug!(
                    "{night}: chain of {} too short after {} rejected extension(s)",
                    chain.len(),
                    rejected.len()
                );
                result.fit_failures += 1;
            }
            continue;
        }

        let motion = match fit_linear_motion(&chain) {
            Ok(motion) if motion.rms <= params.max_tracklet_residual => motion,
            Ok(motion) => {
                debug!(
                    "{night}: chain of {} rejected, rms {:.3}\" > {:.3}\"",
                    chain.len(),
                    motion.rms,
                    params.max_tracklet_residual
                );
                result.fit_failures += 1;
                continue;
            }
            Err(err) => {
                debug!("{night}: chain of {} rejected: {err}", chain.len());
                result.fit_failures += 1;
                continue;
            }
        };

        claimed.extend(chain.iter().map(|d| d.id));
        let id = TrackletId {
            night,
            index: result.tracklets.len() as u32,
        };
        result.tracklets.push(Tracklet {
            id,
            detections: chain.iter().map(|d| d.id).collect(),
            start_mjd: chain[0].mjd,
            end_mjd: chain[chain.len() - 1].mjd,
            motion,
        });
    }

    debug!(
        "{night}: {} tracklet(s) from {} link(s), {} fit failure(s)",
        result.tracklets.len(),
        links.len(),
        result.fit_failures
    );
    result
}

/// Whether `candidate` moves like `reference` within the angle and speed tolerances.
pub fn velocity_consistent(
    candidate: &Vector2<f64>,
    reference: &Vector2<f64>,
    params: &LinkingParams,
) -> bool {
    let (c, r) = (candidate.norm(), reference.norm());
    if c == 0.0 || r == 0.0 {
        return false;
    }
    let cos = (candidate.dot(reference) / (c * r)).clamp(-1.0, 1.0);
    cos.acos().to_degrees() <= params.max_angle_difference
        && (c - r).abs() <= params.max_speed_difference_fraction * r
}

/// Indices of the links starting or ending at `id`.
fn incident<'a>(
    id: DetectionId,
    outgoing: &'a Adjacency,
    incoming: &'a Adjacency,
) -> impl Iterator<Item = usize> + 'a {
    outgoing
        .get(&id)
        .into_iter()
        .chain(incoming.get(&id))
        .flatten()
        .copied()
}

#[allow(clippy::too_many_arguments)]
fn best_extension<'s>(
    chain: &[&Detection],
    links: &[Link],
    outgoing: &Adjacency,
    incoming: &Adjacency,
    claimed: &HashSet<DetectionId, RandomState>,
    rejected: &HashSet<DetectionId, RandomState>,
    velocity: Vector2<f64>,
    store: &'s DetectionStore,
    params: &LinkingParams,
) -> Option<&'s Detection> {
    chain
        .iter()
        .flat_map(|member| {
            incident(member.id, outgoing, incoming).map(move |i| {
                let link = &links[i];
                let far = if link.from == member.id { link.to } else { link.from };
                (link, far)
            })
        })
        .filter_map(|(link, far)| {
            let far = store.detection(far);
            let usable = !claimed.contains(&far.id)
                && !rejected.contains(&far.id)
                && chain
                    .iter()
                    .all(|d| d.exposure_id != far.exposure_id && d.mjd != far.mjd)
                && velocity_consistent(&link.velocity, &velocity, params);
            usable.then(|| ((link.velocity - velocity).norm(), link.residual, far))
        })
        .min_by(|a, b| {
            a.0.total_cmp(&b.0)
                .then(a.1.total_cmp(&b.1))
                .then(a.2.id.cmp(&b.2.id))
        })
        .map(|(_, _, far)| far)
}

//! # Candidate ranking and deduplication
//!
//! Order the closed [`Track`]s of a run and drop near-duplicates.
//!
//! ## Score
//!
//! ```text
//! score = w_span · span_days + w_tracklets · n_tracklets − w_residual · mean_residual
//! ```
//!
//! where `mean_residual` is the mean RMS residual (arcsec) of the track's tracklets. Tracks
//! are sorted by score (descending), then span (descending), then detection count
//! (descending), then track id (ascending). This is a total order, so ranking an already
//! ranked sequence returns it unchanged.
//!
//! ## Deduplication
//!
//! Walking the sorted list, a track is dropped when it shares **more than half** of the
//! detections of the smaller of the two tracks with a track kept before it. The survivor of two
//! overlapping tracks is therefore always the better ranked one.
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use ahash::RandomState;
use log::debug;

use crate::{constants::DetectionId, tracks::Track};

/// Weights of the ranking score.
#[derive(Debug, Clone, PartialEq)]
pub struct RankingWeights {
    /// Per day of observation span.
    pub span: f64,
    /// Per tracklet.
    pub tracklets: f64,
    /// Per arcsecond of mean tracklet residual (subtracted).
    pub residual: f64,
}

impl Default for RankingWeights {
    fn default() -> Self {
        RankingWeights {
            span: 1.0,
            tracklets: 1.0,
            residual: 1.0,
        }
    }
}

/// A track with its score and 1-based rank.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedTrack {
    pub rank: usize,
    pub score: f64,
    pub track: Track,
}

impl fmt::Display for RankedTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} score={:.3} {}", self.rank, self.score, self.track)
    }
}

/// Score of one track.
pub fn score(track: &Track, weights: &RankingWeights) -> f64 {
    weights.span * track.span_days() + weights.tracklets * track.tracklets().len() as f64
        - weights.residual * track.mean_tracklet_residual()
}

fn compare(a: &(f64, Track), b: &(f64, Track)) -> Ordering {
    b.0.total_cmp(&a.0)
        .then(b.1.span_days().total_cmp(&a.1.span_days()))
        .then(b.1.detection_count().cmp(&a.1.detection_count()))
        .then(a.1.id().cmp(&b.1.id()))
}

/// Score, sort and deduplicate `tracks`.
///
/// Arguments
/// -----------------
/// * `tracks`: the closed tracks of a run, in any order.
/// * `weights`: the score weights.
///
/// Return
/// ----------
/// * The surviving tracks in rank order, numbered from 1.
pub fn rank<I>(tracks: I, weights: &RankingWeights) -> Vec<RankedTrack>
where
    I: IntoIterator<Item = Track>,
{
    let mut scored: Vec<(f64, Track)> = tracks
        .into_iter()
        .map(|t| (score(&t, weights), t))
        .collect();
    scored.sort_by(compare);

    let total = scored.len();
    let kept = dedupe(scored);
    debug!(
        "Ranked {} track(s), {} dropped as duplicates",
        kept.len(),
        total - kept.len()
    );

    kept.into_iter()
        .enumerate()
        .map(|(i, (score, track))| RankedTrack {
            rank: i + 1,
            score,
            track,
        })
        .collect()
}

/// Drop tracks sharing a majority of detections with a better ranked one.
fn dedupe(sorted: Vec<(f64, Track)>) -> Vec<(f64, Track)> {
    // detection -> kept tracks holding it
    let mut owners: HashMap<DetectionId, Vec<usize>, RandomState> =
        HashMap::with_hasher(RandomState::new());
    let mut kept: Vec<(f64, Track)> = Vec::with_capacity(sorted.len());

    for (score, track) in sorted {
        let mut shared: HashMap<usize, usize, RandomState> = HashMap::with_hasher(RandomState::new());
        for id in track.detections() {
            for &k in owners.get(&id).into_iter().flatten() {
                *shared.entry(k).or_default() += 1;
            }
        }

        let count = track.detection_count();
        let duplicate = shared.iter().any(|(&k, &n)| {
            let smaller = count.min(kept[k].1.detection_count());
            2 * n > smaller
        });
        if duplicate {
            debug!("{} dropped as a duplicate", track.id());
            continue;
        }

        let k = kept.len();
        for id in track.detections() {
            owners.entry(id).or_default().push(k);
        }
        kept.push((score, track));
    }
    kept
}

#[cfg(test)]
mod ranking_test {
    use super::*;
    use crate::{
        constants::{NightId, TrackId, TrackletId},
        sky::TangentPlane,
        tracklets::{motion_fit::LinearMotion, Tracklet},
    };
    use nalgebra::Vector2;
    use smallvec::SmallVec;

    fn tracklet(night: i64, ids: &[u32], rms: f64) -> Tracklet {
        let start = 57000.3 + night as f64;
        Tracklet {
            id: TrackletId {
                night: NightId(night),
                index: 0,
            },
            detections: ids.iter().map(|&i| DetectionId(i)).collect::<SmallVec<_>>(),
            motion: LinearMotion {
                epoch: start,
                plane: TangentPlane::new(0.0, 0.0),
                position: Vector2::zeros(),
                rate: Vector2::new(1.0, 0.0),
                rms,
                rate_sigma: 0.1,
                n_obs: ids.len(),
            },
            start_mjd: start,
            end_mjd: start + 0.1,
        }
    }

    fn track(id: u32, nights: &[(i64, &[u32])], rms: f64) -> Track {
        let mut iter = nights.iter();
        let (n0, ids0) = iter.next().unwrap();
        let mut track = Track::seed(TrackId(id), tracklet(*n0, ids0, rms));
        for (n, ids) in iter {
            let t = tracklet(*n, ids, rms);
            let motion = t.motion.clone();
            track.attach(t, motion);
        }
        track
    }

    #[test]
    fn test_rank_order_and_stability() {
        let tracks = vec![
            track(0, &[(0, &[0, 1])], 0.1),
            track(1, &[(0, &[2, 3]), (2, &[4, 5]), (4, &[6, 7])], 0.1),
            track(2, &[(0, &[8, 9]), (1, &[10, 11])], 0.1),
            // Same shape as track 2, worse residual.
            track(3, &[(0, &[12, 13]), (1, &[14, 15])], 0.5),
        ];
        let ranked = rank(tracks, &RankingWeights::default());
        let order: Vec<u32> = ranked.iter().map(|r| r.track.id().0).collect();
        assert_eq!(order, vec![1, 2, 3, 0]);
        assert_eq!(ranked.iter().map(|r| r.rank).collect::<Vec<_>>(), vec![1, 2, 3, 4]);

        let again = rank(ranked.iter().map(|r| r.track.clone()), &RankingWeights::default());
        assert_eq!(again, ranked);
    }

    #[test]
    fn test_ties_broken_by_id() {
        let tracks = vec![
            track(5, &[(0, &[0, 1])], 0.2),
            track(4, &[(0, &[2, 3])], 0.2),
        ];
        let ranked = rank(tracks, &RankingWeights::default());
        assert_eq!(ranked[0].track.id(), TrackId(4));
    }

    #[test]
    fn test_dedupe_keeps_the_better_track() {
        let tracks = vec![
            // Shares 3 of its 4 detections with track 1.
            track(0, &[(0, &[0, 1]), (1, &[2, 9])], 0.3),
            track(1, &[(0, &[0, 1]), (1, &[2, 3]), (2, &[4, 5])], 0.1),
            // Shares 1 of 2: not a majority.
            track(2, &[(3, &[5, 20])], 0.1),
        ];
        let ranked = rank(tracks, &RankingWeights::default());
        let ids: Vec<u32> = ranked.iter().map(|r| r.track.id().0).collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(ranked[0].score > score(&track(0, &[(0, &[0, 1]), (1, &[2, 9])], 0.3), &RankingWeights::default()));
    }
}

//! # Night-to-night matcher
//!
//! Grow [`Track`]s one night at a time.
//!
//! ## Processing one night
//!
//! 1. Every open track is evaluated against the night's tracklets in parallel (rayon). The
//!    evaluation is read-only.
//! 2. All qualifying `(track, tracklet)` proposals are sorted by
//!    `(normalized residual, track id, tracklet id)` and assigned greedily: a proposal is taken
//!    when neither its track nor its tracklet has been taken yet.
//! 3. Tracks are updated in parallel, each one owned by a single worker (`par_iter_mut`).
//!    Extended tracks reset their missed-night counter; the others count a missed night and
//!    close once `max_missed_nights` is reached.
//! 4. Every tracklet left unattached seeds a new open track.
//!
//! Only nights that went through [`NightMatcher::process_night`] count as missed nights, so
//! nights without any exposure do not age tracks.
use std::collections::HashSet;
use std::fmt;

use ahash::RandomState;
use log::debug;
use rayon::prelude::*;

use crate::{
    constants::{NightId, TrackId},
    daomop_errors::DaomopError,
    detections::DetectionStore,
    linking::LinkingParams,
    tracklets::{motion_fit::LinearMotion, Tracklet},
    tracks::{ClosureReason, Track},
};

/// Counters of one [`NightMatcher::process_night`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NightReport {
    pub night: Option<NightId>,
    pub tracklets: usize,
    pub extended: usize,
    pub seeded: usize,
    pub closed: usize,
    pub fit_failures: usize,
}

impl fmt::Display for NightReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let night = self
            .night
            .map_or_else(|| "-".to_string(), |n| n.to_string());
        write!(
            f,
            "{night}: {} tracklet(s), {} extended, {} seeded, {} closed, {} fit failure(s)",
            self.tracklets, self.extended, self.seeded, self.closed, self.fit_failures
        )
    }
}

/// Sequential night-by-night track builder.
#[derive(Debug)]
pub struct NightMatcher<'a> {
    store: &'a DetectionStore,
    params: &'a LinkingParams,
    tracks: Vec<Track>,
    next_id: u32,
    last_night: Option<NightId>,
}

impl<'a> NightMatcher<'a> {
    pub fn new(store: &'a DetectionStore, params: &'a LinkingParams) -> Self {
        NightMatcher {
            store,
            params,
            tracks: Vec::new(),
            next_id: 0,
            last_night: None,
        }
    }

    /// All tracks, open and closed, by id.
    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn open_count(&self) -> usize {
        self.tracks.iter().filter(|t| t.is_open()).count()
    }

    /// Match the tracklets of `night` against the open tracks.
    ///
    /// Arguments
    /// -----------------
    /// * `night`: must be later than every night processed before.
    /// * `tracklets`: the tracklets built for `night`.
    ///
    /// Return
    /// ----------
    /// * A [`NightReport`] with the counts of extended, seeded and closed tracks.
    /// * `Err(DaomopError::InvalidParameter)` if `night` does not follow the previous one.
    pub fn process_night(
        &mut self,
        night: NightId,
        mut tracklets: Vec<Tracklet>,
    ) -> Result<NightReport, DaomopError> {
        if self.last_night.is_some_and(|last| night <= last) {
            return Err(DaomopError::InvalidParameter(format!(
                "nights must be processed in increasing order ({night} after {:?})",
                self.last_night
            )));
        }
        self.last_night = Some(night);
        tracklets.sort_by_key(|t| t.id);

        let (store, params) = (self.store, self.params);
        let evaluations: Vec<_> = self
            .tracks
            .par_iter()
            .enumerate()
            .filter(|(_, track)| track.is_open())
            .map(|(i, track)| (i, track.evaluate(&tracklets, store, params)))
            .collect();

        let fit_failures: usize = evaluations.iter().map(|(_, e)| e.fit_failures).sum();

        // Global greedy assignment.
        let mut proposals: Vec<(usize, TrackId, _)> = evaluations
            .into_iter()
            .flat_map(|(i, evaluation)| {
                let id = self.tracks[i].id();
                evaluation.extensions.into_iter().map(move |ext| (i, id, ext))
            })
            .collect();
        proposals.sort_by(|a, b| {
            a.2.normalized_residual
                .total_cmp(&b.2.normalized_residual)
                .then(a.1.cmp(&b.1))
                .then(a.2.tracklet.cmp(&b.2.tracklet))
        });

        let mut assignment: Vec<Option<(Tracklet, LinearMotion)>> = vec![None; self.tracks.len()];
        let mut taken: HashSet<usize, RandomState> = HashSet::with_hasher(RandomState::new());
        for (i, _, ext) in proposals {
            if assignment[i].is_some() || taken.contains(&ext.candidate) {
                continue;
            }
            taken.insert(ext.candidate);
            assignment[i] = Some((tracklets[ext.candidate].clone(), ext.motion));
        }

        let extended = taken.len();
        let closed: usize = self
            .tracks
            .par_iter_mut()
            .zip(assignment.into_par_iter())
            .filter(|(track, _)| track.is_open())
            .map(|(track, assigned)| match assigned {
                Some((tracklet, motion)) => {
                    track.attach(tracklet, motion);
                    0
                }
                None => usize::from(track.miss(params)),
            })
            .sum();

        let mut seeded = 0;
        for (k, tracklet) in tracklets.into_iter().enumerate() {
            if taken.contains(&k) {
                continue;
            }
            let id = TrackId(self.next_id);
            self.next_id += 1;
            self.tracks.push(Track::seed(id, tracklet));
            seeded += 1;
        }

        let report = NightReport {
            night: Some(night),
            tracklets: extended + seeded,
            extended,
            seeded,
            closed,
            fit_failures,
        };
        debug!("{report}; {} open track(s)", self.open_count());
        Ok(report)
    }

    /// Close one track explicitly.
    pub fn close(&mut self, id: TrackId) -> Result<(), DaomopError> {
        let track = self
            .tracks
            .iter_mut()
            .find(|t| t.id() == id)
            .ok_or(DaomopError::UnknownTrack(id))?;
        track.close(ClosureReason::Explicit);
        Ok(())
    }

    /// End of the run: close the remaining open tracks and return every track by id.
    pub fn finish(mut self) -> Vec<Track> {
        for track in self.tracks.iter_mut() {
            track.close(ClosureReason::EndOfRun);
        }
        self.tracks
    }

    /// Cancelled run: return only the tracks already closed, discarding open ones.
    pub fn abandon(self) -> Vec<Track> {
        let before = self.tracks.len();
        let closed: Vec<Track> = self.tracks.into_iter().filter(|t| !t.is_open()).collect();
        debug!(
            "Discarding {} open track(s), keeping {} closed",
            before - closed.len(),
            closed.len()
        );
        closed
    }
}

#[cfg(test)]
mod matcher_test {
    use super::*;
    use crate::tracks::{
        tracks_test::{mover_store, night_tracklets, survey_store},
        TrackState,
    };

    #[test]
    fn test_mover_is_followed_across_nights() {
        let store = mover_store(&[0, 1, 2], &[], 0.0);
        let params = LinkingParams::default();
        let mut matcher = NightMatcher::new(&store, &params);

        let nights = store.nights();
        let reports: Vec<NightReport> = nights
            .iter()
            .map(|&n| {
                matcher
                    .process_night(n, night_tracklets(&store, n, &params))
                    .unwrap()
            })
            .collect();
        assert_eq!(reports[0].seeded, 1);
        assert_eq!(reports[1].extended, 1);
        assert_eq!(reports[2].extended, 1);

        let tracks = matcher.finish();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].tracklets().len(), 3);
        assert_eq!(tracks[0].state(), TrackState::Closed(ClosureReason::EndOfRun));
    }

    #[test]
    fn test_track_closes_after_missed_nights() {
        // Object A is seen on night 0 only; object B, 1° away, on nights 1 to 3.
        let store = survey_store(&[(60.0, &[0]), (61.0, &[1, 2, 3])]);
        let params = LinkingParams::builder().max_missed_nights(2).build().unwrap();
        let mut matcher = NightMatcher::new(&store, &params);
        let nights = store.nights();
        assert_eq!(nights.len(), 4);

        let seed_id = TrackId(0);
        for (k, &n) in nights.iter().enumerate() {
            let report = matcher
                .process_night(n, night_tracklets(&store, n, &params))
                .unwrap();
            let state = matcher.tracks()[0].state();
            match k {
                0 | 1 => assert_eq!(state, TrackState::Open),
                _ => assert_eq!(state, TrackState::Closed(ClosureReason::MissedNights)),
            }
            if k == 2 {
                assert_eq!(report.closed, 1);
            }
        }
        assert_eq!(matcher.tracks()[0].id(), seed_id);

        let tracks = matcher.abandon();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].id(), seed_id);
        assert_eq!(tracks[0].tracklets().len(), 1);
    }

    #[test]
    fn test_explicit_close_and_out_of_order_nights() {
        let store = mover_store(&[0, 1], &[], 0.0);
        let params = LinkingParams::default();
        let nights = store.nights();
        let mut matcher = NightMatcher::new(&store, &params);

        matcher
            .process_night(nights[1], night_tracklets(&store, nights[1], &params))
            .unwrap();
        assert!(matcher.process_night(nights[0], Vec::new()).is_err());

        matcher.close(TrackId(0)).unwrap();
        assert_eq!(matcher.close(TrackId(9)), Err(DaomopError::UnknownTrack(TrackId(9))));
        assert_eq!(matcher.open_count(), 0);

        let tracks = matcher.finish();
        assert_eq!(tracks[0].state(), TrackState::Closed(ClosureReason::Explicit));
    }
}

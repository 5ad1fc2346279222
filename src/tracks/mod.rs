//! # Multi-night tracks
//!
//! A [`Track`] is a chain of [`Tracklet`]s from successive nights (not necessarily
//! consecutive) that a single moving object could have produced. Its motion model is a
//! [`LinearMotion`] refitted over **all** its detections each time a tracklet is attached.
//!
//! ## Lifecycle
//!
//! ```text
//!           seed(tracklet)
//!                 │
//!                 ▼
//!   ┌──────────► Open ──── extend() finds a candidate ───┐
//!   │             │                                       │
//!   └─────────────┼───────────────────────────────────────┘
//!                 │ missed nights ≥ max, end of run, explicit close
//!                 ▼
//!        Closed(ClosureReason)
//! ```
//!
//! ## Extension rule
//!
//! For each candidate tracklet of a later night, the track's motion is extrapolated to the
//! candidate's **first detection** and compared with it in the track's tangent plane. The
//! candidate qualifies when
//!
//! 1. its first detection lies inside the [`UncertaintyEllipse`] grown for the elapsed time,
//! 2. its rate differs from the track rate by at most `max_rate_change`,
//! 3. the refit over the track and candidate detections succeeds with an RMS residual of at
//!    most `max_track_residual`.
//!
//! The smallest normalized ellipse distance wins; ties go to the lowest tracklet id.
//!
//! ## See also
//! ------------
//! * [`matcher::NightMatcher`] – processes whole nights with a global, deterministic assignment.
pub mod matcher;
pub mod uncertainty;

use std::fmt;

use log::debug;

use crate::{
    constants::{ArcSec, DetectionId, NightId, TrackId, TrackletId, MJD},
    daomop_errors::DaomopError,
    detections::{Detection, DetectionStore},
    linking::LinkingParams,
    tracklets::{
        motion_fit::{fit_linear_motion, LinearMotion},
        Tracklet,
    },
};
use uncertainty::UncertaintyEllipse;

/// Why a track stopped accepting tracklets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClosureReason {
    /// `max_missed_nights` consecutive nights without a qualifying candidate.
    MissedNights,
    /// The run processed its last night.
    EndOfRun,
    /// Closed on request.
    Explicit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TrackState {
    #[default]
    Open,
    Closed(ClosureReason),
}

/// A qualifying candidate found by [`Track::evaluate`].
#[derive(Debug, Clone, PartialEq)]
pub struct Extension {
    /// Position of the candidate in the evaluated slice.
    pub candidate: usize,
    pub tracklet: TrackletId,
    /// Ellipse distance of the candidate's first detection (≤ 1).
    pub normalized_residual: f64,
    /// Motion refitted over the track and the candidate.
    pub motion: LinearMotion,
}

/// Outcome of scoring a set of candidates against one track.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    /// Qualifying candidates, best first.
    pub extensions: Vec<Extension>,
    /// Candidates inside the ellipse whose refit failed or exceeded `max_track_residual`.
    pub fit_failures: usize,
}

impl Evaluation {
    pub fn best(&self) -> Option<&Extension> {
        self.extensions.first()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    id: TrackId,
    tracklets: Vec<Tracklet>,
    motion: LinearMotion,
    state: TrackState,
    missed_nights: u32,
}

impl Track {
    /// Open a new track from a single tracklet.
    pub fn seed(id: TrackId, tracklet: Tracklet) -> Self {
        Track {
            id,
            motion: tracklet.motion.clone(),
            tracklets: vec![tracklet],
            state: TrackState::Open,
            missed_nights: 0,
        }
    }

    pub fn id(&self) -> TrackId {
        self.id
    }

    pub fn state(&self) -> TrackState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == TrackState::Open
    }

    pub fn tracklets(&self) -> &[Tracklet] {
        &self.tracklets
    }

    pub fn motion(&self) -> &LinearMotion {
        &self.motion
    }

    pub fn missed_nights(&self) -> u32 {
        self.missed_nights
    }

    /// All detections, in time order.
    pub fn detections(&self) -> impl Iterator<Item = DetectionId> + '_ {
        self.tracklets.iter().flat_map(|t| t.detections.iter().copied())
    }

    pub fn detection_count(&self) -> usize {
        self.tracklets.iter().map(|t| t.len()).sum()
    }

    pub fn first_mjd(&self) -> MJD {
        self.tracklets.first().map_or(self.motion.epoch, |t| t.start_mjd)
    }

    pub fn last_mjd(&self) -> MJD {
        self.tracklets.last().map_or(self.motion.epoch, |t| t.end_mjd)
    }

    pub fn last_night(&self) -> Option<NightId> {
        self.tracklets.last().map(|t| t.night())
    }

    /// Observation span in days.
    pub fn span_days(&self) -> f64 {
        self.last_mjd() - self.first_mjd()
    }

    /// Mean RMS residual of the constituent tracklets (arcsec).
    pub fn mean_tracklet_residual(&self) -> ArcSec {
        if self.tracklets.is_empty() {
            return 0.0;
        }
        self.tracklets.iter().map(|t| t.residual()).sum::<f64>() / self.tracklets.len() as f64
    }

    /// Prediction ellipse `dt` days after the last detection.
    pub fn ellipse(&self, dt: f64, params: &LinkingParams) -> UncertaintyEllipse {
        UncertaintyEllipse::at(dt, self.motion.rms, &self.motion.rate, params)
    }

    /// Score `candidates` against this track without modifying it.
    ///
    /// Arguments
    /// -----------------
    /// * `candidates`: tracklets of one later night.
    /// * `store`: the detection store the tracklets refer to.
    /// * `params`: ellipse growth, rate and residual tolerances.
    ///
    /// Return
    /// ----------
    /// * Every qualifying candidate sorted by `(normalized residual, tracklet id)`, plus the
    ///   number of refit failures. Closed tracks qualify nothing.
    pub fn evaluate(
        &self,
        candidates: &[Tracklet],
        store: &DetectionStore,
        params: &LinkingParams,
    ) -> Evaluation {
        let mut evaluation = Evaluation::default();
        if !self.is_open() {
            return evaluation;
        }

        for (index, candidate) in candidates.iter().enumerate() {
            let Some(normalized) = self.ellipse_distance(candidate, store, params) else {
                continue;
            };
            if normalized > 1.0 {
                continue;
            }
            if (candidate.motion.rate - self.motion.rate).norm() > params.max_rate_change {
                continue;
            }

            match self.refit_with(candidate, store) {
                Ok(motion) if motion.rms <= params.max_track_residual => {
                    evaluation.extensions.push(Extension {
                        candidate: index,
                        tracklet: candidate.id,
                        normalized_residual: normalized,
                        motion,
                    });
                }
                Ok(motion) => {
                    debug!(
                        "{}: {} rejected, track rms {:.3}\" > {:.3}\"",
                        self.id, candidate.id, motion.rms, params.max_track_residual
                    );
                    evaluation.fit_failures += 1;
                }
                Err(err) => {
                    debug!("{}: {} rejected: {err}", self.id, candidate.id);
                    evaluation.fit_failures += 1;
                }
            }
        }

        evaluation.extensions.sort_by(|a, b| {
            a.normalized_residual
                .total_cmp(&b.normalized_residual)
                .then(a.tracklet.cmp(&b.tracklet))
        });
        evaluation
    }

    /// Normalized ellipse distance of a candidate's first detection, `None` when the candidate
    /// is not from a later night or cannot be placed on the track's tangent plane.
    fn ellipse_distance(
        &self,
        candidate: &Tracklet,
        store: &DetectionStore,
        params: &LinkingParams,
    ) -> Option<f64> {
        if self.last_night().is_some_and(|night| candidate.night() <= night) {
            return None;
        }
        let first = store.get(candidate.first_detection()?)?;
        let observed = self.motion.to_plane(first.ra, first.dec)?;
        let offset = observed - self.motion.predict_plane(first.mjd);
        let dt = first.mjd - self.last_mjd();
        Some(self.ellipse(dt, params).normalized_distance(&offset))
    }

    fn refit_with(
        &self,
        candidate: &Tracklet,
        store: &DetectionStore,
    ) -> Result<LinearMotion, DaomopError> {
        let detections = self
            .detections()
            .chain(candidate.detections.iter().copied())
            .map(|id| store.get(id).ok_or(DaomopError::UnknownDetection(id)))
            .collect::<Result<Vec<&Detection>, _>>()?;
        fit_linear_motion(&detections)
    }

    /// Attach a tracklet with its refitted motion; resets the missed-night counter.
    pub fn attach(&mut self, tracklet: Tracklet, motion: LinearMotion) {
        self.tracklets.push(tracklet);
        self.motion = motion;
        self.missed_nights = 0;
    }

    /// Record a night without extension.
    ///
    /// Return
    /// ----------
    /// * `true` if the track closed with [`ClosureReason::MissedNights`].
    pub fn miss(&mut self, params: &LinkingParams) -> bool {
        if !self.is_open() {
            return false;
        }
        self.missed_nights += 1;
        if self.missed_nights >= params.max_missed_nights {
            self.close(ClosureReason::MissedNights);
            return true;
        }
        false
    }

    /// Close the track; a closed track keeps its first closure reason.
    pub fn close(&mut self, reason: ClosureReason) {
        if self.is_open() {
            self.state = TrackState::Closed(reason);
        }
    }

    /// Evaluate the candidates of the next available night and attach the best one.
    ///
    /// Return
    /// ----------
    /// * The id of the attached tracklet, or `None` (a missed night is then counted, which may
    ///   close the track).
    pub fn extend(
        &mut self,
        candidates: &[Tracklet],
        store: &DetectionStore,
        params: &LinkingParams,
    ) -> Option<TrackletId> {
        if !self.is_open() {
            return None;
        }
        let best = self.evaluate(candidates, store, params).extensions.into_iter().next();
        match best {
            Some(extension) => {
                self.attach(candidates[extension.candidate].clone(), extension.motion);
                Some(extension.tracklet)
            }
            None => {
                self.miss(params);
                None
            }
        }
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            TrackState::Open => "open".to_string(),
            TrackState::Closed(reason) => format!("closed ({reason:?})"),
        };
        if f.alternate() {
            writeln!(f, "Track {} [{state}]", self.id)?;
            writeln!(
                f,
                "  span = {:.3} d, detections = {}, rate = ({:.3}, {:.3}) \"/h, rms = {:.3}\"",
                self.span_days(),
                self.detection_count(),
                self.motion.rate.x,
                self.motion.rate.y,
                self.motion.rms
            )?;
            for tracklet in &self.tracklets {
                writeln!(f, "  {tracklet}")?;
            }
            Ok(())
        } else {
            write!(
                f,
                "{}({} tracklet(s), {} detection(s), {state})",
                self.id,
                self.tracklets.len(),
                self.detection_count()
            )
        }
    }
}

#[cfg(test)]
pub(crate) mod tracks_test {
    use super::*;
    use crate::{
        constants::ARCSEC_PER_DEG,
        detections::{ExposureCatalog, RawDetection, StoreParams},
        linking::pairwise::link_night,
        tracklets,
    };

    /// Three exposures per night, one hour apart, of objects moving at 3"/h east and 1"/h north.
    /// Each object is given by its starting RA and the nights it is observed on.
    pub(crate) fn survey_store(objects: &[(f64, &[i64])]) -> DetectionStore {
        survey_store_with_decoy(objects, &[], 0.0)
    }

    /// One mover observed on `nights`, plus a second object offset by `decoy` arcsec (in RA and
    /// Dec) on `decoy_nights`.
    pub(crate) fn mover_store(nights: &[i64], decoy_nights: &[i64], decoy: f64) -> DetectionStore {
        survey_store_with_decoy(&[(60.0, nights)], decoy_nights, decoy)
    }

    fn survey_store_with_decoy(
        objects: &[(f64, &[i64])],
        decoy_nights: &[i64],
        decoy: f64,
    ) -> DetectionStore {
        let rate = (3.0, 1.0);
        let mut all_nights: Vec<i64> = objects
            .iter()
            .flat_map(|(_, nights)| nights.iter().copied())
            .collect();
        all_nights.sort();
        all_nights.dedup();

        let position = |ra0: f64, hours: f64, shift: f64| RawDetection {
            ra: ra0 + (rate.0 * hours + shift) / ARCSEC_PER_DEG,
            dec: 5.0 + (rate.1 * hours + shift) / ARCSEC_PER_DEG,
            mjd: 57000.35 + hours / 24.0,
            mag: 21.0,
            sigma: 0.1,
        };

        let mut catalogs = Vec::new();
        for night in all_nights {
            for k in 0..3 {
                let hours = night as f64 * 24.0 + k as f64;
                let mut dets = Vec::new();
                for (ra0, nights) in objects {
                    if nights.contains(&night) {
                        dets.push(position(*ra0, hours, 0.0));
                        if decoy_nights.contains(&night) {
                            dets.push(position(*ra0, hours, decoy));
                        }
                    }
                }
                catalogs.push(ExposureCatalog::new(format!("n{night}e{k}"), dets));
            }
        }
        DetectionStore::from_catalogs(catalogs, StoreParams::default()).unwrap()
    }

    pub(crate) fn night_tracklets(
        store: &DetectionStore,
        night: NightId,
        params: &LinkingParams,
    ) -> Vec<Tracklet> {
        let links = link_night(store, night, params);
        tracklets::build(night, &links, store, params).tracklets
    }

    #[test]
    fn test_extend_with_the_same_object() {
        let store = mover_store(&[0, 1], &[], 0.0);
        let params = LinkingParams::default();
        let nights = store.nights();

        let first = night_tracklets(&store, nights[0], &params);
        let second = night_tracklets(&store, nights[1], &params);
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);

        let mut track = Track::seed(TrackId(0), first[0].clone());
        assert_eq!(track.extend(&second, &store, &params), Some(second[0].id));
        assert_eq!(track.tracklets().len(), 2);
        assert_eq!(track.detection_count(), 6);
        assert!(track.is_open());
        assert!(track.motion().rms < 0.05);
        assert!((track.span_days() - (1.0 + 2.0 / 24.0)).abs() < 1e-9);
    }

    #[test]
    fn test_candidate_outside_ellipse_is_rejected() {
        // Decoy 600" away on the second night, moving at the same rate.
        let store = mover_store(&[0, 1], &[1], 600.0);
        let params = LinkingParams::default();
        let nights = store.nights();
        let first = night_tracklets(&store, nights[0], &params);
        let second = night_tracklets(&store, nights[1], &params);
        assert_eq!(second.len(), 2);

        let track = Track::seed(TrackId(0), first[0].clone());
        let evaluation = track.evaluate(&second, &store, &params);
        assert_eq!(evaluation.extensions.len(), 1);
        let best = &evaluation.extensions[0];
        assert!(best.normalized_residual < 0.1);

        let decoy = second.iter().find(|t| t.id != best.tracklet).unwrap();
        let first_det = store.detection(decoy.detections[0]);
        let offset = track.motion().to_plane(first_det.ra, first_det.dec).unwrap()
            - track.motion().predict_plane(first_det.mjd);
        assert!(!track
            .ellipse(first_det.mjd - track.last_mjd(), &params)
            .contains(&offset));
    }

    #[test]
    fn test_closest_candidate_wins() {
        let store = mover_store(&[0, 1], &[1], 5.0);
        let params = LinkingParams::default();
        let nights = store.nights();
        let first = night_tracklets(&store, nights[0], &params);
        let second = night_tracklets(&store, nights[1], &params);
        assert_eq!(second.len(), 2);

        let mut track = Track::seed(TrackId(0), first[0].clone());
        let evaluation = track.evaluate(&second, &store, &params);
        assert_eq!(evaluation.extensions.len(), 2);
        assert!(
            evaluation.extensions[0].normalized_residual
                <= evaluation.extensions[1].normalized_residual
        );

        let expected = evaluation.extensions[0].tracklet;
        assert_eq!(track.extend(&second, &store, &params), Some(expected));
        assert!(track.motion().rms < 0.05);
    }

    #[test]
    fn test_missed_nights_close_the_track() {
        let store = mover_store(&[0], &[], 0.0);
        let params = LinkingParams::builder().max_missed_nights(2).build().unwrap();
        let tracklet = night_tracklets(&store, store.nights()[0], &params).remove(0);

        let mut track = Track::seed(TrackId(7), tracklet);
        assert_eq!(track.extend(&[], &store, &params), None);
        assert!(track.is_open());
        assert_eq!(track.extend(&[], &store, &params), None);
        assert_eq!(track.state(), TrackState::Closed(ClosureReason::MissedNights));

        track.close(ClosureReason::Explicit);
        assert_eq!(track.state(), TrackState::Closed(ClosureReason::MissedNights));
        assert_eq!(track.extend(&[], &store, &params), None);
        assert_eq!(track.missed_nights(), 2);
    }
}

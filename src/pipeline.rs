//! # Linkage pipeline
//!
//! End-to-end run over a list of exposures:
//!
//! 1. **Load** – exposures are fetched concurrently from an [`Archive`] by a bounded pool of
//!    tokio tasks (`fetch_workers` permits), decoded and validated. Retries and caching belong
//!    to the archive (see [`CachedArchive`](crate::archive::CachedArchive)). A failing exposure is
//!    skipped with a warning and recorded in the [`RunSummary`]; only a run with no detection
//!    at all fails ([`DaomopError::NoDetections`]).
//! 2. **Flag** – stationary sources are flagged ([`flag_stationary`]).
//! 3. **Link** – pairwise links and tracklets are built for every night in parallel (rayon,
//!    on the blocking pool).
//! 4. **Match** – nights are fed in order to a [`NightMatcher`].
//! 5. **Rank** – closed tracks are scored and deduplicated ([`rank`]).
//!
//! ## Cancellation
//!
//! The caller passes a [`CancellationToken`]. The run uses a child of it, cancelled as well
//! when the optional `run_timeout` elapses. Cancellation drops the in-flight fetches, skips
//! the nights not yet matched and keeps only the tracks already closed; the summary records
//! `cancelled = true`.
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use ahash::RandomState;
use log::{debug, info, warn};
use rayon::prelude::*;
use tokio::{
    sync::Semaphore,
    task::{self, JoinSet},
};
use tokio_util::sync::CancellationToken;

use crate::{
    archive::{validate_exposure_id, Archive},
    constants::{ExposureId, NightId},
    daomop_errors::{DaomopError, ErrorClass},
    detections::{
        catalog::decode_catalog,
        stationary::{flag_stationary, StationaryParams},
        DetectionStore, DetectionStoreBuilder, StoreParams,
    },
    linking::{pairwise::link_night, LinkingParams},
    ranking::{rank, RankedTrack, RankingWeights},
    tracklets::{self, TrackletBuild},
    tracks::{matcher::NightMatcher, Track},
};

/// Every setting of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub linking: LinkingParams,
    pub stationary: StationaryParams,
    pub store: StoreParams,
    pub ranking: RankingWeights,
    /// Concurrent archive requests.
    pub fetch_workers: usize,
    /// Wall-clock limit of the whole run; `None` means no limit.
    pub run_timeout: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            linking: LinkingParams::default(),
            stationary: StationaryParams::default(),
            store: StoreParams::default(),
            ranking: RankingWeights::default(),
            fetch_workers: 8,
            run_timeout: None,
        }
    }
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }
}

/// Builder for [`PipelineConfig`], with validation.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn linking(mut self, v: LinkingParams) -> Self {
        self.config.linking = v;
        self
    }
    pub fn stationary(mut self, v: StationaryParams) -> Self {
        self.config.stationary = v;
        self
    }
    pub fn store(mut self, v: StoreParams) -> Self {
        self.config.store = v;
        self
    }
    pub fn ranking(mut self, v: RankingWeights) -> Self {
        self.config.ranking = v;
        self
    }
    pub fn fetch_workers(mut self, v: usize) -> Self {
        self.config.fetch_workers = v;
        self
    }
    pub fn run_timeout(mut self, v: Option<Duration>) -> Self {
        self.config.run_timeout = v;
        self
    }

    /// Finalize the builder.
    ///
    /// Returns
    /// -----------------
    /// * `Err(DaomopError::InvalidParameter)` if `fetch_workers` is zero, a store or stationary
    ///   setting is out of range, or a ranking weight is not finite.
    pub fn build(self) -> Result<PipelineConfig, DaomopError> {
        let c = &self.config;
        let invalid = |msg: &str| Err(DaomopError::InvalidParameter(msg.into()));

        if c.fetch_workers == 0 {
            return invalid("fetch_workers must be >= 1");
        }
        if !(c.store.max_exposure_duration > 0.0) || !c.store.observatory_longitude.is_finite() {
            return invalid("max_exposure_duration must be > 0 and the longitude finite");
        }
        if !(c.stationary.tolerance > 0.0) || !(c.stationary.min_time_separation >= 0.0) {
            return invalid("stationary tolerance must be > 0 and min_time_separation >= 0");
        }
        let w = &c.ranking;
        if ![w.span, w.tracklets, w.residual].iter().all(|x| x.is_finite()) {
            return invalid("ranking weights must be finite");
        }

        Ok(self.config)
    }
}

impl fmt::Display for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            writeln!(f, "Pipeline Configuration")?;
            writeln!(f, "----------------------")?;
            writeln!(f, "  fetch_workers            = {}", self.fetch_workers)?;
            match self.run_timeout {
                Some(t) => writeln!(f, "  run_timeout              = {t:?}")?,
                None => writeln!(f, "  run_timeout              = none")?,
            }
            writeln!(
                f,
                "  store                    = longitude {:.4}°, max duration {:.4} d",
                self.store.observatory_longitude, self.store.max_exposure_duration
            )?;
            writeln!(
                f,
                "  stationary               = {:.2}\", ≥ {:.3} d apart, {} match(es)",
                self.stationary.tolerance,
                self.stationary.min_time_separation,
                self.stationary.min_matches
            )?;
            writeln!(
                f,
                "  ranking weights          = span {} / tracklets {} / residual {}",
                self.ranking.span, self.ranking.tracklets, self.ranking.residual
            )?;
            writeln!(f)?;
            write!(f, "{:#}", self.linking)
        } else {
            write!(
                f,
                "PipelineConfig(workers={}, timeout={:?}, {})",
                self.fetch_workers, self.run_timeout, self.linking
            )
        }
    }
}

/// An exposure left out of the run.
#[derive(Debug, PartialEq)]
pub struct SkippedExposure {
    pub exposure: ExposureId,
    pub error: DaomopError,
}

impl SkippedExposure {
    pub fn class(&self) -> ErrorClass {
        self.error.class()
    }
}

/// Counters of a run.
#[derive(Debug, Default, PartialEq)]
pub struct RunSummary {
    pub requested: usize,
    pub loaded: usize,
    pub skipped: Vec<SkippedExposure>,
    pub detections: usize,
    pub stationary: usize,
    pub nights: usize,
    pub nights_matched: usize,
    pub links: usize,
    pub tracklets: usize,
    /// Chains rejected by the tracklet fit.
    pub tracklet_fit_failures: usize,
    /// Extensions rejected by the multi-night fit.
    pub track_fit_failures: usize,
    /// Tracks emitted by the matcher, before deduplication.
    pub closed_tracks: usize,
    /// Tracks left after ranking.
    pub candidates: usize,
    pub cancelled: bool,
    pub timed_out: bool,
}

impl RunSummary {
    /// Skipped exposures per error class.
    pub fn skipped_by_class(&self) -> BTreeMap<ErrorClass, usize> {
        let mut counts = BTreeMap::new();
        for skipped in &self.skipped {
            *counts.entry(skipped.class()).or_default() += 1;
        }
        counts
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match (self.cancelled, self.timed_out) {
            (_, true) => "timed out",
            (true, false) => "cancelled",
            _ => "complete",
        };
        if !f.alternate() {
            return write!(
                f,
                "Run {status}: {}/{} exposure(s), {} detection(s), {} tracklet(s), {} candidate(s)",
                self.loaded, self.requested, self.detections, self.tracklets, self.candidates
            );
        }

        writeln!(f, "Run Summary ({status})")?;
        writeln!(f, "-----------")?;
        writeln!(f, "  exposures      : {} loaded / {} requested", self.loaded, self.requested)?;
        for (class, n) in self.skipped_by_class() {
            writeln!(f, "    skipped ({class}) : {n}")?;
        }
        writeln!(
            f,
            "  detections     : {} ({} stationary)",
            self.detections, self.stationary
        )?;
        writeln!(f, "  nights         : {} matched / {}", self.nights_matched, self.nights)?;
        writeln!(f, "  links          : {}", self.links)?;
        writeln!(
            f,
            "  tracklets      : {} ({} fit failure(s))",
            self.tracklets, self.tracklet_fit_failures
        )?;
        writeln!(
            f,
            "  tracks         : {} closed, {} fit failure(s)",
            self.closed_tracks, self.track_fit_failures
        )?;
        write!(f, "  candidates     : {}", self.candidates)
    }
}

/// Result of a run.
#[derive(Debug)]
pub struct RunOutput {
    /// Ranked candidate tracks.
    pub tracks: Vec<RankedTrack>,
    pub summary: RunSummary,
    /// The detections the tracks refer to.
    pub store: Arc<DetectionStore>,
}

/// Outcome of linking and matching an already loaded store.
#[derive(Debug, Default, PartialEq)]
pub struct Linkage {
    pub tracks: Vec<RankedTrack>,
    pub nights: usize,
    pub nights_matched: usize,
    pub links: usize,
    pub tracklets: usize,
    pub tracklet_fit_failures: usize,
    pub track_fit_failures: usize,
    pub closed_tracks: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Pipeline { config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run the full pipeline.
    ///
    /// Arguments
    /// -----------------
    /// * `archive`: where exposure catalogs are fetched from.
    /// * `exposure_ids`: the exposures of the run, in any order.
    /// * `cancel`: cancels the run from outside.
    ///
    /// Return
    /// ----------
    /// * The ranked tracks, the run summary and the detection store.
    /// * `Err(DaomopError::NoDetections)` if no exposure could be loaded and the run was not
    ///   cancelled.
    pub async fn run<A>(
        &self,
        archive: Arc<A>,
        exposure_ids: &[ExposureId],
        cancel: CancellationToken,
    ) -> Result<RunOutput, DaomopError>
    where
        A: Archive + 'static,
    {
        info!("Starting run over {} exposure(s)", exposure_ids.len());
        debug!("{:#}", self.config);

        let token = cancel.child_token();
        let _guard = token.clone().drop_guard();
        if let Some(timeout) = self.config.run_timeout {
            let timer = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = timer.cancelled() => {}
                    _ = tokio::time::sleep(timeout) => {
                        warn!("Run timeout of {timeout:?} reached, cancelling");
                        timer.cancel();
                    }
                }
            });
        }

        let mut summary = RunSummary {
            requested: exposure_ids.len(),
            ..RunSummary::default()
        };

        let fetched = fetch_all(archive, exposure_ids, self.config.fetch_workers, &token).await;
        let mut builder = DetectionStoreBuilder::new(self.config.store.clone());
        for (exposure, result) in fetched {
            let loaded = result
                .and_then(|bytes| decode_catalog(&exposure, &bytes))
                .and_then(|catalog| builder.add_exposure(catalog));
            if let Err(error) = loaded {
                if error == DaomopError::Cancelled {
                    debug!("Exposure {exposure} not loaded: run cancelled");
                } else {
                    warn!("Skipping exposure {exposure}: {error}");
                }
                summary.skipped.push(SkippedExposure { exposure, error });
            }
        }
        summary.loaded = builder.len();

        if builder.is_empty() && !token.is_cancelled() {
            return Err(DaomopError::NoDetections(exposure_ids.len()));
        }

        let mut store = builder.finish();
        summary.detections = store.len();
        summary.stationary = flag_stationary(&mut store, &self.config.stationary);
        let store = Arc::new(store);

        let linkage = if token.is_cancelled() {
            Linkage {
                nights: store.nights().len(),
                cancelled: true,
                ..Linkage::default()
            }
        } else {
            let (pipeline, shared, run_token) = (self.clone(), Arc::clone(&store), token.clone());
            tokio::task::spawn_blocking(move || pipeline.link(&shared, &run_token))
                .await
                .map_err(|err| DaomopError::IoError(io::Error::other(err)))??
        };

        summary.nights = linkage.nights;
        summary.nights_matched = linkage.nights_matched;
        summary.links = linkage.links;
        summary.tracklets = linkage.tracklets;
        summary.tracklet_fit_failures = linkage.tracklet_fit_failures;
        summary.track_fit_failures = linkage.track_fit_failures;
        summary.closed_tracks = linkage.closed_tracks;
        summary.candidates = linkage.tracks.len();
        summary.cancelled = linkage.cancelled || token.is_cancelled();
        summary.timed_out = summary.cancelled && !cancel.is_cancelled();

        info!("{summary:#}");
        Ok(RunOutput {
            tracks: linkage.tracks,
            summary,
            store,
        })
    }

    /// Link, match and rank an already loaded store (CPU-bound, blocking).
    ///
    /// Arguments
    /// -----------------
    /// * `store`: the detections, stationary sources already flagged.
    /// * `cancel`: checked before each night is matched.
    ///
    /// Return
    /// ----------
    /// * The ranked tracks with the per-stage counters. When cancelled, only the tracks closed
    ///   so far are ranked.
    pub fn link(
        &self,
        store: &DetectionStore,
        cancel: &CancellationToken,
    ) -> Result<Linkage, DaomopError> {
        let params = &self.config.linking;
        let nights = store.nights();

        let built: Vec<Option<(NightId, usize, TrackletBuild)>> = nights
            .par_iter()
            .map(|&night| {
                if cancel.is_cancelled() {
                    return None;
                }
                let links = link_night(store, night, params);
                let build = tracklets::build(night, &links, store, params);
                Some((night, links.len(), build))
            })
            .collect();

        let mut linkage = Linkage {
            nights: nights.len(),
            ..Linkage::default()
        };
        let mut matcher = NightMatcher::new(store, params);
        for entry in built {
            let Some((night, links, build)) = entry.filter(|_| !cancel.is_cancelled()) else {
                linkage.cancelled = true;
                break;
            };
            linkage.links += links;
            linkage.tracklets += build.tracklets.len();
            linkage.tracklet_fit_failures += build.fit_failures;

            let report = matcher.process_night(night, build.tracklets)?;
            linkage.track_fit_failures += report.fit_failures;
            linkage.nights_matched += 1;
        }

        let tracks: Vec<Track> = if linkage.cancelled {
            info!("Run cancelled after {} night(s)", linkage.nights_matched);
            matcher.abandon()
        } else {
            matcher.finish()
        };
        linkage.closed_tracks = tracks.len();
        linkage.tracks = rank(tracks, &self.config.ranking);
        Ok(linkage)
    }
}

/// Fetch every exposure with at most `workers` requests in flight.
///
/// The results come back in the order of `exposure_ids`, whatever the completion order.
async fn fetch_all<A>(
    archive: Arc<A>,
    exposure_ids: &[ExposureId],
    workers: usize,
    cancel: &CancellationToken,
) -> Vec<(ExposureId, Result<Vec<u8>, DaomopError>)>
where
    A: Archive + 'static,
{
    let permits = Arc::new(Semaphore::new(workers.max(1)));
    let mut tasks = JoinSet::new();
    let mut spawned: HashMap<task::Id, usize, RandomState> =
        HashMap::with_capacity_and_hasher(exposure_ids.len(), RandomState::new());

    for (k, exposure) in exposure_ids.iter().enumerate() {
        let (archive, permits, token) = (Arc::clone(&archive), Arc::clone(&permits), cancel.clone());
        let exposure = exposure.clone();
        let handle = tasks.spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(DaomopError::Cancelled),
                fetched = fetch_one(&*archive, &permits, &exposure) => fetched,
            }
        });
        spawned.insert(handle.id(), k);
    }

    let mut results: Vec<Option<Result<Vec<u8>, DaomopError>>> =
        (0..exposure_ids.len()).map(|_| None).collect();
    while let Some(joined) = tasks.join_next_with_id().await {
        let (id, result) = match joined {
            Ok((id, result)) => (id, result),
            Err(err) => {
                let id = err.id();
                let result = if err.is_cancelled() {
                    Err(DaomopError::Cancelled)
                } else {
                    Err(DaomopError::FetchError {
                        exposure: spawned
                            .get(&id)
                            .map(|&k| exposure_ids[k].clone())
                            .unwrap_or_default(),
                        attempts: 0,
                        reason: format!("fetch task failed: {err}"),
                    })
                };
                (id, result)
            }
        };
        match spawned.get(&id) {
            Some(&k) => results[k] = Some(result),
            None => warn!("Fetch task {id} does not belong to this run"),
        }
    }

    exposure_ids
        .iter()
        .cloned()
        .zip(results)
        .map(|(exposure, result)| (exposure, result.unwrap_or(Err(DaomopError::Cancelled))))
        .collect()
}

async fn fetch_one<A: Archive>(
    archive: &A,
    permits: &Semaphore,
    exposure: &str,
) -> Result<Vec<u8>, DaomopError> {
    validate_exposure_id(exposure)?;
    let _permit = permits
        .acquire()
        .await
        .map_err(|_| DaomopError::Cancelled)?;
    archive.fetch_exposure(exposure).await
}

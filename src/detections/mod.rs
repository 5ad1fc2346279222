//! # Detection store
//!
//! In-memory, read-only collection of the point-source detections of one pipeline run.
//!
//! Detections reach the store as per-exposure [`ExposureCatalog`]s (usually decoded from
//! archive bytes by [`catalog::decode_catalog`]). Each exposure is validated independently by
//! [`DetectionStoreBuilder::add_exposure`]; a malformed exposure is rejected with a
//! data-class [`DaomopError`] and the builder stays usable for the remaining ones.
//!
//! Once [`DetectionStoreBuilder::finish`] is called:
//!
//! - exposures are ordered by `(mid-exposure time, exposure id)`,
//! - detections receive dense [`DetectionId`]s in that order (catalog order inside an exposure),
//! - exposures are grouped into observing nights (see [`crate::time::night_of`]).
//!
//! The ordering does not depend on the order in which exposures were added, so concurrent
//! loading still yields reproducible identifiers.
//!
//! ## Queries
//!
//! * [`DetectionStore::load`] – detections of one exposure,
//! * [`DetectionStore::by_night`] – exposure ids of one night in time order,
//! * [`DetectionStore::nights`] – all nights, ascending,
//! * [`DetectionStore::detection`] – random access by id.
//!
//! ## See also
//! ------------
//! * [`stationary::flag_stationary`] – marks sources that do not move between exposures.
pub mod catalog;
pub mod stationary;

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use ahash::RandomState;

use crate::{
    constants::{
        ArcSec, Degree, DetectionId, ExposureId, NightId, CFHT_LONGITUDE, HOURS_PER_DAY, MJD,
        MJD_MAX, MJD_MIN,
    },
    daomop_errors::DaomopError,
    sky::normalize_ra,
    time::night_of,
};

/// A point-source measurement within one exposure.
///
/// # Fields
///
/// * `id` - Dense identifier assigned by the store
/// * `exposure_id` - Archive identifier of the exposure the source was measured on
/// * `ra` - Right ascension in degrees, `[0, 360)`
/// * `dec` - Declination in degrees
/// * `mjd` - Observation time (MJD, UTC)
/// * `mag` - Instrumental or calibrated magnitude
/// * `sigma` - One-sigma positional uncertainty in arcseconds
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub id: DetectionId,
    pub exposure_id: ExposureId,
    pub ra: Degree,
    pub dec: Degree,
    pub mjd: MJD,
    pub mag: f64,
    pub sigma: ArcSec,
}

/// One catalog row before the store assigns identifiers.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub ra: Degree,
    pub dec: Degree,
    pub mjd: MJD,
    pub mag: f64,
    pub sigma: ArcSec,
}

/// All the detections extracted from one exposure.
#[derive(Debug, Clone, PartialEq)]
pub struct ExposureCatalog {
    pub exposure_id: ExposureId,
    pub detections: Vec<RawDetection>,
}

impl ExposureCatalog {
    pub fn new(exposure_id: impl Into<ExposureId>, detections: Vec<RawDetection>) -> Self {
        ExposureCatalog {
            exposure_id: exposure_id.into(),
            detections,
        }
    }
}

/// Per-exposure metadata kept by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct ExposureInfo {
    pub id: ExposureId,
    /// Median detection time, used as the exposure mid-time.
    pub mid_mjd: MJD,
    pub night: NightId,
    first: u32,
    count: u32,
}

impl ExposureInfo {
    /// Number of detections of this exposure.
    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Settings used while validating and grouping exposures.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreParams {
    /// Observatory longitude (degrees, east-positive) defining the local-noon night boundary.
    pub observatory_longitude: Degree,
    /// Largest accepted distance (days) between a detection time and its exposure mid-time.
    pub max_exposure_duration: f64,
}

impl Default for StoreParams {
    fn default() -> Self {
        StoreParams {
            observatory_longitude: CFHT_LONGITUDE,
            max_exposure_duration: 1.0 / HOURS_PER_DAY,
        }
    }
}

/// Validating builder for [`DetectionStore`].
#[derive(Debug, Clone)]
pub struct DetectionStoreBuilder {
    params: StoreParams,
    pending: Vec<(ExposureId, MJD, Vec<RawDetection>)>,
}

impl DetectionStoreBuilder {
    pub fn new(params: StoreParams) -> Self {
        DetectionStoreBuilder {
            params,
            pending: Vec::new(),
        }
    }

    /// Number of exposures accepted so far.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Validate one exposure and queue it for the store.
    ///
    /// Arguments
    /// -----------------
    /// * `catalog`: the detections of one exposure.
    ///
    /// Return
    /// ----------
    /// * `Ok(())` when the exposure is accepted.
    /// * `Err(DaomopError::EmptyExposure)` when the catalog has no detection.
    /// * `Err(DaomopError::MalformedTimestamp)` for non-finite or out-of-range times, or a
    ///   detection time too far from the exposure mid-time.
    /// * `Err(DaomopError::MalformedDetection)` for invalid positions, magnitudes or uncertainties.
    /// * `Err(DaomopError::DuplicateExposure)` if the exposure id was already accepted.
    ///
    /// A rejected exposure leaves the builder untouched.
    pub fn add_exposure(&mut self, catalog: ExposureCatalog) -> Result<(), DaomopError> {
        let ExposureCatalog {
            exposure_id,
            mut detections,
        } = catalog;

        if self.pending.iter().any(|(id, _, _)| *id == exposure_id) {
            return Err(DaomopError::DuplicateExposure(exposure_id));
        }
        if detections.is_empty() {
            return Err(DaomopError::EmptyExposure(exposure_id));
        }

        for (row, det) in detections.iter_mut().enumerate() {
            if !det.mjd.is_finite() || !(MJD_MIN..=MJD_MAX).contains(&det.mjd) {
                return Err(DaomopError::MalformedTimestamp {
                    exposure: exposure_id,
                    reason: format!("row {row}: MJD {} outside [{MJD_MIN}, {MJD_MAX}]", det.mjd),
                });
            }
            let reason = if !det.ra.is_finite() {
                Some(format!("non-finite RA {}", det.ra))
            } else if !det.dec.is_finite() || det.dec.abs() > 90.0 {
                Some(format!("declination {} outside [-90, 90]", det.dec))
            } else if !det.mag.is_finite() {
                Some(format!("non-finite magnitude {}", det.mag))
            } else if !det.sigma.is_finite() || det.sigma <= 0.0 {
                Some(format!("positional uncertainty {} must be > 0", det.sigma))
            } else {
                None
            };
            if let Some(reason) = reason {
                return Err(DaomopError::MalformedDetection {
                    exposure: exposure_id,
                    row,
                    reason,
                });
            }
            det.ra = normalize_ra(det.ra);
        }

        let mid_mjd = median_time(&detections);
        if let Some((row, det)) = detections
            .iter()
            .enumerate()
            .find(|(_, d)| (d.mjd - mid_mjd).abs() > self.params.max_exposure_duration)
        {
            return Err(DaomopError::MalformedTimestamp {
                exposure: exposure_id,
                reason: format!(
                    "row {row}: MJD {} is {:.3} h away from the exposure mid-time {mid_mjd}",
                    det.mjd,
                    (det.mjd - mid_mjd).abs() * HOURS_PER_DAY
                ),
            });
        }

        self.pending.push((exposure_id, mid_mjd, detections));
        Ok(())
    }

    /// Freeze the accepted exposures into a [`DetectionStore`].
    pub fn finish(mut self) -> DetectionStore {
        self.pending
            .sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        let total: usize = self.pending.iter().map(|(_, _, d)| d.len()).sum();
        let mut detections = Vec::with_capacity(total);
        let mut exposures = Vec::with_capacity(self.pending.len());
        let mut exposure_index = HashMap::with_hasher(RandomState::new());
        let mut nights: BTreeMap<NightId, Vec<usize>> = BTreeMap::new();

        for (exposure_id, mid_mjd, raw) in self.pending {
            let first = detections.len() as u32;
            let count = raw.len() as u32;
            for (offset, r) in raw.into_iter().enumerate() {
                detections.push(Detection {
                    id: DetectionId(first + offset as u32),
                    exposure_id: exposure_id.clone(),
                    ra: r.ra,
                    dec: r.dec,
                    mjd: r.mjd,
                    mag: r.mag,
                    sigma: r.sigma,
                });
            }

            let night = night_of(mid_mjd, self.params.observatory_longitude);
            let idx = exposures.len();
            nights.entry(night).or_default().push(idx);
            exposure_index.insert(exposure_id.clone(), idx);
            exposures.push(ExposureInfo {
                id: exposure_id,
                mid_mjd,
                night,
                first,
                count,
            });
        }

        let stationary = vec![false; detections.len()];
        DetectionStore {
            detections,
            exposures,
            exposure_index,
            nights,
            stationary,
        }
    }
}

fn median_time(detections: &[RawDetection]) -> MJD {
    let mut times: Vec<MJD> = detections.iter().map(|d| d.mjd).collect();
    times.sort_by(|a, b| a.total_cmp(b));
    let n = times.len();
    if n % 2 == 1 {
        times[n / 2]
    } else {
        0.5 * (times[n / 2 - 1] + times[n / 2])
    }
}

/// Read-only detection collection shared by every downstream stage.
#[derive(Debug, Clone)]
pub struct DetectionStore {
    detections: Vec<Detection>,
    exposures: Vec<ExposureInfo>,
    exposure_index: HashMap<ExposureId, usize, RandomState>,
    nights: BTreeMap<NightId, Vec<usize>>,
    stationary: Vec<bool>,
}

impl DetectionStore {
    /// Build a store from already-decoded catalogs, failing on the first invalid exposure.
    pub fn from_catalogs<I>(catalogs: I, params: StoreParams) -> Result<Self, DaomopError>
    where
        I: IntoIterator<Item = ExposureCatalog>,
    {
        let mut builder = DetectionStoreBuilder::new(params);
        for catalog in catalogs {
            builder.add_exposure(catalog)?;
        }
        Ok(builder.finish())
    }

    /// Detections of one exposure, in catalog order.
    pub fn load(&self, exposure_id: &str) -> Result<&[Detection], DaomopError> {
        let idx = self
            .exposure_index
            .get(exposure_id)
            .ok_or_else(|| DaomopError::UnknownExposure(exposure_id.to_string()))?;
        Ok(self.exposure_detections(&self.exposures[*idx]))
    }

    /// Exposure ids observed during `night`, in time order (empty for an unknown night).
    pub fn by_night(&self, night: NightId) -> Vec<ExposureId> {
        self.night_exposures(night).map(|e| e.id.clone()).collect()
    }

    /// Exposure metadata of `night`, in time order.
    pub fn night_exposures(&self, night: NightId) -> impl Iterator<Item = &ExposureInfo> + '_ {
        self.nights
            .get(&night)
            .into_iter()
            .flatten()
            .map(move |&idx| &self.exposures[idx])
    }

    /// All nights with at least one exposure, ascending.
    pub fn nights(&self) -> Vec<NightId> {
        self.nights.keys().copied().collect()
    }

    pub fn exposure(&self, exposure_id: &str) -> Option<&ExposureInfo> {
        self.exposure_index
            .get(exposure_id)
            .map(|&idx| &self.exposures[idx])
    }

    /// All exposures in time order.
    pub fn exposures(&self) -> &[ExposureInfo] {
        &self.exposures
    }

    pub fn exposure_detections(&self, exposure: &ExposureInfo) -> &[Detection] {
        let start = exposure.first as usize;
        &self.detections[start..start + exposure.count as usize]
    }

    /// Random access by id.
    ///
    /// Panics if `id` was not issued by this store.
    pub fn detection(&self, id: DetectionId) -> &Detection {
        &self.detections[id.0 as usize]
    }

    pub fn get(&self, id: DetectionId) -> Option<&Detection> {
        self.detections.get(id.0 as usize)
    }

    pub fn detections(&self) -> &[Detection] {
        &self.detections
    }

    pub fn is_stationary(&self, id: DetectionId) -> bool {
        self.stationary
            .get(id.0 as usize)
            .copied()
            .unwrap_or(false)
    }

    /// Number of detections flagged as stationary.
    pub fn stationary_count(&self) -> usize {
        self.stationary.iter().filter(|&&s| s).count()
    }

    pub(crate) fn set_stationary(&mut self, flags: Vec<bool>) {
        debug_assert_eq!(flags.len(), self.detections.len());
        self.stationary = flags;
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    pub fn number_of_exposures(&self) -> usize {
        self.exposures.len()
    }
}

impl fmt::Display for DetectionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            writeln!(f, "Detection store")?;
            writeln!(f, "---------------")?;
            for (night, idxs) in &self.nights {
                let count: usize = idxs.iter().map(|&i| self.exposures[i].len()).sum();
                writeln!(
                    f,
                    "{night}: {} exposure(s), {count} detection(s)",
                    idxs.len()
                )?;
            }
            write!(f, "stationary: {}", self.stationary_count())
        } else {
            write!(
                f,
                "DetectionStore(detections={}, exposures={}, nights={}, stationary={})",
                self.detections.len(),
                self.exposures.len(),
                self.nights.len(),
                self.stationary_count()
            )
        }
    }
}

//! # Linking parameters
//!
//! This module defines the [`LinkingParams`] configuration struct and its builder, which
//! control every kinematic threshold of the linkage chain:
//!
//! 1. **Pairwise linking** ([`pairwise::link`]) – speed bounds, pair residual, optional
//!    photometric consistency, and the size above which a spatial index is used.
//! 2. **Tracklet building** ([`crate::tracklets::build`]) – velocity consistency between
//!    chained links, minimum length and maximum fit residual.
//! 3. **Night-to-night matching** ([`crate::tracks`]) – the growing uncertainty ellipse, the
//!    rate-change bound, the track fit tolerance, and the missed-night budget.
//!
//! The struct is immutable once built and is threaded explicitly through every call.
//!
//! ## Example
//!
//! ```rust
//! use daomop::linking::LinkingParams;
//!
//! let params = LinkingParams::builder()
//!     .max_speed(10.0)
//!     .max_position_error(0.8)
//!     .max_missed_nights(3)
//!     .build()
//!     .unwrap();
//! assert_eq!(params.max_missed_nights, 3);
//! ```
use std::cmp::Ordering::{Equal, Greater, Less};
use std::fmt;

use crate::{
    constants::{ArcSec, ArcSecPerHour, Degree},
    daomop_errors::DaomopError,
};

pub mod pairwise;
pub mod spatial_index;

/// Thresholds of the linkage chain.
///
/// Fields
/// -----------------
/// **Pairwise linker**
/// * `max_speed` – largest accepted implied rate (arcsec/hour).
/// * `min_speed` – smallest accepted implied rate (arcsec/hour); zero-separation pairs are
///   always rejected.
/// * `max_position_error` – largest accepted pair residual `sqrt(σa² + σb²)` (arcsec).
/// * `max_magnitude_difference` – largest magnitude difference between the two detections
///   (infinite disables the check).
/// * `spatial_index_threshold` – above this many candidate pairs a grid index bounds the
///   search.
///
/// **Tracklet builder**
/// * `max_angle_difference` – largest angle (degrees) between a link velocity and the chain
///   velocity.
/// * `max_speed_difference_fraction` – largest relative speed difference between a link and
///   the chain.
/// * `min_tracklet_length` – minimum number of detections in a tracklet (≥ 2).
/// * `max_tracklet_residual` – largest RMS residual of the tracklet linear fit (arcsec).
///
/// **Night-to-night matcher**
/// * `position_uncertainty` – base cross-track semi-axis of the prediction ellipse (arcsec).
/// * `uncertainty_growth_rate` – linear growth of the semi-axes (arcsec/day).
/// * `acceleration_allowance` – quadratic growth accounting for unmodeled acceleration and
///   parallax (arcsec/day²).
/// * `along_track_factor` – ratio of the along-track to the cross-track semi-axis (≥ 1).
/// * `max_rate_change` – largest difference between the track rate and a candidate's rate
///   (arcsec/hour).
/// * `max_track_residual` – largest RMS residual of the multi-night fit (arcsec).
/// * `max_missed_nights` – consecutive nights without extension before a track closes.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkingParams {
    // --- Pairwise linker ---
    pub max_speed: ArcSecPerHour,
    pub min_speed: ArcSecPerHour,
    pub max_position_error: ArcSec,
    pub max_magnitude_difference: f64,
    pub spatial_index_threshold: usize,

    // --- Tracklet builder ---
    pub max_angle_difference: Degree,
    pub max_speed_difference_fraction: f64,
    pub min_tracklet_length: usize,
    pub max_tracklet_residual: ArcSec,

    // --- Night-to-night matcher ---
    pub position_uncertainty: ArcSec,
    pub uncertainty_growth_rate: f64,
    pub acceleration_allowance: f64,
    pub along_track_factor: f64,
    pub max_rate_change: ArcSecPerHour,
    pub max_track_residual: ArcSec,
    pub max_missed_nights: u32,
}

impl LinkingParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new [`LinkingParamsBuilder`] initialized with the default values.
    pub fn builder() -> LinkingParamsBuilder {
        LinkingParamsBuilder::new()
    }
}

impl Default for LinkingParams {
    fn default() -> Self {
        LinkingParams {
            max_speed: 15.0,
            min_speed: 0.0,
            max_position_error: 1.0,
            max_magnitude_difference: f64::INFINITY,
            spatial_index_threshold: 10_000,

            max_angle_difference: 15.0,
            max_speed_difference_fraction: 0.25,
            min_tracklet_length: 2,
            max_tracklet_residual: 0.5,

            position_uncertainty: 2.0,
            uncertainty_growth_rate: 10.0,
            acceleration_allowance: 5.0,
            along_track_factor: 3.0,
            max_rate_change: 1.0,
            max_track_residual: 2.0,
            max_missed_nights: 2,
        }
    }
}

/// Builder for [`LinkingParams`], with validation.
#[derive(Debug, Clone)]
pub struct LinkingParamsBuilder {
    params: LinkingParams,
}

impl Default for LinkingParamsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkingParamsBuilder {
    pub fn new() -> Self {
        Self {
            params: LinkingParams::default(),
        }
    }

    // --- Pairwise linker ---
    pub fn max_speed(mut self, v: ArcSecPerHour) -> Self {
        self.params.max_speed = v;
        self
    }
    pub fn min_speed(mut self, v: ArcSecPerHour) -> Self {
        self.params.min_speed = v;
        self
    }
    pub fn max_position_error(mut self, v: ArcSec) -> Self {
        self.params.max_position_error = v;
        self
    }
    pub fn max_magnitude_difference(mut self, v: f64) -> Self {
        self.params.max_magnitude_difference = v;
        self
    }
    pub fn spatial_index_threshold(mut self, v: usize) -> Self {
        self.params.spatial_index_threshold = v;
        self
    }

    // --- Tracklet builder ---
    pub fn max_angle_difference(mut self, v: Degree) -> Self {
        self.params.max_angle_difference = v;
        self
    }
    pub fn max_speed_difference_fraction(mut self, v: f64) -> Self {
        self.params.max_speed_difference_fraction = v;
        self
    }
    pub fn min_tracklet_length(mut self, v: usize) -> Self {
        self.params.min_tracklet_length = v;
        self
    }
    pub fn max_tracklet_residual(mut self, v: ArcSec) -> Self {
        self.params.max_tracklet_residual = v;
        self
    }

    // --- Night-to-night matcher ---
    pub fn position_uncertainty(mut self, v: ArcSec) -> Self {
        self.params.position_uncertainty = v;
        self
    }
    pub fn uncertainty_growth_rate(mut self, v: f64) -> Self {
        self.params.uncertainty_growth_rate = v;
        self
    }
    pub fn acceleration_allowance(mut self, v: f64) -> Self {
        self.params.acceleration_allowance = v;
        self
    }
    pub fn along_track_factor(mut self, v: f64) -> Self {
        self.params.along_track_factor = v;
        self
    }
    pub fn max_rate_change(mut self, v: ArcSecPerHour) -> Self {
        self.params.max_rate_change = v;
        self
    }
    pub fn max_track_residual(mut self, v: ArcSec) -> Self {
        self.params.max_track_residual = v;
        self
    }
    pub fn max_missed_nights(mut self, v: u32) -> Self {
        self.params.max_missed_nights = v;
        self
    }

    // ---- Numeric helpers for PartialOrd (handle NaN as invalid) ----

    #[inline]
    fn gt0(x: f64) -> bool {
        x.partial_cmp(&0.0) == Some(Greater)
    }

    #[inline]
    fn ge0(x: f64) -> bool {
        matches!(x.partial_cmp(&0.0), Some(Greater) | Some(Equal))
    }

    #[inline]
    fn le(a: f64, b: f64) -> bool {
        matches!(a.partial_cmp(&b), Some(Less) | Some(Equal))
    }

    /// Finalize the builder and produce a [`LinkingParams`] instance.
    ///
    /// Validation rules
    /// -----------------
    /// * `0 ≤ min_speed ≤ max_speed`, `max_speed` finite and > 0.
    /// * `max_position_error > 0`, `max_magnitude_difference ≥ 0` (may be infinite).
    /// * `0 < max_angle_difference ≤ 180`, `max_speed_difference_fraction ≥ 0`.
    /// * `min_tracklet_length ≥ 2`, `max_tracklet_residual ≥ 0`.
    /// * `position_uncertainty > 0`, `uncertainty_growth_rate ≥ 0`, `acceleration_allowance ≥ 0`.
    /// * `along_track_factor ≥ 1`, `max_rate_change ≥ 0`, `max_track_residual ≥ 0`.
    /// * `max_missed_nights ≥ 1`.
    ///
    /// Returns
    /// -----------------
    /// * `Ok(LinkingParams)` if all values are valid.
    /// * `Err(DaomopError::InvalidParameter)` naming the first rule that fails.
    pub fn build(self) -> Result<LinkingParams, DaomopError> {
        let p = &self.params;
        let invalid = |msg: &str| Err(DaomopError::InvalidParameter(msg.into()));

        if !Self::gt0(p.max_speed) || !p.max_speed.is_finite() {
            return invalid("max_speed must be finite and > 0");
        }
        if !Self::ge0(p.min_speed) || !Self::le(p.min_speed, p.max_speed) {
            return invalid("require 0 <= min_speed <= max_speed");
        }
        if !Self::gt0(p.max_position_error) {
            return invalid("max_position_error must be > 0");
        }
        if !Self::ge0(p.max_magnitude_difference) {
            return invalid("max_magnitude_difference must be >= 0");
        }
        if !Self::gt0(p.max_angle_difference) || !Self::le(p.max_angle_difference, 180.0) {
            return invalid("max_angle_difference must be in (0, 180]");
        }
        if !Self::ge0(p.max_speed_difference_fraction) {
            return invalid("max_speed_difference_fraction must be >= 0");
        }
        if p.min_tracklet_length < 2 {
            return invalid("min_tracklet_length must be >= 2");
        }
        if !Self::ge0(p.max_tracklet_residual) {
            return invalid("max_tracklet_residual must be >= 0");
        }
        if !Self::gt0(p.position_uncertainty) {
            return invalid("position_uncertainty must be > 0");
        }
        if !Self::ge0(p.uncertainty_growth_rate) || !Self::ge0(p.acceleration_allowance) {
            return invalid("uncertainty growth terms must be >= 0");
        }
        if !Self::le(1.0, p.along_track_factor) {
            return invalid("along_track_factor must be >= 1");
        }
        if !Self::ge0(p.max_rate_change) || !Self::ge0(p.max_track_residual) {
            return invalid("max_rate_change and max_track_residual must be >= 0");
        }
        if p.max_missed_nights == 0 {
            return invalid("max_missed_nights must be >= 1");
        }

        Ok(self.params)
    }
}

impl fmt::Display for LinkingParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            const PARAM_COL: usize = 46;
            writeln!(f, "Linking Parameters")?;
            writeln!(f, "------------------")?;

            macro_rules! line {
                ($fmt:expr, $val:expr, $comment:expr) => {{
                    let s = format!($fmt, $val);
                    let pad = " ".repeat(PARAM_COL.saturating_sub(s.len()).max(1));
                    writeln!(f, "  {}{}# {}", s, pad, $comment)
                }};
            }

            writeln!(f, "[Pairwise linker]")?;
            line!("max_speed                = {:.3} \"/h", self.max_speed, "Largest implied rate")?;
            line!("min_speed                = {:.3} \"/h", self.min_speed, "Smallest implied rate")?;
            line!("max_position_error       = {:.3} \"", self.max_position_error, "Largest pair residual")?;
            line!("max_magnitude_difference = {:.2}", self.max_magnitude_difference, "Photometric consistency")?;
            line!("spatial_index_threshold  = {}", self.spatial_index_threshold, "Pairs before grid indexing")?;

            writeln!(f, "\n[Tracklet builder]")?;
            line!("max_angle_difference     = {:.1} deg", self.max_angle_difference, "Velocity direction tolerance")?;
            line!("max_speed_diff_fraction  = {:.3}", self.max_speed_difference_fraction, "Velocity magnitude tolerance")?;
            line!("min_tracklet_length      = {}", self.min_tracklet_length, "Minimum detections")?;
            line!("max_tracklet_residual    = {:.3} \"", self.max_tracklet_residual, "Largest linear-fit RMS")?;

            writeln!(f, "\n[Night-to-night matcher]")?;
            line!("position_uncertainty     = {:.3} \"", self.position_uncertainty, "Base ellipse semi-axis")?;
            line!("uncertainty_growth_rate  = {:.3} \"/d", self.uncertainty_growth_rate, "Linear ellipse growth")?;
            line!("acceleration_allowance   = {:.3} \"/d2", self.acceleration_allowance, "Quadratic ellipse growth")?;
            line!("along_track_factor       = {:.2}", self.along_track_factor, "Along/cross-track ratio")?;
            line!("max_rate_change          = {:.3} \"/h", self.max_rate_change, "Rate consistency")?;
            line!("max_track_residual       = {:.3} \"", self.max_track_residual, "Largest multi-night RMS")?;
            line!("max_missed_nights        = {}", self.max_missed_nights, "Nights before closure")?;
            Ok(())
        } else {
            write!(
                f,
                "LinkingParams(speed∈[{:.2},{:.2}]\"/h, pos_err≤{:.2}\", tracklet_rms≤{:.2}\", min_len={}, σ0={:.2}\", growth={:.2}\"/d, missed≤{})",
                self.min_speed,
                self.max_speed,
                self.max_position_error,
                self.max_tracklet_residual,
                self.min_tracklet_length,
                self.position_uncertainty,
                self.uncertainty_growth_rate,
                self.max_missed_nights,
            )
        }
    }
}

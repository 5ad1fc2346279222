//! # Constants and type definitions for daomop
//!
//! This module centralizes the **unit conversions**, **sanity bounds**, and **common type
//! definitions** used throughout the linking pipeline.
//!
//! ## Overview
//!
//! - Unit conversions (degrees ↔ arcseconds, days ↔ hours)
//! - Bounds used to validate upstream catalogs (timestamps, declination)
//! - Core type aliases used across the crate
//! - Identifiers for exposures, nights and detections
//!
//! Conventions: sky positions are in **degrees**, timestamps are **MJD (UTC)**,
//! uncertainties and residuals are in **arcseconds** and angular rates are in
//! **arcseconds per hour**.

use std::fmt;

// -------------------------------------------------------------------------------------------------
// Unit conversions
// -------------------------------------------------------------------------------------------------

/// Arcseconds in one degree
pub const ARCSEC_PER_DEG: f64 = 3600.0;

/// Hours in one day
pub const HOURS_PER_DAY: f64 = 24.0;

/// Seconds in one day
pub const SECONDS_PER_DAY: f64 = 86_400.0;

/// Numerical epsilon used for floating-point comparisons
pub const EPS: f64 = 1e-9;

/// Separations below this value (degrees) are treated as zero motion
pub const ZERO_SEPARATION_DEG: f64 = 1e-10;

// -------------------------------------------------------------------------------------------------
// Sanity bounds
// -------------------------------------------------------------------------------------------------

/// Earliest accepted timestamp (1968-05-24)
pub const MJD_MIN: f64 = 40_000.0;

/// Latest accepted timestamp (2077-09-06)
pub const MJD_MAX: f64 = 80_000.0;

/// Longitude of the Canada-France-Hawaii Telescope, east-positive
pub const CFHT_LONGITUDE: Degree = -155.4681;

// -------------------------------------------------------------------------------------------------
// Type aliases
// -------------------------------------------------------------------------------------------------

/// Angle in degrees
pub type Degree = f64;
/// Angle in arcseconds
pub type ArcSec = f64;
/// Angular rate in arcseconds per hour
pub type ArcSecPerHour = f64;
/// Modified Julian Date (days, UTC)
pub type MJD = f64;
/// Archive identifier of one exposure (e.g. a CFHT exposure number `"1616681"`)
pub type ExposureId = String;

// -------------------------------------------------------------------------------------------------
// Identifiers
// -------------------------------------------------------------------------------------------------

/// Dense identifier of a detection, assigned by the detection store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DetectionId(pub u32);

impl fmt::Display for DetectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "d{}", self.0)
    }
}

/// Observing night, counted in local-noon-to-local-noon days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NightId(pub i64);

impl fmt::Display for NightId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{}", self.0)
    }
}

/// Identifier of a tracklet: the night it belongs to and its build order within that night.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackletId {
    pub night: NightId,
    pub index: u32,
}

impl fmt::Display for TrackletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.t{}", self.night, self.index)
    }
}

/// Identifier of a multi-night track, assigned at seeding time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(pub u32);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{:05}", self.0)
    }
}

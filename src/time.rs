//! # Time helpers
//!
//! Timestamps enter the pipeline either as MJD values or as calendar strings taken from
//! catalog headers (`DATE-OBS`). Everything downstream works in **MJD (UTC days)**.
//!
//! This module also defines how timestamps are grouped into observing **nights**: a night
//! runs from local noon to the next local noon at the observatory, so that all exposures of
//! one dark period share the same [`NightId`] regardless of the UTC date change.
use hifitime::{Epoch, TimeScale};
use std::str::FromStr;

use crate::constants::{Degree, NightId, MJD, SECONDS_PER_DAY};

/// Transformation from an ISO-8601 date (e.g. `2017-05-22T10:34:12.5`) to MJD (UTC)
///
/// Argument
/// --------
/// * `date`: an ISO-8601 date string, interpreted in UTC when no time scale is given
///
/// Return
/// ------
/// * the input date in modified julian date (MJD, UTC), or a description of the parsing failure
pub fn iso_to_mjd(date: &str) -> Result<MJD, String> {
    Epoch::from_str(date.trim())
        .map(|epoch| epoch.to_mjd_utc_days())
        .map_err(|err| format!("invalid ISO date {date:?}: {err}"))
}

/// Transformation from a date in the format `YYYY MM DD.FFFFF` (UTC) to MJD (UTC)
///
/// This is the fractional-day format used by MPC astrometric reports.
///
/// Argument
/// --------
/// * `date_str`: a string representing the date in the format YYYY MM DD.FFFFF in the UTC frame
///
/// Return
/// ------
/// * a float representing the input date in modified julian date (MJD) in the UTC frame
pub fn frac_date_to_mjd(date_str: &str) -> Result<MJD, String> {
    let parts: Vec<&str> = date_str.split_whitespace().collect();
    if parts.len() != 3 {
        return Err("Invalid format, expected: YYYY MM DD.FFFFF".to_string());
    }

    let year = i32::from_str(parts[0]).map_err(|_| "invalid year")?;
    let month = u8::from_str(parts[1]).map_err(|_| "invalid month")?;
    let day_fraction = f64::from_str(parts[2]).map_err(|_| "invalid frac day")?;
    if !(1.0..32.0).contains(&day_fraction) || !(1..=12).contains(&month) {
        return Err(format!("date out of range: {date_str:?}"));
    }

    let day = day_fraction.trunc() as u8;
    let midnight = Epoch::maybe_from_gregorian(year, month, day, 0, 0, 0, 0, TimeScale::UTC)
        .map_err(|err| format!("invalid calendar date {date_str:?}: {err}"))?;

    Ok(midnight.to_mjd_utc_days() + day_fraction.fract())
}

/// Parse a catalog timestamp, accepting ISO-8601 or MPC fractional-day dates.
pub fn parse_timestamp(date: &str) -> Result<MJD, String> {
    iso_to_mjd(date).or_else(|iso_err| frac_date_to_mjd(date).map_err(|_| iso_err))
}

/// Format an MJD (UTC) as an ISO-8601 string, e.g. `2017-05-22T10:34:12 UTC`.
pub fn mjd_to_iso(mjd: MJD) -> String {
    format!("{}", Epoch::from_mjd_utc(mjd))
}

/// Mid-exposure time from an exposure start time and an exposure duration in seconds.
pub fn mid_exposure(start: MJD, exptime_seconds: f64) -> MJD {
    start + 0.5 * exptime_seconds / SECONDS_PER_DAY
}

/// Observing night containing `mjd` for an observatory at `longitude` (degrees, east-positive).
///
/// Nights are bounded by local mean noon: the local mean solar time is
/// `mjd + longitude / 360` and a new night starts when its fractional part crosses 0.5.
///
/// Arguments
/// -----------------
/// * `mjd`: timestamp in MJD (UTC)
/// * `longitude`: observatory longitude in degrees, east-positive
///
/// Return
/// ----------
/// * The [`NightId`] of the dark period containing `mjd`.
pub fn night_of(mjd: MJD, longitude: Degree) -> NightId {
    NightId((mjd + longitude / 360.0 - 0.5).floor() as i64)
}

#[cfg(test)]
mod time_test {
    use super::*;
    use crate::constants::CFHT_LONGITUDE;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_iso_to_mjd() {
        let mjd = iso_to_mjd("2017-05-22T12:00:00").unwrap();
        assert_abs_diff_eq!(mjd, 57895.5, epsilon = 1e-8);
        assert!(iso_to_mjd("not a date").is_err());
    }

    #[test]
    fn test_frac_date_to_mjd() {
        let mjd = frac_date_to_mjd("2017 05 22.25").unwrap();
        assert_abs_diff_eq!(mjd, 57895.25, epsilon = 1e-8);
        assert!(frac_date_to_mjd("2017 13 22.25").is_err());
        assert!(frac_date_to_mjd("2017-05-22").is_err());
    }

    #[test]
    fn test_frac_date_rejects_missing_calendar_days() {
        assert!(frac_date_to_mjd("2017 02 30.5").is_err());
        assert!(frac_date_to_mjd("2017 04 31.0").is_err());
        assert!(parse_timestamp("2017 02 30.5").is_err());
        assert!(frac_date_to_mjd("2016 02 29.5").is_ok());
    }

    #[test]
    fn test_parse_timestamp_accepts_both_formats() {
        let iso = parse_timestamp("2017-05-22T06:00:00").unwrap();
        let frac = parse_timestamp("2017 05 22.25").unwrap();
        assert_abs_diff_eq!(iso, frac, epsilon = 1e-8);
    }

    #[test]
    fn test_mid_exposure() {
        let mid = mid_exposure(57895.0, 287.0);
        assert_abs_diff_eq!(mid, 57895.0 + 143.5 / 86400.0, epsilon = 1e-12);
    }

    #[test]
    fn test_night_of_keeps_one_dark_period_together() {
        // Hawaii evening (05:00 UTC) and morning (15:00 UTC of the next UTC day)
        let evening = 57895.0 + 5.0 / 24.0;
        let morning = 57895.0 + 15.0 / 24.0;
        assert_eq!(
            night_of(evening, CFHT_LONGITUDE),
            night_of(morning, CFHT_LONGITUDE)
        );

        let next_evening = evening + 1.0;
        assert_eq!(
            night_of(next_evening, CFHT_LONGITUDE).0,
            night_of(evening, CFHT_LONGITUDE).0 + 1
        );
    }
}

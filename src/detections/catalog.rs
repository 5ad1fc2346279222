//! # Catalog decoding
//!
//! Turn the bytes of an exposure source catalog (as fetched from the archive) into an
//! [`ExposureCatalog`].
//!
//! Catalogs are CSV files with a header row. Column names follow the survey's SExtractor
//! products, with lowercase aliases for hand-written files:
//!
//! | field      | accepted headers            | unit                         |
//! |------------|-----------------------------|------------------------------|
//! | RA         | `ra`, `X_WORLD`             | degrees                      |
//! | Dec        | `dec`, `Y_WORLD`            | degrees                      |
//! | time       | `mjd`, `MJDATE`             | MJD (UTC)                    |
//! | time (alt) | `date_obs`, `DATE-OBS`      | ISO-8601 or `YYYY MM DD.ddd` |
//! | duration   | `exptime`, `EXPTIME`        | seconds                      |
//! | magnitude  | `mag`, `MAG_AUTO`           | mag                          |
//! | error      | `sigma`                     | arcseconds                   |
//! | error      | `erra_world`, `ERRA_WORLD`  | degrees                      |
//!
//! When an exposure duration column is present the timestamp is taken as the exposure
//! **start** and shifted to mid-exposure. Lines starting with `#` are ignored.
use serde::Deserialize;

use crate::{
    constants::{ArcSec, ARCSEC_PER_DEG},
    daomop_errors::DaomopError,
    detections::{ExposureCatalog, RawDetection},
    time::{mid_exposure, parse_timestamp},
};

/// Positional uncertainty used when a catalog carries no error column.
pub const DEFAULT_SIGMA: ArcSec = 0.2;

#[derive(Debug, Deserialize)]
struct CatalogRow {
    #[serde(alias = "X_WORLD", alias = "RA")]
    ra: f64,
    #[serde(alias = "Y_WORLD", alias = "DEC")]
    dec: f64,
    #[serde(default, alias = "MJDATE", alias = "MJD")]
    mjd: Option<f64>,
    #[serde(default, alias = "DATE-OBS", alias = "DATE_OBS")]
    date_obs: Option<String>,
    #[serde(default, alias = "EXPTIME")]
    exptime: Option<f64>,
    #[serde(alias = "MAG_AUTO", alias = "MAG")]
    mag: f64,
    #[serde(default, alias = "SIGMA")]
    sigma: Option<f64>,
    #[serde(default, alias = "ERRA_WORLD")]
    erra_world: Option<f64>,
}

/// Decode the CSV catalog of one exposure.
///
/// Arguments
/// -----------------
/// * `exposure_id`: the exposure the catalog belongs to (used in error reports).
/// * `bytes`: raw catalog content.
///
/// Return
/// ----------
/// * The decoded [`ExposureCatalog`]; structural validation (ranges, empty catalogs) is left
///   to [`DetectionStoreBuilder::add_exposure`](crate::detections::DetectionStoreBuilder::add_exposure).
/// * `Err(DaomopError::MalformedDetection)` if a row cannot be decoded.
/// * `Err(DaomopError::MalformedTimestamp)` if a row has no usable timestamp.
pub fn decode_catalog(exposure_id: &str, bytes: &[u8]) -> Result<ExposureCatalog, DaomopError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .comment(Some(b'#'))
        .from_reader(bytes);

    let mut detections = Vec::new();
    for (row, record) in reader.deserialize::<CatalogRow>().enumerate() {
        let record = record.map_err(|err| DaomopError::MalformedDetection {
            exposure: exposure_id.to_string(),
            row,
            reason: err.to_string(),
        })?;
        detections.push(row_to_detection(exposure_id, row, record)?);
    }

    Ok(ExposureCatalog::new(exposure_id, detections))
}

fn row_to_detection(
    exposure_id: &str,
    row: usize,
    record: CatalogRow,
) -> Result<RawDetection, DaomopError> {
    let timestamp = match (record.mjd, record.date_obs.as_deref()) {
        (Some(mjd), _) => mjd,
        (None, Some(date)) => {
            parse_timestamp(date).map_err(|reason| DaomopError::MalformedTimestamp {
                exposure: exposure_id.to_string(),
                reason: format!("row {row}: {reason}"),
            })?
        }
        (None, None) => {
            return Err(DaomopError::MalformedTimestamp {
                exposure: exposure_id.to_string(),
                reason: format!("row {row}: no mjd or date_obs column"),
            })
        }
    };

    let mjd = match record.exptime {
        Some(exptime) if exptime.is_finite() && exptime >= 0.0 => mid_exposure(timestamp, exptime),
        Some(exptime) => {
            return Err(DaomopError::MalformedTimestamp {
                exposure: exposure_id.to_string(),
                reason: format!("row {row}: invalid exposure time {exptime}"),
            })
        }
        None => timestamp,
    };

    let sigma = record
        .sigma
        .or(record.erra_world.map(|deg| deg * ARCSEC_PER_DEG))
        .unwrap_or(DEFAULT_SIGMA);

    Ok(RawDetection {
        ra: record.ra,
        dec: record.dec,
        mjd,
        mag: record.mag,
        sigma,
    })
}

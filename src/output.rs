//! # Candidate output
//!
//! [`TrackSink`] receives the ranked tracks of a run. [`CsvTrackWriter`] writes them as CSV,
//! one row per detection:
//!
//! ```text
//! rank,score,track,night,tracklet,exposure,mjd,date,ra,dec,mag
//! 1,4.991,T00000,N56999,0,n0e0,57000.350000000,2014-12-09T08:24:00 UTC,30.000000000,5.000000000,21.50
//! ```
use std::fs::File;
use std::io::Write;

use camino::Utf8Path;
use serde::Serialize;

use crate::{
    constants::{Degree, MJD},
    daomop_errors::DaomopError,
    detections::DetectionStore,
    ranking::RankedTrack,
    time::mjd_to_iso,
};

/// Destination of ranked tracks.
pub trait TrackSink {
    /// Write `tracks`, resolving their detections in `store`.
    ///
    /// Return
    /// ----------
    /// * The number of records written.
    fn write_tracks(
        &mut self,
        tracks: &[RankedTrack],
        store: &DetectionStore,
    ) -> Result<usize, DaomopError>;
}

#[derive(Debug, Serialize)]
struct DetectionRow<'a> {
    rank: usize,
    #[serde(serialize_with = "three_decimals")]
    score: f64,
    track: String,
    night: String,
    tracklet: u32,
    exposure: &'a str,
    #[serde(serialize_with = "nine_decimals")]
    mjd: MJD,
    date: String,
    #[serde(serialize_with = "nine_decimals")]
    ra: Degree,
    #[serde(serialize_with = "nine_decimals")]
    dec: Degree,
    #[serde(serialize_with = "two_decimals")]
    mag: f64,
}

fn three_decimals<S: serde::Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format!("{v:.3}"))
}

fn nine_decimals<S: serde::Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format!("{v:.9}"))
}

fn two_decimals<S: serde::Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format!("{v:.2}"))
}

/// CSV writer of ranked tracks.
#[derive(Debug)]
pub struct CsvTrackWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl CsvTrackWriter<File> {
    pub fn create(path: &Utf8Path) -> Result<Self, DaomopError> {
        Ok(CsvTrackWriter {
            writer: csv::Writer::from_path(path)?,
        })
    }
}

impl<W: Write> CsvTrackWriter<W> {
    pub fn from_writer(writer: W) -> Self {
        CsvTrackWriter {
            writer: csv::Writer::from_writer(writer),
        }
    }

    /// Flush and return the underlying writer.
    pub fn into_inner(self) -> Result<W, DaomopError> {
        self.writer
            .into_inner()
            .map_err(|err| DaomopError::IoError(err.into_error()))
    }
}

impl<W: Write> TrackSink for CsvTrackWriter<W> {
    fn write_tracks(
        &mut self,
        tracks: &[RankedTrack],
        store: &DetectionStore,
    ) -> Result<usize, DaomopError> {
        let mut rows = 0;
        for ranked in tracks {
            let track_id = ranked.track.id().to_string();
            for tracklet in ranked.track.tracklets() {
                let night = tracklet.night().to_string();
                for &id in &tracklet.detections {
                    let detection = store.get(id).ok_or(DaomopError::UnknownDetection(id))?;
                    self.writer.serialize(DetectionRow {
                        rank: ranked.rank,
                        score: ranked.score,
                        track: track_id.clone(),
                        night: night.clone(),
                        tracklet: tracklet.id.index,
                        exposure: &detection.exposure_id,
                        mjd: detection.mjd,
                        date: mjd_to_iso(detection.mjd),
                        ra: detection.ra,
                        dec: detection.dec,
                        mag: detection.mag,
                    })?;
                    rows += 1;
                }
            }
        }
        self.writer.flush()?;
        Ok(rows)
    }
}

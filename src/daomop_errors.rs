use std::fmt;

use thiserror::Error;

use crate::constants::{DetectionId, ExposureId, TrackId};

#[derive(Error, Debug)]
pub enum DaomopError {
    #[error("Exposure {0} has no detections")]
    EmptyExposure(ExposureId),

    #[error("Malformed timestamp in exposure {exposure}: {reason}")]
    MalformedTimestamp {
        exposure: ExposureId,
        reason: String,
    },

    #[error("Malformed detection in exposure {exposure} (row {row}): {reason}")]
    MalformedDetection {
        exposure: ExposureId,
        row: usize,
        reason: String,
    },

    #[error("Invalid exposure identifier: {0:?}")]
    InvalidExposureId(String),

    #[error("Exposure {0} is already loaded")]
    DuplicateExposure(ExposureId),

    #[error("Unknown exposure: {0}")]
    UnknownExposure(ExposureId),

    #[error("Unknown detection: {0}")]
    UnknownDetection(DetectionId),

    #[error("Unknown track: {0}")]
    UnknownTrack(TrackId),

    #[error("Fetch of exposure {exposure} failed after {attempts} attempt(s): {reason}")]
    FetchError {
        exposure: ExposureId,
        attempts: u32,
        reason: String,
    },

    #[error("Exposure {0} not found in the archive")]
    NotFoundError(ExposureId),

    #[error("Motion fit failed: {0}")]
    FitError(String),

    #[error("Invalid linking parameter: {0}")]
    InvalidParameter(String),

    #[error("Invalid VOSpace URI: {0}")]
    InvalidVospaceUri(String),

    #[error("No detections available across {0} exposure(s)")]
    NoDetections(usize),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Unable to perform file operation: {0}")]
    IoError(#[from] std::io::Error),

    #[error("HTTP reqwest error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("UTF-8 Path error: {0}")]
    Utf8PathError(String),
}

/// Coarse classification used to aggregate failures in the run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorClass {
    /// Malformed or missing detection input.
    Data,
    /// Archive access failure after retries.
    Fetch,
    /// Object absent from the archive.
    NotFound,
    /// Motion-model fit failure.
    Fit,
    /// Configuration or programming error.
    Usage,
    /// Cancellation or run-level failure.
    Run,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorClass::Data => "data",
            ErrorClass::Fetch => "fetch",
            ErrorClass::NotFound => "not-found",
            ErrorClass::Fit => "fit",
            ErrorClass::Usage => "usage",
            ErrorClass::Run => "run",
        };
        f.write_str(name)
    }
}

impl DaomopError {
    pub fn class(&self) -> ErrorClass {
        use DaomopError::*;
        match self {
            EmptyExposure(_)
            | MalformedTimestamp { .. }
            | MalformedDetection { .. }
            | InvalidExposureId(_)
            | DuplicateExposure(_)
            | CsvError(_) => ErrorClass::Data,
            FetchError { .. } | IoError(_) | ReqwestError(_) => ErrorClass::Fetch,
            NotFoundError(_) => ErrorClass::NotFound,
            FitError(_) => ErrorClass::Fit,
            UnknownExposure(_)
            | UnknownDetection(_)
            | UnknownTrack(_)
            | InvalidParameter(_)
            | InvalidVospaceUri(_)
            | Utf8PathError(_) => ErrorClass::Usage,
            NoDetections(_) | Cancelled => ErrorClass::Run,
        }
    }

    /// Whether an archive access failure is worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            DaomopError::ReqwestError(err) => !err.status().is_some_and(|s| s.is_client_error()),
            DaomopError::IoError(_) | DaomopError::FetchError { .. } => true,
            _ => false,
        }
    }
}

impl PartialEq for DaomopError {
    fn eq(&self, other: &Self) -> bool {
        use DaomopError::*;
        match (self, other) {
            (EmptyExposure(a), EmptyExposure(b)) => a == b,
            (
                MalformedTimestamp {
                    exposure: a,
                    reason: ra,
                },
                MalformedTimestamp {
                    exposure: b,
                    reason: rb,
                },
            ) => a == b && ra == rb,
            (
                MalformedDetection {
                    exposure: a,
                    row: ia,
                    reason: ra,
                },
                MalformedDetection {
                    exposure: b,
                    row: ib,
                    reason: rb,
                },
            ) => a == b && ia == ib && ra == rb,
            (InvalidExposureId(a), InvalidExposureId(b)) => a == b,
            (DuplicateExposure(a), DuplicateExposure(b)) => a == b,
            (UnknownExposure(a), UnknownExposure(b)) => a == b,
            (UnknownDetection(a), UnknownDetection(b)) => a == b,
            (UnknownTrack(a), UnknownTrack(b)) => a == b,
            (
                FetchError {
                    exposure: a,
                    attempts: na,
                    ..
                },
                FetchError {
                    exposure: b,
                    attempts: nb,
                    ..
                },
            ) => a == b && na == nb,
            (NotFoundError(a), NotFoundError(b)) => a == b,
            (FitError(a), FitError(b)) => a == b,
            (InvalidParameter(a), InvalidParameter(b)) => a == b,
            (InvalidVospaceUri(a), InvalidVospaceUri(b)) => a == b,
            (NoDetections(a), NoDetections(b)) => a == b,
            (Utf8PathError(a), Utf8PathError(b)) => a == b,

            // Wrapped foreign errors are not comparable: same variant is enough
            (IoError(_), IoError(_)) => true,
            (ReqwestError(_), ReqwestError(_)) => true,
            (CsvError(_), CsvError(_)) => true,

            (Cancelled, Cancelled) => true,

            _ => false,
        }
    }
}

#[cfg(test)]
mod daomop_errors_test {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(
            DaomopError::EmptyExposure("1616681".into()).class(),
            ErrorClass::Data
        );
        assert_eq!(
            DaomopError::NotFoundError("1616681".into()).class(),
            ErrorClass::NotFound
        );
        assert_eq!(
            DaomopError::FitError("singular".into()).class(),
            ErrorClass::Fit
        );
        assert_eq!(DaomopError::Cancelled.class(), ErrorClass::Run);
    }

    #[test]
    fn test_fetch_error_equality_ignores_reason() {
        let a = DaomopError::FetchError {
            exposure: "42".into(),
            attempts: 3,
            reason: "timeout".into(),
        };
        let b = DaomopError::FetchError {
            exposure: "42".into(),
            attempts: 3,
            reason: "connection reset".into(),
        };
        assert_eq!(a, b);
        assert!(a.is_transient());
        assert!(!DaomopError::NotFoundError("42".into()).is_transient());
    }
}

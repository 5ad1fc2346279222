//! # Prediction uncertainty ellipse
//!
//! Tolerance region around the extrapolated position of a track.
//!
//! The ellipse is aligned with the direction of motion. Its cross-track semi-axis grows with
//! the time elapsed since the last confirmed detection:
//!
//! ```text
//! cross(dt) = σ_pos + growth_rate · dt + ½ · accel · dt²      (arcsec, dt in days)
//! along(dt) = along_track_factor · cross(dt)
//! σ_pos     = sqrt(position_uncertainty² + track_rms²)
//! ```
//!
//! The linear term covers the rate uncertainty of the fit; the quadratic term covers what the
//! linear model cannot represent (reflex parallax, real acceleration). Both semi-axes are
//! non-decreasing in `|dt|`.
use nalgebra::Vector2;

use crate::{constants::ArcSec, linking::LinkingParams};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UncertaintyEllipse {
    /// Semi-axis along the direction of motion (arcsec).
    pub along: ArcSec,
    /// Semi-axis across the direction of motion (arcsec).
    pub cross: ArcSec,
    /// Unit vector of the along-track axis (east, north).
    pub direction: Vector2<f64>,
}

impl UncertaintyEllipse {
    /// Ellipse of a track with fit residual `track_rms`, `dt` days after its last detection,
    /// moving with `rate` (arcsec/hour).
    pub fn at(dt: f64, track_rms: ArcSec, rate: &Vector2<f64>, params: &LinkingParams) -> Self {
        let (along, cross) = semi_axes(dt, track_rms, params);
        let speed = rate.norm();
        if speed > 0.0 {
            UncertaintyEllipse {
                along,
                cross,
                direction: rate / speed,
            }
        } else {
            // No preferred direction: circle of the cross-track radius.
            UncertaintyEllipse {
                along: cross,
                cross,
                direction: Vector2::new(0.0, 1.0),
            }
        }
    }

    /// `sqrt((d_along / along)² + (d_cross / cross)²)` for a tangent-plane offset (arcsec).
    pub fn normalized_distance(&self, offset: &Vector2<f64>) -> f64 {
        let d_along = offset.dot(&self.direction);
        let d_cross = self.direction.x * offset.y - self.direction.y * offset.x;
        ((d_along / self.along).powi(2) + (d_cross / self.cross).powi(2)).sqrt()
    }

    pub fn contains(&self, offset: &Vector2<f64>) -> bool {
        self.normalized_distance(offset) <= 1.0
    }
}

/// `(along, cross)` semi-axes in arcseconds, `dt` days after the last detection.
pub fn semi_axes(dt: f64, track_rms: ArcSec, params: &LinkingParams) -> (ArcSec, ArcSec) {
    let dt = dt.abs();
    let sigma = params.position_uncertainty.hypot(track_rms);
    let cross = sigma
        + params.uncertainty_growth_rate * dt
        + 0.5 * params.acceleration_allowance * dt * dt;
    (params.along_track_factor * cross, cross)
}

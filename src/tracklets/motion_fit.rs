//! # Linear motion fit
//!
//! Weighted least-squares fit of a constant-rate motion to a set of detections.
//!
//! Positions are projected onto a [`TangentPlane`] centered on their mean direction and
//! expressed in arcseconds. Each axis is fitted independently with the same design matrix:
//!
//! ```text
//!   x(t) = x₀ + vₓ · (t − t₀)        y(t) = y₀ + v_y · (t − t₀)
//! ```
//!
//! where `t₀` is the weighted mean time (hours) and the weights are `1 / σ²`. With this choice
//! of epoch the normal matrix is diagonal, so the position at epoch and the rate are
//! uncorrelated.
//!
//! The reported `rms` is the root mean square of the 2-D residual distances, in arcseconds.
use nalgebra::{Matrix2, Vector2};

use crate::{
    constants::{ArcSec, ArcSecPerHour, Degree, ARCSEC_PER_DEG, EPS, HOURS_PER_DAY, MJD},
    daomop_errors::DaomopError,
    detections::Detection,
    sky::{mean_position, TangentPlane},
};

/// Constant-rate motion on the sky.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearMotion {
    /// Reference epoch (weighted mean time of the fitted detections).
    pub epoch: MJD,
    /// Projection the fit was made in.
    pub plane: TangentPlane,
    /// Tangent-plane position at `epoch` (arcsec, east/north).
    pub position: Vector2<f64>,
    /// Tangent-plane rates (arcsec/hour, east/north).
    pub rate: Vector2<f64>,
    /// RMS of the 2-D residuals (arcsec).
    pub rms: ArcSec,
    /// Formal one-sigma uncertainty of each rate component (arcsec/hour).
    pub rate_sigma: ArcSecPerHour,
    /// Number of fitted detections.
    pub n_obs: usize,
}

impl LinearMotion {
    /// Predicted tangent-plane position (arcsec) at `mjd`.
    pub fn predict_plane(&self, mjd: MJD) -> Vector2<f64> {
        self.position + self.rate * ((mjd - self.epoch) * HOURS_PER_DAY)
    }

    /// Predicted sky position (degrees) at `mjd`.
    pub fn predict(&self, mjd: MJD) -> (Degree, Degree) {
        let p = self.predict_plane(mjd) / ARCSEC_PER_DEG;
        self.plane.deproject(p.x, p.y)
    }

    /// Position of `(ra, dec)` in this fit's tangent plane (arcsec).
    pub fn to_plane(&self, ra: Degree, dec: Degree) -> Option<Vector2<f64>> {
        self.plane
            .project(ra, dec)
            .map(|(xi, eta)| Vector2::new(xi, eta) * ARCSEC_PER_DEG)
    }

    pub fn speed(&self) -> ArcSecPerHour {
        self.rate.norm()
    }
}

/// Fit a [`LinearMotion`] to `detections`.
///
/// Arguments
/// -----------------
/// * `detections`: at least two detections with distinct timestamps.
///
/// Return
/// ----------
/// * The fitted motion.
/// * `Err(DaomopError::FitError)` if fewer than two detections are given, all detections share
///   the same time, a position cannot be projected, or the solution is not finite.
pub fn fit_linear_motion(detections: &[&Detection]) -> Result<LinearMotion, DaomopError> {
    if detections.len() < 2 {
        return Err(DaomopError::FitError(format!(
            "{} detection(s), at least 2 required",
            detections.len()
        )));
    }

    let (ra0, dec0) = mean_position(detections.iter().map(|d| (d.ra, d.dec)))
        .ok_or_else(|| DaomopError::FitError("undefined mean position".into()))?;
    let plane = TangentPlane::new(ra0, dec0);

    let weights: Vec<f64> = detections.iter().map(|d| 1.0 / (d.sigma * d.sigma)).collect();
    let w_sum: f64 = weights.iter().sum();
    let epoch = detections
        .iter()
        .zip(&weights)
        .map(|(d, w)| w * d.mjd)
        .sum::<f64>()
        / w_sum;

    let mut points = Vec::with_capacity(detections.len());
    for d in detections {
        let (xi, eta) = plane.project(d.ra, d.dec).ok_or_else(|| {
            DaomopError::FitError(format!("{} cannot be projected", d.id))
        })?;
        let t = (d.mjd - epoch) * HOURS_PER_DAY;
        points.push((t, Vector2::new(xi, eta) * ARCSEC_PER_DEG));
    }

    // Normal equations, shared by both axes.
    let mut normal = Matrix2::zeros();
    let mut rhs_x = Vector2::zeros();
    let mut rhs_y = Vector2::zeros();
    for ((t, p), w) in points.iter().zip(&weights) {
        let row = Vector2::new(1.0, *t);
        normal += row * row.transpose() * *w;
        rhs_x += row * (w * p.x);
        rhs_y += row * (w * p.y);
    }

    if normal[(1, 1)] <= EPS * w_sum {
        return Err(DaomopError::FitError(
            "detections share the same timestamp".into(),
        ));
    }
    let covariance = normal
        .try_inverse()
        .ok_or_else(|| DaomopError::FitError("singular normal matrix".into()))?;

    let sol_x = covariance * rhs_x;
    let sol_y = covariance * rhs_y;
    let position = Vector2::new(sol_x[0], sol_y[0]);
    let rate = Vector2::new(sol_x[1], sol_y[1]);

    let sq_sum: f64 = points
        .iter()
        .map(|(t, p)| (p - (position + rate * *t)).norm_squared())
        .sum();
    let rms = (sq_sum / points.len() as f64).sqrt();
    let rate_sigma = covariance[(1, 1)].sqrt();

    if !(position.iter().all(|v| v.is_finite())
        && rate.iter().all(|v| v.is_finite())
        && rms.is_finite())
    {
        return Err(DaomopError::FitError("non-finite solution".into()));
    }

    Ok(LinearMotion {
        epoch,
        plane,
        position,
        rate,
        rms,
        rate_sigma,
        n_obs: detections.len(),
    })
}

#[cfg(test)]
mod motion_fit_test {
    use super::*;
    use crate::constants::DetectionId;
    use approx::assert_abs_diff_eq;

    fn det(id: u32, ra: f64, dec: f64, mjd: f64) -> Detection {
        Detection {
            id: DetectionId(id),
            exposure_id: format!("e{id}"),
            ra,
            dec,
            mjd,
            mag: 21.5,
            sigma: 0.1,
        }
    }

    #[test]
    fn test_exact_line_has_zero_residual() {
        // 4"/h east, 2"/h north at the equator.
        let dets: Vec<Detection> = (0..4)
            .map(|k| {
                let h = k as f64;
                det(k, 50.0 + 4.0 * h / 3600.0, 2.0 * h / 3600.0, 57000.3 + h / 24.0)
            })
            .collect();
        let refs: Vec<&Detection> = dets.iter().collect();
        let motion = fit_linear_motion(&refs).unwrap();

        assert_abs_diff_eq!(motion.rate.x, 4.0, epsilon = 1e-4);
        assert_abs_diff_eq!(motion.rate.y, 2.0, epsilon = 1e-4);
        assert!(motion.rms < 1e-4);
        assert_eq!(motion.n_obs, 4);

        let (ra, dec) = motion.predict(57000.3 + 5.0 / 24.0);
        assert_abs_diff_eq!(ra, 50.0 + 20.0 / 3600.0, epsilon = 1e-7);
        assert_abs_diff_eq!(dec, 10.0 / 3600.0, epsilon = 1e-7);
    }

    #[test]
    fn test_residual_of_zigzag() {
        let dets = [
            det(0, 80.0, 0.0, 57000.0),
            det(1, 80.0 + 3.0 / 3600.0, 0.5 / 3600.0, 57000.0 + 1.0 / 24.0),
            det(2, 80.0 + 6.0 / 3600.0, 0.0, 57000.0 + 2.0 / 24.0),
        ];
        let refs: Vec<&Detection> = dets.iter().collect();
        let motion = fit_linear_motion(&refs).unwrap();
        assert_abs_diff_eq!(motion.rms, (1.0_f64 / 18.0).sqrt(), epsilon = 1e-4);
    }

    #[test]
    fn test_degenerate_inputs() {
        let a = det(0, 10.0, 0.0, 57000.0);
        let b = det(1, 10.001, 0.0, 57000.0);
        assert!(matches!(
            fit_linear_motion(&[&a]),
            Err(DaomopError::FitError(_))
        ));
        assert!(matches!(
            fit_linear_motion(&[&a, &b]),
            Err(DaomopError::FitError(_))
        ));
    }
}

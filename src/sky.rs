//! # Sky geometry
//!
//! Small set of spherical-astronomy helpers used by the linker, the motion fits and the
//! stationary-source filter.
//!
//! Positions on the sky are mapped onto a **gnomonic (tangent-plane) projection** centered on
//! a reference point. Inside a few degrees of the center the projection is close to
//! Euclidean, so linear motion along a great circle becomes linear motion in `(ξ, η)`.
//!
//! ```text
//!   ξ = cos δ sin(α − α₀) / cos c
//!   η = (cos δ₀ sin δ − sin δ₀ cos δ cos(α − α₀)) / cos c
//!   cos c = sin δ₀ sin δ + cos δ₀ cos δ cos(α − α₀)
//! ```
//!
//! Standard coordinates are returned in **degrees** so they can be compared directly with
//! positional tolerances once converted to arcseconds.
use crate::constants::{ArcSec, Degree, ARCSEC_PER_DEG};

/// Normalize a right ascension into `[0, 360)`.
#[inline]
pub fn normalize_ra(ra: Degree) -> Degree {
    let r = ra.rem_euclid(360.0);
    if r >= 360.0 {
        0.0
    } else {
        r
    }
}

/// Wrap a right-ascension difference into `(-180, 180]`.
#[inline]
pub fn wrap_delta_ra(delta: Degree) -> Degree {
    let d = delta.rem_euclid(360.0);
    if d > 180.0 {
        d - 360.0
    } else {
        d
    }
}

/// Great-circle separation between two positions (haversine form, stable at small angles).
///
/// Arguments
/// -----------------
/// * `ra1`, `dec1`: first position in degrees.
/// * `ra2`, `dec2`: second position in degrees.
///
/// Return
/// ----------
/// * The angular separation in degrees.
pub fn angular_separation(ra1: Degree, dec1: Degree, ra2: Degree, dec2: Degree) -> Degree {
    let (d1, d2) = (dec1.to_radians(), dec2.to_radians());
    let dra = wrap_delta_ra(ra2 - ra1).to_radians();
    let hav = ((d2 - d1) / 2.0).sin().powi(2) + d1.cos() * d2.cos() * (dra / 2.0).sin().powi(2);
    (2.0 * hav.sqrt().min(1.0).asin()).to_degrees()
}

/// Gnomonic projection centered on `(ra0, dec0)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TangentPlane {
    pub ra0: Degree,
    pub dec0: Degree,
}

impl TangentPlane {
    pub fn new(ra0: Degree, dec0: Degree) -> Self {
        TangentPlane {
            ra0: normalize_ra(ra0),
            dec0,
        }
    }

    /// Project a sky position onto the plane.
    ///
    /// Return
    /// ----------
    /// * `Some((ξ, η))` in degrees, or `None` when the position lies 90° or more from the
    ///   tangent point (the projection is undefined there).
    pub fn project(&self, ra: Degree, dec: Degree) -> Option<(Degree, Degree)> {
        let (d0, d) = (self.dec0.to_radians(), dec.to_radians());
        let dra = wrap_delta_ra(ra - self.ra0).to_radians();

        let cos_c = d0.sin() * d.sin() + d0.cos() * d.cos() * dra.cos();
        if cos_c <= 1e-12 {
            return None;
        }

        let xi = d.cos() * dra.sin() / cos_c;
        let eta = (d0.cos() * d.sin() - d0.sin() * d.cos() * dra.cos()) / cos_c;
        Some((xi.to_degrees(), eta.to_degrees()))
    }

    /// Map standard coordinates (degrees) back onto the sphere.
    pub fn deproject(&self, xi: Degree, eta: Degree) -> (Degree, Degree) {
        let (x, y) = (xi.to_radians(), eta.to_radians());
        let d0 = self.dec0.to_radians();

        let denom = d0.cos() - y * d0.sin();
        let ra = self.ra0.to_radians() + x.atan2(denom);
        let dec = (d0.sin() + y * d0.cos()).atan2((x * x + denom * denom).sqrt());
        (normalize_ra(ra.to_degrees()), dec.to_degrees())
    }
}

/// Offset of `(ra2, dec2)` relative to `(ra1, dec1)` on the tangent plane at the first point.
///
/// Return
/// ----------
/// * `(Δξ, Δη)` in arcseconds (east, north), or `None` for antipodal-ish pairs.
pub fn offset_arcsec(
    ra1: Degree,
    dec1: Degree,
    ra2: Degree,
    dec2: Degree,
) -> Option<(ArcSec, ArcSec)> {
    TangentPlane::new(ra1, dec1)
        .project(ra2, dec2)
        .map(|(xi, eta)| (xi * ARCSEC_PER_DEG, eta * ARCSEC_PER_DEG))
}

/// Mean direction of a set of positions (unit-vector average), robust to RA wrap-around.
pub fn mean_position<I>(positions: I) -> Option<(Degree, Degree)>
where
    I: IntoIterator<Item = (Degree, Degree)>,
{
    let (mut x, mut y, mut z, mut n) = (0.0, 0.0, 0.0, 0usize);
    for (ra, dec) in positions {
        let (a, d) = (ra.to_radians(), dec.to_radians());
        x += d.cos() * a.cos();
        y += d.cos() * a.sin();
        z += d.sin();
        n += 1;
    }
    if n == 0 {
        return None;
    }
    let norm = (x * x + y * y + z * z).sqrt();
    if norm < 1e-12 {
        return None;
    }
    let ra = normalize_ra(y.atan2(x).to_degrees());
    let dec = (z / norm).asin().to_degrees();
    Some((ra, dec))
}

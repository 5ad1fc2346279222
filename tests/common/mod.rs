#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use ahash::RandomState;
use daomop::archive::Archive;
use daomop::sky::TangentPlane;
use daomop::DaomopError;
use rand::{rngs::StdRng, Rng, SeedableRng};

pub const FIELD_RA: f64 = 150.0;
pub const FIELD_DEC: f64 = 10.0;
pub const FIRST_MJD: f64 = 57000.35;
pub const EXPOSURES_PER_NIGHT: usize = 3;

/// Moving objects of the synthetic survey: start offset (arcsec) and rate (arcsec/hour) in the
/// field tangent plane, and a magnitude identifying the object.
pub const MOVERS: [((f64, f64), (f64, f64), f64); 3] = [
    ((-600.0, -400.0), (3.0, 1.0), 20.1),
    ((0.0, 300.0), (-2.0, 2.5), 20.2),
    ((500.0, -200.0), (5.0, -1.0), 20.3),
];

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Synthetic exposures: `(exposure id, catalog CSV)`.
#[derive(Debug, Clone)]
pub struct Survey {
    pub exposures: Vec<(String, String)>,
    pub stars: usize,
}

impl Survey {
    pub fn ids(&self) -> Vec<String> {
        self.exposures.iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn catalogs(&self) -> Vec<(&str, &str)> {
        self.exposures
            .iter()
            .map(|(id, body)| (id.as_str(), body.as_str()))
            .collect()
    }

    pub fn detections_per_exposure(&self) -> usize {
        self.stars + MOVERS.len()
    }
}

fn exposure_id(night: usize, k: usize) -> String {
    format!("{}", 1_616_681 + 10 * night + k)
}

/// A field of `stars` fixed sources and the [`MOVERS`], observed `nights` consecutive nights
/// with [`EXPOSURES_PER_NIGHT`] exposures one hour apart.
pub fn survey(nights: usize, stars: usize, seed: u64) -> Survey {
    let mut rng = StdRng::seed_from_u64(seed);
    let plane = TangentPlane::new(FIELD_RA, FIELD_DEC);

    let star_field: Vec<(f64, f64, f64)> = (0..stars)
        .map(|_| {
            let xi = rng.random_range(-900.0..900.0);
            let eta = rng.random_range(-900.0..900.0);
            let (ra, dec) = plane.deproject(xi / 3600.0, eta / 3600.0);
            (ra, dec, rng.random_range(18.0..22.0))
        })
        .collect();

    let mut exposures = Vec::new();
    for night in 0..nights {
        for k in 0..EXPOSURES_PER_NIGHT {
            let hours = 24.0 * night as f64 + k as f64;
            let mjd = FIRST_MJD + hours / 24.0;
            let mut body = String::from("ra,dec,mjd,mag,sigma\n");

            for &(ra, dec, mag) in &star_field {
                let (dra, ddec) = jitter(&mut rng);
                body.push_str(&format!(
                    "{:.9},{:.9},{mjd:.9},{mag:.2},0.1\n",
                    ra + dra / dec.to_radians().cos(),
                    dec + ddec
                ));
            }
            for &((x0, y0), (vx, vy), mag) in &MOVERS {
                let (dx, dy) = jitter(&mut rng);
                let xi = (x0 + vx * hours) / 3600.0;
                let eta = (y0 + vy * hours) / 3600.0;
                let (ra, dec) = plane.deproject(xi + dx, eta + dy);
                body.push_str(&format!("{ra:.9},{dec:.9},{mjd:.9},{mag:.2},0.1\n"));
            }
            exposures.push((exposure_id(night, k), body));
        }
    }
    Survey {
        exposures,
        stars,
    }
}

/// Positional noise of at most 0.05 arcsec per axis, in degrees.
fn jitter(rng: &mut StdRng) -> (f64, f64) {
    (
        rng.random_range(-0.05..0.05) / 3600.0,
        rng.random_range(-0.05..0.05) / 3600.0,
    )
}

/// In-memory archive with injected failures and latency.
#[derive(Debug, Default)]
pub struct FlakyArchive {
    catalogs: HashMap<String, Vec<u8>, RandomState>,
    failures: HashMap<String, u32, RandomState>,
    default_failures: u32,
    latency: Duration,
    calls: Mutex<HashMap<String, u32, RandomState>>,
    total: AtomicU32,
}

impl FlakyArchive {
    pub fn new(catalogs: &[(&str, &str)]) -> Self {
        FlakyArchive {
            catalogs: catalogs
                .iter()
                .map(|(id, body)| (id.to_string(), body.as_bytes().to_vec()))
                .collect(),
            ..FlakyArchive::default()
        }
    }

    /// Every exposure fails its first `n` requests.
    pub fn failing_first(mut self, n: u32) -> Self {
        self.default_failures = n;
        self
    }

    /// `exposure` fails its first `n` requests.
    pub fn failing(mut self, exposure: &str, n: u32) -> Self {
        self.failures.insert(exposure.to_string(), n);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn total_calls(&self) -> u32 {
        self.total.load(Ordering::SeqCst)
    }

    pub fn calls(&self, exposure: &str) -> u32 {
        self.calls
            .lock()
            .unwrap()
            .get(exposure)
            .copied()
            .unwrap_or(0)
    }
}

impl Archive for FlakyArchive {
    async fn fetch_exposure(&self, exposure_id: &str) -> Result<Vec<u8>, DaomopError> {
        self.total.fetch_add(1, Ordering::SeqCst);
        let attempt = {
            let mut calls = self.calls.lock().unwrap();
            let n = calls.entry(exposure_id.to_string()).or_default();
            *n += 1;
            *n
        };
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let Some(body) = self.catalogs.get(exposure_id) else {
            return Err(DaomopError::NotFoundError(exposure_id.to_string()));
        };
        let failures = self
            .failures
            .get(exposure_id)
            .copied()
            .unwrap_or(self.default_failures);
        if attempt <= failures {
            return Err(DaomopError::IoError(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            )));
        }
        Ok(body.clone())
    }
}

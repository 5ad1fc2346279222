//! # Archive access
//!
//! Exposure catalogs live in a remote archive (VOSpace). This module provides:
//!
//! * [`Archive`]: the seam used by the pipeline to obtain the raw bytes of one exposure,
//! * [`VospaceArchive`]: an HTTP implementation resolving `vos:` URIs against a data endpoint,
//! * [`CachedArchive`]: a wrapper adding an [`ExposureCache`] on disk and a [`RetryPolicy`].
//!
//! Exposure identifiers are validated before being turned into URLs or file names: only
//! `[A-Za-z0-9_.-]` is accepted and the first character cannot be a dot.
use std::future::Future;
use std::sync::Arc;

use log::{debug, warn};
use once_cell::sync::OnceCell;
use regex::Regex;
use reqwest::StatusCode;

use crate::daomop_errors::DaomopError;

pub mod cache;
pub mod retry;

pub use cache::ExposureCache;
pub use retry::RetryPolicy;

/// Public data endpoint behind `vos:` URIs.
pub const DEFAULT_VOSPACE_ENDPOINT: &str = "https://www.canfar.net/data/pub/vospace";

/// Location of an exposure catalog relative to the archive base URL.
/// `{exposure}` is replaced by the exposure identifier.
pub const DEFAULT_CATALOG_TEMPLATE: &str = "{exposure}/{exposure}.cat.csv";

static EXPOSURE_ID_RE: OnceCell<Regex> = OnceCell::new();
static VOSPACE_URI_RE: OnceCell<Regex> = OnceCell::new();

fn compiled(
    cell: &'static OnceCell<Regex>,
    pattern: &str,
) -> Result<&'static Regex, DaomopError> {
    cell.get_or_try_init(|| Regex::new(pattern))
        .map_err(|err| DaomopError::InvalidParameter(format!("bad pattern {pattern}: {err}")))
}

/// Check that an exposure identifier is safe to use in a URL and as a file name.
pub fn validate_exposure_id(exposure_id: &str) -> Result<(), DaomopError> {
    let re = compiled(&EXPOSURE_ID_RE, r"^[A-Za-z0-9_][A-Za-z0-9_.-]*$")?;
    if re.is_match(exposure_id) {
        Ok(())
    } else {
        Err(DaomopError::InvalidExposureId(exposure_id.to_string()))
    }
}

/// Turn a `vos:` URI into an HTTP base URL.
///
/// Arguments
/// -----------------
/// * `uri`: `vos:<path>` or `vos://<authority>/<path>`, e.g. `vos:cfis/solar_system/dbimages`.
/// * `endpoint`: the HTTP data endpoint the path is resolved against.
///
/// Return
/// ----------
/// * `<endpoint>/<path>` without trailing slash.
/// * `Err(DaomopError::InvalidVospaceUri)` if the URI is not a `vos:` URI or the path contains
///   characters outside `[A-Za-z0-9_.~-]` or `..` segments.
pub fn resolve_vospace_uri(uri: &str, endpoint: &str) -> Result<String, DaomopError> {
    let re = compiled(
        &VOSPACE_URI_RE,
        r"^vos:(?://[^/]+)?/*(?P<path>[A-Za-z0-9_.~\-]+(?:/[A-Za-z0-9_.~\-]+)*)/*$",
    )?;
    let path = re
        .captures(uri)
        .and_then(|c| c.name("path"))
        .map(|m| m.as_str())
        .ok_or_else(|| DaomopError::InvalidVospaceUri(uri.to_string()))?;
    if path.split('/').any(|segment| segment == "..") {
        return Err(DaomopError::InvalidVospaceUri(uri.to_string()));
    }
    Ok(format!("{}/{}", endpoint.trim_end_matches('/'), path))
}

/// Source of raw exposure catalogs.
pub trait Archive: Send + Sync {
    /// Raw catalog bytes of one exposure.
    ///
    /// Errors:
    /// * [`DaomopError::NotFoundError`] when the archive has no such exposure (not retried),
    /// * any transient error ([`DaomopError::is_transient`]) is eligible for a retry.
    fn fetch_exposure(
        &self,
        exposure_id: &str,
    ) -> impl Future<Output = Result<Vec<u8>, DaomopError>> + Send;
}

impl<A: Archive> Archive for Arc<A> {
    fn fetch_exposure(
        &self,
        exposure_id: &str,
    ) -> impl Future<Output = Result<Vec<u8>, DaomopError>> + Send {
        (**self).fetch_exposure(exposure_id)
    }
}

/// HTTP access to exposure catalogs stored in VOSpace.
#[derive(Debug, Clone)]
pub struct VospaceArchive {
    client: reqwest::Client,
    base_url: String,
    template: String,
}

impl VospaceArchive {
    /// Archive rooted at a `vos:` URI, resolved against the public endpoint.
    pub fn new(uri: &str) -> Result<Self, DaomopError> {
        Self::with_endpoint(uri, DEFAULT_VOSPACE_ENDPOINT)
    }

    pub fn with_endpoint(uri: &str, endpoint: &str) -> Result<Self, DaomopError> {
        Ok(VospaceArchive {
            client: reqwest::Client::new(),
            base_url: resolve_vospace_uri(uri, endpoint)?,
            template: DEFAULT_CATALOG_TEMPLATE.to_string(),
        })
    }

    /// Replace the catalog path template (must contain `{exposure}`).
    pub fn with_template(mut self, template: &str) -> Result<Self, DaomopError> {
        if !template.contains("{exposure}") {
            return Err(DaomopError::InvalidParameter(format!(
                "catalog template {template:?} does not contain {{exposure}}"
            )));
        }
        self.template = template.to_string();
        Ok(self)
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// URL of an exposure's catalog.
    pub fn exposure_url(&self, exposure_id: &str) -> Result<String, DaomopError> {
        validate_exposure_id(exposure_id)?;
        Ok(format!(
            "{}/{}",
            self.base_url,
            self.template.replace("{exposure}", exposure_id)
        ))
    }
}

impl Archive for VospaceArchive {
    async fn fetch_exposure(&self, exposure_id: &str) -> Result<Vec<u8>, DaomopError> {
        let url = self.exposure_url(exposure_id)?;
        debug!("GET {url}");
        let response = self.client.get(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(DaomopError::NotFoundError(exposure_id.to_string()));
        }
        let bytes = response.error_for_status()?.bytes().await?;
        Ok(bytes.to_vec())
    }
}

/// An [`Archive`] with an on-disk cache and retries in front of it.
///
/// A cached exposure is never fetched again. Fetched bytes are written to the cache before
/// being returned; a failing cache write is logged and does not fail the fetch.
#[derive(Debug, Clone)]
pub struct CachedArchive<A> {
    inner: A,
    cache: ExposureCache,
    retry: RetryPolicy,
}

impl<A: Archive> CachedArchive<A> {
    /// Put `cache` and `retry` in front of `inner`.
    ///
    /// Return
    /// ----------
    /// * `Err(DaomopError::InvalidParameter)` if the retry policy is invalid
    ///   (see [`RetryPolicy::validate`]).
    pub fn new(inner: A, cache: ExposureCache, retry: RetryPolicy) -> Result<Self, DaomopError> {
        retry.validate()?;
        Ok(CachedArchive {
            inner,
            cache,
            retry,
        })
    }

    pub fn cache(&self) -> &ExposureCache {
        &self.cache
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }
}

impl<A: Archive> Archive for CachedArchive<A> {
    async fn fetch_exposure(&self, exposure_id: &str) -> Result<Vec<u8>, DaomopError> {
        validate_exposure_id(exposure_id)?;

        match self.cache.read(exposure_id).await {
            Ok(Some(bytes)) => {
                debug!("Exposure {exposure_id} served from cache");
                return Ok(bytes);
            }
            Ok(None) => {}
            Err(err) => warn!("Cache read for exposure {exposure_id} failed: {err}"),
        }

        let bytes = self
            .retry
            .run(exposure_id, |_| self.inner.fetch_exposure(exposure_id))
            .await?;

        if let Err(err) = self.cache.write(exposure_id, &bytes).await {
            warn!("Unable to cache exposure {exposure_id}: {err}");
        }
        Ok(bytes)
    }
}

//! Network fetch and crop.
//!
//! The [`ImageSource`] trait is the network seam: production uses
//! [`HttpSource`] (a pooled, blocking `reqwest` client shared by all
//! workers); tests swap in a mock that serves generated images.
//!
//! ## Fetch modes
//!
//! | Region | Request | Crop |
//! |---|---|---|
//! | [`Region::Direct`] | `{base}/{x,y,w,h}/{size}/0/default.jpg` | none, the server already cut it |
//! | [`Region::Template`] | full page image | local, after clipping to the decoded page |
//!
//! Template regions never go through a region server: the corrected rectangle
//! may extend past the page and only the local crop knows the real extent.
//! Each page is fetched and decoded once per run and shared by every template
//! box on it.
//!
//! ## Failures
//!
//! Transient failures (timeouts, connection errors, 5xx, 429) are retried with
//! exponential backoff up to `max_attempts`. Everything else is permanent and
//! returned immediately.

use crate::config::{ClipPolicy, FetchConfig};
use crate::correction::{GeometryError, PixelRect, Rect, clip_to_extent};
use crate::imaging::{self, CropParams, ImagingError, Quality, RasterImage};
use crate::region::{Region, RegionDescriptor, create_region_url, page_image_url};
use image::DynamicImage;
use reqwest::header::CONTENT_TYPE;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Whether a failed request is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    Transient,
    Permanent,
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchErrorKind::Transient => write!(f, "transient"),
            FetchErrorKind::Permanent => write!(f, "permanent"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} fetch failure for {url} after {attempts} attempt(s): {message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub url: String,
    pub message: String,
    pub attempts: u32,
}

impl FetchError {
    pub fn transient(url: &str, message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::Transient,
            url: url.to_string(),
            message: message.into(),
            attempts: 1,
        }
    }

    pub fn permanent(url: &str, message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::Permanent,
            url: url.to_string(),
            message: message.into(),
            attempts: 1,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == FetchErrorKind::Transient
    }
}

/// Classify a non-success HTTP status.
pub fn classify_status(status: u16) -> FetchErrorKind {
    match status {
        429 | 500..=599 => FetchErrorKind::Transient,
        _ => FetchErrorKind::Permanent,
    }
}

/// Source of raw image bytes, keyed by URL.
///
/// Implementations must be shareable across worker threads.
pub trait ImageSource: Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

impl<T: ImageSource + ?Sized> ImageSource for &T {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        (**self).fetch(url)
    }
}

/// HTTP image source backed by one pooled blocking client.
#[derive(Clone)]
pub struct HttpSource {
    client: reqwest::blocking::Client,
}

impl HttpSource {
    pub fn new(config: &FetchConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { client })
    }
}

fn transport_error(url: &str, err: reqwest::Error) -> FetchError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        FetchError::transient(url, err.to_string())
    } else {
        FetchError::permanent(url, err.to_string())
    }
}

impl ImageSource for HttpSource {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| transport_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError {
                kind: classify_status(status.as_u16()),
                url: url.to_string(),
                message: format!("HTTP {status}"),
                attempts: 1,
            });
        }

        if let Some(content_type) = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            && !content_type.starts_with("image/")
        {
            return Err(FetchError::permanent(
                url,
                format!("unsupported content type {content_type}"),
            ));
        }

        let bytes = response.bytes().map_err(|e| transport_error(url, e))?;
        Ok(bytes.to_vec())
    }
}

/// Bounded exponential backoff for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &FetchConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
        }
    }

    /// Delay before retry number `retry` (1-based): base, 2·base, 4·base, …
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)))
    }
}

/// Fetch `url`, retrying transient failures per `policy`.
///
/// The returned error carries the number of attempts made.
pub fn fetch_with_retry(
    source: &impl ImageSource,
    url: &str,
    policy: &RetryPolicy,
) -> Result<Vec<u8>, FetchError> {
    let mut attempt = 1;
    loop {
        match source.fetch(url) {
            Ok(bytes) => return Ok(bytes),
            Err(mut err) => {
                err.attempts = attempt;
                if !err.is_transient() || attempt >= policy.max_attempts {
                    return Err(err);
                }
                let delay = policy.delay_for(attempt);
                warn!(
                    "{} (attempt {}/{}), retrying in {:.1}s",
                    err.message,
                    attempt,
                    policy.max_attempts,
                    delay.as_secs_f64()
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Geometry(#[from] GeometryError),
    #[error(transparent)]
    Encode(ImagingError),
}

/// A cropped image plus the geometry that was actually cut.
#[derive(Debug, Clone)]
pub struct Extracted {
    pub image: RasterImage,
    /// Final geometry after clipping to the fetched image.
    pub descriptor: RegionDescriptor,
    /// URL the pixels were fetched from.
    pub request_url: String,
}

type PageResult = Result<Arc<DynamicImage>, FetchError>;

/// Decoded page images shared by the template tasks of one run.
///
/// A page is fetched at most once; concurrent requests for the same page wait
/// for the first. Pages announced with [`FetchCropExecutor::expect_page`] are
/// dropped after their last announced use, others live as long as the cache.
#[derive(Default)]
struct PageCache {
    slots: Mutex<HashMap<String, PageSlot>>,
}

#[derive(Default)]
struct PageSlot {
    page: Arc<OnceLock<PageResult>>,
    /// Announced uses not yet released.
    pending: Option<usize>,
}

impl PageCache {
    fn expect(&self, url: &str) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = slots.entry(url.to_string()).or_default();
        slot.pending = Some(slot.pending.unwrap_or(0) + 1);
    }

    fn get_or_fetch(&self, url: &str, fetch: impl FnOnce() -> PageResult) -> PageResult {
        let page = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(&slots.entry(url.to_string()).or_default().page)
        };
        page.get_or_init(fetch).clone()
    }

    fn release(&self, url: &str) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let last_use = match slots.get_mut(url) {
            Some(PageSlot {
                pending: Some(n), ..
            }) if *n > 1 => {
                *n -= 1;
                false
            }
            Some(PageSlot { pending: Some(_), .. }) => true,
            _ => false,
        };
        if last_use {
            slots.remove(url);
        }
    }

    fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Fetches source imagery and produces the final crop for one region.
pub struct FetchCropExecutor<'a, S: ImageSource> {
    source: &'a S,
    retry: RetryPolicy,
    region_size: String,
    quality: Quality,
    clip: ClipPolicy,
    pages: PageCache,
}

impl<'a, S: ImageSource> FetchCropExecutor<'a, S> {
    pub fn new(source: &'a S, fetch: &FetchConfig, clip: ClipPolicy) -> Self {
        Self {
            source,
            retry: RetryPolicy::from_config(fetch),
            region_size: fetch.region_size.clone(),
            quality: Quality::new(fetch.quality),
            clip,
            pages: PageCache::default(),
        }
    }

    /// Announce one upcoming use of a template region's page.
    ///
    /// Each announcement must be matched by one [`release_page`](Self::release_page);
    /// the decoded page is dropped at the last release. Direct regions are ignored.
    pub fn expect_page(&self, region: &Region) {
        if let Region::Template { descriptor, .. } = region {
            self.pages.expect(&page_image_url(descriptor));
        }
    }

    pub fn release_page(&self, region: &Region) {
        if let Region::Template { descriptor, .. } = region {
            self.pages.release(&page_image_url(descriptor));
        }
    }

    /// Pages currently held, fetched or announced.
    pub fn cached_pages(&self) -> usize {
        self.pages.len()
    }

    /// Fetch and crop. Template regions must already be scale-corrected.
    pub fn execute(&self, region: &Region) -> Result<Extracted, ExtractError> {
        match region {
            Region::Direct(descriptor) => {
                let url = create_region_url(descriptor, &self.region_size);
                let img = self.fetch_image(&url)?;
                debug!(url, width = img.width(), height = img.height(), "fetched region");
                let image = imaging::crop_and_encode(
                    &img,
                    &CropParams {
                        rect: None,
                        quality: self.quality,
                    },
                )
                .map_err(ExtractError::Encode)?;
                Ok(Extracted {
                    image,
                    descriptor: descriptor.clone(),
                    request_url: url,
                })
            }
            Region::Template { descriptor, .. } => {
                let url = page_image_url(descriptor);
                let page = self.page(&url)?;
                let rect = clip_to_extent(
                    Rect::from_descriptor(descriptor),
                    Some((page.width(), page.height())),
                    self.clip,
                )?;
                let image = imaging::crop_and_encode(
                    &page,
                    &CropParams {
                        rect: Some(rect),
                        quality: self.quality,
                    },
                )
                .map_err(ExtractError::Encode)?;
                Ok(Extracted {
                    image,
                    descriptor: with_rect(descriptor, rect),
                    request_url: url,
                })
            }
        }
    }

    /// The geometry [`execute`](Self::execute) reports for `region`, rebuilt
    /// for a crop already on disk whose pixel size is `stored`.
    ///
    /// Direct regions report the requested rectangle. Template regions are
    /// clipped the same way `execute` clips them. Under [`ClipPolicy::Shrink`]
    /// the origin never moves, so the stored size is enough; [`ClipPolicy::Shift`]
    /// needs the page size and goes through the page cache.
    pub fn stored_geometry(
        &self,
        region: &Region,
        stored: Option<(u32, u32)>,
    ) -> Result<RegionDescriptor, ExtractError> {
        match region {
            Region::Direct(descriptor) => Ok(descriptor.clone()),
            Region::Template { descriptor, .. } => {
                let extent = match (self.clip, stored) {
                    (ClipPolicy::Shrink, Some((width, height))) => (
                        descriptor.x.saturating_add(width),
                        descriptor.y.saturating_add(height),
                    ),
                    _ => {
                        let page = self.page(&page_image_url(descriptor))?;
                        (page.width(), page.height())
                    }
                };
                let rect =
                    clip_to_extent(Rect::from_descriptor(descriptor), Some(extent), self.clip)?;
                Ok(with_rect(descriptor, rect))
            }
        }
    }

    fn page(&self, url: &str) -> PageResult {
        self.pages.get_or_fetch(url, || {
            let page = self.fetch_image(url)?;
            debug!(url, width = page.width(), height = page.height(), "fetched page");
            Ok(Arc::new(page))
        })
    }

    fn fetch_image(&self, url: &str) -> Result<DynamicImage, FetchError> {
        let bytes = fetch_with_retry(self.source, url, &self.retry)?;
        imaging::decode(&bytes)
            .map_err(|e| FetchError::permanent(url, format!("malformed response body: {e}")))
    }
}

fn with_rect(descriptor: &RegionDescriptor, rect: PixelRect) -> RegionDescriptor {
    RegionDescriptor {
        x: rect.x,
        y: rect.y,
        width: rect.width,
        height: rect.height,
        ..descriptor.clone()
    }
}

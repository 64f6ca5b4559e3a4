// Copyright (C) 2025 the flus authors
//
// This file is part of flus.
//
// flus is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// flus is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even
// the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with flus.  If not, see
// <http://www.gnu.org/licenses/>.

//! # The flus HTTP client
//!
//! Every outgoing request flus makes goes through a [Fetcher]. On top of a plain
//! [reqwest::Client] (with a timeout, a redirect limit, gzip & our User-Agent) it adds:
//!
//! - per-host rate limiting, so that a feed-heavy site isn't hammered during a sync
//! - retries with exponential backoff on transport errors & 5xx responses (a [tower::retry]
//!   [Policy] over the rate-limited [FetchService])
//! - a cap on response body size
//! - response caching in a shared [FileCache]
//!
//! The cache key for a request is the digest of `"GET <url> <accept>"`. Callers choose a
//! [CachePolicy] per request: [CachePolicy::Validity] re-uses a stored response no older than the
//! given duration, while [CachePolicy::Bypass] always goes to the network. Either way, any HTTP
//! response (whatever its status) is stored; transport failures are not.

use std::{
    future::Future,
    num::NonZeroU32,
    ops::Deref,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use flus_cache::{CacheItem, CacheKey, FileCache};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use http::header::{ACCEPT, CONTENT_TYPE};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, IntoError, prelude::*};
use tower::{
    Service, ServiceBuilder, ServiceExt,
    retry::{
        Policy, Retry, RetryLayer,
        backoff::{Backoff, ExponentialBackoff, ExponentialBackoffMaker, MakeBackoff},
    },
    util::rng::HasherRng,
};
use tracing::{debug, instrument, warn};
use url::Url;

use crate::{define_metric, metrics::Sort};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Invalid backoff configuration: {source}"))]
    Backoff {
        source: tower::retry::backoff::InvalidBackoff,
        backtrace: Backtrace,
    },
    #[snafu(display("While reading the response body from {url}: {source}"))]
    Body {
        url: Url,
        source: reqwest::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The response from {url} exceeds the limit of {limit} bytes"))]
    BodyTooLarge {
        url: Url,
        limit: usize,
        backtrace: Backtrace,
    },
    #[snafu(display("Cache error: {source}"))]
    Cache {
        source: flus_cache::file_cache::Error,
    },
    #[snafu(display("{min:?} to {max:?} is not a valid range of durations"))]
    DurationRange {
        min: Duration,
        max: Duration,
        backtrace: Backtrace,
    },
    #[snafu(display("{value} is not a valid Jitter value"))]
    Jitter { value: f64, backtrace: Backtrace },
    #[snafu(display("A cache task failed: {source}"))]
    Join {
        source: tokio::task::JoinError,
        backtrace: Backtrace,
    },
    #[snafu(display("{num} requests per {duration:?} is not a valid rate limit"))]
    RateLimit {
        num: u32,
        duration: Duration,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to create an HTTP client: {source}"))]
    ReqwestClient {
        source: reqwest::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Request to {url} failed: {source}"))]
    Request {
        url: Url,
        source: reqwest::Error,
        backtrace: Backtrace,
    },
}

impl Error {
    /// True if a later attempt at the same request might succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Body { .. } | Error::Request { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         configuration                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A pair of [Duration]s that carries with it the guarantee that the first is less than or equal to
/// the second, and that the second is non-zero
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[serde(try_from = "RawDurationRange")]
pub struct DurationRange {
    min: Duration,
    max: Duration,
}

#[derive(Deserialize)]
struct RawDurationRange {
    min: Duration,
    max: Duration,
}

impl TryFrom<RawDurationRange> for DurationRange {
    type Error = Error;

    fn try_from(raw: RawDurationRange) -> std::result::Result<Self, Self::Error> {
        DurationRange::new(raw.min, raw.max)
    }
}

impl DurationRange {
    pub fn new(min: Duration, max: Duration) -> Result<DurationRange> {
        if min > max || max.is_zero() {
            DurationRangeSnafu { min, max }.fail()
        } else {
            Ok(DurationRange { min, max })
        }
    }
    pub fn lower(&self) -> &Duration {
        &self.min
    }
    pub fn upper(&self) -> &Duration {
        &self.max
    }
}

/// A refinement of [f64] that asserts that it is also in the range [0, 100), as well as being
/// neither infinite nor NaN.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(try_from = "f64")]
pub struct Jitter(f64);

impl TryFrom<f64> for Jitter {
    type Error = Error;

    fn try_from(value: f64) -> std::result::Result<Self, Self::Error> {
        if !value.is_finite() || !(0.0..100.0).contains(&value) {
            JitterSnafu { value }.fail()
        } else {
            Ok(Jitter(value))
        }
    }
}

impl Deref for Jitter {
    type Target = f64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Parameters for an exponential backoff policy
#[derive(Clone, Debug, Deserialize)]
pub struct ExponentialBackoffParameters {
    durations: DurationRange,
    jitter: Jitter,
    #[serde(rename = "num-attempts")]
    num_attempts: usize,
}

impl ExponentialBackoffParameters {
    pub fn new(
        durations: DurationRange,
        jitter: Jitter,
        num_attempts: usize,
    ) -> ExponentialBackoffParameters {
        ExponentialBackoffParameters {
            durations,
            jitter,
            num_attempts,
        }
    }
    pub fn jitter(&self) -> f64 {
        *self.jitter
    }
    pub fn lower(&self) -> &Duration {
        self.durations.lower()
    }
    pub fn num_attempts(&self) -> usize {
        self.num_attempts
    }
    pub fn upper(&self) -> &Duration {
        self.durations.upper()
    }
}

impl Default for ExponentialBackoffParameters {
    fn default() -> Self {
        ExponentialBackoffParameters {
            durations: DurationRange::new(Duration::from_secs(1), Duration::from_secs(3)).unwrap(/* known good */),
            jitter: Jitter::try_from(10.0).unwrap(/* known good */),
            num_attempts: 3,
        }
    }
}

/// Express a rate limit in terms of requests per duration
#[derive(Clone, Debug, Deserialize)]
pub struct RateLimit {
    pub num: u32,
    pub duration: Duration,
}

impl Default for RateLimit {
    fn default() -> Self {
        RateLimit {
            num: 4,
            duration: Duration::from_secs(1),
        }
    }
}

impl RateLimit {
    /// `num` requests per `duration`, allowed to arrive in a burst
    fn quota(&self) -> Result<Quota> {
        let num = NonZeroU32::new(self.num).context(RateLimitSnafu {
            num: self.num,
            duration: self.duration,
        })?;
        Quota::with_period(self.duration / self.num)
            .map(|quota| quota.allow_burst(num))
            .context(RateLimitSnafu {
                num: self.num,
                duration: self.duration,
            })
    }
}

/// [Fetcher] configuration
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    pub timeout: Duration,
    pub max_body_size: usize,
    pub max_redirects: usize,
    pub exponential_backoff: ExponentialBackoffParameters,
    /// Applied per host
    pub rate_limit: RateLimit,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            timeout: Duration::from_secs(20),
            max_body_size: 8 * 1024 * 1024,
            max_redirects: 10,
            exponential_backoff: ExponentialBackoffParameters::default(),
            rate_limit: RateLimit::default(),
        }
    }
}

/// The default User-Agent for outgoing requests
pub fn default_user_agent() -> String {
    format!(
        "flus/{} (+https://flus.io)",
        env!("CARGO_PKG_VERSION")
    )
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Response                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub const ACCEPT_HTML: &str = "text/html,application/xhtml+xml;q=0.9,*/*;q=0.8";
pub const ACCEPT_FEED: &str =
    "application/rss+xml,application/atom+xml,application/rdf+xml;q=0.9,application/xml;q=0.8,text/xml;q=0.8,*/*;q=0.5";

/// An HTTP response, as fetched (or as retrieved from the cache)
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Response {
    /// The final URL, after redirects
    pub url: Url,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
    pub fetched_at: DateTime<Utc>,
    #[serde(skip)]
    pub from_cache: bool,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
    pub fn is_html(&self) -> bool {
        self.content_type.as_ref().is_some_and(|ct| {
            let ct = ct.to_ascii_lowercase();
            ct.starts_with("text/html") || ct.starts_with("application/xhtml+xml")
        })
    }
    /// The body as (lossily decoded) UTF-8
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// How a request should use the response cache
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CachePolicy {
    /// Re-use a cached response no older than this; store fresh responses for this long
    Validity(Duration),
    /// Always go to the network
    Bypass,
}

// How long responses fetched under `CachePolicy::Bypass` are kept
const BYPASS_TTL: Duration = Duration::from_secs(24 * 60 * 60);

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             Fetcher                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

define_metric! { "client.requests",                client_requests,                Sort::IntegralCounter }
define_metric! { "client.errors",                  client_errors,                  Sort::IntegralCounter }
define_metric! { "client.retries",                 client_retries,                 Sort::IntegralCounter }
define_metric! { "client.responses.success",       client_responses_success,       Sort::IntegralCounter }
define_metric! { "client.responses.redirect",      client_responses_redirect,      Sort::IntegralCounter }
define_metric! { "client.responses.client_error",  client_responses_client_error,  Sort::IntegralCounter }
define_metric! { "client.responses.server_error",  client_responses_server_error,  Sort::IntegralCounter }
define_metric! { "client.responses.unknown",       client_responses_unknown,       Sort::IntegralCounter }
define_metric! { "client.cache.hits",              client_cache_hits,              Sort::IntegralCounter }
define_metric! { "client.cache.misses",            client_cache_misses,            Sort::IntegralCounter }

/// A GET request as seen by the [FetchService] stack
#[derive(Clone, Debug)]
pub struct FetchRequest {
    pub url: Url,
    pub accept: String,
}

type HostRateLimiter = DefaultKeyedRateLimiter<String>;

/// The innermost [Service]: wait on the per-host rate limit, then GET one URL
///
/// Rate limiting happens here, beneath the retry layer, so that retries are rate-limited too.
#[derive(Clone)]
pub struct FetchService {
    client: reqwest::Client,
    limiter: Arc<HostRateLimiter>,
    max_body_size: usize,
}

impl Service<FetchRequest> for FetchService {
    type Response = Response;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: FetchRequest) -> Self::Future {
        let client = self.client.clone();
        let limiter = self.limiter.clone();
        let max_body_size = self.max_body_size;
        Box::pin(async move {
            let host = req.url.host_str().unwrap_or("localhost").to_owned();
            limiter.until_key_ready(&host).await;
            client_requests.add(1, &[KeyValue::new("host", host.clone())]);
            let rsp = get_once(&client, &req.url, &req.accept, max_body_size).await?;
            let instrument = match rsp.status {
                200..=299 => client_responses_success.deref(),
                300..=399 => client_responses_redirect.deref(),
                400..=499 => client_responses_client_error.deref(),
                500..=599 => client_responses_server_error.deref(),
                _ => client_responses_unknown.deref(),
            };
            instrument.add(1, &[KeyValue::new("host", host)]);
            debug!("{} returned status {}", req.url, rsp.status);
            Ok(rsp)
        })
    }
}

/// Retry transient failures & 5xx responses with exponential backoff
///
/// [Retry] clones its policy for each request, so `remaining` counts attempts per request.
#[derive(Clone)]
pub struct FetchRetryPolicy {
    backoff: ExponentialBackoff,
    remaining: usize,
}

impl Policy<FetchRequest, Response, Error> for FetchRetryPolicy {
    type Future = <ExponentialBackoff as Backoff>::Future;

    fn retry(
        &mut self,
        req: &mut FetchRequest,
        result: &mut Result<Response>,
    ) -> Option<Self::Future> {
        let retryable = match result {
            Ok(rsp) => rsp.status >= 500,
            Err(err) => err.is_transient(),
        };
        if !retryable || self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        match result {
            Ok(rsp) => debug!("{} returned status {}; retrying", req.url, rsp.status),
            Err(err) => warn!("Request to {} failed ({}); retrying", req.url, err),
        }
        client_retries.add(1, &[]);
        Some(self.backoff.next_backoff())
    }

    fn clone_request(&mut self, req: &FetchRequest) -> Option<FetchRequest> {
        Some(req.clone())
    }
}

/// A rate-limited, retrying, caching HTTP client
pub struct Fetcher {
    service: Retry<FetchRetryPolicy, FetchService>,
    limiter: Arc<HostRateLimiter>,
    cache: Arc<FileCache>,
}

impl std::fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher")
            .field("cache", &self.cache)
            .field("rate_limited_hosts", &self.limiter.len())
            .finish()
    }
}

impl Fetcher {
    pub fn new(config: &Config, user_agent: &str, cache: Arc<FileCache>) -> Result<Fetcher> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .gzip(true)
            .build()
            .context(ReqwestClientSnafu)?;
        let limiter = Arc::new(RateLimiter::keyed(config.rate_limit.quota()?));
        let backoff = ExponentialBackoffMaker::new(
            *config.exponential_backoff.lower(),
            *config.exponential_backoff.upper(),
            config.exponential_backoff.jitter(),
            HasherRng::new(),
        )
        .context(BackoffSnafu)?
        .make_backoff();
        // `num-attempts` counts the first try
        let service = ServiceBuilder::new()
            .layer(RetryLayer::new(FetchRetryPolicy {
                backoff,
                remaining: config.exponential_backoff.num_attempts().saturating_sub(1),
            }))
            .service(FetchService {
                client,
                limiter: limiter.clone(),
                max_body_size: config.max_body_size,
            });
        Ok(Fetcher {
            service,
            limiter,
            cache,
        })
    }
    pub fn cache(&self) -> &Arc<FileCache> {
        &self.cache
    }
    /// The number of hosts for which rate-limiting state is being kept
    pub fn rate_limited_hosts(&self) -> usize {
        self.limiter.len()
    }
    /// Drop rate-limiting state for hosts that haven't been contacted recently
    ///
    /// One entry is kept per host ever contacted; a long-running process should call this
    /// periodically.
    pub fn forget_idle_hosts(&self) {
        let before = self.limiter.len();
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
        debug!(
            "Rate limiter: forgot {} of {} hosts",
            before.saturating_sub(self.limiter.len()),
            before
        );
    }
    /// GET `url`, consulting the cache per `policy`
    #[instrument(skip_all, fields(url = %url))]
    pub async fn get(&self, url: &Url, accept: &str, policy: CachePolicy) -> Result<Response> {
        let key = CacheKey::digest(format!("GET {url} {accept}"));
        if let CachePolicy::Validity(validity) = policy {
            if let Some(rsp) = self.cached(&key, validity).await? {
                debug!("Serving {} from the cache", url);
                client_cache_hits.add(1, &[]);
                return Ok(rsp);
            }
            client_cache_misses.add(1, &[]);
        }
        let rsp = self
            .service
            .clone()
            .oneshot(FetchRequest {
                url: url.clone(),
                accept: accept.to_owned(),
            })
            .await
            .inspect_err(|_| client_errors.add(1, &[]))?;
        let ttl = match policy {
            CachePolicy::Validity(validity) => validity,
            CachePolicy::Bypass => BYPASS_TTL,
        };
        // A response we failed to cache is still a response
        if let Err(err) = self.store(key, &rsp, ttl).await {
            warn!("Failed to cache the response from {}: {}", url, err);
        }
        Ok(rsp)
    }
    async fn cached(&self, key: &CacheKey, validity: Duration) -> Result<Option<Response>> {
        let cache = self.cache.clone();
        let key = key.clone();
        let item: CacheItem<Response> = tokio::task::spawn_blocking(move || cache.get_item(&key))
            .await
            .context(JoinSnafu)?
            .context(CacheSnafu)?;
        let now = Utc::now();
        Ok(item.into_value().and_then(|mut rsp| {
            let fresh = chrono::Duration::from_std(validity)
                .ok()
                .and_then(|validity| rsp.fetched_at.checked_add_signed(validity))
                .is_none_or(|until| until > now);
            fresh.then(|| {
                rsp.from_cache = true;
                rsp
            })
        }))
    }
    async fn store(&self, key: CacheKey, rsp: &Response, ttl: Duration) -> Result<()> {
        let cache = self.cache.clone();
        let mut item = CacheItem::new(key);
        item.set(rsp.clone()).expires_after(Some(ttl));
        tokio::task::spawn_blocking(move || cache.save(&item))
            .await
            .context(JoinSnafu)?
            .context(CacheSnafu)
    }
}

async fn get_once(
    client: &reqwest::Client,
    url: &Url,
    accept: &str,
    max_body_size: usize,
) -> Result<Response> {
    let mut rsp = client
        .get(url.clone())
        .header(ACCEPT, accept)
        .send()
        .await
        .context(RequestSnafu { url: url.clone() })?;
    let fetched_at = Utc::now();
    let final_url = rsp.url().clone();
    let status = rsp.status().as_u16();
    let content_type = rsp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    let too_large = BodyTooLargeSnafu {
        url: url.clone(),
        limit: max_body_size,
    };
    if rsp
        .content_length()
        .is_some_and(|len| len > max_body_size as u64)
    {
        return too_large.fail();
    }
    let mut body = BytesMut::new();
    loop {
        match rsp.chunk().await {
            Ok(Some(chunk)) => {
                ensure!(body.len() + chunk.len() <= max_body_size, too_large);
                body.extend_from_slice(&chunk);
            }
            Ok(None) => break,
            Err(err) => return Err(BodySnafu { url: url.clone() }.into_error(err)),
        }
    }

    Ok(Response {
        url: final_url,
        status,
        content_type,
        body: body.freeze(),
        fetched_at,
        from_cache: false,
    })
}

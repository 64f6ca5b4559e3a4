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

//! # Link fetching
//!
//! A freshly-added link is titled with its own URL & has no other metadata. [LinkFetcher] fills
//! that in by fetching the page & running it through [Metadata::extract]. Whatever happens, the
//! attempt is recorded on the link (`fetched_at`, `fetched_code`, `fetched_error` &
//! `fetched_count`), which is what drives the retry policy in [Link::needs_fetch].

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use futures::{StreamExt, stream};
use serde::Serialize;
use snafu::{Backtrace, prelude::*};
use tracing::{debug, info, instrument};

use crate::{
    client::{ACCEPT_HTML, CachePolicy, Fetcher},
    define_metric,
    dom::Metadata,
    entities::Link,
    metrics::Sort,
    storage::Backend,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Storage error: {source}"))]
    Storage {
        source: crate::storage::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Pages are re-used from the cache for this long
pub const LINK_CACHE_VALIDITY: Duration = Duration::from_secs(24 * 60 * 60);

const SYNC_CONCURRENCY: usize = 4;

define_metric! { "links.fetches",          links_fetches,          Sort::IntegralCounter }
define_metric! { "links.fetch_failures",   links_fetch_failures,   Sort::IntegralCounter }

/// The outcome of a [LinkFetcher::sync]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct SyncReport {
    pub fetched: usize,
    pub failed: usize,
}

pub struct LinkFetcher {
    fetcher: Arc<Fetcher>,
    storage: Arc<dyn Backend + Send + Sync>,
}

impl LinkFetcher {
    pub fn new(fetcher: Arc<Fetcher>, storage: Arc<dyn Backend + Send + Sync>) -> LinkFetcher {
        LinkFetcher { fetcher, storage }
    }
    /// Fetch `link` & return it updated; the caller is responsible for persisting the result
    #[instrument(skip_all, fields(url = %link.url))]
    pub async fn fetch(&self, mut link: Link) -> Link {
        links_fetches.add(1, &[]);
        // A retry after a failure must not be answered with the failure we already recorded
        let policy = if link.fetched_count > 0 && !link.fetched_successfully() {
            CachePolicy::Bypass
        } else {
            CachePolicy::Validity(LINK_CACHE_VALIDITY)
        };
        match self.fetcher.get(&link.url, ACCEPT_HTML, policy).await {
            Ok(rsp) => {
                link.fetched_code = rsp.status;
                if rsp.is_success() {
                    link.fetched_error = None;
                    if rsp.is_html() {
                        let metadata = Metadata::extract(&rsp.text(), &rsp.url);
                        if let Some(title) = metadata.title {
                            link.title = title;
                        }
                        link.reading_time = metadata.reading_time;
                        if metadata.illustration.is_some() {
                            link.image_url = metadata.illustration;
                        }
                        link.url_feeds = metadata.feeds;
                    } else {
                        debug!("Not HTML ({:?}); leaving metadata alone", rsp.content_type);
                    }
                } else {
                    links_fetch_failures.add(1, &[]);
                    link.fetched_error = Some(format!("HTTP status {}", rsp.status));
                }
            }
            Err(err) => {
                links_fetch_failures.add(1, &[]);
                link.fetched_code = 0;
                link.fetched_error = Some(err.to_string());
            }
        }
        link.fetched_at = Some(Utc::now());
        link.fetched_count += 1;
        link
    }
    /// Fetch & persist up to `limit` links in need of fetching
    pub async fn sync(&self, limit: usize) -> Result<SyncReport> {
        let links = self
            .storage
            .links_to_fetch(&Utc::now(), limit)
            .await
            .context(StorageSnafu)?;
        if links.is_empty() {
            return Ok(SyncReport::default());
        }
        let fetched: Vec<Link> = stream::iter(links)
            .map(|link| self.fetch(link))
            .buffer_unordered(SYNC_CONCURRENCY)
            .collect()
            .await;
        let mut report = SyncReport::default();
        for link in fetched {
            if link.fetched_successfully() {
                report.fetched += 1;
            } else {
                report.failed += 1;
            }
            self.storage.update_link(&link).await.context(StorageSnafu)?;
        }
        info!(
            "Link sync: {} fetched, {} failed",
            report.fetched, report.failed
        );
        Ok(report)
    }
}

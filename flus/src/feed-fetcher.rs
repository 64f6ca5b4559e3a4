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

//! # Feed fetching
//!
//! Feeds are mirrored into collections of type [CollectionType::Feed] owned by the support user.
//! [FeedFetcher::fetch] retrieves a feed & folds any new entries into its collection as links;
//! [FeedFetcher::discover] finds the feeds associated with an arbitrary URL.
//!
//! Unchanged feeds are detected by hashing the response body, so a feed that hasn't changed since
//! the last fetch costs neither a parse nor a walk over its collection.
//!
//! [CollectionType::Feed]: crate::entities::CollectionType::Feed

use std::{collections::HashSet, sync::Arc, time::Duration};

use chrono::Utc;
use futures::{StreamExt, stream};
use serde::Serialize;
use sha2::{Digest, Sha256};
use snafu::{Backtrace, prelude::*};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::{
    client::{ACCEPT_FEED, ACCEPT_HTML, CachePolicy, Fetcher, Response},
    define_metric,
    dom::Metadata,
    entities::{Collection, CollectionId, Link},
    feeds::Feed,
    metrics::Sort,
    storage::Backend,
    urls::{absolutize, sanitize},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("While fetching {url}: {source}"))]
    Fetch {
        url: Url,
        source: crate::client::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Collection {id} doesn't mirror a feed"))]
    NotAFeedCollection {
        id: CollectionId,
        backtrace: Backtrace,
    },
    #[snafu(display("Storage error: {source}"))]
    Storage {
        source: crate::storage::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          FeedFetcher                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Feed responses are re-used from the cache for this long
pub const FEED_CACHE_VALIDITY: Duration = Duration::from_secs(60 * 60);

const SYNC_CONCURRENCY: usize = 4;

define_metric! { "feeds.fetches",          feeds_fetches,          Sort::IntegralCounter }
define_metric! { "feeds.fetch_failures",   feeds_fetch_failures,   Sort::IntegralCounter }
define_metric! { "feeds.unchanged",        feeds_unchanged,        Sort::IntegralCounter }
define_metric! { "feeds.new_links",        feeds_new_links,        Sort::IntegralCounter }

/// The outcome of a single [FeedFetcher::fetch]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct FeedReport {
    /// Links created & published
    pub new_links: usize,
    /// Entries already in the collection, or without a usable link
    pub skipped: usize,
    /// The body was identical to the last one processed
    pub unchanged: bool,
}

/// The outcome of a [FeedFetcher::sync]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct SyncReport {
    pub feeds: usize,
    pub failed: usize,
    pub new_links: usize,
}

/// The hex SHA-256 of a response body
fn body_hash(rsp: &Response) -> String {
    hex::encode(Sha256::digest(&rsp.body))
}

pub struct FeedFetcher {
    fetcher: Arc<Fetcher>,
    storage: Arc<dyn Backend + Send + Sync>,
}

impl FeedFetcher {
    pub fn new(fetcher: Arc<Fetcher>, storage: Arc<dyn Backend + Send + Sync>) -> FeedFetcher {
        FeedFetcher { fetcher, storage }
    }
    /// Find the feeds associated with `url`
    ///
    /// If `url` is itself a feed, that's the answer; if it's a web page, the answer is whatever
    /// feeds it advertises.
    #[instrument(skip(self))]
    pub async fn discover(&self, url: &Url) -> Result<Vec<Url>> {
        let rsp = self
            .fetcher
            .get(url, ACCEPT_HTML, CachePolicy::Validity(FEED_CACHE_VALIDITY))
            .await
            .context(FetchSnafu { url: url.clone() })?;
        if !rsp.is_success() {
            debug!("{} returned status {}; no feeds", url, rsp.status);
            return Ok(Vec::new());
        }
        let text = rsp.text();
        if Feed::is_feed(rsp.content_type.as_deref(), &text) {
            Ok(sanitize(rsp.url.as_str()).ok().into_iter().collect())
        } else if rsp.is_html() {
            Ok(Metadata::extract(&text, &rsp.url).feeds)
        } else {
            Ok(Vec::new())
        }
    }
    /// Fetch the feed mirrored by `collection`, record the outcome & fold new entries into it
    ///
    /// Failing to fetch or parse the feed is not an error; it's recorded on the collection.
    #[instrument(skip_all, fields(feed = %collection.id))]
    pub async fn fetch(&self, collection: &Collection) -> Result<FeedReport> {
        let mut collection = collection.clone();
        let mut info = collection
            .feed
            .take()
            .context(NotAFeedCollectionSnafu { id: collection.id })?;
        let now = Utc::now();
        let mut report = FeedReport::default();
        feeds_fetches.add(1, &[]);
        info.fetched_at = Some(now);

        let outcome = self
            .fetcher
            .get(&info.url, ACCEPT_FEED, CachePolicy::Validity(FEED_CACHE_VALIDITY))
            .await;
        let rsp = match outcome {
            Ok(rsp) if rsp.is_success() => rsp,
            Ok(rsp) => {
                feeds_fetch_failures.add(1, &[]);
                info.fetched_code = rsp.status;
                info.fetched_error = Some(format!("HTTP status {}", rsp.status));
                return self.finish(collection, info, report).await;
            }
            Err(err) => {
                feeds_fetch_failures.add(1, &[]);
                info.fetched_code = 0;
                info.fetched_error = Some(err.to_string());
                return self.finish(collection, info, report).await;
            }
        };
        info.fetched_code = rsp.status;

        let hash = body_hash(&rsp);
        if info.last_hash.as_deref() == Some(hash.as_str()) {
            debug!("{} is unchanged", info.url);
            feeds_unchanged.add(1, &[]);
            info.fetched_error = None;
            report.unchanged = true;
            return self.finish(collection, info, report).await;
        }

        let feed = match Feed::parse(&rsp.text()) {
            Ok(feed) => feed,
            Err(err) => {
                feeds_fetch_failures.add(1, &[]);
                info.fetched_error = Some(err.to_string());
                return self.finish(collection, info, report).await;
            }
        };
        info.fetched_error = None;
        info.last_hash = Some(hash);

        if let Some(title) = feed.title.filter(|title| !title.is_empty()) {
            collection.name = title;
        }
        if let Some(description) = feed.description {
            collection.description = description;
        }
        if let Some(site_url) = feed
            .link
            .as_deref()
            .and_then(|link| absolutize(&rsp.url, link))
            .and_then(|url| sanitize(url.as_str()).ok())
        {
            info.site_url = Some(site_url);
        }
        // Follow permanent moves, unless that would collide with another feed
        if let Ok(final_url) = sanitize(rsp.url.as_str()) {
            if final_url != info.url
                && self
                    .storage
                    .feed_for_url(&final_url)
                    .await
                    .context(StorageSnafu)?
                    .is_none()
            {
                info!("Feed {} has moved to {}", info.url, final_url);
                info.url = final_url;
            }
        }

        let mut known: HashSet<Url> = self
            .storage
            .publications_in(&collection.id)
            .await
            .context(StorageSnafu)?
            .into_iter()
            .map(|(_, link)| link.url)
            .collect();
        for entry in feed.entries {
            let Some(url) = entry
                .link
                .as_deref()
                .and_then(|link| absolutize(&rsp.url, link))
                .and_then(|url| sanitize(url.as_str()).ok())
            else {
                report.skipped += 1;
                continue;
            };
            if !known.insert(url.clone()) {
                report.skipped += 1;
                continue;
            }
            let mut link = Link::new(collection.user_id, url);
            if let Some(title) = entry.title.filter(|title| !title.trim().is_empty()) {
                link.title = title.trim().to_owned();
            }
            self.storage.add_link(&link).await.context(StorageSnafu)?;
            self.storage
                .publish(&link.id, &collection.id, &entry.published_at.unwrap_or(now))
                .await
                .context(StorageSnafu)?;
            report.new_links += 1;
        }
        feeds_new_links.add(report.new_links as u64, &[]);

        self.finish(collection, info, report).await
    }
    async fn finish(
        &self,
        mut collection: Collection,
        info: crate::entities::FeedInfo,
        report: FeedReport,
    ) -> Result<FeedReport> {
        if let Some(error) = &info.fetched_error {
            warn!("Fetching {} failed: {}", info.url, error);
        }
        collection.feed = Some(info);
        self.storage
            .update_collection(&collection)
            .await
            .context(StorageSnafu)?;
        Ok(report)
    }
    /// Fetch up to `limit` feeds not fetched since `before`
    pub async fn sync(&self, before: &chrono::DateTime<Utc>, limit: usize) -> Result<SyncReport> {
        let feeds = self
            .storage
            .feeds_to_fetch(before, limit)
            .await
            .context(StorageSnafu)?;
        let outcomes: Vec<(Collection, Result<FeedReport>)> = stream::iter(feeds)
            .map(|feed| async move {
                let outcome = self.fetch(&feed).await;
                (feed, outcome)
            })
            .buffer_unordered(SYNC_CONCURRENCY)
            .collect()
            .await;
        let mut report = SyncReport::default();
        for (feed, outcome) in outcomes {
            report.feeds += 1;
            match outcome {
                Ok(feed_report) => report.new_links += feed_report.new_links,
                Err(err) => {
                    warn!("Failed to sync feed {}: {}", feed.id, err);
                    report.failed += 1;
                }
            }
        }
        info!(
            "Feed sync: {} feeds, {} new links, {} failures",
            report.feeds, report.new_links, report.failed
        );
        Ok(report)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    use crate::{
        client::test::test_fetcher,
        entities::{User, Username},
        memory::Store,
    };

    fn rss(base: &str, items: &[(&str, &str)]) -> String {
        let items: String = items
            .iter()
            .map(|(slug, title)| {
                format!(
                    "<item><title>{title}</title><link>{base}/posts/{slug}</link>\
                     <pubDate>Mon, 02 Jun 2025 10:00:00 GMT</pubDate></item>"
                )
            })
            .collect();
        format!(
            r#"<?xml version="1.0"?><rss version="2.0"><channel><title>The Blog</title>
<link>{base}/</link><description>Posts</description>{items}</channel></rss>"#
        )
    }

    async fn setup() -> (MockServer, tempfile::TempDir, Arc<Store>, User, FeedFetcher) {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::new());
        let support = User::new(Username::new("flus").unwrap());
        store.add_user(&support).await.unwrap();
        let fetcher = FeedFetcher::new(Arc::new(test_fetcher(dir.path())), store.clone());
        (server, dir, store, support, fetcher)
    }

    #[tokio::test]
    async fn new_entries_become_links() {
        let (server, _dir, store, support, fetcher) = setup().await;
        let base = server.uri();
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(rss(&base, &[("one", "First"), ("two", "Second"), ("one", "Dupe")]), "application/rss+xml"),
            )
            .mount(&server)
            .await;

        let feed = Collection::new_feed(
            support.id,
            Url::parse(&format!("{base}/feed.xml")).unwrap(),
        );
        store.add_collection(&feed).await.unwrap();

        let report = fetcher.fetch(&feed).await.unwrap();
        assert_eq!(
            report,
            FeedReport {
                new_links: 2,
                skipped: 1,
                unchanged: false
            }
        );
        let updated = store.collection(&feed.id).await.unwrap().unwrap();
        assert_eq!(updated.name, "The Blog");
        assert_eq!(updated.description, "Posts");
        let info = updated.feed.as_ref().unwrap();
        assert_eq!(info.fetched_code, 200);
        assert!(info.last_hash.is_some());
        assert_eq!(info.site_url.as_ref().unwrap().as_str(), format!("{base}/"));

        let links = store.publications_in(&feed.id).await.unwrap();
        let mut titles: Vec<String> = links.iter().map(|(_, l)| l.title.clone()).collect();
        titles.sort();
        assert_eq!(titles, vec!["First", "Second"]);
        assert!(links.iter().all(|(_, l)| l.user_id == support.id && l.fetched_at.is_none()));

        // The second fetch sees the same body
        let report = fetcher.fetch(&updated).await.unwrap();
        assert!(report.unchanged);
        assert_eq!(store.publications_in(&feed.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failures_are_recorded() {
        let (server, _dir, store, support, fetcher) = setup().await;
        Mock::given(method("GET"))
            .and(path("/missing.xml"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/garbage.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>not a feed</html>"))
            .mount(&server)
            .await;

        for (p, code) in [("missing.xml", 404), ("garbage.xml", 200)] {
            let feed = Collection::new_feed(
                support.id,
                Url::parse(&format!("{}/{p}", server.uri())).unwrap(),
            );
            store.add_collection(&feed).await.unwrap();
            let report = fetcher.fetch(&feed).await.unwrap();
            assert_eq!(report.new_links, 0);
            let info = store
                .collection(&feed.id)
                .await
                .unwrap()
                .unwrap()
                .feed
                .unwrap();
            assert_eq!(info.fetched_code, code);
            assert!(info.fetched_error.is_some());
            assert!(info.fetched_at.is_some());
            assert!(info.last_hash.is_none());
        }

        let plain = Collection::new_default(support.id, crate::entities::CollectionType::News);
        assert!(matches!(
            fetcher.fetch(&plain).await,
            Err(Error::NotAFeedCollection { .. })
        ));
    }

    #[tokio::test]
    async fn moved_feeds_follow_redirects() {
        let (server, _dir, store, support, fetcher) = setup().await;
        let base = server.uri();
        Mock::given(method("GET"))
            .and(path("/old.xml"))
            .respond_with(
                ResponseTemplate::new(301).insert_header("location", format!("{base}/new.xml")),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/new.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(rss(&base, &[("a", "A")])))
            .mount(&server)
            .await;

        let feed = Collection::new_feed(support.id, Url::parse(&format!("{base}/old.xml")).unwrap());
        store.add_collection(&feed).await.unwrap();
        fetcher.fetch(&feed).await.unwrap();
        let updated = store.collection(&feed.id).await.unwrap().unwrap();
        assert_eq!(
            updated.feed_url().unwrap().as_str(),
            format!("{base}/new.xml")
        );
    }

    #[tokio::test]
    async fn discovery() {
        let (server, _dir, _store, _support, fetcher) = setup().await;
        let base = server.uri();
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(
                        r#"<html><head><link rel="alternate" type="application/rss+xml" href="/feed.xml"></head></html>"#,
                        "text/html",
                    ),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(rss(&base, &[]), "application/rss+xml"),
            )
            .mount(&server)
            .await;

        let found = fetcher
            .discover(&Url::parse(&format!("{base}/")).unwrap())
            .await
            .unwrap();
        assert_eq!(
            found.iter().map(|u| u.as_str()).collect::<Vec<_>>(),
            vec![format!("{base}/feed.xml")]
        );
        let found = fetcher
            .discover(&Url::parse(&format!("{base}/feed.xml")).unwrap())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        let found = fetcher
            .discover(&Url::parse(&format!("{base}/nothing")).unwrap())
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn sync_fetches_stale_feeds() {
        let (server, _dir, store, support, fetcher) = setup().await;
        let base = server.uri();
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(rss(&base, &[("x", "X")])))
            .expect(1)
            .mount(&server)
            .await;
        let feed = Collection::new_feed(support.id, Url::parse(&format!("{base}/feed.xml")).unwrap());
        store.add_collection(&feed).await.unwrap();

        let report = fetcher.sync(&Utc::now(), 10).await.unwrap();
        assert_eq!(
            report,
            SyncReport {
                feeds: 1,
                failed: 0,
                new_links: 1
            }
        );
        // Fetched just now, so not stale as of an hour ago
        let report = fetcher
            .sync(&(Utc::now() - chrono::Duration::hours(1)), 10)
            .await
            .unwrap();
        assert_eq!(report.feeds, 0);
    }
}

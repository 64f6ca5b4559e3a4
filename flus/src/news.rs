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

//! # News
//!
//! A user's news is a digest of suggested links drawn from three sources, in order of precedence:
//!
//! 1. their own bookmarks (oldest first)
//! 2. recent publications in collections they follow
//! 3. recent publications in public collections sharing a topic with their interests
//!
//! [NewsPicker::pick] assembles the suggestions; [NewsPicker::fill_news] moves them into the user's
//! News collection.

use std::{collections::HashSet, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, prelude::*};
use tracing::{debug, info, instrument};
use url::Url;

use crate::{
    define_metric,
    entities::{Collection, CollectionType, Link, User, UserId, Via},
    metrics::Sort,
    storage::Backend,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("User {user} has no {ctype} collection"))]
    NoDefaultCollection {
        user: UserId,
        ctype: CollectionType,
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
//                                         configuration                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Knobs governing news selection
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct NewsConfig {
    /// Never suggest more than this many links
    pub max_links: usize,
    /// Only consider links published within this window (bookmarks are exempt)
    pub since: Duration,
    /// Skip links that take longer than this many minutes to read
    pub max_reading_time: Option<u32>,
}

impl Default for NewsConfig {
    fn default() -> Self {
        NewsConfig {
            max_links: 50,
            since: Duration::from_secs(3 * 24 * 60 * 60),
            max_reading_time: None,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           NewsPicker                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

define_metric! { "news.suggestions", news_suggestions, Sort::IntegralCounter }
define_metric! { "news.filled",      news_filled,      Sort::IntegralCounter }

/// A link suggested for a user's news
#[derive(Clone, Debug, Serialize)]
pub struct Suggestion {
    pub link: Link,
    pub published_at: DateTime<Utc>,
    pub via: Via,
}

/// URLs the user has already dealt with, one way or another
struct Seen {
    handled: HashSet<Url>,
    bookmarked: HashSet<Url>,
}

pub struct NewsPicker {
    storage: Arc<dyn Backend + Send + Sync>,
}

impl NewsPicker {
    pub fn new(storage: Arc<dyn Backend + Send + Sync>) -> NewsPicker {
        NewsPicker { storage }
    }
    async fn default_collection(&self, user: &UserId, ctype: CollectionType) -> Result<Collection> {
        self.storage
            .collection_of_type(user, ctype)
            .await
            .context(StorageSnafu)?
            .context(NoDefaultCollectionSnafu { user: *user, ctype })
    }
    async fn urls_in(&self, collection: &Collection) -> Result<HashSet<Url>> {
        Ok(self
            .storage
            .publications_in(&collection.id)
            .await
            .context(StorageSnafu)?
            .into_iter()
            .map(|(_, link)| link.url)
            .collect())
    }
    async fn seen(&self, user: &UserId) -> Result<Seen> {
        let mut handled = HashSet::new();
        for ctype in [CollectionType::News, CollectionType::Read, CollectionType::Never] {
            let collection = self.default_collection(user, ctype).await?;
            handled.extend(self.urls_in(&collection).await?);
        }
        let bookmarks = self.default_collection(user, CollectionType::Bookmarks).await?;
        let bookmarked = self.urls_in(&bookmarks).await?;
        Ok(Seen {
            handled,
            bookmarked,
        })
    }
    /// Recent, visible publications in `collection` that `user` hasn't seen
    async fn recent_in(
        &self,
        user: &User,
        collection: &Collection,
        cutoff: &DateTime<Utc>,
        options: &NewsConfig,
        seen: &Seen,
        via: Via,
    ) -> Result<Vec<Suggestion>> {
        let owned = collection.user_id == user.id;
        Ok(self
            .storage
            .publications_in(&collection.id)
            .await
            .context(StorageSnafu)?
            .into_iter()
            .filter(|(publication, link)| {
                publication.published_at >= *cutoff
                    && !(link.is_hidden && !owned)
                    && link.user_id != user.id
                    && !seen.handled.contains(&link.url)
                    && !seen.bookmarked.contains(&link.url)
                    && fits(link, options)
            })
            .map(|(publication, link)| Suggestion {
                link,
                published_at: publication.published_at,
                via,
            })
            .collect())
    }
    /// Gather news suggestions for `user`
    #[instrument(skip_all, fields(user = %user.username))]
    pub async fn pick(&self, user: &User, options: &NewsConfig) -> Result<Vec<Suggestion>> {
        let seen = self.seen(&user.id).await?;
        let cutoff = chrono::Duration::from_std(options.since)
            .ok()
            .and_then(|since| Utc::now().checked_sub_signed(since))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let bookmarks = self
            .default_collection(&user.id, CollectionType::Bookmarks)
            .await?;
        let from_bookmarks = self
            .storage
            .publications_in(&bookmarks.id)
            .await
            .context(StorageSnafu)?
            .into_iter()
            .rev()
            .filter(|(_, link)| !seen.handled.contains(&link.url) && fits(link, options))
            .map(|(publication, link)| Suggestion {
                link,
                published_at: publication.published_at,
                via: Via::Bookmarks,
            })
            .unique_by(|s| s.link.url.clone())
            .collect::<Vec<_>>();

        let mut from_followed = Vec::new();
        for (_, collection) in self
            .storage
            .followed_collections(&user.id)
            .await
            .context(StorageSnafu)?
        {
            from_followed.extend(
                self.recent_in(
                    user,
                    &collection,
                    &cutoff,
                    options,
                    &seen,
                    Via::Followed(collection.id),
                )
                .await?,
            );
        }

        let mut from_topics = Vec::new();
        for collection in self
            .storage
            .public_collections_for_topics(&user.interests)
            .await
            .context(StorageSnafu)?
            .into_iter()
            .filter(|c| c.user_id != user.id)
        {
            // Stable choice among the shared topics
            let Some(topic) = collection.topics.intersection(&user.interests).min().copied()
            else {
                continue;
            };
            from_topics.extend(
                self.recent_in(user, &collection, &cutoff, options, &seen, Via::Topic(topic))
                    .await?,
            );
        }

        let by_recency = |a: &Suggestion, b: &Suggestion| b.published_at.cmp(&a.published_at);
        from_followed.sort_by(by_recency);
        from_topics.sort_by(by_recency);
        let mut others = from_followed
            .into_iter()
            .chain(from_topics)
            .unique_by(|s| s.link.url.clone())
            .collect::<Vec<_>>();
        others.sort_by(by_recency);

        let mut suggestions = from_bookmarks;
        suggestions.extend(others);
        suggestions.truncate(options.max_links);
        debug!("Picked {} suggestions", suggestions.len());
        news_suggestions.add(suggestions.len() as u64, &[]);
        Ok(suggestions)
    }
    /// Move `user`'s current suggestions into their News collection; returns the links added
    #[instrument(skip_all, fields(user = %user.username))]
    pub async fn fill_news(&self, user: &User, options: &NewsConfig) -> Result<Vec<Link>> {
        let news = self.default_collection(&user.id, CollectionType::News).await?;
        let bookmarks = self
            .default_collection(&user.id, CollectionType::Bookmarks)
            .await?;
        let now = Utc::now();
        let mut added = Vec::new();
        for suggestion in self.pick(user, options).await? {
            let link = match suggestion.via {
                Via::Bookmarks => {
                    self.storage
                        .unpublish(&suggestion.link.id, &bookmarks.id)
                        .await
                        .context(StorageSnafu)?;
                    suggestion.link
                }
                via => self.own_copy(user, &suggestion.link, via).await?,
            };
            self.storage
                .publish(&link.id, &news.id, &now)
                .await
                .context(StorageSnafu)?;
            added.push(link);
        }
        info!("Added {} links to the news of {}", added.len(), user.username);
        news_filled.add(added.len() as u64, &[]);
        Ok(added)
    }
    /// `user`'s own link for `link`'s URL, created if need be
    async fn own_copy(&self, user: &User, link: &Link, via: Via) -> Result<Link> {
        match self
            .storage
            .link_for_url(&user.id, &link.url)
            .await
            .context(StorageSnafu)?
        {
            Some(mut existing) => {
                existing.via = Some(via);
                self.storage
                    .update_link(&existing)
                    .await
                    .context(StorageSnafu)?;
                Ok(existing)
            }
            None => {
                let copy = link.copy_for(user.id, Some(via));
                self.storage.add_link(&copy).await.context(StorageSnafu)?;
                Ok(copy)
            }
        }
    }
}

fn fits(link: &Link, options: &NewsConfig) -> bool {
    options
        .max_reading_time
        .is_none_or(|max| link.reading_time <= max)
}

#[cfg(test)]
mod test {
    use super::*;

    use chrono::Duration;

    use crate::{
        entities::{Topic, Username},
        memory::Store,
    };

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    async fn add_user(store: &Store, name: &str) -> User {
        let user = User::new(Username::new(name).unwrap());
        store.add_user(&user).await.unwrap();
        for ctype in CollectionType::DEFAULTS {
            store
                .add_collection(&Collection::new_default(user.id, ctype))
                .await
                .unwrap();
        }
        user
    }

    async fn publish(store: &Store, collection: &Collection, link: Link, at: DateTime<Utc>) -> Link {
        store.add_link(&link).await.unwrap();
        store.publish(&link.id, &collection.id, &at).await.unwrap();
        link
    }

    async fn default_of(store: &Store, user: &User, ctype: CollectionType) -> Collection {
        store
            .collection_of_type(&user.id, ctype)
            .await
            .unwrap()
            .unwrap()
    }

    /// alice bookmarks a & b, has read r, follows bob's picks & is interested in carol's topic
    async fn scenario() -> (Arc<Store>, User, Collection) {
        let store = Arc::new(Store::new());
        let now = Utc::now();
        let rust = Topic::new("rust");
        store.add_topic(&rust).await.unwrap();

        let mut alice = add_user(&store, "alice").await;
        alice.interests.insert(rust.id);
        store.update_user(&alice).await.unwrap();
        let bob = add_user(&store, "bob").await;
        let carol = add_user(&store, "carol").await;

        let bookmarks = default_of(&store, &alice, CollectionType::Bookmarks).await;
        let read = default_of(&store, &alice, CollectionType::Read).await;
        publish(&store, &bookmarks, Link::new(alice.id, url("https://a.com/")), now - Duration::hours(2)).await;
        publish(&store, &bookmarks, Link::new(alice.id, url("https://b.com/")), now - Duration::hours(1)).await;
        publish(&store, &read, Link::new(alice.id, url("https://r.com/")), now).await;

        let picks = Collection::new(bob.id, "Picks", "", CollectionType::Collection, true);
        store.add_collection(&picks).await.unwrap();
        store.follow(&alice.id, &picks.id).await.unwrap();
        publish(&store, &picks, Link::new(bob.id, url("https://c.com/")), now - Duration::minutes(30)).await;
        publish(&store, &picks, Link::new(bob.id, url("https://r.com/")), now - Duration::minutes(10)).await;
        publish(&store, &picks, Link::new(bob.id, url("https://a.com/")), now - Duration::minutes(10)).await;
        publish(&store, &picks, Link::new(bob.id, url("https://old.com/")), now - Duration::days(5)).await;
        let mut hidden = Link::new(bob.id, url("https://hidden.com/"));
        hidden.is_hidden = true;
        publish(&store, &picks, hidden, now - Duration::minutes(10)).await;
        let mut long = Link::new(bob.id, url("https://long.com/"));
        long.reading_time = 100;
        publish(&store, &picks, long, now - Duration::minutes(10)).await;

        let mut topical = Collection::new(carol.id, "Rust", "", CollectionType::Collection, true);
        topical.topics.insert(rust.id);
        store.add_collection(&topical).await.unwrap();
        publish(&store, &topical, Link::new(carol.id, url("https://d.com/")), now - Duration::minutes(20)).await;
        publish(&store, &topical, Link::new(carol.id, url("https://c.com/")), now - Duration::minutes(5)).await;

        (store, alice, picks)
    }

    fn options() -> NewsConfig {
        NewsConfig {
            max_reading_time: Some(60),
            ..NewsConfig::default()
        }
    }

    #[tokio::test]
    async fn picking() {
        let (store, alice, picks) = scenario().await;
        let picker = NewsPicker::new(store.clone());
        let suggestions = picker.pick(&alice, &options()).await.unwrap();
        assert_eq!(
            suggestions
                .iter()
                .map(|s| s.link.url.as_str())
                .collect::<Vec<_>>(),
            vec!["https://a.com/", "https://b.com/", "https://d.com/", "https://c.com/"]
        );
        assert_eq!(suggestions[0].via, Via::Bookmarks);
        assert!(matches!(suggestions[2].via, Via::Topic(_)));
        assert_eq!(suggestions[3].via, Via::Followed(picks.id));

        let few = picker
            .pick(
                &alice,
                &NewsConfig {
                    max_links: 3,
                    ..options()
                },
            )
            .await
            .unwrap();
        assert_eq!(few.len(), 3);

        // Without a reading-time cap, the long link shows up
        let all = picker.pick(&alice, &NewsConfig::default()).await.unwrap();
        assert!(all.iter().any(|s| s.link.url.as_str() == "https://long.com/"));
    }

    #[tokio::test]
    async fn filling() {
        let (store, alice, picks) = scenario().await;
        let picker = NewsPicker::new(store.clone());
        let added = picker.fill_news(&alice, &options()).await.unwrap();
        assert_eq!(added.len(), 4);
        assert!(added.iter().all(|l| l.user_id == alice.id));

        let bookmarks = default_of(&store, &alice, CollectionType::Bookmarks).await;
        assert!(store.publications_in(&bookmarks.id).await.unwrap().is_empty());
        let news = default_of(&store, &alice, CollectionType::News).await;
        assert_eq!(store.publications_in(&news.id).await.unwrap().len(), 4);

        let copied = store
            .link_for_url(&alice.id, &url("https://c.com/"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(copied.via, Some(Via::Followed(picks.id)));

        // Everything suggested has now been handled
        assert!(picker.pick(&alice, &options()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_defaults() {
        let store = Arc::new(Store::new());
        let loner = User::new(Username::new("loner").unwrap());
        store.add_user(&loner).await.unwrap();
        let picker = NewsPicker::new(store);
        assert!(matches!(
            picker.pick(&loner, &NewsConfig::default()).await,
            Err(Error::NoDefaultCollection { .. })
        ));
    }

    #[test]
    fn config_from_toml() {
        let config: NewsConfig = toml::from_str(
            r#"max-links = 10
max-reading-time = 15
"#,
        )
        .unwrap();
        assert_eq!(config.max_links, 10);
        assert_eq!(config.max_reading_time, Some(15));
        assert_eq!(config.since, NewsConfig::default().since);
    }
}

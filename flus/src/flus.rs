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

//! # The flus application
//!
//! [Flus] ties the storage layer, the fetch pipeline, the news picker & the exporter together into
//! the operations a user actually performs: saving links, following feeds, commenting, and so on.

use std::sync::Arc;

use chrono::Utc;
use snafu::{Backtrace, prelude::*};
use tap::Pipe;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::{
    client::Fetcher,
    entities::{Collection, CollectionId, CollectionType, Link, LinkId, Message, User, Username},
    exportation::Exporter,
    feed_fetcher::FeedFetcher,
    link_fetcher::LinkFetcher,
    news::{NewsConfig, NewsPicker, Suggestion},
    opml,
    storage::Backend,
    urls::sanitize,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to export user data: {source}"))]
    Export {
        #[snafu(backtrace)]
        source: crate::exportation::Error,
    },
    #[snafu(display("Feed error: {source}"))]
    Feed {
        #[snafu(backtrace)]
        source: crate::feed_fetcher::Error,
    },
    #[snafu(display("News error: {source}"))]
    News {
        #[snafu(backtrace)]
        source: crate::news::Error,
    },
    #[snafu(display("No feed could be found at {url}"))]
    NoFeedFound { url: Url, backtrace: Backtrace },
    #[snafu(display("No collection with id {id}"))]
    NoSuchCollection {
        id: CollectionId,
        backtrace: Backtrace,
    },
    #[snafu(display("No link with id {id}"))]
    NoSuchLink { id: LinkId, backtrace: Backtrace },
    #[snafu(display("No user named {username}"))]
    NoSuchUser {
        username: Username,
        backtrace: Backtrace,
    },
    #[snafu(display("Collection {id} doesn't belong to {username}"))]
    NotOwner {
        id: CollectionId,
        username: Username,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to parse OPML: {source}"))]
    Opml {
        source: crate::opml::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Storage error: {source}"))]
    Storage {
        source: crate::storage::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Bad URL: {source}"))]
    Url {
        source: crate::urls::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("User {username} has no {ctype} collection"))]
    NoDefaultCollection {
        username: Username,
        ctype: CollectionType,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              Flus                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

pub struct Flus {
    storage: Arc<dyn Backend + Send + Sync>,
    fetcher: Arc<Fetcher>,
    links: LinkFetcher,
    feeds: FeedFetcher,
    news: NewsPicker,
    exporter: Exporter,
    news_config: NewsConfig,
    support: User,
}

impl Flus {
    /// Assemble the application, creating the support user (who owns every feed collection) if
    /// this is a fresh store
    pub async fn new(
        storage: Arc<dyn Backend + Send + Sync>,
        fetcher: Arc<Fetcher>,
        support_user: &Username,
        news_config: NewsConfig,
    ) -> Result<Flus> {
        let support = ensure_user(storage.as_ref(), support_user).await?;
        Ok(Flus {
            links: LinkFetcher::new(fetcher.clone(), storage.clone()),
            feeds: FeedFetcher::new(fetcher.clone(), storage.clone()),
            news: NewsPicker::new(storage.clone()),
            exporter: Exporter::new(storage.clone()),
            storage,
            fetcher,
            news_config,
            support,
        })
    }
    pub fn storage(&self) -> &Arc<dyn Backend + Send + Sync> {
        &self.storage
    }
    pub fn fetcher(&self) -> &Arc<Fetcher> {
        &self.fetcher
    }
    pub fn link_fetcher(&self) -> &LinkFetcher {
        &self.links
    }
    pub fn feed_fetcher(&self) -> &FeedFetcher {
        &self.feeds
    }
    pub fn support_user(&self) -> &User {
        &self.support
    }

    // Users
    /// Create a user along with their default collections
    pub async fn add_user(&self, username: &Username) -> Result<User> {
        let user = User::new(username.clone());
        self.storage.add_user(&user).await.context(StorageSnafu)?;
        add_default_collections(self.storage.as_ref(), &user).await?;
        info!("Created user {}", user.username);
        Ok(user)
    }
    pub async fn user(&self, username: &Username) -> Result<User> {
        self.storage
            .user_for_name(username)
            .await
            .context(StorageSnafu)?
            .context(NoSuchUserSnafu {
                username: username.clone(),
            })
    }

    // Collections
    pub async fn add_collection(
        &self,
        user: &User,
        name: &str,
        description: &str,
        is_public: bool,
    ) -> Result<Collection> {
        let collection = Collection::new(
            user.id,
            name,
            description,
            CollectionType::Collection,
            is_public,
        );
        self.storage
            .add_collection(&collection)
            .await
            .context(StorageSnafu)?;
        Ok(collection)
    }
    async fn collection(&self, id: &CollectionId) -> Result<Collection> {
        self.storage
            .collection(id)
            .await
            .context(StorageSnafu)?
            .context(NoSuchCollectionSnafu { id: *id })
    }
    async fn default_collection(&self, user: &User, ctype: CollectionType) -> Result<Collection> {
        self.storage
            .collection_of_type(&user.id, ctype)
            .await
            .context(StorageSnafu)?
            .context(NoDefaultCollectionSnafu {
                username: user.username.clone(),
                ctype,
            })
    }

    // Links
    /// Save `url` for `user` in `collections` (their bookmarks, if none are given)
    ///
    /// If the user already has a link for this URL it's re-used; otherwise a new link is created
    /// and fetched.
    #[instrument(skip(self, user), fields(user = %user.username))]
    pub async fn add_link(
        &self,
        user: &User,
        url: &str,
        collections: &[CollectionId],
    ) -> Result<Link> {
        let url = sanitize(url).context(UrlSnafu)?;
        let mut targets = Vec::with_capacity(collections.len().max(1));
        for id in collections {
            let collection = self.collection(id).await?;
            ensure!(
                collection.user_id == user.id,
                NotOwnerSnafu {
                    id: *id,
                    username: user.username.clone()
                }
            );
            targets.push(collection);
        }
        if targets.is_empty() {
            targets.push(
                self.default_collection(user, CollectionType::Bookmarks)
                    .await?,
            );
        }

        let link = match self
            .storage
            .link_for_url(&user.id, &url)
            .await
            .context(StorageSnafu)?
        {
            Some(link) => {
                debug!("Re-using link {} for {}", link.id, url);
                link
            }
            None => {
                let link = self.links.fetch(Link::new(user.id, url)).await;
                self.storage.add_link(&link).await.context(StorageSnafu)?;
                link
            }
        };

        let now = Utc::now();
        for collection in &targets {
            self.storage
                .publish(&link.id, &collection.id, &now)
                .await
                .context(StorageSnafu)?;
        }
        Ok(link)
    }
    pub async fn add_message(&self, user: &User, link: &LinkId, content: &str) -> Result<Message> {
        self.storage
            .link(link)
            .await
            .context(StorageSnafu)?
            .context(NoSuchLinkSnafu { id: *link })?;
        let message = Message::new(user.id, *link, content);
        self.storage
            .add_message(&message)
            .await
            .context(StorageSnafu)?;
        Ok(message)
    }

    // Feeds & follows
    /// The feed collection for `url`, created (but not fetched) if need be; the flag is true if
    /// it was created
    async fn find_or_create_feed(&self, url: Url) -> Result<(Collection, bool)> {
        match self
            .storage
            .feed_for_url(&url)
            .await
            .context(StorageSnafu)?
        {
            Some(feed) => Ok((feed, false)),
            None => {
                let feed = Collection::new_feed(self.support.id, url);
                self.storage
                    .add_collection(&feed)
                    .await
                    .context(StorageSnafu)?;
                Ok((feed, true))
            }
        }
    }
    /// Follow the feed at, or advertised by, `url`
    #[instrument(skip(self, user), fields(user = %user.username))]
    pub async fn add_feed(&self, user: &User, url: &str) -> Result<Collection> {
        let url = sanitize(url).context(UrlSnafu)?;
        let feed_url = self
            .feeds
            .discover(&url)
            .await
            .context(FeedSnafu)?
            .into_iter()
            .next()
            .context(NoFeedFoundSnafu { url: url.clone() })?;
        let (mut feed, created) = self.find_or_create_feed(feed_url).await?;
        if created {
            self.feeds.fetch(&feed).await.context(FeedSnafu)?;
            feed = self.collection(&feed.id).await?;
        }
        self.storage
            .follow(&user.id, &feed.id)
            .await
            .context(StorageSnafu)?;
        info!("{} now follows {}", user.username, feed.name);
        Ok(feed)
    }
    /// Returns false if `user` already followed the collection
    pub async fn follow(&self, user: &User, collection: &CollectionId) -> Result<bool> {
        self.collection(collection).await?;
        self.storage
            .follow(&user.id, collection)
            .await
            .context(StorageSnafu)
    }
    /// Returns false if `user` didn't follow the collection
    pub async fn unfollow(&self, user: &User, collection: &CollectionId) -> Result<bool> {
        self.storage
            .unfollow(&user.id, collection)
            .await
            .context(StorageSnafu)
    }
    /// Follow every feed listed in an OPML document; feeds are fetched later, by the background
    /// jobs. Returns the number of feeds newly followed (so outlines naming a feed the user already
    /// follows don't count).
    #[instrument(skip_all, fields(user = %user.username))]
    pub async fn import_opml(&self, user: &User, text: &str) -> Result<usize> {
        let mut count = 0;
        for outline in opml::parse(text).context(OpmlSnafu)? {
            let url = match sanitize(&outline.xml_url) {
                Ok(url) => url,
                Err(err) => {
                    warn!("Skipping outline {}: {}", outline.xml_url, err);
                    continue;
                }
            };
            let (mut feed, created) = self.find_or_create_feed(url).await?;
            if created {
                if let Some(title) = outline.title {
                    feed.name = title;
                }
                if let Some(info) = feed.feed.as_mut() {
                    info.site_url = outline.html_url.as_deref().and_then(|s| sanitize(s).ok());
                }
                self.storage
                    .update_collection(&feed)
                    .await
                    .context(StorageSnafu)?;
            }
            if self
                .storage
                .follow(&user.id, &feed.id)
                .await
                .context(StorageSnafu)?
            {
                count += 1;
            }
        }
        info!("Imported {} feeds for {}", count, user.username);
        Ok(count)
    }

    // News & exportation
    pub async fn news(&self, user: &User) -> Result<Vec<Suggestion>> {
        self.news
            .pick(user, &self.news_config)
            .await
            .context(NewsSnafu)
    }
    pub async fn fill_news(&self, user: &User) -> Result<Vec<Link>> {
        self.news
            .fill_news(user, &self.news_config)
            .await
            .context(NewsSnafu)
    }
    pub async fn export(&self, user: &User) -> Result<Vec<u8>> {
        self.exporter.export(user).await.context(ExportSnafu)
    }
    pub async fn export_to(&self, user: &User, dir: &std::path::Path) -> Result<std::path::PathBuf> {
        self.exporter.export_to(user, dir).await.context(ExportSnafu)
    }
}

async fn add_default_collections(storage: &(dyn Backend + Send + Sync), user: &User) -> Result<()> {
    for ctype in CollectionType::DEFAULTS {
        storage
            .add_collection(&Collection::new_default(user.id, ctype))
            .await
            .context(StorageSnafu)?;
    }
    Ok(())
}

/// Look-up `username`, creating them if they don't exist
async fn ensure_user(storage: &(dyn Backend + Send + Sync), username: &Username) -> Result<User> {
    match storage
        .user_for_name(username)
        .await
        .context(StorageSnafu)?
    {
        Some(user) => Ok(user),
        None => {
            let user = User::new(username.clone());
            storage.add_user(&user).await.context(StorageSnafu)?;
            add_default_collections(storage, &user).await?;
            info!("Created the support user {}", username);
            user.pipe(Ok)
        }
    }
}

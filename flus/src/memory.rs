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

//! # In-memory storage
//!
//! [Store] keeps the entire flus dataset in memory behind a [tokio::sync::RwLock]. It is
//! persisted by snapshotting the lot to a JSON file ([Store::save]) & restored from one at startup
//! ([Store::load]). Snapshots are written to a temporary file which is then renamed over the
//! previous snapshot, so a crash mid-save never leaves a truncated state file behind.

use std::{
    collections::{HashMap, HashSet},
    io::Write,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, IntoError, prelude::*};
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;

use crate::{
    entities::{
        Collection, CollectionId, CollectionType, Follow, Link, LinkId, Message, Publication,
        Topic, TopicId, User, UserId, Username,
    },
    storage::{Backend, Error as StorageError},
    urls::url_hash,
};

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Another feed already mirrors {url}"))]
    DuplicateFeed { url: Url, backtrace: Backtrace },
    #[snafu(display("The username {username} is taken"))]
    DuplicateUsername {
        username: Username,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to deserialize the snapshot at {path:?}: {source}"))]
    Json {
        path: PathBuf,
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("A snapshot task failed: {source}"))]
    Join {
        source: tokio::task::JoinError,
        backtrace: Backtrace,
    },
    #[snafu(display("No collection with id {id}"))]
    NoSuchCollection {
        id: CollectionId,
        backtrace: Backtrace,
    },
    #[snafu(display("No link with id {id}"))]
    NoSuchLink { id: LinkId, backtrace: Backtrace },
    #[snafu(display("No user with id {id}"))]
    NoSuchUser { id: UserId, backtrace: Backtrace },
    #[snafu(display("Failed to move the snapshot into place at {path:?}: {source}"))]
    Persist {
        path: PathBuf,
        source: tempfile::PersistError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to read the snapshot at {path:?}: {source}"))]
    Read {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to serialize the store: {source}"))]
    Serialize {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to write a snapshot in {path:?}: {source}"))]
    Write {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for StorageError {
    fn from(err: Error) -> Self {
        StorageError::new(err)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             State                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Default, Deserialize, Serialize)]
struct State {
    users: HashMap<UserId, User>,
    collections: HashMap<CollectionId, Collection>,
    links: HashMap<LinkId, Link>,
    follows: Vec<Follow>,
    publications: Vec<Publication>,
    messages: Vec<Message>,
    topics: Vec<Topic>,
    /// url_hash(link.url) => links with that URL
    #[serde(skip)]
    links_by_url: HashMap<String, Vec<LinkId>>,
}

impl State {
    fn index_link(&mut self, link: &Link) {
        self.links_by_url
            .entry(url_hash(&link.url))
            .or_default()
            .push(link.id);
    }
    fn unindex_link(&mut self, link: &Link) {
        let hash = url_hash(&link.url);
        if let Some(ids) = self.links_by_url.get_mut(&hash) {
            ids.retain(|id| *id != link.id);
            if ids.is_empty() {
                self.links_by_url.remove(&hash);
            }
        }
    }
    fn reindex(&mut self) {
        let links: Vec<Link> = self.links.values().cloned().collect();
        self.links_by_url.clear();
        links.iter().for_each(|link| self.index_link(link));
    }
    fn check_user(&self, id: &UserId) -> Result<()> {
        ensure!(self.users.contains_key(id), NoSuchUserSnafu { id: *id });
        Ok(())
    }
    fn check_feed_url(&self, collection: &Collection) -> Result<()> {
        match collection.feed_url() {
            Some(url) => {
                ensure!(
                    !self.collections.values().any(|other| {
                        other.id != collection.id && other.feed_url() == Some(url)
                    }),
                    DuplicateFeedSnafu { url: url.clone() }
                );
                Ok(())
            }
            None => Ok(()),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             Store                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An in-memory [Backend] implementation
#[derive(Debug, Default)]
pub struct Store {
    state: RwLock<State>,
}

impl Store {
    pub fn new() -> Store {
        Store::default()
    }
    /// Restore a [Store] from the snapshot at `path`; a missing file yields an empty store
    pub async fn load(path: &Path) -> Result<Store> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!("No snapshot at {:?}; starting with an empty store", path);
                return Ok(Store::new());
            }
            Err(err) => return Err(ReadSnafu { path }.into_error(err)),
        };
        let mut state: State = serde_json::from_slice(&bytes).context(JsonSnafu { path })?;
        state.reindex();
        info!(
            "Loaded {} users, {} collections & {} links from {:?}",
            state.users.len(),
            state.collections.len(),
            state.links.len(),
            path
        );
        Ok(Store {
            state: RwLock::new(state),
        })
    }
    /// Write a snapshot of this [Store] to `path`, atomically
    pub async fn save(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec(&*self.state.read().await).context(SerializeSnafu)?;
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let dir = match path.parent() {
                Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
                _ => PathBuf::from("."),
            };
            let mut tmp = tempfile::NamedTempFile::new_in(&dir).context(WriteSnafu {
                path: dir.clone(),
            })?;
            tmp.write_all(&bytes)
                .and_then(|_| tmp.as_file().sync_all())
                .context(WriteSnafu { path: dir.clone() })?;
            tmp.persist(&path).context(PersistSnafu { path: path.clone() })?;
            debug!("Wrote a snapshot of {} bytes to {:?}", bytes.len(), path);
            Ok(())
        })
        .await
        .context(JoinSnafu)?
    }
}

#[async_trait]
impl Backend for Store {
    async fn add_user(&self, user: &User) -> StdResult<(), StorageError> {
        let mut state = self.state.write().await;
        ensure!(
            !state.users.values().any(|u| u.username == user.username),
            DuplicateUsernameSnafu {
                username: user.username.clone()
            }
        );
        state.users.insert(user.id, user.clone());
        Ok(())
    }
    async fn user(&self, id: &UserId) -> StdResult<Option<User>, StorageError> {
        Ok(self.state.read().await.users.get(id).cloned())
    }
    async fn user_for_name(&self, name: &Username) -> StdResult<Option<User>, StorageError> {
        Ok(self
            .state
            .read()
            .await
            .users
            .values()
            .find(|user| user.username == *name)
            .cloned())
    }
    async fn users(&self) -> StdResult<Vec<User>, StorageError> {
        let mut users: Vec<User> = self.state.read().await.users.values().cloned().collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(users)
    }
    async fn update_user(&self, user: &User) -> StdResult<(), StorageError> {
        let mut state = self.state.write().await;
        state.check_user(&user.id)?;
        state.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn add_collection(&self, collection: &Collection) -> StdResult<(), StorageError> {
        let mut state = self.state.write().await;
        state.check_user(&collection.user_id)?;
        state.check_feed_url(collection)?;
        state.collections.insert(collection.id, collection.clone());
        Ok(())
    }
    async fn collection(&self, id: &CollectionId) -> StdResult<Option<Collection>, StorageError> {
        Ok(self.state.read().await.collections.get(id).cloned())
    }
    async fn update_collection(&self, collection: &Collection) -> StdResult<(), StorageError> {
        let mut state = self.state.write().await;
        ensure!(
            state.collections.contains_key(&collection.id),
            NoSuchCollectionSnafu { id: collection.id }
        );
        state.check_feed_url(collection)?;
        state.collections.insert(collection.id, collection.clone());
        Ok(())
    }
    async fn collections_for_user(
        &self,
        user: &UserId,
    ) -> StdResult<Vec<Collection>, StorageError> {
        let mut collections: Vec<Collection> = self
            .state
            .read()
            .await
            .collections
            .values()
            .filter(|c| c.user_id == *user)
            .cloned()
            .collect();
        collections.sort_by_key(|c| c.created_at);
        Ok(collections)
    }
    async fn public_collections_for_topics(
        &self,
        topics: &HashSet<TopicId>,
    ) -> StdResult<Vec<Collection>, StorageError> {
        let mut collections: Vec<Collection> = self
            .state
            .read()
            .await
            .collections
            .values()
            .filter(|c| c.is_public && !c.topics.is_disjoint(topics))
            .cloned()
            .collect();
        collections.sort_by_key(|c| c.created_at);
        Ok(collections)
    }
    async fn collection_of_type(
        &self,
        user: &UserId,
        ctype: CollectionType,
    ) -> StdResult<Option<Collection>, StorageError> {
        Ok(self
            .state
            .read()
            .await
            .collections
            .values()
            .filter(|c| c.user_id == *user && c.ctype == ctype)
            .min_by_key(|c| c.created_at)
            .cloned())
    }
    async fn feed_for_url(&self, url: &Url) -> StdResult<Option<Collection>, StorageError> {
        Ok(self
            .state
            .read()
            .await
            .collections
            .values()
            .find(|c| c.feed_url() == Some(url))
            .cloned())
    }
    async fn feeds_to_fetch(
        &self,
        before: &DateTime<Utc>,
        limit: usize,
    ) -> StdResult<Vec<Collection>, StorageError> {
        let mut feeds: Vec<Collection> = self
            .state
            .read()
            .await
            .collections
            .values()
            .filter(|c| c.feed.as_ref().is_some_and(|feed| feed.is_stale(before)))
            .cloned()
            .collect();
        // `None` sorts first: never-fetched feeds go to the head of the line
        feeds.sort_by_key(|c| c.feed.as_ref().and_then(|feed| feed.fetched_at));
        feeds.truncate(limit);
        Ok(feeds)
    }

    async fn follow(&self, user: &UserId, collection: &CollectionId) -> StdResult<bool, StorageError> {
        let mut state = self.state.write().await;
        state.check_user(user)?;
        ensure!(
            state.collections.contains_key(collection),
            NoSuchCollectionSnafu { id: *collection }
        );
        if state
            .follows
            .iter()
            .any(|f| f.user_id == *user && f.collection_id == *collection)
        {
            return Ok(false);
        }
        state.follows.push(Follow {
            user_id: *user,
            collection_id: *collection,
            created_at: Utc::now(),
        });
        Ok(true)
    }
    async fn unfollow(&self, user: &UserId, collection: &CollectionId) -> StdResult<bool, StorageError> {
        let mut state = self.state.write().await;
        let before = state.follows.len();
        state
            .follows
            .retain(|f| !(f.user_id == *user && f.collection_id == *collection));
        Ok(state.follows.len() != before)
    }
    async fn followed_collections(
        &self,
        user: &UserId,
    ) -> StdResult<Vec<(Follow, Collection)>, StorageError> {
        let state = self.state.read().await;
        let mut followed: Vec<(Follow, Collection)> = state
            .follows
            .iter()
            .filter(|f| f.user_id == *user)
            .filter_map(|f| {
                state
                    .collections
                    .get(&f.collection_id)
                    .map(|c| (f.clone(), c.clone()))
            })
            .collect();
        followed.sort_by_key(|(f, _)| f.created_at);
        Ok(followed)
    }

    async fn add_link(&self, link: &Link) -> StdResult<(), StorageError> {
        let mut state = self.state.write().await;
        state.check_user(&link.user_id)?;
        if let Some(old) = state.links.insert(link.id, link.clone()) {
            state.unindex_link(&old);
        }
        state.index_link(link);
        Ok(())
    }
    async fn link(&self, id: &LinkId) -> StdResult<Option<Link>, StorageError> {
        Ok(self.state.read().await.links.get(id).cloned())
    }
    async fn update_link(&self, link: &Link) -> StdResult<(), StorageError> {
        let mut state = self.state.write().await;
        let old = state
            .links
            .get(&link.id)
            .cloned()
            .context(NoSuchLinkSnafu { id: link.id })?;
        if old.url != link.url {
            state.unindex_link(&old);
            state.index_link(link);
        }
        state.links.insert(link.id, link.clone());
        Ok(())
    }
    async fn link_for_url(&self, user: &UserId, url: &Url) -> StdResult<Option<Link>, StorageError> {
        let state = self.state.read().await;
        Ok(state
            .links_by_url
            .get(&url_hash(url))
            .into_iter()
            .flatten()
            .filter_map(|id| state.links.get(id))
            .filter(|link| link.user_id == *user)
            .min_by_key(|link| link.created_at)
            .cloned())
    }
    async fn links_to_fetch(
        &self,
        now: &DateTime<Utc>,
        limit: usize,
    ) -> StdResult<Vec<Link>, StorageError> {
        let mut links: Vec<Link> = self
            .state
            .read()
            .await
            .links
            .values()
            .filter(|link| link.needs_fetch(now))
            .cloned()
            .collect();
        links.sort_by_key(|link| link.created_at);
        links.truncate(limit);
        Ok(links)
    }

    async fn publish(
        &self,
        link: &LinkId,
        collection: &CollectionId,
        at: &DateTime<Utc>,
    ) -> StdResult<bool, StorageError> {
        let mut state = self.state.write().await;
        ensure!(state.links.contains_key(link), NoSuchLinkSnafu { id: *link });
        ensure!(
            state.collections.contains_key(collection),
            NoSuchCollectionSnafu { id: *collection }
        );
        if state
            .publications
            .iter()
            .any(|p| p.link_id == *link && p.collection_id == *collection)
        {
            return Ok(false);
        }
        state.publications.push(Publication {
            link_id: *link,
            collection_id: *collection,
            published_at: *at,
        });
        Ok(true)
    }
    async fn unpublish(&self, link: &LinkId, collection: &CollectionId) -> StdResult<bool, StorageError> {
        let mut state = self.state.write().await;
        let before = state.publications.len();
        state
            .publications
            .retain(|p| !(p.link_id == *link && p.collection_id == *collection));
        Ok(state.publications.len() != before)
    }
    async fn publications_in(
        &self,
        collection: &CollectionId,
    ) -> StdResult<Vec<(Publication, Link)>, StorageError> {
        let state = self.state.read().await;
        let mut publications: Vec<(Publication, Link)> = state
            .publications
            .iter()
            .filter(|p| p.collection_id == *collection)
            .filter_map(|p| state.links.get(&p.link_id).map(|l| (p.clone(), l.clone())))
            .collect();
        publications.sort_by(|(a, _), (b, _)| b.published_at.cmp(&a.published_at));
        Ok(publications)
    }
    async fn publications_of(&self, link: &LinkId) -> StdResult<Vec<Publication>, StorageError> {
        Ok(self
            .state
            .read()
            .await
            .publications
            .iter()
            .filter(|p| p.link_id == *link)
            .cloned()
            .collect())
    }

    async fn add_message(&self, message: &Message) -> StdResult<(), StorageError> {
        let mut state = self.state.write().await;
        state.check_user(&message.user_id)?;
        ensure!(
            state.links.contains_key(&message.link_id),
            NoSuchLinkSnafu {
                id: message.link_id
            }
        );
        state.messages.push(message.clone());
        Ok(())
    }
    async fn messages_for_link(&self, link: &LinkId) -> StdResult<Vec<Message>, StorageError> {
        let mut messages: Vec<Message> = self
            .state
            .read()
            .await
            .messages
            .iter()
            .filter(|m| m.link_id == *link)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }

    async fn add_topic(&self, topic: &Topic) -> StdResult<(), StorageError> {
        self.state.write().await.topics.push(topic.clone());
        Ok(())
    }
    async fn topics(&self) -> StdResult<Vec<Topic>, StorageError> {
        Ok(self.state.read().await.topics.clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use chrono::Duration;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    async fn store_with_user(name: &str) -> (Store, User) {
        let store = Store::new();
        let user = User::new(Username::new(name).unwrap());
        store.add_user(&user).await.unwrap();
        (store, user)
    }

    #[tokio::test]
    async fn users() {
        let (store, alice) = store_with_user("alice").await;
        assert!(
            store
                .add_user(&User::new(Username::new("alice").unwrap()))
                .await
                .is_err()
        );
        assert_eq!(
            store
                .user_for_name(&Username::new("alice").unwrap())
                .await
                .unwrap()
                .unwrap()
                .id,
            alice.id
        );
        assert!(
            store
                .user_for_name(&Username::new("bob").unwrap())
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(store.users().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn feed_urls_are_unique() {
        let (store, support) = store_with_user("flus").await;
        let feed = Collection::new_feed(support.id, url("https://example.com/feed"));
        store.add_collection(&feed).await.unwrap();
        let dupe = Collection::new_feed(support.id, url("https://example.com/feed"));
        assert!(store.add_collection(&dupe).await.is_err());
        assert_eq!(
            store
                .feed_for_url(&url("https://example.com/feed"))
                .await
                .unwrap()
                .unwrap()
                .id,
            feed.id
        );

        let other = Collection::new_feed(support.id, url("https://example.com/other"));
        store.add_collection(&other).await.unwrap();
        let mut moved = other.clone();
        moved.feed.as_mut().unwrap().url = url("https://example.com/feed");
        assert!(store.update_collection(&moved).await.is_err());

        let orphan = Collection::new_feed(UserId::new(), url("https://example.com/x"));
        assert!(store.add_collection(&orphan).await.is_err());
    }

    #[tokio::test]
    async fn feeds_to_fetch_orders_by_staleness() {
        let (store, support) = store_with_user("flus").await;
        let now = Utc::now();
        let mut fetched_long_ago = Collection::new_feed(support.id, url("https://a.example/feed"));
        fetched_long_ago.feed.as_mut().unwrap().fetched_at = Some(now - Duration::days(1));
        let mut fresh = Collection::new_feed(support.id, url("https://b.example/feed"));
        fresh.feed.as_mut().unwrap().fetched_at = Some(now);
        let never = Collection::new_feed(support.id, url("https://c.example/feed"));
        for c in [&fetched_long_ago, &fresh, &never] {
            store.add_collection(c).await.unwrap();
        }
        store
            .add_collection(&Collection::new_default(support.id, CollectionType::Bookmarks))
            .await
            .unwrap();

        let due = store
            .feeds_to_fetch(&(now - Duration::hours(1)), 10)
            .await
            .unwrap();
        assert_eq!(
            due.iter().map(|c| c.id).collect::<Vec<_>>(),
            vec![never.id, fetched_long_ago.id]
        );
        assert_eq!(
            store
                .feeds_to_fetch(&(now - Duration::hours(1)), 1)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn links_and_publications() {
        let (store, alice) = store_with_user("alice").await;
        let bookmarks = Collection::new_default(alice.id, CollectionType::Bookmarks);
        store.add_collection(&bookmarks).await.unwrap();

        let older = Link::new(alice.id, url("https://example.com/older"));
        let newer = Link::new(alice.id, url("https://example.com/newer"));
        store.add_link(&older).await.unwrap();
        store.add_link(&newer).await.unwrap();

        let now = Utc::now();
        assert!(
            store
                .publish(&older.id, &bookmarks.id, &(now - Duration::hours(1)))
                .await
                .unwrap()
        );
        assert!(store.publish(&newer.id, &bookmarks.id, &now).await.unwrap());
        assert!(!store.publish(&newer.id, &bookmarks.id, &now).await.unwrap());

        let pubs = store.publications_in(&bookmarks.id).await.unwrap();
        assert_eq!(
            pubs.iter().map(|(_, l)| l.id).collect::<Vec<_>>(),
            vec![newer.id, older.id]
        );
        assert_eq!(store.publications_of(&older.id).await.unwrap().len(), 1);

        assert!(store.unpublish(&older.id, &bookmarks.id).await.unwrap());
        assert!(!store.unpublish(&older.id, &bookmarks.id).await.unwrap());
        assert_eq!(store.publications_in(&bookmarks.id).await.unwrap().len(), 1);

        // Moving a link to a new URL moves it in the URL index, too
        let mut moved = older.clone();
        moved.url = url("https://example.com/moved");
        store.update_link(&moved).await.unwrap();
        assert!(
            store
                .link_for_url(&alice.id, &url("https://example.com/older"))
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(
            store
                .link_for_url(&alice.id, &url("https://example.com/moved"))
                .await
                .unwrap()
                .unwrap()
                .id,
            older.id
        );
        assert!(
            store
                .update_link(&Link::new(alice.id, url("https://example.com/nope")))
                .await
                .is_err()
        );
        assert!(
            store
                .link(&LinkId::new())
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn links_to_fetch() {
        let (store, alice) = store_with_user("alice").await;
        let now = Utc::now();
        let pending = Link::new(alice.id, url("https://example.com/pending"));
        let mut done = Link::new(alice.id, url("https://example.com/done"));
        done.fetched_at = Some(now);
        done.fetched_code = 200;
        done.fetched_count = 1;
        let mut failed = Link::new(alice.id, url("https://example.com/failed"));
        failed.fetched_at = Some(now - Duration::hours(1));
        failed.fetched_code = 0;
        failed.fetched_count = 1;
        for link in [&pending, &done, &failed] {
            store.add_link(link).await.unwrap();
        }
        let mut due: Vec<LinkId> = store
            .links_to_fetch(&now, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.id)
            .collect();
        due.sort();
        let mut expected = vec![pending.id, failed.id];
        expected.sort();
        assert_eq!(due, expected);
    }

    #[tokio::test]
    async fn follows_and_messages() {
        let (store, alice) = store_with_user("alice").await;
        let bob = User::new(Username::new("bob").unwrap());
        store.add_user(&bob).await.unwrap();
        let shared = Collection::new(bob.id, "Reading", "", CollectionType::Collection, true);
        store.add_collection(&shared).await.unwrap();

        assert!(store.follow(&alice.id, &shared.id).await.unwrap());
        assert!(!store.follow(&alice.id, &shared.id).await.unwrap());
        assert!(store.follow(&alice.id, &CollectionId::new()).await.is_err());
        let followed = store.followed_collections(&alice.id).await.unwrap();
        assert_eq!(followed.len(), 1);
        assert_eq!(followed[0].1.id, shared.id);
        assert!(store.unfollow(&alice.id, &shared.id).await.unwrap());
        assert!(store.followed_collections(&alice.id).await.unwrap().is_empty());

        let link = Link::new(bob.id, url("https://example.com/"));
        store.add_link(&link).await.unwrap();
        store
            .add_message(&Message::new(alice.id, link.id, "Great read"))
            .await
            .unwrap();
        assert!(
            store
                .add_message(&Message::new(alice.id, LinkId::new(), "Lost"))
                .await
                .is_err()
        );
        let messages = store.messages_for_link(&link.id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "Great read");
    }

    #[tokio::test]
    async fn snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let empty = Store::load(&path).await.unwrap();
        assert!(empty.users().await.unwrap().is_empty());

        let (store, alice) = store_with_user("alice").await;
        let link = Link::new(alice.id, url("https://example.com/saved"));
        store.add_link(&link).await.unwrap();
        store.add_topic(&Topic::new("rust")).await.unwrap();
        store.save(&path).await.unwrap();
        // Saving over an existing snapshot
        store.save(&path).await.unwrap();

        let restored = Store::load(&path).await.unwrap();
        assert_eq!(restored.user(&alice.id).await.unwrap().unwrap(), alice);
        assert_eq!(
            restored
                .link_for_url(&alice.id, &url("https://example.com/saved"))
                .await
                .unwrap()
                .unwrap(),
            link
        );
        assert_eq!(restored.topics().await.unwrap().len(), 1);

        std::fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(Store::load(&path).await, Err(Error::Json { .. })));
    }

    #[tokio::test]
    async fn collections_by_topic() {
        let (store, alice) = store_with_user("alice").await;
        let rust = Topic::new("rust");
        let cooking = Topic::new("cooking");
        let mut public = Collection::new(alice.id, "Rust things", "", CollectionType::Collection, true);
        public.topics.insert(rust.id);
        let mut private = Collection::new(alice.id, "Secret rust", "", CollectionType::Collection, false);
        private.topics.insert(rust.id);
        store.add_collection(&public).await.unwrap();
        store.add_collection(&private).await.unwrap();

        let found = store
            .public_collections_for_topics(&HashSet::from([rust.id, cooking.id]))
            .await
            .unwrap();
        assert_eq!(found.iter().map(|c| c.id).collect::<Vec<_>>(), vec![public.id]);
        assert!(
            store
                .public_collections_for_topics(&HashSet::from([cooking.id]))
                .await
                .unwrap()
                .is_empty()
        );
    }
}

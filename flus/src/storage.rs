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

//! # storage
//!
//! Abstractions for the flus storage layer.
//!
//! [Backend] is object-safe so that the rest of the crate can hold an `Arc<dyn Backend + Send +
//! Sync>` without caring what's behind it. Look-ups that may legitimately come up empty return an
//! `Option`; [Error] is reserved for the storage layer itself failing (or refusing an operation
//! that would violate its invariants).

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use url::Url;

use crate::entities::{
    Collection, CollectionId, CollectionType, Follow, Link, LinkId, Message, Publication, Topic,
    TopicId, User, UserId, Username,
};

#[derive(Debug)]
pub struct Error {
    source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

impl Error {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error {
            source: Box::new(err),
        }
    }
}

#[async_trait]
pub trait Backend {
    // Users
    /// Add a new user; fails if the username is taken
    async fn add_user(&self, user: &User) -> Result<(), Error>;
    async fn user(&self, id: &UserId) -> Result<Option<User>, Error>;
    async fn user_for_name(&self, name: &Username) -> Result<Option<User>, Error>;
    async fn users(&self) -> Result<Vec<User>, Error>;
    async fn update_user(&self, user: &User) -> Result<(), Error>;

    // Collections
    /// Add a collection; fails if its owner doesn't exist, or if it's a feed collection whose URL
    /// is already taken
    async fn add_collection(&self, collection: &Collection) -> Result<(), Error>;
    async fn collection(&self, id: &CollectionId) -> Result<Option<Collection>, Error>;
    async fn update_collection(&self, collection: &Collection) -> Result<(), Error>;
    async fn collections_for_user(&self, user: &UserId) -> Result<Vec<Collection>, Error>;
    /// Retrieve one of `user`'s default collections (bookmarks, news, ...)
    async fn collection_of_type(
        &self,
        user: &UserId,
        ctype: CollectionType,
    ) -> Result<Option<Collection>, Error>;
    /// Public collections tagged with any of `topics`
    async fn public_collections_for_topics(
        &self,
        topics: &HashSet<TopicId>,
    ) -> Result<Vec<Collection>, Error>;
    /// The feed collection mirroring `url`, if any
    async fn feed_for_url(&self, url: &Url) -> Result<Option<Collection>, Error>;
    /// Up to `limit` feed collections not fetched since `before`, least-recently fetched first
    async fn feeds_to_fetch(
        &self,
        before: &DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Collection>, Error>;

    // Follows
    /// Returns false if `user` already followed `collection`
    async fn follow(&self, user: &UserId, collection: &CollectionId) -> Result<bool, Error>;
    /// Returns false if `user` didn't follow `collection`
    async fn unfollow(&self, user: &UserId, collection: &CollectionId) -> Result<bool, Error>;
    async fn followed_collections(&self, user: &UserId) -> Result<Vec<(Follow, Collection)>, Error>;

    // Links
    async fn add_link(&self, link: &Link) -> Result<(), Error>;
    async fn link(&self, id: &LinkId) -> Result<Option<Link>, Error>;
    async fn update_link(&self, link: &Link) -> Result<(), Error>;
    /// `user`'s link for `url`, if they have one
    async fn link_for_url(&self, user: &UserId, url: &Url) -> Result<Option<Link>, Error>;
    /// Up to `limit` links for which [Link::needs_fetch] holds as of `now`, oldest first
    async fn links_to_fetch(&self, now: &DateTime<Utc>, limit: usize) -> Result<Vec<Link>, Error>;

    // Publications
    /// Publish `link` in `collection`; returns false if it was already there (in which case the
    /// publication date is left unchanged)
    async fn publish(
        &self,
        link: &LinkId,
        collection: &CollectionId,
        at: &DateTime<Utc>,
    ) -> Result<bool, Error>;
    async fn unpublish(&self, link: &LinkId, collection: &CollectionId) -> Result<bool, Error>;
    /// The links in `collection`, most recently published first
    async fn publications_in(
        &self,
        collection: &CollectionId,
    ) -> Result<Vec<(Publication, Link)>, Error>;
    /// The collections in which `link` is published
    async fn publications_of(&self, link: &LinkId) -> Result<Vec<Publication>, Error>;

    // Messages
    async fn add_message(&self, message: &Message) -> Result<(), Error>;
    /// Comments on `link`, oldest first
    async fn messages_for_link(&self, link: &LinkId) -> Result<Vec<Message>, Error>;

    // Topics
    async fn add_topic(&self, topic: &Topic) -> Result<(), Error>;
    async fn topics(&self) -> Result<Vec<Topic>, Error>;
}

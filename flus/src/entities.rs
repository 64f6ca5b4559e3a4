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

//! # flus entities
//!
//! The flus domain model: [User]s own [Collection]s; [Link]s are published in collections (the
//! membership being a [Publication]); users [Follow] collections, comment on links through
//! [Message]s, and declare interest in [Topic]s.
//!
//! Every user has four special collections, created with the user: their bookmarks, their news,
//! the links they've read & the links they never want to see again (see [CollectionType]). Feeds
//! are mirrored as collections of type [CollectionType::Feed], carrying a [FeedInfo].

use std::{collections::HashSet, fmt::Display, ops::Deref, str::FromStr};

use chrono::{DateTime, Duration, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use snafu::{Backtrace, prelude::*};
use url::Url;
use uuid::Uuid;

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{name} is not a valid username"))]
    BadUsername { name: String, backtrace: Backtrace },
    #[snafu(display("{text} is not a valid identifier: {source}"))]
    BadId {
        text: String,
        source: uuid::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          identifiers                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

macro_rules! define_id {
    ($type_name:ident) => {
        #[derive(
            Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
        )]
        #[serde(transparent)]
        pub struct $type_name(Uuid);
        impl $type_name {
            pub fn new() -> $type_name {
                $type_name(Uuid::new_v4())
            }
        }
        impl Default for $type_name {
            fn default() -> Self {
                Self::new()
            }
        }
        impl Display for $type_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0.as_hyphenated())
            }
        }
        impl FromStr for $type_name {
            type Err = Error;

            fn from_str(s: &str) -> StdResult<Self, Self::Err> {
                Uuid::parse_str(s)
                    .map($type_name)
                    .context(BadIdSnafu { text: s })
            }
        }
    };
}

define_id!(UserId);
define_id!(CollectionId);
define_id!(LinkId);
define_id!(MessageId);
define_id!(TopicId);

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Username                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

// flus usernames must be ASCII, may be from two to sixty-four characters in length, and must match
// the regex "^[a-zA-Z][-_.a-zA-Z0-9]*$".
const MIN_USERNAME_LENGTH: usize = 2;
const MAX_USERNAME_LENGTH: usize = 64;

lazy_static! {
    static ref USERNAME: Regex = Regex::new("^[a-zA-Z][-_.a-zA-Z0-9]*$").unwrap(/* known good */);
}

fn check_username(s: &str) -> bool {
    s.is_ascii()
        && s.len() >= MIN_USERNAME_LENGTH
        && s.len() <= MAX_USERNAME_LENGTH
        && USERNAME.is_match(s)
}

/// A refined type representing a flus username
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct Username(String);

impl Username {
    /// Construct a [Username] by copying from a `&str`; to move a [String] in (with validity
    /// checking) use [TryFrom::try_from()]
    pub fn new(name: &str) -> Result<Username> {
        check_username(name)
            .then(|| Username(name.to_owned()))
            .context(BadUsernameSnafu { name })
    }
}

impl AsRef<str> for Username {
    fn as_ref(&self) -> &str {
        self.deref()
    }
}

impl Deref for Username {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// Implement `Deserialize` by hand to fail if the serialized value isn't a legit `Username`
impl<'de> Deserialize<'de> for Username {
    fn deserialize<D>(deserializer: D) -> StdResult<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        Username::try_from(s).map_err(serde::de::Error::custom)
    }
}

impl Display for Username {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Username {
    type Err = Error;

    fn from_str(s: &str) -> StdResult<Self, Self::Err> {
        Username::new(s)
    }
}

impl TryFrom<String> for Username {
    type Error = Error;

    fn try_from(name: String) -> StdResult<Self, Self::Error> {
        if check_username(&name) {
            Ok(Username(name))
        } else {
            BadUsernameSnafu { name }.fail()
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             User                                               //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct User {
    pub id: UserId,
    pub username: Username,
    pub created_at: DateTime<Utc>,
    /// Topics in which this user is interested; drives news suggestions
    #[serde(default)]
    pub interests: HashSet<TopicId>,
}

impl User {
    pub fn new(username: Username) -> User {
        User {
            id: UserId::new(),
            username,
            created_at: Utc::now(),
            interests: HashSet::new(),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          Collection                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionType {
    Bookmarks,
    News,
    Read,
    Never,
    Collection,
    Feed,
}

impl CollectionType {
    /// The collections every user owns exactly one of
    pub const DEFAULTS: [CollectionType; 4] = [
        CollectionType::Bookmarks,
        CollectionType::News,
        CollectionType::Read,
        CollectionType::Never,
    ];
    pub fn default_name(&self) -> &'static str {
        match self {
            CollectionType::Bookmarks => "Bookmarks",
            CollectionType::News => "News",
            CollectionType::Read => "Links read",
            CollectionType::Never => "Links never to read",
            CollectionType::Collection => "Collection",
            CollectionType::Feed => "Feed",
        }
    }
}

impl Display for CollectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CollectionType::Bookmarks => "bookmarks",
            CollectionType::News => "news",
            CollectionType::Read => "read",
            CollectionType::Never => "never",
            CollectionType::Collection => "collection",
            CollectionType::Feed => "feed",
        };
        write!(f, "{s}")
    }
}

/// Fetch state for a collection mirroring a syndication feed
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FeedInfo {
    pub url: Url,
    pub site_url: Option<Url>,
    pub fetched_at: Option<DateTime<Utc>>,
    /// HTTP status of the last fetch; zero if it failed below the HTTP layer
    pub fetched_code: u16,
    pub fetched_error: Option<String>,
    /// Hex SHA-256 of the last body successfully processed
    pub last_hash: Option<String>,
}

impl FeedInfo {
    pub fn new(url: Url) -> FeedInfo {
        FeedInfo {
            url,
            site_url: None,
            fetched_at: None,
            fetched_code: 0,
            fetched_error: None,
            last_hash: None,
        }
    }
    /// True if this feed has not been fetched since `before`
    pub fn is_stale(&self, before: &DateTime<Utc>) -> bool {
        self.fetched_at.is_none_or(|at| at < *before)
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Collection {
    pub id: CollectionId,
    pub user_id: UserId,
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub ctype: CollectionType,
    pub is_public: bool,
    #[serde(default)]
    pub topics: HashSet<TopicId>,
    pub created_at: DateTime<Utc>,
    /// Present iff `ctype` is [CollectionType::Feed]
    pub feed: Option<FeedInfo>,
}

impl Collection {
    pub fn new(
        user_id: UserId,
        name: &str,
        description: &str,
        ctype: CollectionType,
        is_public: bool,
    ) -> Collection {
        Collection {
            id: CollectionId::new(),
            user_id,
            name: name.to_owned(),
            description: description.to_owned(),
            ctype,
            is_public,
            topics: HashSet::new(),
            created_at: Utc::now(),
            feed: None,
        }
    }
    /// A collection of type `ctype` named after it; used for the four defaults
    pub fn new_default(user_id: UserId, ctype: CollectionType) -> Collection {
        Collection::new(user_id, ctype.default_name(), "", ctype, false)
    }
    /// A public collection mirroring the feed at `url`, named after it until its first fetch
    pub fn new_feed(user_id: UserId, url: Url) -> Collection {
        let mut collection = Collection::new(user_id, url.as_str(), "", CollectionType::Feed, true);
        collection.feed = Some(FeedInfo::new(url));
        collection
    }
    pub fn feed_url(&self) -> Option<&Url> {
        self.feed.as_ref().map(|feed| &feed.url)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             Link                                               //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Failed fetches are retried no more than this many times
pub const MAX_FETCH_RETRIES: u32 = 25;

/// How did a link get into a user's news?
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Via {
    Bookmarks,
    Followed(CollectionId),
    Topic(TopicId),
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Link {
    pub id: LinkId,
    pub user_id: UserId,
    pub url: Url,
    pub title: String,
    /// In minutes
    pub reading_time: u32,
    pub image_url: Option<Url>,
    pub is_hidden: bool,
    /// Feeds advertised by the page at `url`
    #[serde(default)]
    pub url_feeds: Vec<Url>,
    pub created_at: DateTime<Utc>,
    pub fetched_at: Option<DateTime<Utc>>,
    /// HTTP status of the last fetch; zero if it failed below the HTTP layer
    pub fetched_code: u16,
    pub fetched_error: Option<String>,
    pub fetched_count: u32,
    pub via: Option<Via>,
}

impl Link {
    /// A new, never-fetched link titled with its own URL
    pub fn new(user_id: UserId, url: Url) -> Link {
        Link {
            id: LinkId::new(),
            user_id,
            title: url.to_string(),
            url,
            reading_time: 0,
            image_url: None,
            is_hidden: false,
            url_feeds: Vec::new(),
            created_at: Utc::now(),
            fetched_at: None,
            fetched_code: 0,
            fetched_error: None,
            fetched_count: 0,
            via: None,
        }
    }
    /// A copy of this link belonging to `user_id`: same URL & metadata, new identity
    pub fn copy_for(&self, user_id: UserId, via: Option<Via>) -> Link {
        Link {
            id: LinkId::new(),
            user_id,
            created_at: Utc::now(),
            is_hidden: false,
            via,
            ..self.clone()
        }
    }
    pub fn fetched_successfully(&self) -> bool {
        (200..300).contains(&self.fetched_code)
    }
    /// Should this link be (re-)fetched as of `now`?
    ///
    /// A link is fetched once. If that fails, it is retried with exponential backoff (two minutes,
    /// four, eight, ...  capped at a day) up to [MAX_FETCH_RETRIES] times.
    pub fn needs_fetch(&self, now: &DateTime<Utc>) -> bool {
        match self.fetched_at {
            None => true,
            Some(at) => {
                !self.fetched_successfully()
                    && self.fetched_count <= MAX_FETCH_RETRIES
                    && at + retry_delay(self.fetched_count) <= *now
            }
        }
    }
}

fn retry_delay(fetched_count: u32) -> Duration {
    const DAY_IN_MINUTES: i64 = 24 * 60;
    Duration::minutes(
        2i64.checked_pow(fetched_count)
            .unwrap_or(DAY_IN_MINUTES)
            .min(DAY_IN_MINUTES),
    )
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                 Publication, Follow, Message, Topic                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A link's membership in a collection
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Publication {
    pub link_id: LinkId,
    pub collection_id: CollectionId,
    pub published_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Follow {
    pub user_id: UserId,
    pub collection_id: CollectionId,
    pub created_at: DateTime<Utc>,
}

/// A comment on a link
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Message {
    pub id: MessageId,
    pub user_id: UserId,
    pub link_id: LinkId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(user_id: UserId, link_id: LinkId, content: &str) -> Message {
        Message {
            id: MessageId::new(),
            user_id,
            link_id,
            content: content.to_owned(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Topic {
    pub id: TopicId,
    pub label: String,
}

impl Topic {
    pub fn new(label: &str) -> Topic {
        Topic {
            id: TopicId::new(),
            label: label.to_owned(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn usernames() {
        assert!(Username::new("sp").is_ok());
        assert!(Username::new("john.doe-2_x").is_ok());
        assert!(Username::new("a").is_err());
        assert!(Username::new("2fast").is_err());
        assert!(Username::new("no spaces").is_err());
        assert!(Username::new("café").is_err());
        assert!(Username::new(&"a".repeat(65)).is_err());
        assert!(serde_json::from_str::<Username>("\"x!\"").is_err());
        assert_eq!(
            serde_json::from_str::<Username>("\"alice\"").unwrap(),
            Username::new("alice").unwrap()
        );
    }

    #[test]
    fn ids_round_trip_through_display() {
        let id = LinkId::new();
        assert_eq!(id.to_string().parse::<LinkId>().unwrap(), id);
        assert!("not-a-uuid".parse::<LinkId>().is_err());
    }

    #[test]
    fn link_retry_policy() {
        let now = Utc::now();
        let mut link = Link::new(
            UserId::new(),
            Url::parse("https://example.com/post").unwrap(),
        );
        assert_eq!(link.title, "https://example.com/post");
        assert!(link.needs_fetch(&now));

        link.fetched_at = Some(now);
        link.fetched_code = 200;
        link.fetched_count = 1;
        assert!(!link.needs_fetch(&(now + Duration::days(30))));

        link.fetched_code = 500;
        assert!(!link.needs_fetch(&(now + Duration::minutes(1))));
        assert!(link.needs_fetch(&(now + Duration::minutes(2))));

        link.fetched_count = 5;
        assert!(!link.needs_fetch(&(now + Duration::minutes(31))));
        assert!(link.needs_fetch(&(now + Duration::minutes(32))));

        link.fetched_count = 20;
        assert!(link.needs_fetch(&(now + Duration::hours(24))));
        assert!(!link.needs_fetch(&(now + Duration::hours(23))));

        link.fetched_count = MAX_FETCH_RETRIES + 1;
        assert!(!link.needs_fetch(&(now + Duration::days(30))));
    }

    #[test]
    fn feed_staleness() {
        let now = Utc::now();
        let mut feed = FeedInfo::new(Url::parse("https://example.com/feed").unwrap());
        assert!(feed.is_stale(&now));
        feed.fetched_at = Some(now - Duration::minutes(10));
        assert!(feed.is_stale(&(now - Duration::minutes(5))));
        assert!(!feed.is_stale(&(now - Duration::hours(1))));
    }
}

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

//! # Cache keys
//!
//! A [CacheKey] is a non-empty string of at most [MAX_KEY_LENGTH] bytes that contains none of the
//! reserved characters `{}()/\@:`. Callers with arbitrary text (URLs, say) should use
//! [CacheKey::digest].

use std::{fmt::Display, ops::Deref, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use snafu::{Backtrace, prelude::*};

type StdResult<T, E> = std::result::Result<T, E>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{key:?} is not a valid cache key: {reason}"))]
    BadKey {
        key: String,
        reason: String,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            CacheKey                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Longest permissible key, in bytes
pub const MAX_KEY_LENGTH: usize = 250;

const RESERVED: &str = "{}()/\\@:";

fn check_key(key: &str) -> Result<()> {
    let reason = if key.is_empty() {
        "keys may not be empty".to_owned()
    } else if key.len() > MAX_KEY_LENGTH {
        format!("keys are limited to {MAX_KEY_LENGTH} bytes")
    } else if let Some(c) = key.chars().find(|c| RESERVED.contains(*c)) {
        format!("{c:?} is reserved")
    } else {
        return Ok(());
    };
    BadKeySnafu { key, reason }.fail()
}

/// A validated cache key
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Construct a [CacheKey] by copying from a `&str`; to move a [String] in, use
    /// [TryFrom::try_from()]
    pub fn new(key: &str) -> Result<CacheKey> {
        check_key(key)?;
        Ok(CacheKey(key.to_owned()))
    }
    /// Derive a key from arbitrary text: the lowercase hex SHA-256 of `text`
    ///
    /// The result is always a legal key.
    pub fn digest(text: impl AsRef<[u8]>) -> CacheKey {
        CacheKey(hex::encode(Sha256::digest(text.as_ref())))
    }
    /// The lowercase hex SHA-256 of this key; this is what addresses the entry on disk
    pub fn hash(&self) -> String {
        hex::encode(Sha256::digest(self.0.as_bytes()))
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        self.deref()
    }
}

impl Deref for CacheKey {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'de> Deserialize<'de> for CacheKey {
    fn deserialize<D>(deserializer: D) -> StdResult<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        CacheKey::try_from(s).map_err(serde::de::Error::custom)
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CacheKey {
    type Err = Error;

    fn from_str(s: &str) -> StdResult<Self, Self::Err> {
        CacheKey::new(s)
    }
}

impl TryFrom<String> for CacheKey {
    type Error = Error;

    fn try_from(key: String) -> StdResult<Self, Self::Error> {
        check_key(&key)?;
        Ok(CacheKey(key))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn key_validation() {
        assert!(CacheKey::new("feeds.example.com").is_ok());
        assert!(CacheKey::new("a").is_ok());
        assert!(CacheKey::new(&"x".repeat(MAX_KEY_LENGTH)).is_ok());
        assert!(matches!(CacheKey::new(""), Err(Error::BadKey { .. })));
        assert!(matches!(
            CacheKey::new(&"x".repeat(MAX_KEY_LENGTH + 1)),
            Err(Error::BadKey { .. })
        ));
        for bad in ["a{b", "a}b", "(x)", "a/b", "a\\b", "me@home", "http:"] {
            match CacheKey::new(bad) {
                Err(Error::BadKey { key, reason, .. }) => {
                    assert_eq!(key, bad);
                    assert!(reason.ends_with("is reserved"));
                }
                _ => panic!("{bad} should have been rejected"),
            }
        }
    }

    #[test]
    fn digests_are_legal_keys() {
        let key = CacheKey::digest("GET https://example.com/feed.xml text/html");
        assert_eq!(key.len(), 64);
        assert!(CacheKey::new(&key).is_ok());
        assert_eq!(key, CacheKey::digest("GET https://example.com/feed.xml text/html"));
        assert_ne!(key, CacheKey::digest("GET https://example.com/feed.xml"));
    }

    #[test]
    fn hash_is_sha256() {
        // sha256("abc")
        let key = CacheKey::new("abc").unwrap();
        assert_eq!(
            key.hash(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn deserialization_validates() {
        let key: CacheKey = serde_json::from_str("\"front-page\"").unwrap();
        assert_eq!(key.as_ref(), "front-page");
        assert!(serde_json::from_str::<CacheKey>("\"a/b\"").is_err());
    }
}

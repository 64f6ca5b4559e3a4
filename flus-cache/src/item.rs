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

//! # Cache items
//!
//! A [CacheItem] is what [FileCache] hands out and takes back: a key, maybe a value, and maybe an
//! expiration instant.
//!
//! [FileCache]: crate::FileCache

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::key::CacheKey;

/// A (possibly empty) cache slot
#[derive(Clone, Debug)]
pub struct CacheItem<V> {
    key: CacheKey,
    value: Option<V>,
    hit: bool,
    expiration: Option<DateTime<Utc>>,
}

impl<V> CacheItem<V> {
    /// A miss: no value, no expiration
    pub fn new(key: CacheKey) -> CacheItem<V> {
        CacheItem {
            key,
            value: None,
            hit: false,
            expiration: None,
        }
    }
    pub(crate) fn hit(key: CacheKey, value: V, expiration: Option<DateTime<Utc>>) -> CacheItem<V> {
        CacheItem {
            key,
            value: Some(value),
            hit: true,
            expiration,
        }
    }
    pub fn key(&self) -> &CacheKey {
        &self.key
    }
    pub fn get(&self) -> Option<&V> {
        self.value.as_ref()
    }
    pub fn into_value(self) -> Option<V> {
        self.value
    }
    /// True iff this item was read from the cache (setting a value doesn't change this)
    pub fn is_hit(&self) -> bool {
        self.hit
    }
    pub fn set(&mut self, value: V) -> &mut Self {
        self.value = Some(value);
        self
    }
    /// Expire this item at `when`; `None` means "never"
    pub fn expires_at(&mut self, when: Option<DateTime<Utc>>) -> &mut Self {
        self.expiration = when;
        self
    }
    /// Expire this item `ttl` from now; `None` means "never"
    ///
    /// A `ttl` too large to be represented is treated as "never".
    pub fn expires_after(&mut self, ttl: Option<Duration>) -> &mut Self {
        self.expiration = ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .and_then(|ttl| Utc::now().checked_add_signed(ttl));
        self
    }
    pub fn expiration(&self) -> Option<&DateTime<Utc>> {
        self.expiration.as_ref()
    }
    pub fn is_expired_at(&self, now: &DateTime<Utc>) -> bool {
        self.expiration.is_some_and(|exp| exp <= *now)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn new_items_are_empty_misses() {
        let item: CacheItem<u32> = CacheItem::new(CacheKey::new("k").unwrap());
        assert!(!item.is_hit());
        assert!(item.get().is_none());
        assert!(item.expiration().is_none());
        assert!(!item.is_expired_at(&Utc::now()));
    }

    #[test]
    fn setting_a_value_does_not_make_a_hit() {
        let mut item = CacheItem::new(CacheKey::new("k").unwrap());
        item.set(11);
        assert!(!item.is_hit());
        assert_eq!(item.get(), Some(&11));
        assert_eq!(item.into_value(), Some(11));
    }

    #[test]
    fn expiration() {
        let now = Utc::now();
        let mut item = CacheItem::new(CacheKey::new("k").unwrap());
        item.set("v").expires_at(Some(now));
        // expiry is inclusive
        assert!(item.is_expired_at(&now));
        assert!(!item.is_expired_at(&(now - chrono::Duration::seconds(1))));

        item.expires_after(Some(Duration::from_secs(3600)));
        assert!(!item.is_expired_at(&now));
        assert!(item.is_expired_at(&(now + chrono::Duration::hours(2))));

        item.expires_after(None);
        assert!(item.expiration().is_none());

        item.expires_after(Some(Duration::MAX));
        assert!(item.expiration().is_none());
    }
}

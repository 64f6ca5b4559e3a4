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

//! # flus-cache
//!
//! A content-addressed, filesystem-backed key/value cache.
//!
//! Values are wrapped in a [CacheItem], addressed by a validated [CacheKey] and persisted by a
//! [FileCache] under a directory tree sharded by the SHA-256 hash of the key:
//!
//! ```ignore
//! let cache = FileCache::new("/var/cache/flus")?;
//! let key = CacheKey::new("frontpage")?;
//! let mut item: CacheItem<String> = cache.get_item(&key)?;
//! if !item.is_hit() {
//!     item.set(render_frontpage()).expires_after(Some(Duration::from_secs(300)));
//!     cache.save(&item)?;
//! }
//! ```
//!
//! Entries may carry an expiration instant; an expired entry is never served and is removed by
//! [FileCache::clean].

pub mod item;
pub mod key;
#[path = "file-cache.rs"]
pub mod file_cache;

pub use file_cache::{CleanReport, FileCache, Stats};
pub use item::CacheItem;
pub use key::CacheKey;

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

//! # FileCache
//!
//! A [FileCache] stores each entry in its own file, at `<root>/<h0>/<h1>/<h2>/<h>` where `h` is the
//! lowercase hex SHA-256 of the key and `h0`, `h1` & `h2` are its first three characters. This
//! keeps any one directory from growing too large.
//!
//! Each entry file is laid out as:
//!
//! ```text
//! +--------+------+-----------------------+--------------------------------------------+
//! | "FLC1" | flag | expiration (i64 BE s) | gzip(MessagePack((key, value)))            |
//! +--------+------+-----------------------+--------------------------------------------+
//!   4 bytes  1      8
//! ```
//!
//! where `flag` is one if the entry expires & zero if it does not. Keeping the expiration in a
//! fixed-size, uncompressed header means [FileCache::clean] need only read thirteen bytes of each
//! entry.
//!
//! Writes go to a temporary file in the shard directory, which is then renamed into place, so
//! readers never see a partially written entry. Entries that can't be decoded (or whose stored key
//! doesn't match the key used to look them up) are treated as misses & removed.

use std::{
    ffi::OsStr,
    fs::{self, File},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
    time::{Duration, SystemTime},
};

use chrono::{DateTime, Utc};
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use serde::{
    Serialize,
    de::{DeserializeOwned, IgnoredAny},
};
use snafu::{Backtrace, IntoError, prelude::*};
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::{item::CacheItem, key::CacheKey};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to compress the entry for {key}: {source}"))]
    Compress {
        key: CacheKey,
        source: io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The entry at {path:?} is corrupt: {reason}"))]
    Corrupt {
        path: PathBuf,
        reason: &'static str,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to create the cache directory {path:?}: {source}"))]
    CreateDir {
        path: PathBuf,
        source: io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to decode the entry at {path:?}: {source}"))]
    Decode {
        path: PathBuf,
        source: rmp_serde::decode::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to encode the value for {key}: {source}"))]
    Encode {
        key: CacheKey,
        source: rmp_serde::encode::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The entry at {path:?} was stored under {stored:?}"))]
    KeyMismatch {
        path: PathBuf,
        stored: String,
        backtrace: Backtrace,
    },
    #[snafu(display("Can't save the item {key}: it has no value"))]
    NoValue { key: CacheKey, backtrace: Backtrace },
    #[snafu(display("Failed to move the new entry into place at {path:?}: {source}"))]
    Persist {
        path: PathBuf,
        source: tempfile::PersistError,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to read {path:?}: {source}"))]
    Read {
        path: PathBuf,
        source: io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to remove {path:?}: {source}"))]
    Remove {
        path: PathBuf,
        source: io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("While walking the cache directory {path:?}: {source}"))]
    Walk {
        path: PathBuf,
        source: walkdir::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to write a new entry in {path:?}: {source}"))]
    Write {
        path: PathBuf,
        source: io::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      entry (de)serialization                                   //
////////////////////////////////////////////////////////////////////////////////////////////////////

const MAGIC: &[u8; 4] = b"FLC1";
const HEADER_LEN: usize = 13;
const SHARD_DEPTH: usize = 3;
// Temporary files older than this are assumed to have been abandoned by a crashed writer
const STALE_TEMPFILE_AGE: Duration = Duration::from_secs(3600);

fn encode_header(expiration: Option<&DateTime<Utc>>) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(MAGIC);
    if let Some(expiration) = expiration {
        header[4] = 1;
        header[5..].copy_from_slice(&expiration.timestamp().to_be_bytes());
    }
    header
}

/// Parse an entry header; the outer `Option` is `None` if the header is malformed
fn decode_header(bytes: &[u8]) -> Option<Option<DateTime<Utc>>> {
    if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
        return None;
    }
    match bytes[4] {
        0 => Some(None),
        1 => {
            let secs = i64::from_be_bytes(bytes[5..HEADER_LEN].try_into().ok()?);
            DateTime::from_timestamp(secs, 0).map(Some)
        }
        _ => None,
    }
}

fn encode<V: Serialize>(
    key: &CacheKey,
    expiration: Option<&DateTime<Utc>>,
    value: &V,
) -> Result<Vec<u8>> {
    let payload =
        rmp_serde::to_vec(&(key.as_ref(), value)).context(EncodeSnafu { key: key.clone() })?;
    // `Vec<u8>` appends on write, so the gzip stream lands right after the (uncompressed) header
    let mut encoder = GzEncoder::new(encode_header(expiration).to_vec(), Compression::default());
    encoder
        .write_all(&payload)
        .context(CompressSnafu { key: key.clone() })?;
    encoder.finish().context(CompressSnafu { key: key.clone() })
}

struct Entry<V> {
    key: String,
    expiration: Option<DateTime<Utc>>,
    value: V,
}

fn decode<V: DeserializeOwned>(path: &Path, bytes: &[u8]) -> Result<Entry<V>> {
    let expiration = decode_header(bytes).context(CorruptSnafu {
        path,
        reason: "bad header",
    })?;
    let (key, value): (String, V) =
        rmp_serde::from_read(GzDecoder::new(&bytes[HEADER_LEN..])).context(DecodeSnafu { path })?;
    Ok(Entry {
        key,
        expiration,
        value,
    })
}

/// Read just the header of the entry at `path`; `Ok(None)` means the header is malformed
fn read_header(path: &Path) -> io::Result<Option<Option<DateTime<Utc>>>> {
    let mut buf = Vec::with_capacity(HEADER_LEN);
    File::open(path)?
        .take(HEADER_LEN as u64)
        .read_to_end(&mut buf)?;
    Ok(decode_header(&buf))
}

fn is_entry_name(name: &OsStr) -> bool {
    name.to_str()
        .is_some_and(|s| s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit()))
}

fn is_stale_tempfile(name: &OsStr, path: &Path) -> bool {
    name.to_str().is_some_and(|s| s.starts_with(".tmp"))
        && fs::metadata(path)
            .and_then(|md| md.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .is_some_and(|age| age > STALE_TEMPFILE_AGE)
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            FileCache                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// What [FileCache::clean] did
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct CleanReport {
    /// Expired (or unreadable) entries removed
    pub removed_entries: usize,
    /// Empty shard directories removed
    pub removed_dirs: usize,
    /// Live entries left in place
    pub kept_entries: usize,
}

/// A point-in-time summary of a [FileCache]'s contents
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct Stats {
    pub entries: usize,
    pub bytes: u64,
    pub expired: usize,
}

/// A key/value cache living in a directory tree
///
/// [FileCache] is `Send` & `Sync`; share it behind an `Arc`. All operations are blocking; async
/// callers should go through `spawn_blocking`.
#[derive(Debug)]
pub struct FileCache {
    root: PathBuf,
    deferred: Mutex<Vec<(CacheKey, Vec<u8>)>>,
}

impl FileCache {
    /// Open (creating if need be) a cache rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Result<FileCache> {
        let root = root.into();
        fs::create_dir_all(&root).context(CreateDirSnafu { path: root.clone() })?;
        debug!("Opened a file cache at {:?}", root);
        Ok(FileCache {
            root,
            deferred: Mutex::new(Vec::new()),
        })
    }
    pub fn root(&self) -> &Path {
        &self.root
    }
    fn shard_dir(&self, hash: &str) -> PathBuf {
        (0..SHARD_DEPTH).fold(self.root.clone(), |dir, i| dir.join(&hash[i..i + 1]))
    }
    /// The location of the entry for `key`, whether or not it exists
    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        let hash = key.hash();
        self.shard_dir(&hash).join(hash)
    }
    /// Look-up `key`; a missing, expired or unreadable entry produces a miss
    pub fn get_item<V: DeserializeOwned>(&self, key: &CacheKey) -> Result<CacheItem<V>> {
        let path = self.path_for(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(CacheItem::new(key.clone()));
            }
            Err(err) => return Err(ReadSnafu { path }.into_error(err)),
        };
        let result = decode::<V>(&path, &bytes).and_then(|entry| {
            if entry.key == key.as_ref() {
                Ok(entry)
            } else {
                KeyMismatchSnafu {
                    path: path.clone(),
                    stored: entry.key,
                }
                .fail()
            }
        });
        match result {
            Ok(entry) => {
                if entry.expiration.is_some_and(|exp| exp <= Utc::now()) {
                    debug!("Cache entry for {} has expired", key);
                    Ok(CacheItem::new(key.clone()))
                } else {
                    Ok(CacheItem::hit(key.clone(), entry.value, entry.expiration))
                }
            }
            Err(err) => {
                warn!("Discarding the cache entry for {}: {}", key, err);
                self.remove_entry(&path)?;
                Ok(CacheItem::new(key.clone()))
            }
        }
    }
    pub fn get_items<'a, V, I>(&self, keys: I) -> Result<Vec<CacheItem<V>>>
    where
        V: DeserializeOwned,
        I: IntoIterator<Item = &'a CacheKey>,
    {
        keys.into_iter().map(|key| self.get_item(key)).collect()
    }
    /// True iff [FileCache::get_item] would produce a hit for `key`
    ///
    /// The whole entry is decoded (though the value is discarded), so an entry with a good header
    /// but a corrupt body, or one stored under another key, is not counted & is removed.
    pub fn has_item(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.get_item::<IgnoredAny>(key)?.is_hit())
    }
    /// Persist `item` immediately
    pub fn save<V: Serialize>(&self, item: &CacheItem<V>) -> Result<()> {
        let value = item.get().context(NoValueSnafu {
            key: item.key().clone(),
        })?;
        let bytes = encode(item.key(), item.expiration(), value)?;
        self.write_entry(item.key(), &bytes)
    }
    /// Queue `item` to be persisted on the next [FileCache::commit]
    ///
    /// The value is serialized now, so later changes to `item` are not reflected.
    pub fn save_deferred<V: Serialize>(&self, item: &CacheItem<V>) -> Result<()> {
        let value = item.get().context(NoValueSnafu {
            key: item.key().clone(),
        })?;
        let bytes = encode(item.key(), item.expiration(), value)?;
        self.deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((item.key().clone(), bytes));
        Ok(())
    }
    /// Persist every deferred item, returning the number written
    ///
    /// Every queued item is attempted; if any fail, the first failure is returned.
    pub fn commit(&self) -> Result<usize> {
        let pending = std::mem::take(&mut *self.deferred.lock().unwrap_or_else(PoisonError::into_inner));
        let mut first_err = None;
        let mut written = 0;
        for (key, bytes) in pending {
            match self.write_entry(&key, &bytes) {
                Ok(_) => written += 1,
                Err(err) => {
                    warn!("Failed to commit the cache entry for {}: {}", key, err);
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(written),
        }
    }
    fn write_entry(&self, key: &CacheKey, bytes: &[u8]) -> Result<()> {
        let hash = key.hash();
        let dir = self.shard_dir(&hash);
        fs::create_dir_all(&dir).context(CreateDirSnafu { path: dir.clone() })?;
        let mut tmp = NamedTempFile::new_in(&dir).context(WriteSnafu { path: dir.clone() })?;
        tmp.write_all(bytes)
            .context(WriteSnafu { path: dir.clone() })?;
        tmp.persist(dir.join(&hash))
            .context(PersistSnafu { path: dir.join(&hash) })?;
        Ok(())
    }
    fn remove_entry(&self, path: &Path) -> Result<bool> {
        match fs::remove_file(path) {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(RemoveSnafu { path }.into_error(err)),
        }
    }
    /// Remove the entry for `key`; returns true iff there was one
    pub fn delete_item(&self, key: &CacheKey) -> Result<bool> {
        self.remove_entry(&self.path_for(key))
    }
    /// Remove the entries for `keys`, returning the number actually removed
    pub fn delete_items<'a, I>(&self, keys: I) -> Result<usize>
    where
        I: IntoIterator<Item = &'a CacheKey>,
    {
        keys.into_iter().try_fold(0, |n, key| {
            Ok(if self.delete_item(key)? { n + 1 } else { n })
        })
    }
    /// Remove every entry (and drop any deferred items), leaving an empty root directory
    pub fn clear(&self) -> Result<()> {
        self.deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        let children = fs::read_dir(&self.root).context(ReadSnafu {
            path: self.root.clone(),
        })?;
        for child in children {
            let child = child.context(ReadSnafu {
                path: self.root.clone(),
            })?;
            let path = child.path();
            let res = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            res.context(RemoveSnafu { path })?;
        }
        Ok(())
    }
    /// Remove expired entries & prune empty shard directories
    pub fn clean(&self) -> Result<CleanReport> {
        self.clean_at(Utc::now())
    }
    /// Remove entries expiring at or before `now` & prune empty shard directories
    ///
    /// Unreadable entries are removed as well. The walk visits directory contents before the
    /// directory itself, so shards emptied by this sweep are removed in the same pass.
    pub fn clean_at(&self, now: DateTime<Utc>) -> Result<CleanReport> {
        let mut report = CleanReport::default();
        for entry in WalkDir::new(&self.root).min_depth(1).contents_first(true) {
            let entry = entry.context(WalkSnafu {
                path: self.root.clone(),
            })?;
            let path = entry.path();
            if entry.file_type().is_dir() {
                let empty = fs::read_dir(path)
                    .context(ReadSnafu { path })?
                    .next()
                    .is_none();
                if empty {
                    match fs::remove_dir(path) {
                        Ok(_) => report.removed_dirs += 1,
                        Err(err) if err.kind() == io::ErrorKind::NotFound => (),
                        Err(err) => return Err(RemoveSnafu { path }.into_error(err)),
                    }
                }
            } else if is_entry_name(entry.file_name()) {
                match read_header(path) {
                    Ok(Some(Some(exp))) if exp <= now => {
                        if self.remove_entry(path)? {
                            report.removed_entries += 1;
                        }
                    }
                    Ok(None) => {
                        warn!("Removing the unreadable cache entry {:?}", path);
                        if self.remove_entry(path)? {
                            report.removed_entries += 1;
                        }
                    }
                    Ok(Some(_)) => report.kept_entries += 1,
                    Err(err) if err.kind() == io::ErrorKind::NotFound => (),
                    Err(err) => return Err(ReadSnafu { path }.into_error(err)),
                }
            } else if is_stale_tempfile(entry.file_name(), path) {
                debug!("Removing the abandoned temporary file {:?}", path);
                self.remove_entry(path)?;
            }
        }
        debug!("Cleaned the cache at {:?}: {:?}", self.root, report);
        Ok(report)
    }
    pub fn stats(&self) -> Result<Stats> {
        let now = Utc::now();
        let mut stats = Stats::default();
        for entry in WalkDir::new(&self.root).min_depth(1) {
            let entry = entry.context(WalkSnafu {
                path: self.root.clone(),
            })?;
            if !entry.file_type().is_file() || !is_entry_name(entry.file_name()) {
                continue;
            }
            let path = entry.path();
            stats.entries += 1;
            stats.bytes += entry
                .metadata()
                .map(|md| md.len())
                .context(WalkSnafu { path })?;
            match read_header(path) {
                Ok(Some(Some(exp))) if exp <= now => stats.expired += 1,
                Ok(_) => (),
                Err(err) if err.kind() == io::ErrorKind::NotFound => (),
                Err(err) => return Err(ReadSnafu { path }.into_error(err)),
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use serde::Deserialize;

    #[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
    struct Page {
        status: u16,
        body: Vec<u8>,
    }

    fn key(s: &str) -> CacheKey {
        CacheKey::new(s).unwrap()
    }

    #[test]
    fn save_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path().join("cache")).unwrap();

        let miss: CacheItem<Page> = cache.get_item(&key("page")).unwrap();
        assert!(!miss.is_hit());
        assert!(!cache.has_item(&key("page")).unwrap());

        let page = Page {
            status: 200,
            body: b"<html></html>".to_vec(),
        };
        let mut item = CacheItem::new(key("page"));
        item.set(page.clone());
        cache.save(&item).unwrap();

        let hit: CacheItem<Page> = cache.get_item(&key("page")).unwrap();
        assert!(hit.is_hit());
        assert_eq!(hit.get(), Some(&page));
        assert!(hit.expiration().is_none());
        assert!(cache.has_item(&key("page")).unwrap());
    }

    #[test]
    fn entries_are_sharded_by_hash() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path()).unwrap();
        let k = key("abc");
        let path = cache.path_for(&k);
        assert_eq!(
            path,
            dir.path()
                .join("b")
                .join("a")
                .join("7")
                .join("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
        let mut item = CacheItem::new(k);
        item.set(1u8);
        cache.save(&item).unwrap();
        let bytes = fs::read(&path).unwrap();
        assert_eq!(&bytes[..4], b"FLC1");
        assert_eq!(bytes[4], 0);
    }

    #[test]
    fn expired_entries_are_misses() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path()).unwrap();
        let mut item = CacheItem::new(key("old"));
        item.set("stale".to_owned())
            .expires_at(Some(Utc::now() - chrono::Duration::seconds(10)));
        cache.save(&item).unwrap();
        let read: CacheItem<String> = cache.get_item(&key("old")).unwrap();
        assert!(!read.is_hit());
        assert!(!cache.has_item(&key("old")).unwrap());

        let mut item = CacheItem::new(key("fresh"));
        item.set("fresh".to_owned())
            .expires_after(Some(Duration::from_secs(3600)));
        cache.save(&item).unwrap();
        let read: CacheItem<String> = cache.get_item(&key("fresh")).unwrap();
        assert!(read.is_hit());
        assert!(read.expiration().is_some());
    }

    #[test]
    fn saving_without_a_value_fails() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path()).unwrap();
        let item: CacheItem<String> = CacheItem::new(key("nothing"));
        assert!(matches!(cache.save(&item), Err(Error::NoValue { .. })));
        assert!(matches!(
            cache.save_deferred(&item),
            Err(Error::NoValue { .. })
        ));
    }

    #[test]
    fn deferred_items_appear_on_commit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path()).unwrap();
        for (k, v) in [("a", 1u32), ("b", 2u32)] {
            let mut item = CacheItem::new(key(k));
            item.set(v);
            cache.save_deferred(&item).unwrap();
        }
        let items: Vec<CacheItem<u32>> = cache.get_items([&key("a"), &key("b")]).unwrap();
        assert!(items.iter().all(|item| !item.is_hit()));

        assert_eq!(cache.commit().unwrap(), 2);
        let items: Vec<CacheItem<u32>> = cache.get_items([&key("a"), &key("b")]).unwrap();
        assert_eq!(
            items.iter().map(|item| item.get().copied()).collect::<Vec<_>>(),
            vec![Some(1), Some(2)]
        );
        assert_eq!(cache.commit().unwrap(), 0);
    }

    #[test]
    fn delete_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path().join("c")).unwrap();
        for k in ["a", "b", "c"] {
            let mut item = CacheItem::new(key(k));
            item.set(k.to_owned());
            cache.save(&item).unwrap();
        }
        assert!(cache.delete_item(&key("a")).unwrap());
        assert!(!cache.delete_item(&key("a")).unwrap());
        assert_eq!(cache.delete_items([&key("a"), &key("b")]).unwrap(), 1);
        assert!(cache.has_item(&key("c")).unwrap());

        cache.clear().unwrap();
        assert!(!cache.has_item(&key("c")).unwrap());
        assert!(cache.root().is_dir());
        assert_eq!(fs::read_dir(cache.root()).unwrap().count(), 0);
    }

    #[test]
    fn clean_removes_expired_entries_and_empty_shards() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path()).unwrap();
        let now = Utc::now();

        let mut item = CacheItem::new(key("keep"));
        item.set(1u8);
        cache.save(&item).unwrap();
        let mut item = CacheItem::new(key("later"));
        item.set(2u8).expires_at(Some(now + chrono::Duration::hours(1)));
        cache.save(&item).unwrap();
        let mut item = CacheItem::new(key("gone"));
        item.set(3u8).expires_at(Some(now + chrono::Duration::seconds(30)));
        cache.save(&item).unwrap();

        let stats = cache.stats().unwrap();
        assert_eq!(stats.entries, 3);
        assert_eq!(stats.expired, 0);
        assert!(stats.bytes > 0);

        let report = cache.clean_at(now + chrono::Duration::minutes(1)).unwrap();
        assert_eq!(report.removed_entries, 1);
        assert_eq!(report.kept_entries, 2);
        // "gone" shares no shard prefix with the survivors, so all three of its levels go
        assert_eq!(report.removed_dirs, 3);
        assert!(!cache.path_for(&key("gone")).exists());
        assert!(!cache.path_for(&key("gone")).parent().unwrap().exists());
        assert!(cache.has_item(&key("keep")).unwrap());
        assert!(cache.has_item(&key("later")).unwrap());

        let report = cache.clean_at(now + chrono::Duration::hours(2)).unwrap();
        assert_eq!(report.removed_entries, 1);
        assert_eq!(cache.stats().unwrap().entries, 1);
    }

    #[test]
    fn corrupt_entries_are_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path()).unwrap();
        let k = key("corrupt");
        let path = cache.path_for(&k);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"FLC1\x00garbage-that-is-not-gzip").unwrap();

        let item: CacheItem<String> = cache.get_item(&k).unwrap();
        assert!(!item.is_hit());
        assert!(!path.exists());

        fs::write(&path, b"nope").unwrap();
        let report = cache.clean().unwrap();
        assert_eq!(report.removed_entries, 1);
    }

    #[test]
    fn has_item_looks_past_the_header() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path()).unwrap();
        let k = key("truncated");
        let mut item = CacheItem::new(k.clone());
        item.set("a value long enough to be worth compressing".repeat(8));
        cache.save(&item).unwrap();
        assert!(cache.has_item(&k).unwrap());

        // A good header followed by a damaged body
        let path = cache.path_for(&k);
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..HEADER_LEN + 4]).unwrap();
        assert!(!cache.has_item(&k).unwrap());
        assert!(!path.exists());

        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"FLC1\x00\x00\x00\x00\x00\x00\x00\x00\x00not gzip").unwrap();
        assert!(!cache.has_item(&k).unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn key_mismatches_are_misses() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path()).unwrap();
        let mut item = CacheItem::new(key("one"));
        item.set(1u64);
        cache.save(&item).unwrap();

        // Move "one"'s entry to where "two" should be
        let two = cache.path_for(&key("two"));
        fs::create_dir_all(two.parent().unwrap()).unwrap();
        fs::rename(cache.path_for(&key("one")), &two).unwrap();

        let item: CacheItem<u64> = cache.get_item(&key("two")).unwrap();
        assert!(!item.is_hit());
        assert!(!two.exists());

        let mut item = CacheItem::new(key("one"));
        item.set(1u64);
        cache.save(&item).unwrap();
        fs::rename(cache.path_for(&key("one")), &two).unwrap();
        assert!(!cache.has_item(&key("two")).unwrap());
        assert!(!two.exists());
    }
}

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

//! # flus
//!
//! Social bookmarking & feed reading.
//!
//! Users save [links], gather them into [collections], follow one another's public collections (and
//! syndication feeds, which flus mirrors as collections), comment on links, and receive a daily
//! selection of "news" drawn from all of the above.
//!
//! The heart of the crate is the fetch pipeline: an HTTP [client] whose responses are kept in a
//! [FileCache], an HTML metadata extractor ([dom]), a syndication-format parser ([feeds]) and the
//! two fetchers built on top of them ([link_fetcher] & [feed_fetcher]). Around that sit the
//! [storage] abstraction (with an in-memory implementation in [memory]), the [news] picker, OPML
//! support ([opml]), [exportation], the periodic [jobs] run by `flusd` & its operational endpoints
//! ([ops]).
//!
//! [links]: entities::Link
//! [collections]: entities::Collection
//! [FileCache]: flus_cache::FileCache

pub mod client;
pub mod dom;
pub mod entities;
pub mod exportation;
#[path = "feed-fetcher.rs"]
pub mod feed_fetcher;
pub mod feeds;
pub mod flus;
pub mod jobs;
#[path = "link-fetcher.rs"]
pub mod link_fetcher;
pub mod memory;
pub mod metrics;
pub mod news;
pub mod opml;
pub mod ops;
pub mod storage;
pub mod urls;

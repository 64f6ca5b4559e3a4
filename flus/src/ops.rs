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

//! # Operational endpoints
//!
//! A handful of local-only HTTP endpoints through which an operator can kick the background
//! machinery by hand: sweep the cache, sync feeds or links, build a user's news, export a user.
//! `flusd` nests [make_router] under `/ops` on its private listener.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;
use flus_cache::{CleanReport, FileCache};
use http::{StatusCode, header};
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, prelude::*};
use tracing::error;

use crate::{
    define_metric,
    entities::{Link, Username},
    feed_fetcher,
    flus::{self, Flus},
    jobs::JobsConfig,
    link_fetcher,
    metrics::Sort,
    news::Suggestion,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Bad username: {source}"))]
    BadUsername {
        source: crate::entities::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Cache cleaning failed: {source}"))]
    Cache {
        source: flus_cache::file_cache::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Feed sync failed: {source}"))]
    Feeds {
        #[snafu(backtrace)]
        source: feed_fetcher::Error,
    },
    #[snafu(display("{source}"))]
    Flus {
        #[snafu(backtrace)]
        source: flus::Error,
    },
    #[snafu(display("Failed to join a blocking task: {source}"))]
    Join {
        source: tokio::task::JoinError,
        backtrace: Backtrace,
    },
    #[snafu(display("Link sync failed: {source}"))]
    Links {
        #[snafu(backtrace)]
        source: link_fetcher::Error,
    },
}

impl Error {
    fn as_status_and_msg(&self) -> (StatusCode, String) {
        match self {
            Error::BadUsername { .. } => (StatusCode::BAD_REQUEST, self.to_string()),
            Error::Flus {
                source: flus::Error::NoSuchUser { .. },
            } => (StatusCode::NOT_FOUND, self.to_string()),
            _ => {
                error!("{}", self);
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
        }
    }
}

/// JSON body of an error response
#[derive(Debug, Deserialize, Serialize)]
pub struct ErrorResponseBody {
    pub error: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        ops_errors.add(1, &[]);
        let (code, msg) = self.as_status_and_msg();
        (code, Json(ErrorResponseBody { error: msg })).into_response()
    }
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            handlers                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

define_metric! { "ops.requests", ops_requests, Sort::IntegralCounter }
define_metric! { "ops.errors",   ops_errors,   Sort::IntegralCounter }

/// State shared by the ops handlers
pub struct Ops {
    pub flus: Arc<Flus>,
    pub cache: Arc<FileCache>,
    pub jobs: JobsConfig,
}

async fn user_named(state: &Ops, username: &str) -> Result<crate::entities::User> {
    let username = Username::new(username).context(BadUsernameSnafu)?;
    state.flus.user(&username).await.context(FlusSnafu)
}

async fn clean_cache(State(state): State<Arc<Ops>>) -> Result<Json<CleanReport>> {
    ops_requests.add(1, &[]);
    let cache = state.cache.clone();
    tokio::task::spawn_blocking(move || cache.clean())
        .await
        .context(JoinSnafu)?
        .context(CacheSnafu)
        .map(Json)
}

async fn sync_feeds(State(state): State<Arc<Ops>>) -> Result<Json<feed_fetcher::SyncReport>> {
    ops_requests.add(1, &[]);
    let before = chrono::Duration::from_std(state.jobs.feeds_refresh_after)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .unwrap_or_else(Utc::now);
    state
        .flus
        .feed_fetcher()
        .sync(&before, state.jobs.feeds_batch_size)
        .await
        .context(FeedsSnafu)
        .map(Json)
}

async fn sync_links(State(state): State<Arc<Ops>>) -> Result<Json<link_fetcher::SyncReport>> {
    ops_requests.add(1, &[]);
    state
        .flus
        .link_fetcher()
        .sync(state.jobs.links_batch_size)
        .await
        .context(LinksSnafu)
        .map(Json)
}

async fn news(
    State(state): State<Arc<Ops>>,
    Path(username): Path<String>,
) -> Result<Json<Vec<Suggestion>>> {
    ops_requests.add(1, &[]);
    let user = user_named(&state, &username).await?;
    state.flus.news(&user).await.context(FlusSnafu).map(Json)
}

async fn fill_news(
    State(state): State<Arc<Ops>>,
    Path(username): Path<String>,
) -> Result<Json<Vec<Link>>> {
    ops_requests.add(1, &[]);
    let user = user_named(&state, &username).await?;
    state.flus.fill_news(&user).await.context(FlusSnafu).map(Json)
}

async fn export(
    State(state): State<Arc<Ops>>,
    Path(username): Path<String>,
) -> Result<impl IntoResponse> {
    ops_requests.add(1, &[]);
    let user = user_named(&state, &username).await?;
    let archive = state.flus.export(&user).await.context(FlusSnafu)?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/gzip".to_owned()),
            (
                header::CONTENT_DISPOSITION,
                format!(
                    "attachment; filename=\"{}-{}.tar.gz\"",
                    user.username,
                    Utc::now().format("%Y%m%d%H%M%S")
                ),
            ),
        ],
        archive,
    ))
}

/// Build the ops [Router]
pub fn make_router(state: Arc<Ops>) -> Router {
    Router::new()
        .route("/cache/clean", post(clean_cache))
        .route("/feeds/sync", post(sync_feeds))
        .route("/links/sync", post(sync_links))
        .route("/news/{username}", get(news).post(fill_news))
        .route("/export/{username}", get(export))
        .with_state(state)
}

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

//! # Periodic background jobs
//!
//! `flusd` keeps its data fresh by running a handful of [Job]s on a schedule: feeds & links are
//! re-fetched in batches, the HTTP cache is swept, and the in-memory store is snapshotted to disk.
//!
//! A [Processor] drives the jobs. Every job is due at startup; after that, a job is next due one
//! `period` after its previous run completes (or fails, or times out), so each job runs at most once
//! at a time, under a timeout. The processor is signalled to stop through [Processor::shutdown], at
//! which point it gives in-flight jobs a grace period to complete.

use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use flus_cache::FileCache;
use opentelemetry::KeyValue;
use serde::Deserialize;
use snafu::{Backtrace, IntoError, prelude::*};
use tokio::{
    sync::Notify,
    task::{Id, JoinError, JoinHandle, JoinSet},
    time::{Instant, error::Elapsed},
};
use tracing::{debug, error, info, warn};

use crate::{define_metric, flus::Flus, memory::Store, metrics::Sort};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Cache cleaning failed: {source}"))]
    Cache {
        source: flus_cache::file_cache::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Feed sync failed: {source}"))]
    Feeds {
        #[snafu(backtrace)]
        source: crate::feed_fetcher::Error,
    },
    #[snafu(display("Failed to join a task: {source}"))]
    Join {
        source: JoinError,
        backtrace: Backtrace,
    },
    #[snafu(display("Link sync failed: {source}"))]
    Links {
        #[snafu(backtrace)]
        source: crate::link_fetcher::Error,
    },
    #[snafu(display("In-flight jobs failed to complete in time"))]
    ShutdownTimeout {
        source: Elapsed,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to snapshot the store: {source}"))]
    Snapshot {
        source: crate::memory::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         configuration                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct JobsConfig {
    pub feeds_sync_period: Duration,
    /// Maximum number of feeds fetched per sync
    pub feeds_batch_size: usize,
    /// Feeds are re-fetched once they're this old
    pub feeds_refresh_after: Duration,
    pub links_sync_period: Duration,
    pub links_batch_size: usize,
    pub cache_clean_period: Duration,
    pub snapshot_period: Duration,
    /// Timeout for any job that doesn't define its own
    pub default_timeout: Duration,
    /// How long the processor idles between checks for due jobs
    pub sleep_duration: Duration,
    /// How long to wait for in-flight jobs on shutdown
    pub shutdown_timeout: Duration,
}

impl Default for JobsConfig {
    fn default() -> Self {
        JobsConfig {
            feeds_sync_period: Duration::from_secs(60),
            feeds_batch_size: 25,
            feeds_refresh_after: Duration::from_secs(60 * 60),
            links_sync_period: Duration::from_secs(60),
            links_batch_size: 25,
            cache_clean_period: Duration::from_secs(24 * 60 * 60),
            snapshot_period: Duration::from_secs(5 * 60),
            default_timeout: Duration::from_secs(5 * 60),
            sleep_duration: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         Job & Processor                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Something to be done periodically
///
/// The context type is a trait parameter (rather than a method parameter) so that the trait
/// remains object-safe.
#[async_trait]
pub trait Job<C>: Send + Sync {
    fn name(&self) -> &'static str;
    /// Time between the end of one run & the start of the next
    fn period(&self) -> Duration;
    /// [None] means the processor's default
    fn timeout(&self) -> Option<Duration> {
        None
    }
    async fn run(&self, context: C) -> Result<()>;
}

define_metric! { "jobs.completed",        jobs_completed,        Sort::IntegralCounter }
define_metric! { "jobs.failed",           jobs_failed,           Sort::IntegralCounter }
define_metric! { "jobs.in_flight",        jobs_in_flight,        Sort::IntegralGauge }
define_metric! { "jobs.duration_seconds", jobs_duration_seconds, Sort::FloatGauge }

/// Handle on a running job processor
pub struct Processor {
    processor: JoinHandle<Result<()>>,
    shutdown: Arc<Notify>,
}

impl Processor {
    /// Signal the processor to stop, and wait up to `timeout` for it to do so
    pub async fn shutdown(self, timeout: Duration) -> Result<()> {
        self.shutdown.notify_one();
        tokio::time::timeout(timeout, self.processor)
            .await
            .context(ShutdownTimeoutSnafu)?
            .context(JoinSnafu)?
    }
    /// Split the instance back into it's parts
    pub fn into_parts(self) -> (JoinHandle<Result<()>>, Arc<Notify>) {
        (self.processor, self.shutdown)
    }
}

struct Scheduled<C> {
    job: Arc<dyn Job<C>>,
    due: Instant,
    running: bool,
}

async fn process<C: Clone + Send + 'static>(
    jobs: Vec<Arc<dyn Job<C>>>,
    context: C,
    config: JobsConfig,
    shutdown: Arc<Notify>,
) -> Result<()> {
    let start = Instant::now();
    let mut schedule: Vec<Scheduled<C>> = jobs
        .into_iter()
        .map(|job| Scheduled {
            job,
            due: start,
            running: false,
        })
        .collect();
    let mut in_flight: HashMap<Id, usize> = HashMap::new();
    let mut futures = JoinSet::new();

    loop {
        let now = Instant::now();
        for (idx, entry) in schedule.iter_mut().enumerate() {
            if entry.running || entry.due > now {
                continue;
            }
            entry.running = true;
            let job = entry.job.clone();
            let timeout = job.timeout().unwrap_or(config.default_timeout);
            let context = context.clone();
            debug!("Starting job {}", job.name());
            let id = futures
                .spawn(async move {
                    let started = Instant::now();
                    let outcome = tokio::time::timeout(timeout, job.run(context)).await;
                    (started.elapsed(), outcome)
                })
                .id();
            in_flight.insert(id, idx);
        }
        jobs_in_flight.record(futures.len() as u64, &[]);

        tokio::select! {
            Some(result) = futures.join_next_with_id(), if !futures.is_empty() => {
                let (id, (elapsed, outcome)) = match result {
                    Ok(completed) => completed,
                    Err(err) => {
                        // A panicking job takes the processor down with it
                        return Err(JoinSnafu.into_error(err));
                    }
                };
                let Some(entry) = in_flight.remove(&id).and_then(|idx| schedule.get_mut(idx)) else {
                    continue;
                };
                entry.running = false;
                entry.due = Instant::now() + entry.job.period();
                let name = entry.job.name();
                let attrs = [KeyValue::new("job", name)];
                jobs_duration_seconds.record(elapsed.as_secs_f64(), &attrs);
                match outcome {
                    Ok(Ok(())) => {
                        debug!("Job {} completed in {:?}", name, elapsed);
                        jobs_completed.add(1, &attrs);
                    }
                    Ok(Err(err)) => {
                        warn!("Job {} failed: {}", name, err);
                        jobs_failed.add(1, &attrs);
                    }
                    Err(_) => {
                        warn!("Job {} timed out after {:?}", name, elapsed);
                        jobs_failed.add(1, &attrs);
                    }
                }
            },
            _ = tokio::time::sleep(config.sleep_duration) => (),
            _ = shutdown.notified() => break,
        }
    }

    info!("Job processor shutting down; {} jobs in flight", futures.len());
    tokio::time::timeout(config.shutdown_timeout, futures.join_all())
        .await
        .context(ShutdownTimeoutSnafu)?;
    jobs_in_flight.record(0, &[]);
    Ok(())
}

/// Start driving `jobs` on a new task
pub fn start<C: Clone + Send + 'static>(
    jobs: Vec<Arc<dyn Job<C>>>,
    context: C,
    config: JobsConfig,
) -> Processor {
    let shutdown = Arc::new(Notify::new());
    let processor = tokio::spawn(process(jobs, context, config, shutdown.clone()));
    Processor {
        processor,
        shutdown,
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           flus jobs                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Everything the standard jobs need
pub struct Context {
    pub flus: Arc<Flus>,
    pub store: Arc<Store>,
    pub cache: Arc<FileCache>,
    pub state_file: PathBuf,
}

pub struct FeedsSync {
    period: Duration,
    batch_size: usize,
    refresh_after: Duration,
}

#[async_trait]
impl Job<Arc<Context>> for FeedsSync {
    fn name(&self) -> &'static str {
        "feeds-sync"
    }
    fn period(&self) -> Duration {
        self.period
    }
    async fn run(&self, context: Arc<Context>) -> Result<()> {
        let before = chrono::Duration::from_std(self.refresh_after)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or_else(Utc::now);
        context
            .flus
            .feed_fetcher()
            .sync(&before, self.batch_size)
            .await
            .context(FeedsSnafu)?;
        Ok(())
    }
}

pub struct LinksSync {
    period: Duration,
    batch_size: usize,
}

#[async_trait]
impl Job<Arc<Context>> for LinksSync {
    fn name(&self) -> &'static str {
        "links-sync"
    }
    fn period(&self) -> Duration {
        self.period
    }
    async fn run(&self, context: Arc<Context>) -> Result<()> {
        context
            .flus
            .link_fetcher()
            .sync(self.batch_size)
            .await
            .context(LinksSnafu)?;
        Ok(())
    }
}

pub struct CacheCleaner {
    period: Duration,
}

#[async_trait]
impl Job<Arc<Context>> for CacheCleaner {
    fn name(&self) -> &'static str {
        "cache-cleaner"
    }
    fn period(&self) -> Duration {
        self.period
    }
    async fn run(&self, context: Arc<Context>) -> Result<()> {
        let cache = context.cache.clone();
        let report = tokio::task::spawn_blocking(move || cache.clean())
            .await
            .context(JoinSnafu)?
            .context(CacheSnafu)?;
        info!(
            "Cache cleaned: {} entries & {} directories removed, {} entries kept",
            report.removed_entries, report.removed_dirs, report.kept_entries
        );
        context.flus.fetcher().forget_idle_hosts();
        Ok(())
    }
}

pub struct Snapshot {
    period: Duration,
}

#[async_trait]
impl Job<Arc<Context>> for Snapshot {
    fn name(&self) -> &'static str {
        "snapshot"
    }
    fn period(&self) -> Duration {
        self.period
    }
    async fn run(&self, context: Arc<Context>) -> Result<()> {
        context
            .store
            .save(&context.state_file)
            .await
            .context(SnapshotSnafu)
            .inspect_err(|err| error!("{}", err))
    }
}

/// The jobs `flusd` runs
pub fn standard_jobs(config: &JobsConfig) -> Vec<Arc<dyn Job<Arc<Context>>>> {
    vec![
        Arc::new(FeedsSync {
            period: config.feeds_sync_period,
            batch_size: config.feeds_batch_size,
            refresh_after: config.feeds_refresh_after,
        }),
        Arc::new(LinksSync {
            period: config.links_sync_period,
            batch_size: config.links_batch_size,
        }),
        Arc::new(CacheCleaner {
            period: config.cache_clean_period,
        }),
        Arc::new(Snapshot {
            period: config.snapshot_period,
        }),
    ]
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use crate::{
        client::test::test_fetcher, entities::Username, news::NewsConfig, storage::Backend,
    };

    /// Counts its runs, and the maximum number of simultaneous runs
    #[derive(Default)]
    struct Counters {
        runs: AtomicUsize,
        running: AtomicUsize,
        max_running: AtomicUsize,
        starts: Mutex<Vec<Instant>>,
    }

    struct Sleeper {
        period: Duration,
        nap: Duration,
        timeout: Option<Duration>,
    }

    #[async_trait]
    impl Job<Arc<Counters>> for Sleeper {
        fn name(&self) -> &'static str {
            "sleeper"
        }
        fn period(&self) -> Duration {
            self.period
        }
        fn timeout(&self) -> Option<Duration> {
            self.timeout
        }
        async fn run(&self, counters: Arc<Counters>) -> Result<()> {
            counters.starts.lock().unwrap().push(Instant::now());
            let now = counters.running.fetch_add(1, Ordering::SeqCst) + 1;
            counters.max_running.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.nap).await;
            counters.running.fetch_sub(1, Ordering::SeqCst);
            counters.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fast_config() -> JobsConfig {
        JobsConfig {
            sleep_duration: Duration::from_millis(5),
            shutdown_timeout: Duration::from_millis(500),
            ..JobsConfig::default()
        }
    }

    #[tokio::test]
    async fn jobs_run_periodically_one_at_a_time() {
        let counters = Arc::new(Counters::default());
        let processor = start(
            vec![Arc::new(Sleeper {
                period: Duration::from_millis(1),
                nap: Duration::from_millis(30),
                timeout: None,
            }) as Arc<dyn Job<Arc<Counters>>>],
            counters.clone(),
            fast_config(),
        );
        tokio::time::sleep(Duration::from_millis(300)).await;
        processor.shutdown(Duration::from_secs(2)).await.unwrap();
        assert!(counters.runs.load(Ordering::SeqCst) >= 2);
        assert_eq!(counters.max_running.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn next_run_is_due_a_period_after_completion() {
        let counters = Arc::new(Counters::default());
        let processor = start(
            vec![Arc::new(Sleeper {
                period: Duration::from_millis(40),
                nap: Duration::from_millis(40),
                timeout: None,
            }) as Arc<dyn Job<Arc<Counters>>>],
            counters.clone(),
            fast_config(),
        );
        tokio::time::sleep(Duration::from_millis(400)).await;
        processor.shutdown(Duration::from_secs(2)).await.unwrap();
        let starts = counters.starts.lock().unwrap().clone();
        assert!(starts.len() >= 2);
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(80));
        }
    }

    #[tokio::test]
    async fn timeouts_do_not_stop_the_processor() {
        let counters = Arc::new(Counters::default());
        let processor = start(
            vec![
                Arc::new(Sleeper {
                    period: Duration::from_millis(1),
                    nap: Duration::from_secs(10),
                    timeout: Some(Duration::from_millis(10)),
                }) as Arc<dyn Job<Arc<Counters>>>,
                Arc::new(Sleeper {
                    period: Duration::from_millis(20),
                    nap: Duration::from_millis(1),
                    timeout: None,
                }),
            ],
            counters.clone(),
            fast_config(),
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
        processor.shutdown(Duration::from_secs(2)).await.unwrap();
        // Only the quick sleeper ever finishes
        assert!(counters.runs.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn snapshot_and_cache_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("cache");
        let store = Arc::new(Store::new());
        let fetcher = Arc::new(test_fetcher(&cache_dir));
        let cache = fetcher.cache().clone();
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(200))
            .mount(&server)
            .await;
        fetcher
            .get(
                &url::Url::parse(&server.uri()).unwrap(),
                crate::client::ACCEPT_HTML,
                crate::client::CachePolicy::Bypass,
            )
            .await
            .unwrap();
        assert_eq!(fetcher.rate_limited_hosts(), 1);
        let flus = Flus::new(
            store.clone(),
            fetcher,
            &Username::new("flus").unwrap(),
            NewsConfig::default(),
        )
        .await
        .unwrap();
        let context = Arc::new(Context {
            flus: Arc::new(flus),
            store,
            cache,
            state_file: dir.path().join("state.json"),
        });

        let jobs = standard_jobs(&JobsConfig::default());
        assert_eq!(
            jobs.iter().map(|job| job.name()).collect::<Vec<_>>(),
            vec!["feeds-sync", "links-sync", "cache-cleaner", "snapshot"]
        );
        tokio::time::sleep(Duration::from_millis(250)).await;
        for job in &jobs {
            job.run(context.clone()).await.unwrap();
        }
        assert_eq!(context.flus.fetcher().rate_limited_hosts(), 0);
        let restored = Store::load(&dir.path().join("state.json")).await.unwrap();
        assert!(
            restored
                .user_for_name(&Username::new("flus").unwrap())
                .await
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn config_from_toml() {
        let config: JobsConfig = toml::from_str(
            r#"feeds-batch-size = 5
snapshot-period = { secs = 30, nanos = 0 }
"#,
        )
        .unwrap();
        assert_eq!(config.feeds_batch_size, 5);
        assert_eq!(config.snapshot_period, Duration::from_secs(30));
        assert_eq!(config.links_batch_size, 25);
    }
}

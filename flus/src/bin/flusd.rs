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

//! # flusd
//!
//! The flus daemon.
//!
//! flusd keeps a flus instance fresh: it loads the store snapshot, runs the periodic jobs (feed &
//! link syncs, cache sweeps, snapshots) and serves two small HTTP surfaces: a public one for
//! health-checks & metrics, and a private one with operational endpoints. It runs in the
//! foreground; `SIGHUP` re-reads configuration (and re-opens the log file, if there is one),
//! `SIGTERM` shuts everything down after writing a final snapshot.

use std::{
    env,
    fmt::Display,
    fs::OpenOptions,
    future::IntoFuture,
    io,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use axum::{Router, extract::State, routing::get};
use clap::{Arg, ArgAction, Command, crate_authors, crate_version, value_parser};
use http::{HeaderName, HeaderValue, StatusCode};
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_prometheus_text_exporter::PrometheusExporter;
use serde::Deserialize;
use snafu::{IntoError, prelude::*};
use tap::Pipe;
use tokio::{
    net::TcpListener,
    signal::unix::{SignalKind, signal},
    sync::{Notify, mpsc},
};
use tower_http::{
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::{
    Layer, Registry,
    filter::EnvFilter,
    fmt::{self, MakeWriter},
    layer::SubscriberExt,
};
use url::Url;

use flus::{
    client::{self, Fetcher, default_user_agent},
    entities::Username,
    flus::Flus,
    jobs::{self, JobsConfig},
    memory::Store,
    metrics::check_metric_names,
    news::NewsConfig,
    ops::{self, Ops},
};
use flus_cache::FileCache;

#[derive(Snafu)]
pub enum Error {
    #[snafu(display("Failed to bind to {addr}: {source}"))]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[snafu(display("Failed to open the cache: {source}"))]
    Cache {
        source: flus_cache::file_cache::Error,
    },
    #[snafu(display("Failed to create an HTTP client: {source}"))]
    Client { source: client::Error },
    #[snafu(display("Unable to read configuration file {pth:?}: {source}"))]
    ConfigNotFound {
        pth: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Error parsing configuration file {pth:?}: {source}"))]
    ConfigParse {
        pth: PathBuf,
        source: toml::de::Error,
    },
    #[snafu(display("Couldn't resolve the present working directory: {source}"))]
    CurrentDir { source: std::io::Error },
    #[snafu(display("Failed to parse RUST_LOG: {source}"))]
    EnvFilter {
        source: tracing_subscriber::filter::FromEnvError,
    },
    #[snafu(display("Failed to start flus: {source}"))]
    Flus { source: flus::flus::Error },
    #[snafu(display("Failed to open the flus log file: {source}"))]
    LogFile { source: std::io::Error },
    #[snafu(display("Failed to HUP the logfile: {source}"))]
    LogHup {
        source: tokio::sync::mpsc::error::SendError<PathBuf>,
    },
    #[snafu(display("Metric registration problem: {source}"))]
    Metrics { source: flus::metrics::Error },
    #[snafu(display("While building the OTLP exporter, {source}"))]
    OtlpExporter {
        source: opentelemetry_otlp::ExporterBuildError,
    },
    #[snafu(display("The {service} exited unexpectedly"))]
    ServiceFailed { service: &'static str },
    #[snafu(display("Failed to install a signal handler: {source}"))]
    Signal { source: std::io::Error },
    #[snafu(display("Failed to load the store from {pth:?}: {source}"))]
    StateLoad {
        pth: PathBuf,
        source: flus::memory::Error,
    },
    #[snafu(display("Failed to set the tracing subscriber: {source}"))]
    Subscriber {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
    #[snafu(display("Failed to instantiate a Tokio runtime: {source}"))]
    TokioRuntime { source: std::io::Error },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self::Display::fmt(&self, f)
    }
}

type Result<T> = std::result::Result<T, Error>;

type StdResult<T, E> = std::result::Result<T, E>;

static DEFAULT_CONFIG: &str = "/etc/flus.toml";

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                   options & configuration                                      //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Logging-related options read from the command line or the environment
struct LogOpts {
    pub plain: bool,
    pub level: Level,
}

impl LogOpts {
    fn new(matches: &clap::ArgMatches) -> LogOpts {
        LogOpts {
            plain: matches.get_flag("plain"),
            level: match (
                matches.get_flag("debug"),
                matches.get_flag("verbose"),
                matches.get_flag("quiet"),
            ) {
                (true, _, _) => Level::TRACE,
                (false, true, _) => Level::DEBUG,
                (false, false, true) => Level::ERROR,
                (_, _, _) => Level::INFO,
            },
        }
    }
}

/// Configuration options read from the CLI (or the environment)
struct CliOpts {
    pub log_opts: LogOpts,
    pub cfg: Option<PathBuf>,
}

impl CliOpts {
    fn new(matches: clap::ArgMatches) -> Result<CliOpts> {
        let here = env::current_dir().context(CurrentDirSnafu)?;
        Ok(CliOpts {
            log_opts: LogOpts::new(&matches),
            cfg: matches
                .get_one::<PathBuf>("config")
                .cloned()
                .map(|p| here.join(p)),
        })
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct OtelExportConfig {
    /// Endpoint that will receive metric data in OTLP format
    endpoint: Url,
    /// Interval at which metrics will be pushed to `endpoint`; defaults to 60 seconds
    interval: Option<std::time::Duration>,
}

/// flusd configuration, version one
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
struct ConfigV1 {
    /// Log file; None means log to stdout
    log_file: Option<PathBuf>,
    /// OTLP export target; None means don't export
    otlp_export: Option<OtelExportConfig>,
    /// Address at which to serve health-checks & metrics; specify as "address:port"
    public_address: SocketAddr,
    /// Address at which to serve the ops endpoints; this should not be reachable from the world
    private_address: SocketAddr,
    /// Location of the store snapshot
    state_file: PathBuf,
    /// Root of the HTTP cache
    cache_dir: PathBuf,
    user_agent: String,
    /// The user owning all feed collections
    support_user: Username,
    client: client::Config,
    jobs: JobsConfig,
    news: NewsConfig,
}

impl Default for ConfigV1 {
    fn default() -> Self {
        ConfigV1 {
            log_file: None,
            otlp_export: None,
            public_address: "0.0.0.0:20700".parse::<SocketAddr>().unwrap(/* known good */),
            private_address: "127.0.0.1:20701".parse::<SocketAddr>().unwrap(/* known good */),
            state_file: PathBuf::from("flus-state.json"),
            cache_dir: PathBuf::from("cache"),
            user_agent: default_user_agent(),
            support_user: Username::new("flus").unwrap(/* known good */),
            client: client::Config::default(),
            jobs: JobsConfig::default(),
            news: NewsConfig::default(),
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "version")]
enum Configuration {
    #[serde(rename = "1")]
    V1(ConfigV1),
}

/// Parse the flusd configuration file
///
/// A missing file at the default location means "all defaults"; a missing file that was named
/// explicitly is an error.
fn parse_config(cfg: &Option<PathBuf>) -> Result<ConfigV1> {
    let (pth, defaulted): (PathBuf, bool) = cfg.as_ref().map_or_else(
        || (PathBuf::from(DEFAULT_CONFIG), true),
        |p| (p.clone(), false),
    );
    match std::fs::read_to_string(&pth) {
        Ok(text) => match toml::from_str::<Configuration>(&text) {
            Ok(Configuration::V1(cfg)) => Ok(cfg),
            Err(err) => Err(ConfigParseSnafu { pth }.into_error(err)),
        },
        Err(err) => {
            if defaulted {
                Ok(ConfigV1::default())
            } else {
                Err(ConfigNotFoundSnafu { pth }.into_error(err))
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            logging                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A tracing-compatible, "reopenable" log file
///
/// [MakeWriter] is implemented for `Mutex<W>` but not for `Arc<Mutex<W>>`, so the file handle is
/// shared with a task that swaps in a freshly-opened file whenever it's sent a path (on `SIGHUP`).
struct LogFile {
    fd: Arc<Mutex<std::fs::File>>,
}

impl LogFile {
    /// Open a file at `pth`; return a [LogFile] instance along with the send side of a channel
    /// the caller can use to close & re-open the file.
    pub fn open(pth: &Path) -> StdResult<(LogFile, mpsc::Sender<PathBuf>), std::io::Error> {
        let (tx, rx) = mpsc::channel::<PathBuf>(1);
        let fd = OpenOptions::new()
            .create(true)
            .append(true)
            .open(pth)
            .map(|fd| Arc::new(Mutex::new(fd)))?;
        tokio::spawn(LogFile::rehup(fd.clone(), rx));
        Ok((LogFile { fd }, tx))
    }
    async fn rehup(fd: Arc<Mutex<std::fs::File>>, mut rx: mpsc::Receiver<PathBuf>) {
        while let Some(ref pbuf) = rx.recv().await {
            match OpenOptions::new().create(true).append(true).open(pbuf) {
                Ok(f) => *fd.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = f,
                Err(err) => error!("Failed to open {:?} ({}).", pbuf, err),
            }
        }
    }
}

pub struct LogFileWriter<'a>(MutexGuard<'a, std::fs::File>);

impl<'a> MakeWriter<'a> for LogFile {
    type Writer = LogFileWriter<'a>;
    fn make_writer(&'a self) -> Self::Writer {
        LogFileWriter(self.fd.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }
}

impl io::Write for LogFileWriter<'_> {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }
    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
    #[inline]
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.0.write_all(buf)
    }
}

/// Configure flusd logging
///
/// Log to `logfile` if one is configured, stdout otherwise; JSON unless `--plain` was given. If
/// logging to file, return the sender side of a channel that can be used to signal the file to
/// close & re-open itself.
#[allow(clippy::type_complexity)]
fn configure_logging(
    logopts: &LogOpts,
    logfile: Option<&Path>,
) -> Result<(
    Box<dyn Layer<Registry> + Send + Sync>,
    EnvFilter,
    Option<mpsc::Sender<PathBuf>>,
)> {
    let filter = EnvFilter::builder()
        .with_default_directive(logopts.level.into())
        .from_env()
        .context(EnvFilterSnafu)?;

    // `json()` & `compact()` produce layers of different types, hence the boxing
    let mut tx = None;
    let formatter: Box<dyn Layer<Registry> + Send + Sync> = match logfile {
        Some(logfile) => {
            let (log_file, tx_inner) = LogFile::open(logfile).context(LogFileSnafu)?;
            tx = Some(tx_inner);
            if logopts.plain {
                Box::new(
                    fmt::Layer::default()
                        .compact()
                        .with_ansi(false)
                        .with_writer(log_file),
                )
            } else {
                Box::new(
                    fmt::Layer::default()
                        .json()
                        .with_current_span(true)
                        .with_writer(log_file),
                )
            }
        }
        None if logopts.plain => Box::new(fmt::Layer::default().compact().with_writer(io::stdout)),
        None => Box::new(
            fmt::Layer::default()
                .json()
                .with_current_span(true)
                .with_writer(io::stdout),
        ),
    };

    Ok((formatter, filter, tx))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           the server                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// State for the public router
struct Public {
    exporter: PrometheusExporter,
}

/// Count requests by method & path
async fn otel_middleware(
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    // OTel names are restricted to ASCII alphanumerics, '_', '.', '-' & '/'; map '/' to '.' and
    // drop everything else
    let stem: String = request
        .uri()
        .path()
        .chars()
        .filter_map(|c| match c {
            '/' => Some('.'),
            c if c.is_ascii_alphanumeric() || c == '-' || c == '_' => Some(c),
            _ => None,
        })
        .collect();
    let name = format!("http.{}{}", request.method().as_str().to_lowercase(), stem);
    global::meter("flus").u64_counter(name).build().add(1, &[]);
    next.run(request).await
}

async fn healthcheck() -> &'static str {
    "GOOD"
}

async fn metrics(State(state): State<Arc<Public>>) -> StdResult<String, StatusCode> {
    let mut output = Vec::new();
    state.exporter.export(&mut output).map_err(|err| {
        error!("Failed to encode metrics: {:?}", err);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    String::from_utf8(output).map_err(|err| {
        error!("Non UTF-8 metrics: {}", err);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// Sequential request IDs; less information than a UUID, but readable, and a rough gauge of uptime
#[derive(Clone, Debug, Default)]
struct RequestIdGenerator {
    counter: Arc<AtomicU64>,
}

impl MakeRequestId for RequestIdGenerator {
    fn make_request_id<B>(&mut self, _request: &http::Request<B>) -> Option<RequestId> {
        self.counter
            .fetch_add(1, Ordering::SeqCst)
            .to_string()
            .pipe(|s| HeaderValue::from_str(&s).ok())
            .map(RequestId::new)
    }
}

/// Apply the layers common to both routers
///
/// Requests hit `SetRequestIdLayer` first, so it's applied last.
fn with_layers(router: Router, request_ids: RequestIdGenerator) -> Router {
    router
        .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
            "x-request-id",
        )))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(axum::middleware::from_fn(otel_middleware))
        .layer(SetRequestIdLayer::new(
            HeaderName::from_static("x-request-id"),
            request_ids,
        ))
}

/// The [Router] accessible to the world
fn make_public_router(state: Arc<Public>, request_ids: RequestIdGenerator) -> Router {
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/metrics", get(metrics))
        .with_state(state)
        .pipe(|router| with_layers(router, request_ids))
}

/// The [Router] that should only be locally accessible
fn make_private_router(ops: Arc<Ops>, request_ids: RequestIdGenerator) -> Router {
    Router::new()
        .nest("/ops", ops::make_router(ops))
        .pipe(|router| with_layers(router, request_ids))
}

async fn snapshot(store: &Store, state_file: &Path) {
    match store.save(state_file).await {
        Ok(()) => info!("Wrote snapshot to {:?}.", state_file),
        Err(err) => error!("Failed to write snapshot to {:?}: {}", state_file, err),
    }
}

/// Why [serve] stopped serving
enum Interruption {
    Hangup,
    Terminate,
    /// A server or the job processor exited on its own
    Failure(&'static str),
}

impl Interruption {
    /// The result with which [serve] should stop, if it should
    fn outcome(&self) -> Option<Result<()>> {
        match self {
            Interruption::Hangup => None,
            Interruption::Terminate => Some(Ok(())),
            Interruption::Failure(service) => Some(ServiceFailedSnafu { service: *service }.fail()),
        }
    }
}

async fn serve(
    opts: CliOpts,
    mut cfg: ConfigV1,
    log_file_hup: Option<mpsc::Sender<PathBuf>>,
) -> Result<()> {
    async fn shutdown_signal(nfy: Arc<Notify>) {
        nfy.notified().await
    }

    fn log_on_err<T, E: std::fmt::Debug>(x: StdResult<T, E>) {
        if let Err(err) = x {
            error!("{:?}", err);
        }
    }

    let mut sighup = signal(SignalKind::hangup()).context(SignalSnafu)?;
    let mut sigterm = signal(SignalKind::terminate()).context(SignalSnafu)?;
    let mut sigint = signal(SignalKind::interrupt()).context(SignalSnafu)?;

    let exporter = init_telemetry(cfg.otlp_export.as_ref())?;
    let public = Arc::new(Public { exporter });
    let request_ids = RequestIdGenerator::default();

    // The store outlives configuration reloads; everything built on top of it is re-built
    let store = Arc::new(
        Store::load(&cfg.state_file)
            .await
            .context(StateLoadSnafu {
                pth: cfg.state_file.clone(),
            })?,
    );

    loop {
        let cache = Arc::new(FileCache::new(&cfg.cache_dir).context(CacheSnafu)?);
        let fetcher =
            Arc::new(Fetcher::new(&cfg.client, &cfg.user_agent, cache.clone()).context(ClientSnafu)?);
        let flus = Arc::new(
            Flus::new(store.clone(), fetcher, &cfg.support_user, cfg.news.clone())
                .await
                .context(FlusSnafu)?,
        );
        let processor = jobs::start(
            jobs::standard_jobs(&cfg.jobs),
            Arc::new(jobs::Context {
                flus: flus.clone(),
                store: store.clone(),
                cache: cache.clone(),
                state_file: cfg.state_file.clone(),
            }),
            cfg.jobs.clone(),
        );
        let ops = Arc::new(Ops {
            flus,
            cache,
            jobs: cfg.jobs.clone(),
        });

        let public_nfy = Arc::new(Notify::new());
        let private_nfy = Arc::new(Notify::new());

        let mut public_server = axum::serve(
            TcpListener::bind(cfg.public_address)
                .await
                .context(BindSnafu {
                    addr: cfg.public_address,
                })?,
            make_public_router(public.clone(), request_ids.clone()),
        )
        .with_graceful_shutdown(shutdown_signal(public_nfy.clone()))
        .into_future();
        let mut private_server = axum::serve(
            TcpListener::bind(cfg.private_address)
                .await
                .context(BindSnafu {
                    addr: cfg.private_address,
                })?,
            make_private_router(ops, request_ids.clone()),
        )
        .with_graceful_shutdown(shutdown_signal(private_nfy.clone()))
        .into_future();

        let (mut processor_join_handle, processor_shutdown) = processor.into_parts();

        info!(
            "Serving on {} (public) & {} (private).",
            cfg.public_address, cfg.private_address
        );

        let interruption = tokio::select! {
            res = &mut public_server => {
                error!("The public server exited unexpectedly with {:?}.", res);
                Interruption::Failure("public server")
            },
            res = &mut private_server => {
                error!("The private server exited unexpectedly with {:?}.", res);
                Interruption::Failure("private server")
            },
            res = &mut processor_join_handle => {
                error!("The job processor exited early with {:?}.", res);
                Interruption::Failure("job processor")
            },
            _ = sighup.recv() => {
                info!("Received SIGHUP; re-reading configuration.");
                Interruption::Hangup
            },
            _ = sigterm.recv() => {
                info!("Received SIGTERM; terminating.");
                Interruption::Terminate
            },
            _ = sigint.recv() => {
                info!("Received SIGINT; terminating.");
                Interruption::Terminate
            },
        };

        public_nfy.notify_one();
        private_nfy.notify_one();
        if let Interruption::Failure(_) = interruption {
            // Whatever's still running goes down with the runtime
            processor_shutdown.notify_one();
            snapshot(&store, &cfg.state_file).await;
            return interruption.outcome().unwrap_or(Ok(()));
        }

        log_on_err(public_server.await);
        log_on_err(private_server.await);
        processor_shutdown.notify_one();
        match tokio::time::timeout(cfg.jobs.shutdown_timeout * 2, processor_join_handle).await {
            Ok(Ok(Err(err))) => error!("The job processor failed on shut-down: {:?}", err),
            Ok(Err(err)) => error!("Failed to join the job processor: {:?}", err),
            Err(_) => error!("Timed-out waiting for the job processor to shut-down."),
            Ok(Ok(Ok(()))) => debug!("Job processor shut-down."),
        }
        snapshot(&store, &cfg.state_file).await;

        if let Some(outcome) = interruption.outcome() {
            return outcome;
        }

        cfg = match parse_config(&opts.cfg) {
            Ok(new_cfg) => new_cfg,
            Err(err) => {
                warn!("Failed to re-read configuration ({}); keeping the old.", err);
                cfg
            }
        };
        if let (Some(lfh), Some(log_file)) = (&log_file_hup, &cfg.log_file) {
            // logrotate renames the file out from under us & then HUPs us
            lfh.send(log_file.clone()).await.context(LogHupSnafu)?;
            info!("Started new log file.");
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                    main() & process startup                                    //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Initialize telemetry
///
/// Must be invoked from inside the Tokio runtime, but before any instruments are accessed. Returns
/// an exporter for the `/metrics` endpoint.
fn init_telemetry(collector_config: Option<&OtelExportConfig>) -> Result<PrometheusExporter> {
    check_metric_names().context(MetricsSnafu)?;
    let text_exporter = PrometheusExporter::new();

    let mut provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
        .with_resource(
            opentelemetry_sdk::Resource::builder_empty()
                .with_attribute(KeyValue::new("service.name", "flus"))
                .build(),
        )
        .with_reader(text_exporter.clone());

    if let Some(config) = collector_config {
        let otlp_exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_http()
            .with_endpoint(config.endpoint.as_str())
            .with_protocol(opentelemetry_otlp::Protocol::HttpBinary)
            .build()
            .context(OtlpExporterSnafu)?;

        let mut reader = opentelemetry_sdk::metrics::PeriodicReader::builder(otlp_exporter);
        if let Some(interval) = config.interval {
            reader = reader.with_interval(interval);
        }
        provider = provider.with_reader(reader.build());
    }

    global::set_meter_provider(provider.build());

    Ok(text_exporter)
}

async fn go_async(
    opts: CliOpts,
    bootstrap_logging_guard: tracing::dispatcher::DefaultGuard,
) -> Result<()> {
    #[allow(clippy::type_complexity)]
    fn go_async1(
        opts: &CliOpts,
    ) -> Result<(
        ConfigV1,
        Box<dyn Layer<Registry> + Send + Sync>,
        EnvFilter,
        Option<mpsc::Sender<PathBuf>>,
    )> {
        // Failure to parse at this point is fatal; on SIGHUP we fall back to the last good
        // configuration instead
        let cfg = parse_config(&opts.cfg)?;
        let (formatter, filter, log_file_hup) =
            configure_logging(&opts.log_opts, cfg.log_file.as_deref())?;
        Ok((cfg, formatter, filter, log_file_hup))
    }

    match go_async1(&opts) {
        Ok((cfg, formatter, filter, log_file_hup)) => {
            tracing::subscriber::set_global_default(
                Registry::default().with(formatter).with(filter),
            )
            .context(SubscriberSnafu)?;
            drop(bootstrap_logging_guard);

            info!("flusd version {} starting.", crate_version!());

            serve(opts, cfg, log_file_hup).await
        }
        Err(err) => {
            error!("While configuring logging: {err:?}");
            Err(err)
        }
    }
}

fn main() -> Result<()> {
    // Most configuration is read from file; the few command-line options govern where to find that
    // file & how to log. Each has an environment variable for convenience in containers.
    let opts = CliOpts::new(
        Command::new("flusd")
            .version(crate_version!())
            .author(crate_authors!())
            .about("The flus daemon")
            .long_about(
                "`flusd` keeps a flus instance's feeds & links fresh and serves its operational \
                 endpoints.",
            )
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .num_args(1)
                    .value_parser(value_parser!(PathBuf))
                    .env("FLUS_CONFIG")
                    .help(
                        "path (absolute or relative to the process' current directory) to a \
                         configuration file",
                    ),
            )
            .arg(
                Arg::new("debug")
                    .short('D')
                    .long("debug")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("FLUS_DEBUG")
                    .help("produce debug output"),
            )
            .arg(
                Arg::new("plain")
                    .short('p')
                    .long("plain")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("FLUS_PLAIN")
                    .help("log in human-readable format, not JSON/structured logging"),
            )
            .arg(
                Arg::new("quiet")
                    .short('q')
                    .long("quiet")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("FLUS_QUIET")
                    .help("produce only error output"),
            )
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("FLUS_VERBOSE")
                    .help("produce prolix output"),
            )
            .get_matches(),
    )?;

    // Until configuration is read & logging configured, log to stderr
    let bootstrap_subscriber = Registry::default()
        .with(fmt::Layer::default().with_writer(io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(opts.log_opts.level.into())
                .from_env()
                .context(EnvFilterSnafu)?,
        );
    let bootstrap_logging_guard = tracing::subscriber::set_default(bootstrap_subscriber);
    debug!("Temporarily logging to stderr while initializing.");

    tokio::runtime::Runtime::new()
        .context(TokioRuntimeSnafu)?
        .block_on(go_async(opts, bootstrap_logging_guard))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn configuration() {
        let cfg: Configuration = toml::from_str(
            r#"version = "1"
public-address = "127.0.0.1:8080"
state-file = "/var/lib/flus/state.json"
support-user = "robot"

[client]
max-body-size = 1024

[jobs]
feeds-batch-size = 10

[news]
max-links = 20
"#,
        )
        .unwrap();
        let Configuration::V1(cfg) = cfg;
        assert_eq!(cfg.public_address.port(), 8080);
        assert_eq!(cfg.private_address.port(), 20701);
        assert_eq!(cfg.state_file, PathBuf::from("/var/lib/flus/state.json"));
        assert_eq!(cfg.support_user.as_ref(), "robot");
        assert_eq!(cfg.client.max_body_size, 1024);
        assert_eq!(cfg.jobs.feeds_batch_size, 10);
        assert_eq!(cfg.news.max_links, 20);
        assert!(cfg.log_file.is_none());

        assert!(toml::from_str::<Configuration>("version = \"2\"").is_err());
        assert!(toml::from_str::<Configuration>("version = \"1\"\nsupport-user = \"x\"").is_err());
    }

    #[test]
    fn failures_are_errors() {
        assert!(Interruption::Hangup.outcome().is_none());
        assert!(matches!(Interruption::Terminate.outcome(), Some(Ok(()))));
        match Interruption::Failure("job processor").outcome() {
            Some(Err(err @ Error::ServiceFailed { .. })) => {
                assert_eq!(err.to_string(), "The job processor exited unexpectedly")
            }
            _ => panic!("a failed service should stop flusd with an error"),
        }
    }

    #[test]
    fn missing_configuration() {
        assert!(matches!(
            parse_config(&Some(PathBuf::from("/no/such/flus.toml"))),
            Err(Error::ConfigNotFound { .. })
        ));
    }
}

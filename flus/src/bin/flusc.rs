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

//! # flusc
//!
//! The flus command-line client.
//!
//! flusc works directly against a flus store snapshot & fetch cache, which makes it handy for
//! seeding an instance, poking at a single feed or page, or pulling an export without running
//! `flusd`. Don't point it at the state file of a running daemon: the daemon will overwrite
//! whatever flusc writes on its next snapshot.

use std::{
    ffi::OsStr,
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::{Arg, ArgAction, Command, crate_authors, crate_version, value_parser};
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, IntoError, OptionExt, ResultExt, Snafu};
use tap::Pipe;
use tracing::{Level, info, level_filters::LevelFilter};
use tracing_subscriber::{Registry, fmt, layer::SubscriberExt};
use url::Url;

use flus::{
    client::{self, ACCEPT_FEED, ACCEPT_HTML, CachePolicy, Fetcher, default_user_agent},
    dom::Metadata,
    entities::{CollectionId, Username},
    feeds::Feed,
    flus::Flus,
    memory::Store,
    news::NewsConfig,
    urls::sanitize,
};
use flus_cache::FileCache;

#[derive(Snafu)]
enum Error {
    #[snafu(display("While attempting to read {path:?}, {source}"))]
    BadConfig {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to open the cache: {source}"))]
    Cache {
        #[snafu(backtrace)]
        source: flus_cache::file_cache::Error,
    },
    #[snafu(display("Failed to create an HTTP client: {source}"))]
    Client {
        #[snafu(backtrace)]
        source: client::Error,
    },
    #[snafu(display("Failed to parse configuration: {source}"))]
    Config {
        source: toml::de::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Feed discovery on {url} failed: {source}"))]
    Discover {
        url: Url,
        #[snafu(backtrace)]
        source: flus::feed_fetcher::Error,
    },
    #[snafu(display("{url} doesn't look like a feed: {source}"))]
    Feed {
        url: Url,
        source: flus::feeds::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to fetch {url}: {source}"))]
    Fetch {
        url: Url,
        #[snafu(backtrace)]
        source: client::Error,
    },
    #[snafu(display("{source}"))]
    Flus {
        #[snafu(backtrace)]
        source: flus::flus::Error,
    },
    #[snafu(display("Failed to serialize output: {source}"))]
    Json {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to read {path:?}: {source}"))]
    Input {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The background task panicked: {source}"))]
    Join {
        source: tokio::task::JoinError,
        backtrace: Backtrace,
    },
    #[snafu(display("No sub-command given; try --help"))]
    NoSubCommand { backtrace: Backtrace },
    #[snafu(display("This sub-command requires a user; specify one with --user"))]
    NoUser { backtrace: Backtrace },
    #[snafu(display("Failed to write the store: {source}"))]
    Save {
        #[snafu(backtrace)]
        source: flus::memory::Error,
    },
    #[snafu(display("Failed to load the store: {source}"))]
    State {
        #[snafu(backtrace)]
        source: flus::memory::Error,
    },
    #[snafu(display("Failed to set the tracing subscriber: {source}"))]
    Subscriber {
        source: tracing::subscriber::SetGlobalDefaultError,
        backtrace: Backtrace,
    },
    #[snafu(display("{url} is not a valid URL: {source}"))]
    Url {
        url: String,
        source: flus::urls::Error,
        backtrace: Backtrace,
    },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         configuration                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case", default)]
struct ConfigV1 {
    pub state_file: PathBuf,
    pub cache_dir: PathBuf,
    pub user_agent: String,
    pub support_user: Username,
    pub client: client::Config,
    pub news: NewsConfig,
}

impl Default for ConfigV1 {
    fn default() -> Self {
        ConfigV1 {
            state_file: PathBuf::from("flus-state.json"),
            cache_dir: PathBuf::from("cache"),
            user_agent: default_user_agent(),
            support_user: Username::new("flus").unwrap(/* known good */),
            client: client::Config::default(),
            news: NewsConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "version", deny_unknown_fields)] // tag "internally"
enum Configuration {
    #[serde(rename = "1")]
    V1(ConfigV1),
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration::V1(ConfigV1::default())
    }
}

impl Configuration {
    fn into_v1(self) -> ConfigV1 {
        match self {
            Configuration::V1(config_v1) => config_v1,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          sub-commands                                          //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Everything a sub-command may need
struct Session {
    store: Arc<Store>,
    state_file: PathBuf,
    flus: Flus,
}

impl Session {
    async fn new(cfg: &ConfigV1) -> Result<Session> {
        let store = Arc::new(Store::load(&cfg.state_file).await.context(StateSnafu)?);
        let cache = Arc::new(FileCache::new(&cfg.cache_dir).context(CacheSnafu)?);
        let fetcher =
            Arc::new(Fetcher::new(&cfg.client, &cfg.user_agent, cache).context(ClientSnafu)?);
        let flus = Flus::new(store.clone(), fetcher, &cfg.support_user, cfg.news.clone())
            .await
            .context(FlusSnafu)?;
        Ok(Session {
            store,
            state_file: cfg.state_file.clone(),
            flus,
        })
    }
    async fn save(&self) -> Result<()> {
        self.store.save(&self.state_file).await.context(SaveSnafu)
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    serde_json::to_string_pretty(value)
        .context(JsonSnafu)?
        .pipe(|text| println!("{text}"));
    Ok(())
}

fn parse_url(text: &str) -> Result<Url> {
    sanitize(text).context(UrlSnafu { url: text })
}

async fn add_user(session: Session, username: &Username) -> Result<()> {
    let user = session.flus.add_user(username).await.context(FlusSnafu)?;
    session.save().await?;
    print_json(&user)
}

async fn add_link(
    session: Session,
    username: &Username,
    url: &str,
    collections: Vec<CollectionId>,
) -> Result<()> {
    let user = session.flus.user(username).await.context(FlusSnafu)?;
    let link = session
        .flus
        .add_link(&user, url, &collections)
        .await
        .context(FlusSnafu)?;
    session.save().await?;
    print_json(&link)
}

async fn add_feed(session: Session, username: &Username, url: &str) -> Result<()> {
    let user = session.flus.user(username).await.context(FlusSnafu)?;
    let collection = session.flus.add_feed(&user, url).await.context(FlusSnafu)?;
    session.save().await?;
    print_json(&collection)
}

async fn discover(session: Session, url: &str) -> Result<()> {
    let url = parse_url(url)?;
    session
        .flus
        .feed_fetcher()
        .discover(&url)
        .await
        .context(DiscoverSnafu { url: url.clone() })?
        .into_iter()
        .for_each(|feed| println!("{feed}"));
    Ok(())
}

/// Fetch a page & show what flus makes of it, without storing anything
async fn fetch_link(session: Session, url: &str) -> Result<()> {
    let url = parse_url(url)?;
    let rsp = session
        .flus
        .fetcher()
        .get(&url, ACCEPT_HTML, CachePolicy::Bypass)
        .await
        .context(FetchSnafu { url: url.clone() })?;
    println!("url:          {}", rsp.url);
    println!("status:       {}", rsp.status);
    println!(
        "content-type: {}",
        rsp.content_type.as_deref().unwrap_or("-")
    );
    if rsp.is_html() {
        let Metadata {
            title,
            description,
            illustration,
            reading_time,
            feeds,
        } = Metadata::extract(&rsp.text(), &rsp.url);
        println!("title:        {}", title.as_deref().unwrap_or("-"));
        println!("description:  {}", description.as_deref().unwrap_or("-"));
        println!(
            "illustration: {}",
            illustration.map(|u| u.to_string()).unwrap_or("-".to_owned())
        );
        println!("reading time: {reading_time} min");
        feeds.iter().for_each(|feed| println!("feed:         {feed}"));
    }
    Ok(())
}

/// Fetch a feed & list its entries, without storing anything
async fn fetch_feed(session: Session, url: &str) -> Result<()> {
    let url = parse_url(url)?;
    let rsp = session
        .flus
        .fetcher()
        .get(&url, ACCEPT_FEED, CachePolicy::Bypass)
        .await
        .context(FetchSnafu { url: url.clone() })?;
    let feed = Feed::parse(&rsp.text()).context(FeedSnafu { url })?;
    println!(
        "{:?} feed: {}",
        feed.kind,
        feed.title.as_deref().unwrap_or("(untitled)")
    );
    if let Some(link) = &feed.link {
        println!("site: {link}");
    }
    for entry in &feed.entries {
        println!(
            "{}  {}  {}",
            entry
                .published_at
                .map(|d| d.to_rfc3339())
                .unwrap_or("-".to_owned()),
            entry.link.as_deref().unwrap_or("-"),
            entry.title.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn import_opml(session: Session, username: &Username, path: &Path) -> Result<()> {
    let text = fs::read_to_string(path).context(InputSnafu { path })?;
    let user = session.flus.user(username).await.context(FlusSnafu)?;
    let followed = session
        .flus
        .import_opml(&user, &text)
        .await
        .context(FlusSnafu)?;
    session.save().await?;
    info!("{} now follows {} new feed(s).", username, followed);
    Ok(())
}

async fn news(session: Session, username: &Username, fill: bool) -> Result<()> {
    let user = session.flus.user(username).await.context(FlusSnafu)?;
    if fill {
        let links = session.flus.fill_news(&user).await.context(FlusSnafu)?;
        session.save().await?;
        print_json(&links)
    } else {
        print_json(&session.flus.news(&user).await.context(FlusSnafu)?)
    }
}

async fn export(session: Session, username: &Username, dir: &Path) -> Result<()> {
    let user = session.flus.user(username).await.context(FlusSnafu)?;
    let path = session
        .flus
        .export_to(&user, dir)
        .await
        .context(FlusSnafu)?;
    println!("{}", path.display());
    Ok(())
}

async fn cache(cfg: &ConfigV1, action: &str) -> Result<()> {
    let cache = FileCache::new(&cfg.cache_dir).context(CacheSnafu)?;
    // Cache operations walk the directory tree; keep them off the executor
    let action = action.to_owned();
    tokio::task::spawn_blocking(move || -> Result<()> {
        match action.as_str() {
            "stats" => print_json(&cache.stats().context(CacheSnafu)?),
            "clean" => print_json(&cache.clean().context(CacheSnafu)?),
            _ => cache.clear().context(CacheSnafu),
        }
    })
    .await
    .context(JoinSnafu)?
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              main                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

fn user_arg() -> Arg {
    Arg::new("user")
        .short('u')
        .long("user")
        .num_args(1)
        .value_parser(value_parser!(Username))
        .env("FLUSC_USER")
        .help("The flus user on whose behalf to act")
}

fn url_arg(help: &'static str) -> Arg {
    Arg::new("URL")
        .required(true)
        .value_parser(value_parser!(String))
        .index(1) /* Better to be explicit, I think */
        .help(help)
}

fn default_config() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_default()
        .join(".flusc.toml")
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("flusc")
        .version(crate_version!())
        .author(crate_authors!())
        .about("The flus client")
        .long_about(
            "General-purpose client for working with a flus store.

flusc operates directly on a flus state file & fetch cache; it's meant for seeding an
instance, inspecting individual feeds & pages, and exporting user data.",
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .num_args(1)
                .value_parser(value_parser!(PathBuf))
                .env("FLUSC_CONFIG")
                .help("Specify the path to the configuration file (default ~/.flusc.toml)"),
        )
        .arg(
            Arg::new("state")
                .short('s')
                .long("state")
                .num_args(1)
                .value_parser(value_parser!(PathBuf))
                .env("FLUSC_STATE")
                .help("The flus state file (overrides configuration)"),
        )
        .arg(
            Arg::new("cache")
                .short('C')
                .long("cache")
                .num_args(1)
                .value_parser(value_parser!(PathBuf))
                .env("FLUSC_CACHE")
                .help("The fetch cache directory (overrides configuration)"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .num_args(0)
                .action(ArgAction::SetTrue)
                .help("produce more prolix output"),
        )
        .subcommand(
            Command::new("add-user")
                .about("Create a user, along with their default collections")
                .arg(
                    Arg::new("USERNAME")
                        .required(true)
                        .value_parser(value_parser!(Username))
                        .index(1)
                        .help("Between two & sixty-four characters: letters, digits, '-', '_' or '.'"),
                ),
        )
        .subcommand(
            Command::new("add-link")
                .about("Add a link")
                .long_about(
                    "Add a single link. The page will be fetched for its title, description &c. If
no collections are given, the link is bookmarked.",
                )
                .arg(user_arg())
                .arg(
                    Arg::new("collection")
                        .short('k')
                        .long("collection")
                        .num_args(1)
                        .action(ArgAction::Append)
                        .value_parser(value_parser!(CollectionId))
                        .help("Collection into which the link should go; may be repeated"),
                )
                .arg(url_arg("The URL to be added")),
        )
        .subcommand(
            Command::new("add-feed")
                .about("Follow a feed")
                .long_about(
                    "Follow a feed. The URL may name the feed itself, or a page advertising one.",
                )
                .arg(user_arg())
                .arg(url_arg("The feed, or a page advertising it")),
        )
        .subcommand(
            Command::new("discover")
                .about("List the feeds associated with a URL")
                .arg(url_arg("The page to examine")),
        )
        .subcommand(
            Command::new("fetch-link")
                .about("Fetch a page & show its metadata, without storing anything")
                .arg(url_arg("The page to fetch")),
        )
        .subcommand(
            Command::new("fetch-feed")
                .about("Fetch a feed & list its entries, without storing anything")
                .arg(url_arg("The feed to fetch")),
        )
        .subcommand(
            Command::new("import-opml")
                .about("Follow every feed listed in an OPML file")
                .arg(user_arg())
                .arg(
                    Arg::new("FILE")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .index(1)
                        .help("OPML file to import"),
                ),
        )
        .subcommand(
            Command::new("news")
                .about("Show (or fill) a user's news")
                .arg(user_arg())
                .arg(
                    Arg::new("fill")
                        .short('f')
                        .long("fill")
                        .num_args(0)
                        .action(ArgAction::SetTrue)
                        .help("Move the suggestions into the user's news collection"),
                ),
        )
        .subcommand(
            Command::new("export")
                .about("Export a user's data as a .tar.gz archive")
                .arg(user_arg())
                .arg(
                    Arg::new("dir")
                        .short('d')
                        .long("dir")
                        .num_args(1)
                        .value_parser(value_parser!(PathBuf))
                        .default_value(OsStr::new("."))
                        .help("Directory in which to write the archive"),
                ),
        )
        .subcommand(
            Command::new("cache")
                .about("Inspect or maintain the fetch cache")
                .arg(
                    Arg::new("ACTION")
                        .required(true)
                        .value_parser(["stats", "clean", "clear"])
                        .index(1)
                        .help("'stats' summarizes, 'clean' drops expired entries, 'clear' drops everything"),
                ),
        )
        .get_matches();

    tracing::subscriber::set_global_default(
        Registry::default()
            .with(LevelFilter::from_level(if matches.get_flag("verbose") {
                Level::DEBUG
            } else {
                Level::INFO
            }))
            .with(
                fmt::Layer::default()
                    .compact()
                    .without_time()
                    .with_level(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_target(false)
                    .with_writer(io::stderr),
            ),
    )
    .context(SubscriberSnafu)?;

    // A missing configuration file is only an error if it was named explicitly
    let (path, explicit) = match matches.get_one::<PathBuf>("config") {
        Some(path) => (path.clone(), true),
        None => (default_config(), false),
    };
    let mut cfg = match fs::read_to_string(&path) {
        Ok(config_text) => toml::from_str::<Configuration>(&config_text).context(ConfigSnafu)?,
        Err(err) if err.kind() == io::ErrorKind::NotFound && !explicit => Configuration::default(),
        Err(err) => return Err(BadConfigSnafu { path }.into_error(err)),
    }
    .into_v1();

    if let Some(state) = matches.get_one::<PathBuf>("state").cloned() {
        cfg.state_file = state;
    }
    if let Some(cache_dir) = matches.get_one::<PathBuf>("cache").cloned() {
        cfg.cache_dir = cache_dir;
    }

    fn user(matches: &clap::ArgMatches) -> Result<&Username> {
        matches.get_one::<Username>("user").context(NoUserSnafu)
    }
    fn url(matches: &clap::ArgMatches) -> &str {
        matches.get_one::<String>("URL").unwrap(/* impossible */)
    }

    match matches.subcommand() {
        Some(("cache", matches)) => {
            cache(&cfg, matches.get_one::<String>("ACTION").unwrap(/* impossible */)).await
        }
        Some((name, matches)) => {
            let session = Session::new(&cfg).await?;
            match name {
                "add-user" => {
                    add_user(
                        session,
                        matches.get_one::<Username>("USERNAME").unwrap(/* impossible */),
                    )
                    .await
                }
                "add-link" => {
                    add_link(
                        session,
                        user(matches)?,
                        url(matches),
                        matches
                            .get_many::<CollectionId>("collection")
                            .map(|ids| ids.copied().collect())
                            .unwrap_or_default(),
                    )
                    .await
                }
                "add-feed" => add_feed(session, user(matches)?, url(matches)).await,
                "discover" => discover(session, url(matches)).await,
                "fetch-link" => fetch_link(session, url(matches)).await,
                "fetch-feed" => fetch_feed(session, url(matches)).await,
                "import-opml" => {
                    import_opml(
                        session,
                        user(matches)?,
                        matches.get_one::<PathBuf>("FILE").unwrap(/* impossible */),
                    )
                    .await
                }
                "news" => news(session, user(matches)?, matches.get_flag("fill")).await,
                "export" => {
                    export(
                        session,
                        user(matches)?,
                        matches.get_one::<PathBuf>("dir").unwrap(/* defaulted */),
                    )
                    .await
                }
                _ => unimplemented!(/* impossible */),
            }
        }
        None => NoSubCommandSnafu.fail(),
    }
}

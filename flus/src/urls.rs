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

//! # URL handling
//!
//! Users paste all manner of things into "add a link" forms: bare hostnames, URLs with stray
//! whitespace, URLs littered with campaign-tracking parameters. [sanitize] turns those into the
//! canonical form under which flus stores (and de-duplicates) links.

use sha2::{Digest, Sha256};
use snafu::{Backtrace, IntoError, prelude::*};
use url::Url;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("An empty string is not an URL"))]
    Empty { backtrace: Backtrace },
    #[snafu(display("{text} has no host"))]
    NoHost { text: String, backtrace: Backtrace },
    #[snafu(display("Failed to parse {text} as an URL: {source}"))]
    Parse {
        text: String,
        source: url::ParseError,
        backtrace: Backtrace,
    },
    #[snafu(display("Only http & https URLs are supported; {text} has scheme {scheme}"))]
    Scheme {
        text: String,
        scheme: String,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////

const TRACKING_PARAMETERS: [&str; 8] = [
    "fbclid", "gclid", "mc_cid", "mc_eid", "igshid", "_hsenc", "_hsmi", "yclid",
];

fn is_tracking_parameter(name: &str) -> bool {
    name.starts_with("utm_") || TRACKING_PARAMETERS.contains(&name)
}

/// Parse `text` into the canonical form of an http(s) URL
///
/// `text` is trimmed and, if it has no scheme, assumed to be an http URL. The host is lowercased,
/// an empty fragment is dropped & tracking parameters are removed from the query (as is the query
/// itself, should that leave it empty).
pub fn sanitize(text: &str) -> Result<Url> {
    let text = text.trim();
    ensure!(!text.is_empty(), EmptySnafu);
    let mut url = match Url::parse(text) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            Url::parse(&format!("http://{text}")).context(ParseSnafu { text })?
        }
        Err(err) => return Err(ParseSnafu { text }.into_error(err)),
    };
    ensure!(
        matches!(url.scheme(), "http" | "https"),
        SchemeSnafu {
            text,
            scheme: url.scheme()
        }
    );
    ensure!(
        url.host_str().is_some_and(|host| !host.is_empty()),
        NoHostSnafu { text }
    );

    if url.fragment() == Some("") {
        url.set_fragment(None);
    }

    if url.query().is_some() {
        let total = url.query_pairs().count();
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(name, _)| !is_tracking_parameter(name))
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect();
        if kept.is_empty() {
            url.set_query(None);
        } else if kept.len() != total {
            url.query_pairs_mut().clear().extend_pairs(kept);
        }
    }

    Ok(url)
}

/// Resolve `href` (which may be relative) against `base`; only http(s) results are returned
pub fn absolutize(base: &Url, href: &str) -> Option<Url> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }
    base.join(href)
        .ok()
        .filter(|url| matches!(url.scheme(), "http" | "https"))
}

/// The hex SHA-256 of `url`'s serialization; used to index links by URL
pub fn url_hash(url: &Url) -> String {
    hex::encode(Sha256::digest(url.as_str().as_bytes()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sanitize_adds_a_scheme() {
        assert_eq!(
            sanitize("  example.com/some/page ").unwrap().as_str(),
            "http://example.com/some/page"
        );
        assert_eq!(
            sanitize("HTTPS://Example.COM").unwrap().as_str(),
            "https://example.com/"
        );
    }

    #[test]
    fn sanitize_rejects_junk() {
        assert!(matches!(sanitize("   "), Err(Error::Empty { .. })));
        assert!(matches!(
            sanitize("ftp://example.com/file"),
            Err(Error::Scheme { .. })
        ));
        assert!(matches!(
            sanitize("mailto:someone@example.com"),
            Err(Error::Scheme { .. })
        ));
        assert!(sanitize("http://").is_err());
    }

    #[test]
    fn sanitize_strips_trackers() {
        assert_eq!(
            sanitize("https://example.com/a?utm_source=x&utm_medium=y&id=3&fbclid=abc#")
                .unwrap()
                .as_str(),
            "https://example.com/a?id=3"
        );
        assert_eq!(
            sanitize("https://example.com/a?utm_campaign=spring&gclid=1")
                .unwrap()
                .as_str(),
            "https://example.com/a"
        );
        // Untouched queries keep their original encoding
        assert_eq!(
            sanitize("https://example.com/search?q=a+b&page=2#results")
                .unwrap()
                .as_str(),
            "https://example.com/search?q=a+b&page=2#results"
        );
    }

    #[test]
    fn absolutize_resolves_references() {
        let base = Url::parse("https://example.com/blog/post.html").unwrap();
        assert_eq!(
            absolutize(&base, "/feed.xml").unwrap().as_str(),
            "https://example.com/feed.xml"
        );
        assert_eq!(
            absolutize(&base, "img/cover.png").unwrap().as_str(),
            "https://example.com/blog/img/cover.png"
        );
        assert_eq!(
            absolutize(&base, "https://cdn.example.net/x.png")
                .unwrap()
                .as_str(),
            "https://cdn.example.net/x.png"
        );
        assert!(absolutize(&base, "javascript:void(0)").is_none());
        assert!(absolutize(&base, "  ").is_none());
    }

    #[test]
    fn hashes_are_stable() {
        let a = sanitize("example.com").unwrap();
        let b = sanitize("http://EXAMPLE.com/").unwrap();
        assert_eq!(url_hash(&a), url_hash(&b));
        assert_eq!(url_hash(&a).len(), 64);
    }
}

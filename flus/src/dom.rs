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

//! # HTML metadata extraction
//!
//! Given an HTML page, [Metadata::extract] works out what flus wants to show for a link: a
//! title, a description, an illustration, an estimated reading time & the syndication feeds the
//! page advertises.
//!
//! [scraper] documents are not `Send`, so extraction is a plain synchronous function; callers
//! mustn't hold the parsed document across an `.await`.

use std::collections::{HashMap, HashSet};

use itertools::Itertools;
use lazy_static::lazy_static;
use scraper::{ElementRef, Html, Selector};
use unicode_segmentation::UnicodeSegmentation;
use url::Url;

use crate::urls::{absolutize, sanitize};

/// Average reading speed, in words per minute
pub const WORDS_PER_MINUTE: usize = 200;

const FEED_TYPES: [&str; 5] = [
    "application/rss+xml",
    "application/atom+xml",
    "application/rdf+xml",
    "application/xml",
    "text/xml",
];

lazy_static! {
    static ref META: Selector = Selector::parse("meta").unwrap(/* known good */);
    static ref TITLE: Selector = Selector::parse("title").unwrap(/* known good */);
    static ref H1: Selector = Selector::parse("h1").unwrap(/* known good */);
    static ref ALTERNATE: Selector = Selector::parse("link[rel~=\"alternate\"]").unwrap(/* known good */);
    static ref CONTENT: [Selector; 3] = [
        Selector::parse("article").unwrap(/* known good */),
        Selector::parse("main").unwrap(/* known good */),
        Selector::parse("body").unwrap(/* known good */),
    ];
}

/// What flus knows about a web page
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Metadata {
    pub title: Option<String>,
    pub description: Option<String>,
    pub illustration: Option<Url>,
    /// In minutes
    pub reading_time: u32,
    /// Advertised feeds, in document order
    pub feeds: Vec<Url>,
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().join(" ")
}

fn non_empty(text: String) -> Option<String> {
    (!text.is_empty()).then_some(text)
}

/// The text of `element`, minus anything inside script, style & noscript elements
fn readable_text(element: ElementRef) -> String {
    element
        .descendants()
        .filter_map(|node| {
            let text = node.value().as_text()?;
            let hidden = node.ancestors().any(|ancestor| {
                ancestor
                    .value()
                    .as_element()
                    .is_some_and(|el| matches!(el.name(), "script" | "style" | "noscript"))
            });
            (!hidden).then(|| text.to_string())
        })
        .join(" ")
}

impl Metadata {
    /// Extract metadata from `html`, resolving relative references against `base`
    pub fn extract(html: &str, base: &Url) -> Metadata {
        let document = Html::parse_document(html);

        // `<meta property="og:title" content="...">` & friends; first occurrence wins
        let mut meta: HashMap<String, String> = HashMap::new();
        for element in document.select(&META) {
            let value = element.value();
            let (Some(name), Some(content)) = (
                value.attr("property").or_else(|| value.attr("name")),
                value.attr("content"),
            ) else {
                continue;
            };
            let content = collapse_whitespace(content);
            if !content.is_empty() {
                meta.entry(name.to_ascii_lowercase()).or_insert(content);
            }
        }
        let meta_value = |names: &[&str]| names.iter().find_map(|name| meta.get(*name).cloned());

        let title = meta_value(&["og:title", "twitter:title"])
            .or_else(|| {
                document
                    .select(&TITLE)
                    .next()
                    .and_then(|el| non_empty(collapse_whitespace(&el.text().join(" "))))
            })
            .or_else(|| {
                document
                    .select(&H1)
                    .next()
                    .and_then(|el| non_empty(collapse_whitespace(&el.text().join(" "))))
            });

        let description = meta_value(&["og:description", "twitter:description", "description"]);

        let illustration = ["og:image", "og:image:url", "twitter:image"]
            .iter()
            .filter_map(|name| meta.get(*name))
            .find_map(|href| absolutize(base, href));

        let words = CONTENT
            .iter()
            .find_map(|selector| document.select(selector).next())
            .map(|element| readable_text(element).unicode_words().count())
            .unwrap_or(0);
        let reading_time = u32::try_from(words / WORDS_PER_MINUTE).unwrap_or(u32::MAX);

        let mut seen = HashSet::new();
        let feeds = document
            .select(&ALTERNATE)
            .filter(|el| {
                el.value().attr("type").is_some_and(|t| {
                    let t = t.trim().to_ascii_lowercase();
                    FEED_TYPES.contains(&t.as_str())
                })
            })
            .filter_map(|el| el.value().attr("href"))
            .filter_map(|href| absolutize(base, href))
            .filter_map(|url| sanitize(url.as_str()).ok())
            .filter(|url| seen.insert(url.clone()))
            .collect();

        Metadata {
            title,
            description,
            illustration,
            reading_time,
            feeds,
        }
    }
}

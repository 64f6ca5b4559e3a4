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

//! # Syndication feeds
//!
//! [Feed::parse] understands the three syndication formats found in the wild:
//!
//! - RSS 2.0 (`<rss><channel><item>...`)
//! - RSS 1.0 (`<rdf:RDF><channel/><item/>...`)
//! - Atom (`<feed><entry>...`)
//!
//! The document is first read into a small element tree (local names only; flus has no use for
//! namespaces beyond telling `content:encoded` from `description`, which local names already do),
//! which is then interpreted according to its root element.

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use quick_xml::{Reader, events::Event};
use snafu::{Backtrace, prelude::*};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("The document is empty"))]
    Empty { backtrace: Backtrace },
    #[snafu(display("A document rooted at <{root}> is not a feed"))]
    NotAFeed { root: String, backtrace: Backtrace },
    #[snafu(display("Failed to parse XML: {source}"))]
    Xml {
        source: quick_xml::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                         element tree                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Default)]
struct Node {
    name: String,
    attrs: Vec<(String, String)>,
    text: String,
    children: Vec<Node>,
}

impl Node {
    fn new(e: &quick_xml::events::BytesStart) -> Node {
        Node {
            name: String::from_utf8_lossy(e.local_name().as_ref()).into_owned(),
            attrs: e
                .attributes()
                .flatten()
                .map(|attr| {
                    (
                        String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned(),
                        attr.unescape_value()
                            .map(Cow::into_owned)
                            .unwrap_or_else(|_| String::from_utf8_lossy(&attr.value).into_owned()),
                    )
                })
                .collect(),
            ..Default::default()
        }
    }
    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
    fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|child| child.name == name)
    }
    fn children<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.children.iter().filter(move |child| child.name == name)
    }
    /// The trimmed text of the first child named `name` that has any
    ///
    /// Only local names are kept, so an RSS channel's `<atom:link rel="self" href=".."/>` is also
    /// a `link`; being empty, it's passed over in favor of the real `<link>`.
    fn child_text(&self, name: &str) -> Option<String> {
        self.children(name)
            .map(|child| child.text.trim())
            .find(|text| !text.is_empty())
            .map(str::to_owned)
    }
}

/// Attach `node` to the element on top of `stack`; if there is none, it's the root
fn attach(stack: &mut [Node], root: &mut Option<Node>, node: Node) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(node),
        None => {
            root.get_or_insert(node);
        }
    }
}

fn parse_tree(text: &str) -> Result<Node> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);
    let mut stack: Vec<Node> = Vec::new();
    let mut root = None;
    loop {
        match reader.read_event().context(XmlSnafu)? {
            Event::Start(e) => stack.push(Node::new(&e)),
            Event::Empty(e) => attach(&mut stack, &mut root, Node::new(&e)),
            Event::End(_) => {
                if let Some(node) = stack.pop() {
                    attach(&mut stack, &mut root, node);
                }
            }
            Event::Text(e) => {
                if let Some(top) = stack.last_mut() {
                    // Feeds are full of HTML entities XML doesn't know about; keep those as-is
                    let text = e
                        .unescape()
                        .map(Cow::into_owned)
                        .unwrap_or_else(|_| String::from_utf8_lossy(&e).into_owned());
                    top.text.push_str(&text);
                }
            }
            Event::CData(e) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&e.into_inner()));
                }
            }
            Event::Eof => break,
            _ => (),
        }
        if root.is_some() {
            break;
        }
    }
    root.context(EmptySnafu)
}

/// The local name of the document's root element, if it can be found
fn root_name(text: &str) -> Option<String> {
    let mut reader = Reader::from_str(text);
    loop {
        match reader.read_event().ok()? {
            Event::Start(e) | Event::Empty(e) => {
                return Some(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
            }
            Event::Eof => return None,
            _ => (),
        }
    }
}

/// Parse a date in either RFC 3339 (Atom) or RFC 2822 (RSS) format
pub fn parse_date(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    DateTime::parse_from_rfc3339(text)
        .or_else(|_| DateTime::parse_from_rfc2822(text))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                              Feed                                              //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FeedKind {
    Rss,
    Rdf,
    Atom,
}

/// A feed entry
///
/// Links are kept as they appear in the document; they may be relative.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Entry {
    pub id: Option<String>,
    pub title: Option<String>,
    pub link: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub content: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Feed {
    pub kind: FeedKind,
    pub title: Option<String>,
    pub description: Option<String>,
    /// The site's home page
    pub link: Option<String>,
    pub entries: Vec<Entry>,
}

/// The href of the Atom `link` to use: `rel="alternate"` (or no `rel`) preferred, else the first
fn atom_link(node: &Node) -> Option<String> {
    let links: Vec<&Node> = node
        .children("link")
        .filter(|link| link.attr("href").is_some())
        .collect();
    links
        .iter()
        .find(|link| link.attr("rel").is_none_or(|rel| rel == "alternate"))
        .or_else(|| links.first())
        .and_then(|link| link.attr("href"))
        .map(|href| href.trim().to_owned())
}

fn rss_entry(item: &Node) -> Entry {
    let link = item
        .child_text("link")
        .or_else(|| {
            item.child("guid")
                .filter(|guid| guid.attr("isPermaLink") != Some("false"))
                .map(|guid| guid.text.trim().to_owned())
                .filter(|guid| guid.starts_with("http"))
        })
        .or_else(|| item.attr("about").map(str::to_owned));
    Entry {
        id: item.child_text("guid").or_else(|| item.attr("about").map(str::to_owned)),
        title: item.child_text("title"),
        link,
        published_at: item
            .child_text("pubDate")
            .or_else(|| item.child_text("date"))
            .and_then(|date| parse_date(&date)),
        content: item
            .child_text("encoded")
            .or_else(|| item.child_text("description")),
    }
}

fn atom_entry(entry: &Node) -> Entry {
    Entry {
        id: entry.child_text("id"),
        title: entry.child_text("title"),
        link: atom_link(entry),
        published_at: entry
            .child_text("published")
            .or_else(|| entry.child_text("updated"))
            .and_then(|date| parse_date(&date)),
        content: entry
            .child_text("content")
            .or_else(|| entry.child_text("summary")),
    }
}

impl Feed {
    pub fn parse(text: &str) -> Result<Feed> {
        let root = parse_tree(text)?;
        match root.name.as_str() {
            "rss" => {
                let channel = root.child("channel").context(NotAFeedSnafu { root: "rss" })?;
                Ok(Feed {
                    kind: FeedKind::Rss,
                    title: channel.child_text("title"),
                    description: channel.child_text("description"),
                    link: channel.child_text("link"),
                    entries: channel.children("item").map(rss_entry).collect(),
                })
            }
            "RDF" => {
                let channel = root.child("channel");
                Ok(Feed {
                    kind: FeedKind::Rdf,
                    title: channel.and_then(|c| c.child_text("title")),
                    description: channel.and_then(|c| c.child_text("description")),
                    link: channel.and_then(|c| c.child_text("link")),
                    // RSS 1.0 puts items alongside the channel, but some producers nest them
                    entries: root
                        .children("item")
                        .chain(channel.into_iter().flat_map(|c| c.children("item")))
                        .map(rss_entry)
                        .collect(),
                })
            }
            "feed" => Ok(Feed {
                kind: FeedKind::Atom,
                title: root.child_text("title"),
                description: root.child_text("subtitle"),
                link: atom_link(&root),
                entries: root.children("entry").map(atom_entry).collect(),
            }),
            other => NotAFeedSnafu { root: other }.fail(),
        }
    }
    /// Does this look like a feed?
    ///
    /// Decided by content type where that's conclusive; otherwise by sniffing the root element.
    pub fn is_feed(content_type: Option<&str>, text: &str) -> bool {
        let content_type = content_type.map(|ct| ct.to_ascii_lowercase());
        match content_type.as_deref() {
            Some(ct) if ct.contains("rss") || ct.contains("atom") || ct.contains("rdf") => true,
            Some(ct) if ct.contains("html") => false,
            _ => root_name(text).is_some_and(|root| matches!(root.as_str(), "rss" | "RDF" | "feed")),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use chrono::TimeZone;

    const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:content="http://purl.org/rss/1.0/modules/content/">
  <channel>
    <title>Example &amp; Co</title>
    <link>https://example.com/</link>
    <description>All the news</description>
    <item>
      <title>First post</title>
      <link>https://example.com/first</link>
      <guid isPermaLink="false">post-1</guid>
      <pubDate>Tue, 10 Jun 2025 04:00:00 GMT</pubDate>
      <description>Summary</description>
      <content:encoded><![CDATA[<p>Full <b>content</b>&nbsp;here</p>]]></content:encoded>
    </item>
    <item>
      <title>Second post</title>
      <guid>https://example.com/second</guid>
      <pubDate>not a date</pubDate>
    </item>
  </channel>
</rss>"#;

    const ATOM: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Atom blog</title>
  <subtitle>Thoughts</subtitle>
  <link rel="self" href="https://atom.example.org/feed.atom"/>
  <link href="https://atom.example.org/"/>
  <entry>
    <title type="html">An &lt;em&gt;entry&lt;/em&gt;</title>
    <id>urn:uuid:60a76c80-d399-11d9-b93C-0003939e0af6</id>
    <link rel="replies" href="https://atom.example.org/entry#comments"/>
    <link rel="alternate" type="text/html" href="/2025/entry"/>
    <updated>2025-03-01T10:00:00Z</updated>
    <published>2025-02-28T09:30:00+01:00</published>
    <summary>Short</summary>
  </entry>
</feed>"#;

    const RDF: &str = r#"<?xml version="1.0"?>
<rdf:RDF xmlns:rdf="http://www.w3.org/1999/02/22-rdf-syntax-ns#"
         xmlns="http://purl.org/rss/1.0/" xmlns:dc="http://purl.org/dc/elements/1.1/">
  <channel rdf:about="https://rdf.example.net/">
    <title>RDF site</title>
    <link>https://rdf.example.net/</link>
    <description>Old school</description>
  </channel>
  <item rdf:about="https://rdf.example.net/one">
    <title>One</title>
    <link>https://rdf.example.net/one</link>
    <dc:date>2024-12-24T18:00:00Z</dc:date>
  </item>
</rdf:RDF>"#;

    #[test]
    fn rss() {
        let feed = Feed::parse(RSS).unwrap();
        assert_eq!(feed.kind, FeedKind::Rss);
        assert_eq!(feed.title.as_deref(), Some("Example & Co"));
        assert_eq!(feed.link.as_deref(), Some("https://example.com/"));
        assert_eq!(feed.entries.len(), 2);

        let first = &feed.entries[0];
        assert_eq!(first.id.as_deref(), Some("post-1"));
        assert_eq!(first.link.as_deref(), Some("https://example.com/first"));
        assert_eq!(
            first.published_at,
            Some(Utc.with_ymd_and_hms(2025, 6, 10, 4, 0, 0).unwrap())
        );
        assert_eq!(
            first.content.as_deref(),
            Some("<p>Full <b>content</b>&nbsp;here</p>")
        );

        let second = &feed.entries[1];
        assert_eq!(second.link.as_deref(), Some("https://example.com/second"));
        assert!(second.published_at.is_none());
    }

    #[test]
    fn atom() {
        let feed = Feed::parse(ATOM).unwrap();
        assert_eq!(feed.kind, FeedKind::Atom);
        assert_eq!(feed.title.as_deref(), Some("Atom blog"));
        assert_eq!(feed.description.as_deref(), Some("Thoughts"));
        assert_eq!(feed.link.as_deref(), Some("https://atom.example.org/"));
        let entry = &feed.entries[0];
        assert_eq!(entry.title.as_deref(), Some("An <em>entry</em>"));
        assert_eq!(entry.link.as_deref(), Some("/2025/entry"));
        assert_eq!(
            entry.published_at,
            Some(Utc.with_ymd_and_hms(2025, 2, 28, 8, 30, 0).unwrap())
        );
        assert_eq!(entry.content.as_deref(), Some("Short"));
    }

    #[test]
    fn rdf() {
        let feed = Feed::parse(RDF).unwrap();
        assert_eq!(feed.kind, FeedKind::Rdf);
        assert_eq!(feed.title.as_deref(), Some("RDF site"));
        assert_eq!(feed.entries.len(), 1);
        assert_eq!(
            feed.entries[0].link.as_deref(),
            Some("https://rdf.example.net/one")
        );
        assert_eq!(
            feed.entries[0].published_at,
            Some(Utc.with_ymd_and_hms(2024, 12, 24, 18, 0, 0).unwrap())
        );
    }

    #[test]
    fn wordpress_self_links_are_skipped() {
        let feed = Feed::parse(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:atom="http://www.w3.org/2005/Atom">
  <channel>
    <title>A WordPress blog</title>
    <atom:link href="https://wp.example.com/feed/" rel="self" type="application/rss+xml" />
    <link>https://wp.example.com</link>
    <description>Just another WordPress site</description>
    <item>
      <title>Hello world!</title>
      <link>https://wp.example.com/hello-world/</link>
    </item>
  </channel>
</rss>"#,
        )
        .unwrap();
        assert_eq!(feed.link.as_deref(), Some("https://wp.example.com"));
        assert_eq!(
            feed.description.as_deref(),
            Some("Just another WordPress site")
        );
        assert_eq!(
            feed.entries[0].link.as_deref(),
            Some("https://wp.example.com/hello-world/")
        );
    }

    #[test]
    fn not_feeds() {
        assert!(matches!(
            Feed::parse("<html><body>hi</body></html>"),
            Err(Error::NotAFeed { .. })
        ));
        assert!(matches!(Feed::parse("   "), Err(Error::Empty { .. })));
        assert!(Feed::parse("<rss><channel><title>x</rss>").is_err());
    }

    #[test]
    fn detection() {
        assert!(Feed::is_feed(Some("application/rss+xml; charset=utf-8"), ""));
        assert!(Feed::is_feed(Some("application/atom+xml"), ""));
        assert!(!Feed::is_feed(Some("text/html"), ATOM));
        assert!(Feed::is_feed(Some("text/xml"), RDF));
        assert!(Feed::is_feed(None, RSS));
        assert!(!Feed::is_feed(Some("application/xml"), "<?xml version=\"1.0\"?><svg/>"));
        assert!(!Feed::is_feed(None, "just text"));
    }
}

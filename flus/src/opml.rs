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

//! # OPML
//!
//! Reading & writing the outline format feed readers use to exchange subscription lists.

use chrono::Utc;
use quick_xml::{
    Reader, Writer,
    events::{BytesDecl, BytesText, Event},
};
use snafu::{Backtrace, prelude::*};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to render OPML: {source}"))]
    Render {
        source: quick_xml::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to parse OPML: {source}"))]
    Xml {
        source: quick_xml::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// An OPML subscription
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Outline {
    pub xml_url: String,
    pub html_url: Option<String>,
    pub title: Option<String>,
}

/// Collect every `outline` carrying an `xmlUrl`, however deeply nested
pub fn parse(text: &str) -> Result<Vec<Outline>> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);
    let mut outlines = Vec::new();
    loop {
        match reader.read_event().context(XmlSnafu)? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"outline" => {
                let mut xml_url = None;
                let mut html_url = None;
                let mut title = None;
                let mut text = None;
                for attr in e.attributes().flatten() {
                    let value = match attr.unescape_value() {
                        Ok(value) => value.trim().to_owned(),
                        Err(_) => continue,
                    };
                    if value.is_empty() {
                        continue;
                    }
                    match attr.key.local_name().as_ref() {
                        b"xmlUrl" => xml_url = Some(value),
                        b"htmlUrl" => html_url = Some(value),
                        b"title" => title = Some(value),
                        b"text" => text = Some(value),
                        _ => (),
                    }
                }
                if let Some(xml_url) = xml_url {
                    outlines.push(Outline {
                        xml_url,
                        html_url,
                        title: title.or(text),
                    });
                }
            }
            Event::Eof => break,
            _ => (),
        }
    }
    Ok(outlines)
}

/// Produce an OPML 2.0 document listing `outlines`
pub fn render(title: &str, outlines: &[Outline]) -> Result<Vec<u8>> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .context(RenderSnafu)?;
    writer
        .create_element("opml")
        .with_attribute(("version", "2.0"))
        .write_inner_content::<_, quick_xml::Error>(|writer| {
            writer
                .create_element("head")
                .write_inner_content::<_, quick_xml::Error>(|writer| {
                    writer
                        .create_element("title")
                        .write_text_content(BytesText::new(title))?;
                    writer
                        .create_element("dateCreated")
                        .write_text_content(BytesText::new(&Utc::now().to_rfc2822()))?;
                    Ok(())
                })?;
            writer
                .create_element("body")
                .write_inner_content::<_, quick_xml::Error>(|writer| {
                    for outline in outlines {
                        let label = outline.title.as_deref().unwrap_or(&outline.xml_url);
                        writer
                            .create_element("outline")
                            .with_attributes([
                                ("type", "rss"),
                                ("text", label),
                                ("title", label),
                                ("xmlUrl", outline.xml_url.as_str()),
                            ])
                            .with_attributes(
                                outline.html_url.as_deref().map(|url| ("htmlUrl", url)),
                            )
                            .write_empty()?;
                    }
                    Ok(())
                })?;
            Ok(())
        })
        .context(RenderSnafu)?;
    Ok(writer.into_inner())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_nested_outlines() {
        let text = r#"<?xml version="1.0"?>
<opml version="1.0">
  <head><title>My feeds</title></head>
  <body>
    <outline text="Tech">
      <outline text="Blog A" type="rss" xmlUrl="https://a.example.com/feed" htmlUrl="https://a.example.com/"/>
      <outline text="Folder">
        <outline title="Blog B" text="ignored" xmlUrl=" https://b.example.com/rss?x=1&amp;y=2 "/>
      </outline>
    </outline>
    <outline text="No feed here" htmlUrl="https://c.example.com/"/>
    <outline text="Empty" xmlUrl=""/>
  </body>
</opml>"#;
        let outlines = parse(text).unwrap();
        assert_eq!(
            outlines,
            vec![
                Outline {
                    xml_url: "https://a.example.com/feed".to_owned(),
                    html_url: Some("https://a.example.com/".to_owned()),
                    title: Some("Blog A".to_owned()),
                },
                Outline {
                    xml_url: "https://b.example.com/rss?x=1&y=2".to_owned(),
                    html_url: None,
                    title: Some("Blog B".to_owned()),
                },
            ]
        );
    }

    #[test]
    fn rendered_documents_parse() {
        let outlines = vec![
            Outline {
                xml_url: "https://example.com/feed?a=1&b=2".to_owned(),
                html_url: Some("https://example.com/".to_owned()),
                title: Some("Tom & Jerry's \"blog\"".to_owned()),
            },
            Outline {
                xml_url: "https://other.example.com/atom".to_owned(),
                html_url: None,
                title: None,
            },
        ];
        let text = String::from_utf8(render("Followed <feeds>", &outlines).unwrap()).unwrap();
        assert!(text.starts_with(r#"<?xml version="1.0" encoding="UTF-8"?>"#));
        assert!(text.contains("<title>Followed &lt;feeds&gt;</title>"));
        assert!(text.contains(r#"xmlUrl="https://example.com/feed?a=1&amp;b=2""#));
        assert!(!text.contains(r#"htmlUrl="https://other"#));
        let mut parsed = parse(&text).unwrap();
        // `render` labels untitled outlines with their URL
        parsed[1].title = None;
        assert_eq!(parsed, outlines);
    }

    #[test]
    fn malformed_documents_fail() {
        assert!(parse("<opml><body><outline xmlUrl='x'></body></opml>").is_err());
    }
}

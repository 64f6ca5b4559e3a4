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

//! # Data exportation
//!
//! Everything a user owns, bundled as a gzip-compressed tarball: a JSON description of the
//! account, their followed feeds as OPML, and each of their collections as an Atom feed whose
//! entries carry the user's comments.

use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use flate2::{Compression, write::GzEncoder};
use quick_xml::{
    Writer,
    escape::escape,
    events::{BytesDecl, BytesText, Event},
};
use serde::Serialize;
use snafu::{Backtrace, prelude::*};
use tap::Pipe;
use tracing::{info, instrument};

use crate::{
    entities::{Collection, CollectionType, Link, Publication, User, UserId},
    opml::{self, Outline},
    storage::Backend,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Failed to compress the archive: {source}"))]
    Compress {
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to serialize the export metadata: {source}"))]
    Metadata {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to render the followed feeds: {source}"))]
    Opml {
        #[snafu(backtrace)]
        source: crate::opml::Error,
    },
    #[snafu(display("Failed to render {name}: {source}"))]
    Render {
        name: String,
        source: quick_xml::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("User {user} has no {ctype} collection"))]
    NoDefaultCollection {
        user: UserId,
        ctype: CollectionType,
        backtrace: Backtrace,
    },
    #[snafu(display("Storage error: {source}"))]
    Storage {
        source: crate::storage::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to add {name} to the archive: {source}"))]
    Tar {
        name: String,
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to write {path:?}: {source}"))]
    Write {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          Atom rendering                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

const FLUS_XMLNS: &str = "https://flus.io/xmlns";

fn generator() -> String {
    format!("flus {}", env!("CARGO_PKG_VERSION"))
}

/// A link as it appears in an exported collection, along with the owner's comments on it
struct ExportedLink {
    publication: Publication,
    link: Link,
    comments: Vec<String>,
}

fn render_atom(
    collection: &Collection,
    links: &[ExportedLink],
    exported_at: &DateTime<Utc>,
) -> quick_xml::Result<Vec<u8>> {
    fn text_element(
        writer: &mut Writer<Vec<u8>>,
        name: &str,
        text: &str,
    ) -> quick_xml::Result<()> {
        writer
            .create_element(name)
            .write_text_content(BytesText::new(text))
            .map(|_| ())
    }

    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    writer
        .create_element("feed")
        .with_attributes([
            ("xmlns", "http://www.w3.org/2005/Atom"),
            ("xmlns:flus", FLUS_XMLNS),
        ])
        .write_inner_content::<_, quick_xml::Error>(|writer| {
            text_element(writer, "title", &collection.name)?;
            if !collection.description.is_empty() {
                text_element(writer, "subtitle", &collection.description)?;
            }
            text_element(writer, "id", &format!("urn:uuid:{}", collection.id))?;
            text_element(writer, "updated", &exported_at.to_rfc3339())?;
            text_element(writer, "generator", &generator())?;
            text_element(writer, "flus:type", &collection.ctype.to_string())?;
            if let Some(url) = collection.feed_url() {
                writer
                    .create_element("link")
                    .with_attributes([("rel", "self"), ("href", url.as_str())])
                    .write_empty()?;
            }
            for ExportedLink {
                publication,
                link,
                comments,
            } in links
            {
                let published = publication.published_at.to_rfc3339();
                writer
                    .create_element("entry")
                    .write_inner_content::<_, quick_xml::Error>(|writer| {
                        text_element(writer, "title", &link.title)?;
                        text_element(writer, "id", &format!("urn:uuid:{}", link.id))?;
                        writer
                            .create_element("link")
                            .with_attribute(("href", link.url.as_str()))
                            .write_empty()?;
                        text_element(writer, "published", &published)?;
                        text_element(writer, "updated", &published)?;
                        text_element(writer, "flus:reading-time", &link.reading_time.to_string())?;
                        if !comments.is_empty() {
                            // The content is HTML, which is then escaped as XML text
                            let html = comments
                                .iter()
                                .map(|comment| format!("<p>{}</p>", escape(comment)))
                                .collect::<String>();
                            writer
                                .create_element("content")
                                .with_attribute(("type", "html"))
                                .write_text_content(BytesText::new(&html))?;
                        }
                        Ok(())
                    })?;
            }
            Ok(())
        })?;
    Ok(writer.into_inner())
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            Exporter                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Serialize)]
struct Metadata<'a> {
    user: &'a User,
    exported_at: DateTime<Utc>,
    generator: String,
}

/// Accumulates the files of an export in an in-memory tarball
struct Archive {
    builder: tar::Builder<Vec<u8>>,
    mtime: u64,
}

impl Archive {
    fn new(at: &DateTime<Utc>) -> Archive {
        Archive {
            builder: tar::Builder::new(Vec::new()),
            mtime: at.timestamp().max(0) as u64,
        }
    }
    fn add(&mut self, name: &str, contents: &[u8]) -> Result<()> {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o644);
        header.set_mtime(self.mtime);
        header.set_size(contents.len() as u64);
        self.builder
            .append_data(&mut header, name, contents)
            .context(TarSnafu { name })
    }
    fn finish(self) -> Result<Vec<u8>> {
        let tarball = self
            .builder
            .into_inner()
            .context(TarSnafu { name: "<trailer>" })?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tarball).context(CompressSnafu)?;
        encoder.finish().context(CompressSnafu)
    }
}

pub struct Exporter {
    storage: Arc<dyn Backend + Send + Sync>,
}

impl Exporter {
    pub fn new(storage: Arc<dyn Backend + Send + Sync>) -> Exporter {
        Exporter { storage }
    }
    async fn links_of(&self, user: &User, collection: &Collection) -> Result<Vec<ExportedLink>> {
        let mut links = Vec::new();
        for (publication, link) in self
            .storage
            .publications_in(&collection.id)
            .await
            .context(StorageSnafu)?
        {
            let comments = self
                .storage
                .messages_for_link(&link.id)
                .await
                .context(StorageSnafu)?
                .into_iter()
                .filter(|message| message.user_id == user.id)
                .map(|message| message.content)
                .collect();
            links.push(ExportedLink {
                publication,
                link,
                comments,
            });
        }
        Ok(links)
    }
    async fn followed_feeds(&self, user: &User) -> Result<Vec<Outline>> {
        self.storage
            .followed_collections(&user.id)
            .await
            .context(StorageSnafu)?
            .into_iter()
            .filter_map(|(_, collection)| {
                let feed = collection.feed?;
                Some(Outline {
                    xml_url: feed.url.to_string(),
                    html_url: feed.site_url.map(|url| url.to_string()),
                    title: Some(collection.name),
                })
            })
            .collect::<Vec<_>>()
            .pipe(Ok)
    }
    /// Build the export archive for `user`
    #[instrument(skip_all, fields(user = %user.username))]
    pub async fn export(&self, user: &User) -> Result<Vec<u8>> {
        let exported_at = Utc::now();
        let mut archive = Archive::new(&exported_at);

        let metadata = serde_json::to_vec_pretty(&Metadata {
            user,
            exported_at,
            generator: generator(),
        })
        .context(MetadataSnafu)?;
        archive.add("metadata.json", &metadata)?;

        let followed = opml::render(
            &format!("Feeds followed by {}", user.username),
            &self.followed_feeds(user).await?,
        )
        .context(OpmlSnafu)?;
        archive.add("followed.opml.xml", &followed)?;

        for (ctype, name) in [
            (CollectionType::Bookmarks, "bookmarks.atom.xml"),
            (CollectionType::News, "news.atom.xml"),
            (CollectionType::Read, "read.atom.xml"),
            (CollectionType::Never, "never.atom.xml"),
        ] {
            let collection = self
                .storage
                .collection_of_type(&user.id, ctype)
                .await
                .context(StorageSnafu)?
                .context(NoDefaultCollectionSnafu {
                    user: user.id,
                    ctype,
                })?;
            let links = self.links_of(user, &collection).await?;
            let atom = render_atom(&collection, &links, &exported_at).context(RenderSnafu { name })?;
            archive.add(name, &atom)?;
        }

        for collection in self
            .storage
            .collections_for_user(&user.id)
            .await
            .context(StorageSnafu)?
            .into_iter()
            .filter(|c| !CollectionType::DEFAULTS.contains(&c.ctype))
        {
            let links = self.links_of(user, &collection).await?;
            let name = format!("collections/{}.atom.xml", collection.id);
            let atom = render_atom(&collection, &links, &exported_at)
                .context(RenderSnafu { name: name.clone() })?;
            archive.add(&name, &atom)?;
        }

        archive.finish()
    }
    /// Export `user` to `<dir>/<username>-<timestamp>.tar.gz`; returns the path written
    pub async fn export_to(&self, user: &User, dir: &Path) -> Result<PathBuf> {
        let bytes = self.export(user).await?;
        let path = dir.join(format!(
            "{}-{}.tar.gz",
            user.username,
            Utc::now().format("%Y%m%d%H%M%S")
        ));
        tokio::fs::write(&path, &bytes)
            .await
            .context(WriteSnafu { path: path.clone() })?;
        info!("Exported {} to {}", user.username, path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::{collections::HashMap, io::Read};

    use flate2::read::GzDecoder;
    use url::Url;

    use crate::{
        entities::{Message, Username},
        memory::Store,
    };

    fn unpack(bytes: &[u8]) -> HashMap<String, String> {
        let mut archive = tar::Archive::new(GzDecoder::new(bytes));
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let path = entry.path().unwrap().to_string_lossy().into_owned();
                let mut contents = String::new();
                entry.read_to_string(&mut contents).unwrap();
                (path, contents)
            })
            .collect()
    }

    async fn scenario() -> (Arc<Store>, User, Collection) {
        let store = Arc::new(Store::new());
        let alice = User::new(Username::new("alice").unwrap());
        store.add_user(&alice).await.unwrap();
        for ctype in CollectionType::DEFAULTS {
            store
                .add_collection(&Collection::new_default(alice.id, ctype))
                .await
                .unwrap();
        }
        let bookmarks = store
            .collection_of_type(&alice.id, CollectionType::Bookmarks)
            .await
            .unwrap()
            .unwrap();
        let mut link = Link::new(alice.id, Url::parse("https://example.com/a?b=1&c=2").unwrap());
        link.title = "Fish & chips".to_owned();
        link.reading_time = 7;
        store.add_link(&link).await.unwrap();
        store
            .publish(&link.id, &bookmarks.id, &Utc::now())
            .await
            .unwrap();
        store
            .add_message(&Message::new(alice.id, link.id, "Must <try>"))
            .await
            .unwrap();

        let mine = Collection::new(alice.id, "Recipes", "Things to cook", CollectionType::Collection, true);
        store.add_collection(&mine).await.unwrap();

        let support = User::new(Username::new("flus").unwrap());
        store.add_user(&support).await.unwrap();
        let mut feed = Collection::new_feed(support.id, Url::parse("https://blog.example.com/feed.xml").unwrap());
        feed.name = "A Blog".to_owned();
        store.add_collection(&feed).await.unwrap();
        store.follow(&alice.id, &feed.id).await.unwrap();

        (store, alice, mine)
    }

    #[tokio::test]
    async fn archive_contents() {
        let (store, alice, mine) = scenario().await;
        let exporter = Exporter::new(store);
        let files = unpack(&exporter.export(&alice).await.unwrap());

        let mut names = files.keys().cloned().collect::<Vec<_>>();
        names.sort();
        assert_eq!(
            names,
            vec![
                "bookmarks.atom.xml".to_owned(),
                format!("collections/{}.atom.xml", mine.id),
                "followed.opml.xml".to_owned(),
                "metadata.json".to_owned(),
                "never.atom.xml".to_owned(),
                "news.atom.xml".to_owned(),
                "read.atom.xml".to_owned(),
            ]
        );

        let metadata: serde_json::Value = serde_json::from_str(&files["metadata.json"]).unwrap();
        assert_eq!(metadata["user"]["username"], "alice");
        assert!(metadata["generator"].as_str().unwrap().starts_with("flus"));

        let bookmarks = &files["bookmarks.atom.xml"];
        assert!(bookmarks.contains("<title>Fish &amp; chips</title>"));
        assert!(bookmarks.contains(r#"<link href="https://example.com/a?b=1&amp;c=2"/>"#));
        assert!(bookmarks.contains("<flus:reading-time>7</flus:reading-time>"));
        // The comment is HTML, escaped once more as XML text
        assert!(bookmarks.contains("&lt;p&gt;Must &amp;lt;try&amp;gt;&lt;/p&gt;"));

        // The exported Atom is itself a parseable feed
        let parsed = crate::feeds::Feed::parse(bookmarks).unwrap();
        assert_eq!(parsed.entries.len(), 1);
        assert_eq!(parsed.entries[0].title.as_deref(), Some("Fish & chips"));

        let followed = opml::parse(&files["followed.opml.xml"]).unwrap();
        assert_eq!(followed.len(), 1);
        assert_eq!(followed[0].xml_url, "https://blog.example.com/feed.xml");
        assert_eq!(followed[0].title.as_deref(), Some("A Blog"));

        let recipes = &files[&format!("collections/{}.atom.xml", mine.id)];
        assert!(recipes.contains("<subtitle>Things to cook</subtitle>"));
        assert!(!recipes.contains("<entry>"));
    }

    #[tokio::test]
    async fn export_to_directory() {
        let (store, alice, _) = scenario().await;
        let dir = tempfile::tempdir().unwrap();
        let path = Exporter::new(store)
            .export_to(&alice, dir.path())
            .await
            .unwrap();
        assert_eq!(path.parent().unwrap(), dir.path());
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("alice-") && name.ends_with(".tar.gz"));
        assert_eq!(unpack(&std::fs::read(&path).unwrap()).len(), 7);
    }
}

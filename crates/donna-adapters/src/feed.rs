//! Feed list loading, RSS/Atom parsing and the HTTP-backed feed source.

use std::io::ErrorKind;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use donna_core::{FeedEntry, FeedMetadata, ParsedFeed};
use donna_storage::HttpFetcher;
use regex::Regex;
use roxmltree::{Document, Node, ParsingOptions};
use tracing::{debug, info, warn};

use crate::{AdapterError, FeedFetch, FeedSource};

const UNTITLED: &str = "(no title)";
const RDF_NS: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#";

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("tag pattern compiles"));
static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern compiles"));

/// Read the feed list: one URL per line, `#` comments and blanks ignored.
/// A missing file is an empty list.
pub async fn load_feed_list(path: impl AsRef<Path>) -> anyhow::Result<Vec<String>> {
    let path = path.as_ref();
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            info!(path = %path.display(), "feed list not found");
            return Ok(Vec::new());
        }
        Err(err) => {
            return Err(err).with_context(|| format!("reading feed list {}", path.display()));
        }
    };

    let mut urls = Vec::new();
    for line in content.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with("http://") || line.starts_with("https://") {
            urls.push(line.to_string());
        } else {
            warn!(line, "skipping invalid feed url");
        }
    }

    info!(count = urls.len(), path = %path.display(), "loaded feed urls");
    Ok(urls)
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Reduce an HTML fragment to plain, single-spaced text.
fn strip_markup(html: &str) -> Option<String> {
    let without_tags = TAG_RE.replace_all(html, " ");
    let decoded = decode_entities(&without_tags);
    let collapsed = WHITESPACE_RE.replace_all(&decoded, " ");
    let trimmed = collapsed.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == name)
}

fn text_of(node: Node<'_, '_>) -> String {
    node.descendants()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect::<String>()
        .trim()
        .to_string()
}

fn child_text(node: Node<'_, '_>, name: &str) -> Option<String> {
    child(node, name)
        .map(text_of)
        .filter(|t| !t.is_empty())
}

fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn entry_link(node: Node<'_, '_>) -> Option<String> {
    let links: Vec<Node<'_, '_>> = node
        .children()
        .filter(|n| n.is_element() && n.tag_name().name() == "link")
        .collect();

    // Atom links carry the target in `href`; RSS links carry it as text.
    let atom = links
        .iter()
        .find(|l| matches!(l.attribute("rel"), None | Some("alternate")) && l.has_attribute("href"))
        .or_else(|| links.iter().find(|l| l.has_attribute("href")))
        .and_then(|l| l.attribute("href"))
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(ToString::to_string);

    atom.or_else(|| links.iter().map(|l| text_of(*l)).find(|t| !t.is_empty()))
}

fn entry_author(node: Node<'_, '_>) -> Option<String> {
    child_text(node, "creator").or_else(|| {
        child(node, "author").and_then(|author| {
            child_text(author, "name").or_else(|| Some(text_of(author)).filter(|t| !t.is_empty()))
        })
    })
}

fn parse_entry(node: Node<'_, '_>) -> FeedEntry {
    let title = child_text(node, "title").and_then(|t| strip_markup(&t));
    let link = entry_link(node);
    let guid = child_text(node, "guid")
        .or_else(|| child_text(node, "id"))
        .or_else(|| {
            node.attribute((RDF_NS, "about"))
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(ToString::to_string)
        });

    let published_at = ["pubDate", "published", "date", "updated"]
        .iter()
        .filter_map(|name| child_text(node, name))
        .find_map(|raw| parse_date(&raw));

    let summary = ["description", "summary", "content", "encoded"]
        .iter()
        .filter_map(|name| child_text(node, name))
        .find_map(|raw| strip_markup(&raw));

    FeedEntry {
        id: guid
            .or_else(|| link.clone())
            .or_else(|| title.clone())
            .unwrap_or_default(),
        title: title.unwrap_or_else(|| UNTITLED.to_string()),
        link: link.unwrap_or_default(),
        published_at,
        summary,
        author: entry_author(node),
    }
}

/// Parse an RSS 2.0, RSS 1.0 (RDF) or Atom document.
pub fn parse_feed(feed_url: &str, xml: &str) -> Result<ParsedFeed, AdapterError> {
    let options = ParsingOptions {
        allow_dtd: true,
        ..ParsingOptions::default()
    };
    let doc = Document::parse_with_options(xml.trim_start_matches('\u{feff}'), options)
        .map_err(|e| AdapterError::Parse(format!("{feed_url}: {e}")))?;
    let root = doc.root_element();

    let (title_holder, items, item_name) = match root.tag_name().name() {
        "rss" => {
            let channel = child(root, "channel")
                .ok_or_else(|| AdapterError::Parse(format!("{feed_url}: rss document without channel")))?;
            (channel, channel, "item")
        }
        "RDF" => {
            let channel = child(root, "channel").unwrap_or(root);
            (channel, root, "item")
        }
        "feed" => (root, root, "entry"),
        other => {
            return Err(AdapterError::Parse(format!(
                "{feed_url}: unrecognised feed root <{other}>"
            )))
        }
    };

    let entries = items
        .children()
        .filter(|n| n.is_element() && n.tag_name().name() == item_name)
        .map(parse_entry)
        .collect();

    Ok(ParsedFeed {
        feed_url: feed_url.to_string(),
        feed_title: child_text(title_holder, "title"),
        entries,
    })
}

/// Feed source that polls over HTTP with conditional requests.
#[derive(Debug, Clone)]
pub struct HttpFeedSource {
    fetcher: HttpFetcher,
}

impl HttpFeedSource {
    pub fn new(fetcher: HttpFetcher) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl FeedSource for HttpFeedSource {
    async fn fetch(
        &self,
        feed_url: &str,
        validators: Option<&FeedMetadata>,
    ) -> Result<FeedFetch, AdapterError> {
        let response = self.fetcher.fetch(feed_url, validators).await?;
        let previous = validators.cloned().unwrap_or_default();
        let metadata = FeedMetadata {
            feed_url: feed_url.to_string(),
            etag: response.etag.clone().or(previous.etag),
            last_modified: response.last_modified.clone().or(previous.last_modified),
        };

        if response.is_not_modified() {
            return Ok(FeedFetch::NotModified { metadata });
        }

        let body = String::from_utf8_lossy(&response.body);
        let feed = parse_feed(feed_url, &body)?;
        debug!(%feed_url, entries = feed.entries.len(), "parsed feed");
        Ok(FeedFetch::Fetched { feed, metadata })
    }
}

//! # Item extraction seam
//! Feed sources go through [`ItemExtractor`] to turn raw content into an
//! ordered list of `(identifier, payload)` items. [`RssExtractor`] covers
//! RSS 2.0; other formats plug in behind the same trait.

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use quick_xml::de::from_str;
use serde::Deserialize;
use time::{format_description::well_known::Rfc2822, OffsetDateTime, UtcOffset};

use crate::state;
use crate::types::SourceConfig;

/// One discrete entry extracted from a feed, in document order.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedItem {
    /// Stable identifier: guid, else link, else a digest of the title.
    pub id: String,
    pub title: String,
    pub url: Option<String>,
    pub published_unix: u64,
}

pub trait ItemExtractor: Send + Sync {
    fn extract_items(&self, raw: &str, source: &SourceConfig) -> Result<Vec<ExtractedItem>>;
}

/// Normalize text: decode HTML entities, strip tags, collapse whitespace.
pub fn normalize_text(s: &str) -> String {
    let mut out = html_escape::decode_html_entities(s).to_string();

    static RE_TAGS: OnceCell<regex::Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").unwrap());
    out = re_tags.replace_all(&out, " ").to_string();

    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'")
        .replace('\u{00A0}', " ");

    static RE_WS: OnceCell<regex::Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"[ \t]+").unwrap());
    out = re_ws.replace_all(&out, " ").to_string();

    static RE_BLANK: OnceCell<regex::Regex> = OnceCell::new();
    let re_blank = RE_BLANK.get_or_init(|| regex::Regex::new(r"\n\s*\n+").unwrap());
    out = re_blank.replace_all(&out, "\n").to_string();

    out.trim().to_string()
}

// --- RSS 2.0 ---

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    guid: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
}

fn parse_rfc2822_to_unix(ts: &str) -> u64 {
    OffsetDateTime::parse(ts, &Rfc2822)
        .ok()
        .map(|dt| dt.to_offset(UtcOffset::UTC).unix_timestamp())
        .and_then(|x| u64::try_from(x).ok())
        .unwrap_or(0)
}

fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
}

#[derive(Debug, Default)]
pub struct RssExtractor;

impl ItemExtractor for RssExtractor {
    fn extract_items(&self, raw: &str, source: &SourceConfig) -> Result<Vec<ExtractedItem>> {
        let xml_clean = scrub_html_entities_for_xml(raw);
        let rss: Rss = from_str(&xml_clean)
            .with_context(|| format!("parsing rss xml for source {}", source.id))?;

        let mut out = Vec::with_capacity(rss.channel.item.len());
        for it in rss.channel.item {
            let title = normalize_text(it.title.as_deref().unwrap_or_default());
            let id = it
                .guid
                .as_deref()
                .or(it.link.as_deref())
                .map(str::to_string)
                .unwrap_or_else(|| state::fingerprint(&title));
            if id.is_empty() && title.is_empty() {
                continue;
            }
            out.push(ExtractedItem {
                id,
                title,
                url: it.link,
                published_unix: it
                    .pub_date
                    .as_deref()
                    .map(parse_rfc2822_to_unix)
                    .unwrap_or(0),
            });
        }
        Ok(out)
    }
}

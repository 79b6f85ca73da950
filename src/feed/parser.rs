use encoding_rs::Encoding;
use std::borrow::Cow;
use thiserror::Error;

use crate::util::{clean_text, resolve_url, strip_control_chars};

#[derive(Debug, Error)]
pub enum ParseError {
    /// The payload is not a feed in any format feed-rs understands
    #[error("Parse error: {0}")]
    Structural(String),
}

/// One entry as the source published it, before fingerprinting.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedItem {
    /// The entry's own identifier (RSS `guid`, Atom `id`, JSON Feed `id`)
    pub source_id: Option<String>,
    pub title: String,
    pub link: Option<String>,
    /// Publication (or last update) time as a Unix timestamp
    pub date: Option<i64>,
    pub content: Option<String>,
}

/// A feed normalized across RSS, Atom and JSON Feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFeed {
    pub title: String,
    pub description: Option<String>,
    /// Website the feed belongs to
    pub site_link: Option<String>,
    /// Entries in document order
    pub items: Vec<ParsedItem>,
}

/// A successful parse. `partial` is set when the document was damaged and
/// only the entries before the damage could be recovered.
#[derive(Debug, Clone)]
pub struct ParseOutcome {
    pub feed: ParsedFeed,
    pub partial: bool,
}

/// Parse a feed document.
///
/// `charset` is the `Content-Type` charset, if the server sent one; the body
/// is transcoded to UTF-8 before parsing. Relative links resolve against
/// `base_url`.
///
/// A document that fails to parse is retried once, cut after its last
/// complete entry. If that recovers a feed the outcome is marked `partial`.
pub fn parse_feed(
    bytes: &[u8],
    charset: Option<&str>,
    base_url: &str,
) -> Result<ParseOutcome, ParseError> {
    let body = transcode_to_utf8(bytes, charset);
    let parser = feed_parser();

    match parser.parse(body.as_ref()) {
        Ok(feed) => Ok(ParseOutcome {
            feed: normalize(feed, base_url),
            partial: false,
        }),
        Err(err) => {
            let salvaged = truncate_after_last_entry(&body)
                .and_then(|repaired| parser.parse(repaired.as_bytes()).ok());
            match salvaged {
                Some(feed) => Ok(ParseOutcome {
                    feed: normalize(feed, base_url),
                    partial: true,
                }),
                None => Err(ParseError::Structural(err.to_string())),
            }
        }
    }
}

/// feed-rs with synthetic ids turned off.
///
/// The default generator invents a random UUID for an entry with neither id
/// nor link, which would give it a new identity on every fetch. A missing id
/// stays empty here and `merge::fingerprint` derives one from the content.
fn feed_parser() -> feed_rs::parser::Parser {
    feed_rs::parser::Builder::new()
        .id_generator(|_, _, _| String::new())
        .build()
}

/// Decode a text body by its declared charset, falling back to UTF-8.
///
/// A byte order mark overrides the declared charset. Invalid sequences become
/// U+FFFD rather than failing.
pub fn decode_text(bytes: &[u8], charset: Option<&str>) -> String {
    let encoding = charset
        .and_then(|label| Encoding::for_label(label.as_bytes()))
        .unwrap_or(encoding_rs::UTF_8);
    let (text, _, _) = encoding.decode(bytes);
    text.into_owned()
}

/// Re-encode a non-UTF-8 body as UTF-8 so the XML parser sees one encoding.
///
/// The XML declaration is rewritten to match; otherwise the parser would
/// decode the already-converted bytes a second time.
fn transcode_to_utf8<'a>(bytes: &'a [u8], charset: Option<&str>) -> Cow<'a, [u8]> {
    let Some(encoding) = charset.and_then(|label| Encoding::for_label(label.as_bytes())) else {
        return Cow::Borrowed(bytes);
    };
    if encoding == encoding_rs::UTF_8 {
        return Cow::Borrowed(bytes);
    }

    let (text, _, _) = encoding.decode(bytes);
    Cow::Owned(rewrite_xml_encoding(&text).into_bytes())
}

fn rewrite_xml_encoding(text: &str) -> String {
    let trimmed = text.trim_start();
    if !trimmed.starts_with("<?xml") {
        return text.to_owned();
    }
    let Some(decl_end) = trimmed.find("?>") else {
        return text.to_owned();
    };
    let declaration = &trimmed[..decl_end];
    let Some(enc_pos) = declaration.find("encoding") else {
        return text.to_owned();
    };

    let after = &declaration[enc_pos + "encoding".len()..];
    let Some(quote_pos) = after.find(['"', '\'']) else {
        return text.to_owned();
    };
    let quote = after[quote_pos..].chars().next().unwrap_or('"');
    let value_start = enc_pos + "encoding".len() + quote_pos + 1;
    let Some(value_len) = declaration[value_start..].find(quote) else {
        return text.to_owned();
    };

    let mut out = String::with_capacity(trimmed.len());
    out.push_str(&trimmed[..value_start]);
    out.push_str("utf-8");
    out.push_str(&trimmed[value_start + value_len..]);
    out
}

/// Cut a damaged XML feed after its last complete `</item>` or `</entry>`
/// and close the root element.
fn truncate_after_last_entry(body: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(body);

    let (cut, closing) = if let Some(pos) = text.rfind("</item>") {
        let closing = if text.contains("<rdf:RDF") {
            "</rdf:RDF>"
        } else {
            "</channel></rss>"
        };
        (pos + "</item>".len(), closing)
    } else if let Some(pos) = text.rfind("</entry>") {
        (pos + "</entry>".len(), "</feed>")
    } else {
        return None;
    };

    let mut repaired = String::with_capacity(cut + closing.len());
    repaired.push_str(&text[..cut]);
    repaired.push_str(closing);
    Some(repaired)
}

fn normalize(feed: feed_rs::model::Feed, base_url: &str) -> ParsedFeed {
    let title = feed
        .title
        .map(|t| clean_text(&t.content))
        .unwrap_or_default();
    let description = feed
        .description
        .map(|d| clean_text(&d.content))
        .filter(|d| !d.is_empty());

    // Prefer an explicit alternate link, then anything that is not the feed itself
    let site_link = feed
        .links
        .iter()
        .find(|l| l.rel.as_deref() == Some("alternate"))
        .or_else(|| feed.links.iter().find(|l| l.rel.as_deref() != Some("self")))
        .map(|l| resolve_url(&l.href, base_url));

    let link_base = site_link.as_deref().unwrap_or(base_url).to_owned();

    let items = feed
        .entries
        .into_iter()
        .map(|entry| {
            let link = entry
                .links
                .iter()
                .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
                .or_else(|| entry.links.first())
                .map(|l| resolve_url(&l.href, &link_base));
            let date = entry.published.or(entry.updated).map(|dt| dt.timestamp());
            let content = entry
                .content
                .and_then(|c| c.body)
                .or_else(|| entry.summary.map(|s| s.content))
                .map(|c| strip_control_chars(&c).into_owned());
            let title = entry
                .title
                .map(|t| clean_text(&t.content))
                .unwrap_or_default();
            let source_id = Some(entry.id.trim().to_owned()).filter(|id| !id.is_empty());

            ParsedItem {
                source_id,
                title,
                link,
                date,
                content,
            }
        })
        .collect();

    ParsedFeed {
        title,
        description,
        site_link,
        items,
    }
}

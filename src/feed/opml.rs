use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

use crate::util::{clean_text, validate_url, UrlPolicy};

/// SEC-003: Maximum allowed nesting depth for OPML outline elements.
const MAX_OPML_DEPTH: usize = 50;

/// Errors that can occur during OPML parsing.
#[derive(Debug, Error)]
pub enum OpmlError {
    /// SEC-003: OPML nesting depth exceeds safety limit.
    #[error("OPML nesting depth exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),

    /// XML parsing failed.
    #[error("XML parse error: {0}")]
    XmlParse(String),

    /// File I/O error.
    #[error("Failed to read OPML file: {0}")]
    Io(#[from] std::io::Error),
}

/// A feed subscription extracted from an OPML document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpmlFeed {
    /// `title` attribute, falling back to `text`, then to the feed URL.
    pub title: String,
    pub xml_url: String,
    pub html_url: Option<String>,
    /// Title of the outermost enclosing folder outline. Deeper nesting is
    /// flattened into it.
    pub folder: Option<String>,
}

/// Reads and parses an OPML file from disk.
pub async fn parse_file(path: &str, policy: UrlPolicy) -> Result<Vec<OpmlFeed>, OpmlError> {
    let content = tokio::fs::read_to_string(path).await?;
    parse_opml(&content, policy)
}

/// Parses OPML content and extracts feed subscriptions in document order.
///
/// Outlines with an `xmlUrl` are feeds; outlines without one are folders.
/// Feeds whose URL fails validation are skipped with a warning.
///
/// # Security
///
/// SEC-002: quick-xml (0.37) never expands `<!ENTITY>` declarations; only the
/// five predefined entities unescape, anything else is an error.
pub fn parse_opml(content: &str, policy: UrlPolicy) -> Result<Vec<OpmlFeed>, OpmlError> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut feeds = Vec::new();
    // One entry per open <outline>: Some(title) for folders, None for feeds
    let mut stack: Vec<Option<String>> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.name().as_ref() == b"outline" => {
                if stack.len() >= MAX_OPML_DEPTH {
                    return Err(OpmlError::MaxDepthExceeded(MAX_OPML_DEPTH));
                }
                let outline = read_outline(&e)?;
                match outline.xml_url {
                    Some(_) => {
                        if let Some(feed) = outline.into_feed(outermost_folder(&stack), policy) {
                            feeds.push(feed);
                        }
                        stack.push(None);
                    }
                    None => stack.push(Some(outline.title.unwrap_or_default())),
                }
            }
            Ok(Event::Empty(e)) if e.name().as_ref() == b"outline" => {
                let outline = read_outline(&e)?;
                if outline.xml_url.is_some() {
                    if let Some(feed) = outline.into_feed(outermost_folder(&stack), policy) {
                        feeds.push(feed);
                    }
                }
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"outline" => {
                stack.pop();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(OpmlError::XmlParse(e.to_string())),
            _ => {}
        }
    }

    Ok(feeds)
}

fn outermost_folder(stack: &[Option<String>]) -> Option<String> {
    stack
        .iter()
        .flatten()
        .find(|title| !title.is_empty())
        .cloned()
}

#[derive(Default)]
struct Outline {
    title: Option<String>,
    xml_url: Option<String>,
    html_url: Option<String>,
}

impl Outline {
    fn into_feed(self, folder: Option<String>, policy: UrlPolicy) -> Option<OpmlFeed> {
        let xml_url = self.xml_url?.trim().to_owned();
        // SEC-002: Validate URL before accepting
        if let Err(e) = validate_url(&xml_url, policy) {
            tracing::warn!(url = %xml_url, error = %e, "Skipping invalid feed URL");
            return None;
        }
        let html_url = self.html_url.filter(|url| match validate_url(url, policy) {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "Ignoring invalid htmlUrl in OPML");
                false
            }
        });
        Some(OpmlFeed {
            title: self.title.unwrap_or_else(|| xml_url.clone()),
            xml_url,
            html_url,
            folder,
        })
    }
}

fn read_outline(e: &BytesStart<'_>) -> Result<Outline, OpmlError> {
    let mut outline = Outline::default();
    let mut text = None;

    for attr_result in e.attributes() {
        let attr = match attr_result {
            Ok(attr) => attr,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed OPML attribute");
                continue;
            }
        };
        let value = attr
            .unescape_value()
            .map_err(|e| OpmlError::XmlParse(e.to_string()))?;
        match attr.key.as_ref() {
            b"xmlUrl" => outline.xml_url = Some(value.into_owned()),
            b"htmlUrl" => outline.html_url = Some(value.into_owned()),
            b"title" => outline.title = Some(clean_text(&value)),
            b"text" => text = Some(clean_text(&value)),
            _ => {}
        }
    }

    outline.title = outline
        .title
        .filter(|t| !t.is_empty())
        .or(text.filter(|t| !t.is_empty()));
    Ok(outline)
}

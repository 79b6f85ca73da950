/// Attributes of one `<link>` element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkTag {
    /// `rel` tokens, lowercased
    pub rel: Vec<String>,
    pub href: Option<String>,
    /// `type`, lowercased
    pub mime_type: Option<String>,
    pub title: Option<String>,
}

impl LinkTag {
    pub fn has_rel(&self, token: &str) -> bool {
        self.rel.iter().any(|r| r == token)
    }
}

/// Upper bound on scanned bytes; `<link>` tags live in `<head>`.
const MAX_SCAN_BYTES: usize = 512 * 1024;

/// Collects every `<link ...>` element in document order.
///
/// Uses plain string scanning (no HTML parser dependency). Attribute values
/// may be double-quoted, single-quoted or bare; names are case-insensitive.
pub fn link_tags(html: &str) -> Vec<LinkTag> {
    let mut end = html.len().min(MAX_SCAN_BYTES);
    while !html.is_char_boundary(end) {
        end -= 1;
    }
    let html = &html[..end];
    let lower = html.to_ascii_lowercase();

    let mut tags = Vec::new();
    let mut search_from = 0;

    while let Some(found) = lower[search_from..].find("<link") {
        let start = search_from + found + "<link".len();
        let Some(len) = lower[start..].find('>') else {
            break;
        };
        // `<linkfoo>` is a different element
        if html[start..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_whitespace() || c == '/')
        {
            tags.push(parse_link_attributes(&html[start..start + len]));
        }
        search_from = start + len + 1;
    }

    tags
}

fn parse_link_attributes(body: &str) -> LinkTag {
    let mut tag = LinkTag::default();
    for (name, value) in attributes(body) {
        match name.as_str() {
            "rel" => {
                tag.rel = value
                    .split_ascii_whitespace()
                    .map(str::to_ascii_lowercase)
                    .collect()
            }
            "href" => tag.href = Some(decode_entities(value.trim())),
            "type" => tag.mime_type = Some(value.trim().to_ascii_lowercase()),
            "title" => tag.title = Some(decode_entities(value.trim())),
            _ => {}
        }
    }
    tag
}

/// Splits the inside of a start tag into `(lowercased name, value)` pairs.
fn attributes(body: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut rest = body.trim_start();

    while !rest.is_empty() {
        rest = rest.trim_start_matches(|c: char| c.is_ascii_whitespace() || c == '/');
        let name_len = rest
            .find(|c: char| c.is_ascii_whitespace() || c == '=' || c == '/')
            .unwrap_or(rest.len());
        if name_len == 0 {
            break;
        }
        let name = rest[..name_len].to_ascii_lowercase();
        rest = rest[name_len..].trim_start();

        let Some(after_eq) = rest.strip_prefix('=') else {
            out.push((name, String::new()));
            continue;
        };
        let after_eq = after_eq.trim_start();

        let (value, remaining) = match after_eq.chars().next() {
            Some(quote @ ('"' | '\'')) => {
                let inner = &after_eq[1..];
                match inner.find(quote) {
                    Some(end) => (&inner[..end], &inner[end + 1..]),
                    None => (inner, ""),
                }
            }
            _ => {
                let end = after_eq
                    .find(|c: char| c.is_ascii_whitespace())
                    .unwrap_or(after_eq.len());
                (&after_eq[..end], &after_eq[end..])
            }
        };
        out.push((name, value.to_owned()));
        rest = remaining;
    }

    out
}

/// Decodes the handful of entities that show up in `href` values.
fn decode_entities(value: &str) -> String {
    if !value.contains('&') {
        return value.to_owned();
    }
    value
        .replace("&amp;", "&")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
}

//! Minimal XML element tree built from `quick-xml` events.
//!
//! Feed dialects are extracted from this tree rather than through serde so
//! that both RSS and Atom can be probed against the same parse, and so that
//! mixed content (XHTML bodies, CDATA, namespaced extensions) never aborts
//! the whole document.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::parser::ParseError;

/// Maximum element nesting accepted before the document is rejected.
const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, Default)]
pub(crate) struct Element {
    /// Qualified name as written, e.g. `dc:creator`.
    pub name: String,
    /// Name without namespace prefix, e.g. `creator`.
    pub local_name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Element>,
    text: String,
}

impl Element {
    fn from_start(e: &BytesStart<'_>, reader: &Reader<&[u8]>) -> Self {
        let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
        let local_name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();

        let mut attributes = Vec::new();
        for attr in e.attributes() {
            let attr = match attr {
                Ok(attr) => attr,
                Err(err) => {
                    tracing::debug!(element = %name, error = %err, "Skipping malformed attribute");
                    continue;
                }
            };
            let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
            let value = match attr.decode_and_unescape_value(reader.decoder()) {
                Ok(v) => v.into_owned(),
                Err(_) => String::from_utf8_lossy(&attr.value).into_owned(),
            };
            attributes.push((key, value));
        }

        Self {
            name,
            local_name,
            attributes,
            children: Vec::new(),
            text: String::new(),
        }
    }

    /// Value of the attribute with the given local name.
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// First child whose local name matches.
    pub fn child(&self, local_name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.local_name == local_name)
    }

    /// First child whose qualified name (prefix included) matches.
    pub fn child_qualified(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    /// All children whose local name matches, in document order.
    pub fn children_named<'a>(&'a self, local_name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |c| c.local_name == local_name)
    }

    /// Trimmed text of this element including all descendants.
    pub fn text(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out.trim().to_owned()
    }

    fn collect_text(&self, out: &mut String) {
        out.push_str(&self.text);
        for child in &self.children {
            child.collect_text(out);
        }
    }

    /// Trimmed text of the first matching child, empty if absent.
    pub fn child_text(&self, local_name: &str) -> String {
        self.child(local_name).map(Element::text).unwrap_or_default()
    }
}

/// Parses `body` and returns its root element.
///
/// Processing instructions, comments and the DOCTYPE are skipped. Entity
/// declarations are never expanded (see the `quick-xml` pin in Cargo.toml).
pub(crate) fn parse_document(body: &[u8]) -> Result<Element, ParseError> {
    let mut reader = Reader::from_reader(body);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Element> = Vec::new();
    let mut buf = Vec::new();

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| ParseError::Xml(e.to_string()))?;

        match event {
            Event::Start(e) => {
                if stack.len() >= MAX_DEPTH {
                    return Err(ParseError::Xml(format!(
                        "nesting depth exceeds maximum of {MAX_DEPTH} levels"
                    )));
                }
                stack.push(Element::from_start(&e, &reader));
            }
            Event::Empty(e) => {
                let element = Element::from_start(&e, &reader);
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => return Ok(element),
                }
            }
            Event::End(_) => {
                let Some(element) = stack.pop() else {
                    return Err(ParseError::Xml("unexpected closing tag".to_owned()));
                };
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => return Ok(element),
                }
            }
            Event::Text(e) => {
                if let Some(current) = stack.last_mut() {
                    match e.unescape() {
                        Ok(text) => current.text.push_str(&text),
                        Err(_) => current.text.push_str(&String::from_utf8_lossy(&e)),
                    }
                }
            }
            Event::CData(e) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&String::from_utf8_lossy(&e));
                }
            }
            Event::Eof => {
                return Err(ParseError::Xml(if stack.is_empty() {
                    "document has no root element".to_owned()
                } else {
                    "unexpected end of document".to_owned()
                }));
            }
            _ => {}
        }
        buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nested_with_namespaces() {
        let doc = br#"<?xml version="1.0"?>
<rss xmlns:dc="http://purl.org/dc/elements/1.1/"><channel>
  <item><dc:creator>Ann</dc:creator><title><![CDATA[A <b>bold</b> move]]></title></item>
</channel></rss>"#;
        let root = parse_document(doc).unwrap();
        assert_eq!(root.local_name, "rss");
        let item = root.child("channel").unwrap().child("item").unwrap();
        assert_eq!(item.child_qualified("dc:creator").unwrap().text(), "Ann");
        assert_eq!(item.child_text("title"), "A <b>bold</b> move");
    }

    #[test]
    fn test_entities_are_unescaped() {
        let root = parse_document(b"<feed><title>Q&amp;A &#8212; notes</title></feed>").unwrap();
        assert_eq!(root.child_text("title"), "Q&A \u{2014} notes");
    }

    #[test]
    fn test_attributes_by_local_name() {
        let root = parse_document(br#"<feed><link rel="alternate" href="https://e.com/"/></feed>"#)
            .unwrap();
        let link = root.child("link").unwrap();
        assert_eq!(link.attr("rel"), Some("alternate"));
        assert_eq!(link.attr("href"), Some("https://e.com/"));
        assert_eq!(link.attr("type"), None);
    }

    #[test]
    fn test_not_xml_is_error() {
        assert!(parse_document(b"not xml").is_err());
        assert!(parse_document(b"").is_err());
    }

    #[test]
    fn test_mismatched_tags_is_error() {
        assert!(parse_document(b"<rss><channel></rss>").is_err());
    }

    #[test]
    fn test_depth_limit() {
        let deep = format!("{}{}", "<a>".repeat(MAX_DEPTH + 1), "</a>".repeat(MAX_DEPTH + 1));
        assert!(parse_document(deep.as_bytes()).is_err());
    }
}

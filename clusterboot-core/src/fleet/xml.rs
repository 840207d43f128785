//! Minimal XML element scanner for query-protocol responses
//!
//! Splits a document into direct child elements, tracking nesting depth so
//! repeated inner tags (`member`, `item`) stay attached to their parent.
//! Attributes, comments and the prolog are skipped; CDATA is not supported.

/// An element and the raw text between its tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Element<'a> {
    pub name: &'a str,
    pub body: &'a str,
}

impl<'a> Element<'a> {
    /// Direct child elements
    pub fn children(&self) -> Vec<Element<'a>> {
        children(self.body)
    }

    /// Direct children with the given name
    pub fn children_named(&self, name: &str) -> Vec<Element<'a>> {
        self.children().into_iter().filter(|e| e.name == name).collect()
    }

    /// First direct child with the given name
    pub fn child(&self, name: &str) -> Option<Element<'a>> {
        self.children().into_iter().find(|e| e.name == name)
    }

    /// Decoded text of the first direct child with the given name
    pub fn child_text(&self, name: &str) -> Option<String> {
        self.child(name).map(|e| e.text())
    }

    /// Decoded, trimmed text content
    pub fn text(&self) -> String {
        decode(self.body.trim())
    }
}

/// The document's root element
pub fn root(xml: &str) -> Option<Element<'_>> {
    children(xml).into_iter().next()
}

/// Top-level elements of `xml`
pub fn children(xml: &str) -> Vec<Element<'_>> {
    let mut out = Vec::new();
    let mut pos = 0;
    let mut depth = 0usize;
    let mut open: Option<(&str, usize)> = None;

    while let Some(rel) = xml[pos..].find('<') {
        let start = pos + rel;
        let Some(rel_end) = xml[start..].find('>') else {
            break;
        };
        let end = start + rel_end;
        let tag = &xml[start + 1..end];
        pos = end + 1;

        if tag.starts_with('?') || tag.starts_with('!') {
            continue;
        }

        if tag.starts_with('/') {
            depth = depth.saturating_sub(1);
            if depth == 0 {
                if let Some((name, body_start)) = open.take() {
                    out.push(Element {
                        name,
                        body: &xml[body_start..start],
                    });
                }
            }
            continue;
        }

        let self_closing = tag.ends_with('/');
        let name = tag
            .trim_end_matches('/')
            .split_whitespace()
            .next()
            .unwrap_or_default();

        if self_closing {
            if depth == 0 {
                out.push(Element { name, body: "" });
            }
            continue;
        }

        if depth == 0 {
            open = Some((name, pos));
        }
        depth += 1;
    }

    out
}

/// Text of the first element named `name` anywhere in `xml`
pub fn find_text(xml: &str, name: &str) -> Option<String> {
    for element in children(xml) {
        if element.name == name {
            return Some(element.text());
        }
        if let Some(found) = find_text(element.body, name) {
            return Some(found);
        }
    }
    None
}

fn decode(raw: &str) -> String {
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

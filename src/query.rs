//! JSON-path and XML-path evaluation over request and response bodies.
//!
//! Both evaluators make the same distinction: a query that parses but
//! finds nothing is a successful empty result, while input that fails to
//! parse is reported as such so body predicates can evaluate false.

use std::collections::BTreeMap;

use serde_json::Value;
use xmltree::{Element, XMLNode};

/// Outcome of a body query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryOutcome {
    /// The query matched; the projection rendered as a string.
    Value(String),
    /// The document parsed but the query selected nothing.
    Empty,
    /// The document could not be parsed (or the query is malformed).
    ParseFailure,
}

impl QueryOutcome {
    /// The matched value, with `Empty` collapsing to the empty string.
    /// `None` only for parse failures.
    pub fn resolve(&self) -> Option<String> {
        match self {
            QueryOutcome::Value(s) => Some(s.clone()),
            QueryOutcome::Empty => Some(String::new()),
            QueryOutcome::ParseFailure => None,
        }
    }
}

/// Evaluate a JSON-path expression, projecting the first match. String
/// results are returned bare; anything else is JSON-encoded.
pub fn json_query(body: &str, path: &str) -> QueryOutcome {
    let document: Value = match serde_json::from_str(body) {
        Ok(document) => document,
        Err(_) => return QueryOutcome::ParseFailure,
    };
    match jsonpath_lib::select(&document, path) {
        Ok(matches) => match matches.first() {
            Some(Value::String(s)) => QueryOutcome::Value(s.clone()),
            Some(other) => QueryOutcome::Value(other.to_string()),
            None => QueryOutcome::Empty,
        },
        // jsonpath_lib reports an unparsable path; unknown keys already
        // come back as an empty selection above.
        Err(_) => QueryOutcome::ParseFailure,
    }
}

/// Evaluate an XPath-style element path against an XML document.
///
/// The supported grammar is the subset the matcher and captures need:
/// absolute element paths (`/env:Envelope/env:Body/pet:name`), a leading
/// `//` descendant search, a trailing `text()` step and a trailing
/// `@attribute` step. Prefixes resolve through `namespaces`; steps
/// without a prefix match on local name alone.
pub fn xml_query(body: &str, path: &str, namespaces: &BTreeMap<String, String>) -> QueryOutcome {
    let root = match Element::parse(body.as_bytes()) {
        Ok(root) => root,
        Err(_) => return QueryOutcome::ParseFailure,
    };

    let (descendant, remainder) = if let Some(rest) = path.strip_prefix("//") {
        (true, rest)
    } else if let Some(rest) = path.strip_prefix('/') {
        (false, rest)
    } else {
        (true, path)
    };
    let steps: Vec<&str> = remainder.split('/').filter(|s| !s.is_empty()).collect();
    if steps.is_empty() {
        return QueryOutcome::ParseFailure;
    }

    // a trailing text() step is implicit; bare element paths project text
    let mut element_steps = steps.as_slice();
    let mut want_attr: Option<&str> = None;
    match steps.last() {
        Some(&"text()") => {
            element_steps = &steps[..steps.len() - 1];
        }
        Some(last) if last.starts_with('@') => {
            want_attr = Some(&last[1..]);
            element_steps = &steps[..steps.len() - 1];
        }
        _ => {}
    }
    if element_steps.is_empty() {
        return QueryOutcome::ParseFailure;
    }

    let found = if descendant {
        find_descendant(&root, element_steps, namespaces)
    } else {
        // an absolute path names the document root as its first step
        if !step_matches(&root, element_steps[0], namespaces) {
            None
        } else if element_steps.len() == 1 {
            Some(&root)
        } else {
            find_path(&root, &element_steps[1..], namespaces)
        }
    };

    match found {
        Some(element) => {
            if let Some(attr) = want_attr {
                match element.attributes.get(attr) {
                    Some(value) => QueryOutcome::Value(value.clone()),
                    None => QueryOutcome::Empty,
                }
            } else {
                QueryOutcome::Value(element_text(element))
            }
        }
        None => QueryOutcome::Empty,
    }
}

/// First element child of `element`, in document order.
pub fn first_element_child(element: &Element) -> Option<&Element> {
    element.children.iter().find_map(|node| match node {
        XMLNode::Element(child) => Some(child),
        _ => None,
    })
}

/// Concatenated text content of an element.
pub fn element_text(element: &Element) -> String {
    let mut text = String::new();
    for node in &element.children {
        match node {
            XMLNode::Text(t) => text.push_str(t),
            XMLNode::CData(t) => text.push_str(t),
            XMLNode::Element(child) => text.push_str(&element_text(child)),
            _ => {}
        }
    }
    text.trim().to_owned()
}

fn step_matches(element: &Element, step: &str, namespaces: &BTreeMap<String, String>) -> bool {
    match step.split_once(':') {
        Some((prefix, local)) => {
            element.name == local
                && match namespaces.get(prefix) {
                    Some(uri) => element.namespace.as_deref() == Some(uri.as_str()),
                    // unbound prefix: fall back to local-name matching
                    None => true,
                }
        }
        None => element.name == step,
    }
}

fn find_path<'a>(
    element: &'a Element,
    steps: &[&str],
    namespaces: &BTreeMap<String, String>,
) -> Option<&'a Element> {
    let (step, rest) = steps.split_first()?;
    for node in &element.children {
        if let XMLNode::Element(child) = node {
            if step_matches(child, step, namespaces) {
                if rest.is_empty() {
                    return Some(child);
                }
                if let Some(found) = find_path(child, rest, namespaces) {
                    return Some(found);
                }
            }
        }
    }
    None
}

fn find_descendant<'a>(
    element: &'a Element,
    steps: &[&str],
    namespaces: &BTreeMap<String, String>,
) -> Option<&'a Element> {
    let first = steps.first()?;
    if step_matches(element, first, namespaces) {
        if steps.len() == 1 {
            return Some(element);
        }
        if let Some(found) = find_path(element, &steps[1..], namespaces) {
            return Some(found);
        }
    }
    for node in &element.children {
        if let XMLNode::Element(child) = node {
            if let Some(found) = find_descendant(child, steps, namespaces) {
                return Some(found);
            }
        }
    }
    None
}

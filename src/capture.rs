//! Declarative capture of request-derived values into stores.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::config::{Capture, CaptureSource};
use crate::exchange::Exchange;
use crate::query::{self, QueryOutcome};
use crate::store::{StoreFactory, REQUEST_STORE};
use crate::template::TemplateContext;

/// Apply a capture map against the exchange. Each enabled capture
/// resolves an item name and value and writes them to its target store.
/// Captures that fail to resolve are skipped, never fatal.
pub fn apply_captures(
    captures: &BTreeMap<String, Capture>,
    exchange: &mut Exchange,
    factory: &StoreFactory,
    server: &crate::template::ServerInfo,
    system_namespaces: &BTreeMap<String, String>,
) {
    if captures.is_empty() {
        return;
    }

    // Stage writes first: the template context borrows the exchange.
    let mut writes: Vec<(String, String, String)> = Vec::new();
    {
        let tctx = TemplateContext::new(exchange, factory, server);
        for (id, capture) in captures {
            if !capture.enabled {
                continue;
            }
            let Some(value) =
                resolve_source(&capture.source, exchange, &tctx, system_namespaces)
            else {
                debug!("capture {} resolved nothing, skipping", id);
                continue;
            };
            let key = match &capture.key {
                Some(source) => {
                    match resolve_source(source, exchange, &tctx, system_namespaces) {
                        Some(key) if !key.is_empty() => key,
                        _ => id.clone(),
                    }
                }
                None => id.clone(),
            };
            writes.push((capture.store.clone(), key, value));
        }
    }

    for (store_name, key, value) in writes {
        trace!("capturing {}={} into store {}", key, value, store_name);
        let store = if store_name == REQUEST_STORE {
            exchange.store.clone()
        } else {
            factory.open(&store_name)
        };
        store.save(&key, Value::String(value));
    }
}

fn resolve_source(
    source: &CaptureSource,
    exchange: &Exchange,
    tctx: &TemplateContext<'_>,
    system_namespaces: &BTreeMap<String, String>,
) -> Option<String> {
    if let Some(name) = &source.path_param {
        return Some(exchange.path_params().get(name).cloned().unwrap_or_default());
    }
    if let Some(name) = &source.query_param {
        return Some(exchange.request.query_param(name).unwrap_or_default().to_owned());
    }
    if let Some(name) = &source.form_param {
        return Some(exchange.request.form_param(name).unwrap_or_default().to_owned());
    }
    if let Some(name) = &source.request_header {
        return Some(exchange.request.header(name).unwrap_or_default().to_owned());
    }
    if let Some(expression) = &source.expression {
        return Some(tctx.render(expression));
    }
    if let Some(constant) = &source.const_value {
        return Some(constant.clone());
    }
    if let Some(body) = &source.request_body {
        let raw = exchange.request.body_string();
        if let Some(path) = &body.json_path {
            return query::json_query(&raw, path).resolve();
        }
        if let Some(path) = &body.x_path {
            let mut namespaces = system_namespaces.clone();
            namespaces.extend(body.xml_namespaces.clone());
            return match query::xml_query(&raw, path, &namespaces) {
                QueryOutcome::Value(value) => Some(value),
                QueryOutcome::Empty => Some(String::new()),
                QueryOutcome::ParseFailure => None,
            };
        }
    }
    None
}

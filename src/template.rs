//! Expression and template engine.
//!
//! Evaluates `${category.sub[.field][:trailer]}` placeholders against a
//! per-request exchange. Unrecognised placeholders are left verbatim;
//! recognised-but-unresolvable ones (unknown store keys, absent headers)
//! collapse to the empty string and are then subject to the `:-default`
//! trailer.

use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use lazy_static::lazy_static;
use rand::Rng;
use regex::{Captures, Regex};
use uuid::Uuid;

use crate::exchange::Exchange;
use crate::query::{self, QueryOutcome};
use crate::store::{StoreFactory, REQUEST_STORE};

lazy_static! {
    static ref PLACEHOLDER: Regex = Regex::new(r"\$\{([^{}]+)\}").expect("placeholder regex");
}

/// Server identity surfaced through `${system.server.*}`.
#[derive(Clone, Debug)]
pub struct ServerInfo {
    pub port: u16,
    pub url: String,
}

/// Everything a placeholder can observe.
pub struct TemplateContext<'a> {
    exchange: &'a Exchange,
    stores: &'a StoreFactory,
    server: &'a ServerInfo,
}

impl<'a> TemplateContext<'a> {
    pub fn new(exchange: &'a Exchange, stores: &'a StoreFactory, server: &'a ServerInfo) -> Self {
        Self {
            exchange,
            stores,
            server,
        }
    }

    /// Substitute every placeholder in `input`. Templates without
    /// placeholders come back unchanged.
    pub fn render(&self, input: &str) -> String {
        PLACEHOLDER
            .replace_all(input, |captures: &Captures<'_>| {
                let expression = &captures[1];
                match self.eval(expression) {
                    Some(value) => value,
                    // unrecognised: keep the placeholder verbatim
                    None => captures[0].to_owned(),
                }
            })
            .into_owned()
    }

    /// Evaluate a single expression (without the `${}` wrapper),
    /// including trailer handling. `None` means the expression is not
    /// recognised.
    pub fn eval(&self, expression: &str) -> Option<String> {
        let (base, trailer) = match expression.split_once(':') {
            Some((base, trailer)) => (base, Some(trailer)),
            None => (expression, None),
        };

        let raw = self.eval_base(base)?;
        Some(apply_trailer(raw, trailer))
    }

    fn eval_base(&self, expression: &str) -> Option<String> {
        let parts: Vec<&str> = expression.split('.').collect();
        match *parts.first()? {
            "context" => self.eval_context(&parts),
            "stores" => self.eval_stores(&parts),
            "datetime" => eval_datetime(&parts),
            "random" => eval_random(parts.get(1..)?.join(".").as_str()),
            "system" => self.eval_system(&parts),
            _ => None,
        }
    }

    fn eval_context(&self, parts: &[&str]) -> Option<String> {
        let request = &self.exchange.request;
        match *parts.get(1)? {
            "request" => match *parts.get(2)? {
                "method" => Some(request.method().to_owned()),
                "path" => Some(request.path().to_owned()),
                "uri" => Some(request.uri().to_owned()),
                "body" => Some(request.body_string()),
                "headers" => {
                    let name = name_field(parts, 3)?;
                    Some(request.header(&name).unwrap_or_default().to_owned())
                }
                "queryParams" => {
                    let name = name_field(parts, 3)?;
                    Some(request.query_param(&name).unwrap_or_default().to_owned())
                }
                "pathParams" => {
                    let name = name_field(parts, 3)?;
                    Some(self.exchange.path_params().get(&name).cloned().unwrap_or_default())
                }
                "formParams" => {
                    let name = name_field(parts, 3)?;
                    Some(request.form_param(&name).unwrap_or_default().to_owned())
                }
                _ => None,
            },
            "response" => {
                let response = self.exchange.response.as_ref();
                match *parts.get(2)? {
                    "body" => Some(response.map(|r| r.body.clone()).unwrap_or_default()),
                    "statusCode" => Some(
                        response
                            .map(|r| r.status_code.to_string())
                            .unwrap_or_default(),
                    ),
                    "headers" => {
                        let name = name_field(parts, 3)?;
                        Some(
                            response
                                .and_then(|r| r.header(&name))
                                .unwrap_or_default()
                                .to_owned(),
                        )
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    }

    fn eval_stores(&self, parts: &[&str]) -> Option<String> {
        let store_name = *parts.get(1)?;
        let key = name_field(parts, 2)?;
        let value = if store_name == REQUEST_STORE {
            self.exchange.store.load_string(&key)
        } else {
            self.stores.open(store_name).load_string(&key)
        };
        Some(value.unwrap_or_default())
    }

    fn eval_system(&self, parts: &[&str]) -> Option<String> {
        if *parts.get(1)? != "server" {
            return None;
        }
        match *parts.get(2)? {
            "port" => Some(self.server.port.to_string()),
            "url" => Some(self.server.url.clone()),
            _ => None,
        }
    }
}

/// Re-join a dotted field name (header names may themselves contain
/// dots).
fn name_field(parts: &[&str], from: usize) -> Option<String> {
    if parts.len() <= from {
        return None;
    }
    Some(parts[from..].join("."))
}

fn apply_trailer(raw: String, trailer: Option<&str>) -> String {
    let Some(trailer) = trailer else {
        return raw;
    };
    if raw.is_empty() {
        if let Some(fallback) = trailer.strip_prefix('-') {
            return fallback.to_owned();
        }
    }
    if trailer.starts_with('$') {
        return query::json_query(&raw, trailer).resolve().unwrap_or_default();
    }
    if trailer.starts_with('/') {
        return match query::xml_query(&raw, trailer, &BTreeMap::new()) {
            QueryOutcome::Value(value) => value,
            _ => String::new(),
        };
    }
    raw
}

fn eval_datetime(parts: &[&str]) -> Option<String> {
    if *parts.get(1)? != "now" {
        return None;
    }
    let now = Utc::now();
    match *parts.get(2)? {
        "iso8601_date" => Some(now.format("%Y-%m-%d").to_string()),
        "iso8601_datetime" => Some(now.to_rfc3339_opts(SecondsFormat::Secs, true)),
        "millis" => Some(now.timestamp_millis().to_string()),
        "nanos" => Some(
            now.timestamp_nanos_opt()
                .unwrap_or_else(|| now.timestamp_millis() * 1_000_000)
                .to_string(),
        ),
        _ => None,
    }
}

const ALPHABET: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &str = "0123456789";

/// `random.<kind>(args)` with comma-separated `name=value` args.
fn eval_random(call: &str) -> Option<String> {
    let (kind, args) = match call.split_once('(') {
        Some((kind, rest)) => (kind, rest.trim_end_matches(')')),
        None => (call, ""),
    };

    let mut length = 1usize;
    let mut uppercase = false;
    let mut chars: Option<String> = None;
    for arg in args.split(',') {
        let Some((name, value)) = arg.split_once('=') else {
            continue;
        };
        match name.trim() {
            "length" => length = value.trim().parse().ok()?,
            "uppercase" => uppercase = value.trim() == "true",
            "chars" => chars = Some(value.trim().to_owned()),
            _ => {}
        }
    }

    random_value(kind, length, uppercase, chars.as_deref())
}

/// Shared by the template engine and the script runtime's `random` API.
pub(crate) fn random_value(
    kind: &str,
    length: usize,
    uppercase: bool,
    chars: Option<&str>,
) -> Option<String> {
    let value = match kind {
        "alphabetic" => random_chars(ALPHABET, length),
        "numeric" => random_chars(DIGITS, length),
        "alphanumeric" => random_chars(&format!("{}{}", ALPHABET, DIGITS), length),
        "any" => {
            let charset = chars
                .map(ToOwned::to_owned)
                .unwrap_or_else(|| format!("{}{}", ALPHABET, DIGITS));
            random_chars(&charset, length)
        }
        "uuid" => Uuid::new_v4().to_string(),
        _ => return None,
    };
    Some(if uppercase {
        value.to_uppercase()
    } else {
        value
    })
}

fn random_chars(charset: &str, length: usize) -> String {
    let chars: Vec<char> = charset.chars().collect();
    if chars.is_empty() {
        return String::new();
    }
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| chars[rng.gen_range(0..chars.len())])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{RequestView, ResponseContext};
    use crate::store::{inmemory::InMemoryStoreProvider, StoreFactory};
    use bytes::Bytes;
    use serde_json::json;
    use std::sync::Arc;

    fn server() -> ServerInfo {
        ServerInfo {
            port: 8080,
            url: "http://localhost:8080".to_owned(),
        }
    }

    fn factory() -> StoreFactory {
        StoreFactory::new(Arc::new(InMemoryStoreProvider::new(None)))
    }

    fn exchange_with(factory: &StoreFactory) -> Exchange {
        Exchange::new(
            RequestView::new(
                "POST",
                "http://localhost:8080/pets/3?verbose=true",
                vec![
                    ("Content-Type".to_owned(), "application/json".to_owned()),
                    ("X-Api-Key".to_owned(), "secret".to_owned()),
                ],
                Bytes::from_static(br#"{"name": "Rex"}"#),
            ),
            factory.request_store(),
        )
    }

    #[test]
    fn render_without_placeholders_is_identity() {
        let factory = factory();
        let exchange = exchange_with(&factory);
        let server = server();
        let tctx = TemplateContext::new(&exchange, &factory, &server);
        let input = "plain text, no substitution { nothing } here";
        assert_eq!(tctx.render(input), input);
    }

    #[test]
    fn unrecognised_placeholders_stay_verbatim() {
        let factory = factory();
        let exchange = exchange_with(&factory);
        let server = server();
        let tctx = TemplateContext::new(&exchange, &factory, &server);
        assert_eq!(tctx.render("${bogus.thing}"), "${bogus.thing}");
        assert_eq!(tctx.render("${context.request.teapot}"), "${context.request.teapot}");
    }

    #[test]
    fn request_fields_resolve() {
        let factory = factory();
        let mut exchange = exchange_with(&factory);
        exchange.path_template = Some("/pets/{petId}".to_owned());
        let server = server();
        let tctx = TemplateContext::new(&exchange, &factory, &server);

        assert_eq!(tctx.render("${context.request.method}"), "POST");
        assert_eq!(tctx.render("${context.request.path}"), "/pets/3");
        assert_eq!(tctx.render("${context.request.queryParams.verbose}"), "true");
        assert_eq!(tctx.render("${context.request.headers.X-Api-Key}"), "secret");
        assert_eq!(tctx.render("${context.request.pathParams.petId}"), "3");
        assert_eq!(tctx.render("${context.request.body}"), r#"{"name": "Rex"}"#);
    }

    #[test]
    fn unknown_header_is_empty_then_defaultable() {
        let factory = factory();
        let exchange = exchange_with(&factory);
        let server = server();
        let tctx = TemplateContext::new(&exchange, &factory, &server);

        assert_eq!(tctx.render("${context.request.headers.Missing}"), "");
        assert_eq!(
            tctx.render("${context.request.headers.Missing:-fallback}"),
            "fallback"
        );
        // the dash-default is not applied to non-empty values
        assert_eq!(
            tctx.render("${context.request.headers.X-Api-Key:-fallback}"),
            "secret"
        );
    }

    #[test]
    fn store_values_resolve_and_json_encode() {
        let factory = factory();
        factory.open("pets").save("rex", json!({"species": "dog"}));
        let exchange = exchange_with(&factory);
        exchange.store.save("uid", json!("42"));
        let server = server();
        let tctx = TemplateContext::new(&exchange, &factory, &server);

        assert_eq!(tctx.render("${stores.request.uid}"), "42");
        assert_eq!(
            tctx.render("${stores.pets.rex}"),
            r#"{"species":"dog"}"#
        );
        assert_eq!(tctx.render("${stores.pets.missing}"), "");
        assert_eq!(tctx.render("${stores.pets.missing:-none}"), "none");
    }

    #[test]
    fn json_path_trailer_projects_the_raw_value() {
        let factory = factory();
        let exchange = exchange_with(&factory);
        let server = server();
        let tctx = TemplateContext::new(&exchange, &factory, &server);
        assert_eq!(tctx.render("${context.request.body:$.name}"), "Rex");
        assert_eq!(tctx.render("${context.request.body:$.missing}"), "");
    }

    #[test]
    fn response_context_is_empty_until_a_remote_step_runs() {
        let factory = factory();
        let mut exchange = exchange_with(&factory);
        let server = server();

        {
            let tctx = TemplateContext::new(&exchange, &factory, &server);
            assert_eq!(tctx.render("${context.response.body}"), "");
            assert_eq!(tctx.render("${context.response.statusCode}"), "");
        }

        exchange.response = Some(ResponseContext {
            status_code: 201,
            headers: vec![("X-Request-Id".to_owned(), "abc".to_owned())],
            body: "created".to_owned(),
        });
        let tctx = TemplateContext::new(&exchange, &factory, &server);
        assert_eq!(tctx.render("${context.response.statusCode}"), "201");
        assert_eq!(tctx.render("${context.response.body}"), "created");
        assert_eq!(tctx.render("${context.response.headers.X-Request-Id}"), "abc");
    }

    #[test]
    fn random_values_honour_length_and_charset() {
        let factory = factory();
        let exchange = exchange_with(&factory);
        let server = server();
        let tctx = TemplateContext::new(&exchange, &factory, &server);

        let numeric = tctx.render("${random.numeric(length=6)}");
        assert_eq!(numeric.len(), 6);
        assert!(numeric.chars().all(|c| c.is_ascii_digit()));

        let upper = tctx.render("${random.alphabetic(length=8,uppercase=true)}");
        assert_eq!(upper.len(), 8);
        assert!(upper.chars().all(|c| c.is_ascii_uppercase()));

        let any = tctx.render("${random.any(chars=ab,length=12)}");
        assert!(any.chars().all(|c| c == 'a' || c == 'b'));

        let uuid = tctx.render("${random.uuid()}");
        assert_eq!(uuid.len(), 36);
    }

    #[test]
    fn system_server_fields_resolve() {
        let factory = factory();
        let exchange = exchange_with(&factory);
        let server = server();
        let tctx = TemplateContext::new(&exchange, &factory, &server);
        assert_eq!(tctx.render("${system.server.port}"), "8080");
        assert_eq!(tctx.render("${system.server.url}"), "http://localhost:8080");
    }

    #[test]
    fn datetime_fields_have_expected_shapes() {
        let factory = factory();
        let exchange = exchange_with(&factory);
        let server = server();
        let tctx = TemplateContext::new(&exchange, &factory, &server);

        let date = tctx.render("${datetime.now.iso8601_date}");
        assert_eq!(date.len(), 10);
        assert!(tctx.render("${datetime.now.millis}").parse::<i64>().is_ok());
        assert!(tctx.render("${datetime.now.nanos}").parse::<i64>().is_ok());
        assert!(tctx.render("${datetime.now.iso8601_datetime}").contains('T'));
    }

    #[test]
    fn multiple_placeholders_substitute_in_one_pass() {
        let factory = factory();
        let exchange = exchange_with(&factory);
        exchange.store.save("uid", json!("42"));
        let server = server();
        let tctx = TemplateContext::new(&exchange, &factory, &server);
        assert_eq!(
            tctx.render("user ${stores.request.uid} via ${context.request.method}"),
            "user 42 via POST"
        );
    }
}

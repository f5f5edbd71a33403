//! The per-request exchange: immutable request view, mutable
//! response-state under construction, request-scoped store and the
//! response context filled in by remote steps.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::OnceLock;

use actix_web::HttpRequest;
use bytes::Bytes;

use crate::config::{DelayConfig, FailureKind};
use crate::matcher::extract_path_params;
use crate::store::Store;

/// Immutable view of the inbound request. Headers and query parameters
/// expose the first value per name; the form body is parsed on demand.
#[derive(Clone, Debug)]
pub struct RequestView {
    method: String,
    uri: String,
    path: String,
    headers: Vec<(String, String)>,
    query: Vec<(String, String)>,
    body: Bytes,
    form: OnceLock<HashMap<String, String>>,
}

impl RequestView {
    pub fn new(method: &str, uri: &str, headers: Vec<(String, String)>, body: Bytes) -> Self {
        let (path, query_string) = match uri.find('?') {
            Some(idx) => (&uri[..idx], &uri[idx + 1..]),
            None => (uri, ""),
        };
        // strip scheme/authority if a full URL was supplied
        let path = match path.find("://").map(|idx| &path[idx + 3..]) {
            Some(rest) => match rest.find('/') {
                Some(idx) => &rest[idx..],
                None => "/",
            },
            None => path,
        };
        let query = url::form_urlencoded::parse(query_string.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        Self {
            method: method.to_owned(),
            uri: uri.to_owned(),
            path: path.to_owned(),
            headers,
            query,
            body,
            form: OnceLock::new(),
        }
    }

    pub fn from_http(req: &HttpRequest, body: Bytes) -> Self {
        let info = req.connection_info();
        let uri = format!("{}://{}{}", info.scheme(), info.host(), req.uri());
        let headers = req
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_owned(),
                    value.to_str().unwrap_or_default().to_owned(),
                )
            })
            .collect();
        drop(info);
        Self::new(req.method().as_str(), &uri, headers, body)
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// First header value under a case-insensitive name lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn query_params(&self) -> &[(String, String)] {
        &self.query
    }

    /// Parse the form body on first use. Non-form content types yield an
    /// empty map.
    pub fn form(&self) -> &HashMap<String, String> {
        self.form.get_or_init(|| {
            let is_form = self
                .header("Content-Type")
                .map(|ct| ct.starts_with("application/x-www-form-urlencoded"))
                .unwrap_or(false);
            if !is_form {
                return HashMap::new();
            }
            let mut form = HashMap::new();
            for (key, value) in url::form_urlencoded::parse(&self.body) {
                form.entry(key.into_owned()).or_insert_with(|| value.into_owned());
            }
            form
        })
    }

    pub fn form_param(&self, name: &str) -> Option<&str> {
        self.form().get(name).map(String::as_str)
    }
}

/// Response recorded by a remote step, observable through
/// `${context.response.*}` and captures.
#[derive(Clone, Debug, Default)]
pub struct ResponseContext {
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl ResponseContext {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

type Cleanup = Box<dyn FnOnce() + Send>;

/// The response under construction, shared by the whole pipeline.
#[derive(Default)]
pub struct ResponseState {
    /// 0 means "not set"; the write path defaults it to 200.
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// A resource (or script, or interceptor) has claimed the request.
    pub handled: bool,
    /// The connection should be dropped without a body.
    pub stopped: bool,
    pub file: Option<String>,
    pub delay: Option<DelayConfig>,
    pub fail: Option<FailureKind>,
    cleanups: Vec<Cleanup>,
}

impl std::fmt::Debug for ResponseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseState")
            .field("status", &self.status)
            .field("handled", &self.handled)
            .field("stopped", &self.stopped)
            .field("cleanups", &self.cleanups.len())
            .finish()
    }
}

impl ResponseState {
    /// Set a header, replacing any previous value under the same name.
    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers
            .retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
        self.headers.push((name.to_owned(), value.to_owned()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Register a completion hook. Hooks run LIFO on every exit path.
    pub fn on_complete(&mut self, cleanup: impl FnOnce() + Send + 'static) {
        self.cleanups.push(Box::new(cleanup));
    }

    /// Run and drain the cleanup hooks. A panicking hook is logged and
    /// never affects the response or the remaining hooks.
    pub fn run_cleanups(&mut self) {
        while let Some(cleanup) = self.cleanups.pop() {
            if panic::catch_unwind(AssertUnwindSafe(cleanup)).is_err() {
                warn!("cleanup hook panicked");
            }
        }
    }
}

impl Drop for ResponseState {
    fn drop(&mut self) {
        // an abandoned exchange still runs its completion hooks
        self.run_cleanups();
    }
}

/// The per-request value object.
pub struct Exchange {
    pub request: RequestView,
    pub state: ResponseState,
    /// Request-scoped store; lifetime equals this exchange.
    pub store: Store,
    /// Set by remote steps.
    pub response: Option<ResponseContext>,
    /// Path template of the matched resource, for path-parameter
    /// extraction.
    pub path_template: Option<String>,
}

impl Exchange {
    pub fn new(request: RequestView, store: Store) -> Self {
        Self {
            request,
            state: ResponseState::default(),
            store,
            response: None,
            path_template: None,
        }
    }

    /// Path parameters aligned against the matched resource's template.
    pub fn path_params(&self) -> HashMap<String, String> {
        match &self.path_template {
            Some(template) => extract_path_params(template, self.request.path()),
            None => HashMap::new(),
        }
    }
}

//! The pooled per-request context: request/response handles, captured path
//! parameters, the abort flag, lazy query/form caches, a string-keyed scratch
//! map, and the response helpers handlers write through.

use std::any::Any;
use std::collections::HashMap;
use std::mem;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, LOCATION};
use http::{HeaderValue, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::engine::{Config, HandlerError};
use crate::params::Params;
use crate::tree::SkippedNodes;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Per-request state handed to every handler in the matched chain.
///
/// Contexts are pooled by the engine: one is acquired per dispatch, fully
/// reset, bound to the request, and released when the response has been
/// produced. Handlers receive it mutably and exclusively.
pub struct Context {
    pub(crate) request: Request<Bytes>,
    pub(crate) response: Response<Bytes>,

    /// Status recorded for the dispatch outcome. Error handlers may rewrite
    /// it before the default writer runs.
    pub status: StatusCode,
    /// The error that stopped the chain, if any.
    pub error: Option<HandlerError>,

    pub(crate) broke: bool,
    pub(crate) cursor: isize,
    pub(crate) full_path: String,
    pub(crate) params: Params,
    pub(crate) skipped: SkippedNodes,
    pub(crate) config: Config,

    values: HashMap<String, Box<dyn Any + Send + Sync>>,
    query_cache: Option<Vec<(String, String)>>,
    form_cache: Option<Vec<(String, String)>>,
}

impl Context {
    pub(crate) fn new(config: Config, max_params: usize, max_sections: usize) -> Context {
        Context {
            request: Request::default(),
            response: Response::default(),
            status: StatusCode::OK,
            error: None,
            broke: false,
            cursor: -1,
            full_path: String::new(),
            params: Params::with_capacity(max_params),
            skipped: SkippedNodes::with_capacity(max_sections),
            config,
            values: HashMap::new(),
            query_cache: None,
            form_cache: None,
        }
    }

    // Clears every mutable field. Skipping one here is the classic
    // use-after-release bug, so reset runs on every acquisition.
    pub(crate) fn reset(&mut self) {
        self.response = Response::default();
        self.status = StatusCode::OK;
        self.error = None;
        self.broke = false;
        self.cursor = -1;
        self.full_path.clear();
        self.params.clear();
        self.skipped.clear();
        self.values.clear();
        self.query_cache = None;
        self.form_cache = None;
    }

    pub(crate) fn take_response(&mut self) -> Response<Bytes> {
        mem::take(&mut self.response)
    }

    /// The incoming request.
    pub fn request(&self) -> &Request<Bytes> {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request<Bytes> {
        &mut self.request
    }

    /// The response under construction. Handlers may set headers on it
    /// directly in addition to using the writer helpers.
    pub fn response(&self) -> &Response<Bytes> {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut Response<Bytes> {
        &mut self.response
    }

    /// Read-only view of the engine configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The registered path the request matched, e.g. `/users/:id`.
    pub fn full_path(&self) -> &str {
        &self.full_path
    }

    /// Stops the remaining handlers in the chain from running.
    pub fn abort(&mut self) {
        self.broke = true;
    }

    pub fn is_aborted(&self) -> bool {
        self.broke
    }

    /// Value of a captured path parameter; empty when absent.
    pub fn path_value(&self, key: &str) -> &str {
        self.params.get(key).unwrap_or("")
    }

    /// Captured path parameter, distinguishing absent from empty.
    pub fn path_param(&self, key: &str) -> Option<&str> {
        self.params.get(key)
    }

    /// All captured path parameters, in path order.
    pub fn all_path_values(&self) -> &Params {
        &self.params
    }

    /// Stores a request-scoped value under `key`, visible to every later
    /// handler in the chain.
    pub fn set_value<V: Any + Send + Sync>(&mut self, key: impl Into<String>, value: V) {
        self.values.insert(key.into(), Box::new(value));
    }

    /// Reads back a request-scoped value stored with [`set_value`].
    ///
    /// [`set_value`]: Context::set_value
    pub fn get_value<V: Any>(&self, key: &str) -> Option<&V> {
        self.values.get(key)?.downcast_ref()
    }

    fn ensure_query_cache(&mut self) {
        if self.query_cache.is_none() {
            let parsed = match self.request.uri().query() {
                Some(query) => url::form_urlencoded::parse(query.as_bytes())
                    .into_owned()
                    .collect(),
                None => Vec::new(),
            };
            self.query_cache = Some(parsed);
        }
    }

    /// First value of a query-string parameter; empty when absent.
    pub fn query_value(&mut self, key: &str) -> &str {
        self.query_param(key).unwrap_or("")
    }

    /// First value of a query-string parameter, distinguishing absent from
    /// empty.
    pub fn query_param(&mut self, key: &str) -> Option<&str> {
        self.ensure_query_cache();
        self.query_cache
            .as_ref()
            .expect("query cache initialized")
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All values of a repeated query-string parameter.
    pub fn query_values(&mut self, key: &str) -> Vec<&str> {
        self.ensure_query_cache();
        self.query_cache
            .as_ref()
            .expect("query cache initialized")
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Parses the request body as an urlencoded form, once. Bodies larger
    /// than `max_multipart_memory` are rejected; non-form content types
    /// produce an empty cache, mirroring how missing form fields read as
    /// absent rather than failing the handler.
    pub fn try_form_cache(&mut self) -> Result<(), HandlerError> {
        if self.form_cache.is_some() {
            return Ok(());
        }

        if self.request.body().len() > self.config.max_multipart_memory {
            self.form_cache = Some(Vec::new());
            return Err("request body exceeds the configured form memory limit".into());
        }

        let is_form = self
            .request
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.starts_with(FORM_CONTENT_TYPE))
            .unwrap_or(false);

        let parsed = if is_form {
            url::form_urlencoded::parse(self.request.body())
                .into_owned()
                .collect()
        } else {
            Vec::new()
        };
        self.form_cache = Some(parsed);
        Ok(())
    }

    /// First value of a form field; empty when absent or unparsable.
    pub fn form_value(&mut self, key: &str) -> &str {
        self.form_param(key).unwrap_or("")
    }

    /// First value of a form field, distinguishing absent from empty.
    pub fn form_param(&mut self, key: &str) -> Option<&str> {
        if self.try_form_cache().is_err() {
            return None;
        }
        self.form_cache
            .as_ref()
            .expect("form cache initialized")
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All values of a repeated form field.
    pub fn form_values(&mut self, key: &str) -> Vec<&str> {
        if self.try_form_cache().is_err() {
            return Vec::new();
        }
        self.form_cache
            .as_ref()
            .expect("form cache initialized")
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Deserializes the request body as JSON.
    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_slice(self.request.body()).map_err(HandlerError::from)
    }

    /// Writes a plain-text response.
    pub fn string(
        &mut self,
        status: StatusCode,
        body: impl Into<String>,
    ) -> Result<(), HandlerError> {
        self.status = status;
        *self.response.status_mut() = status;
        self.response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        *self.response.body_mut() = Bytes::from(body.into());
        Ok(())
    }

    /// Serializes `data` as the JSON response body.
    pub fn json<T: Serialize>(&mut self, status: StatusCode, data: &T) -> Result<(), HandlerError> {
        let body = serde_json::to_vec(data)?;

        self.status = status;
        *self.response.status_mut() = status;
        self.response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        *self.response.body_mut() = Bytes::from(body);
        Ok(())
    }

    /// Responds with `204 No Content`.
    pub fn no_content(&mut self) -> Result<(), HandlerError> {
        self.status = StatusCode::NO_CONTENT;
        *self.response.status_mut() = StatusCode::NO_CONTENT;
        *self.response.body_mut() = Bytes::new();
        Ok(())
    }

    /// Responds with a bare status code.
    pub fn status_code(&mut self, status: StatusCode) -> Result<(), HandlerError> {
        self.status = status;
        *self.response.status_mut() = status;
        Ok(())
    }

    /// Sends a redirect. `status` must be a 3xx code.
    pub fn redirect(&mut self, status: StatusCode, url: &str) -> Result<(), HandlerError> {
        if !status.is_redirection() {
            return Err("redirect status must be 3xx".into());
        }

        self.status = status;
        *self.response.status_mut() = status;
        self.response
            .headers_mut()
            .insert(LOCATION, HeaderValue::try_from(url)?);
        Ok(())
    }

    /// Streams a file from disk into the response. Unreadable paths produce
    /// a plain 404.
    #[cfg(feature = "hyper-server")]
    pub async fn serve_file(
        &mut self,
        path: impl AsRef<std::path::Path>,
    ) -> Result<(), HandlerError> {
        let path = path.as_ref();
        match tokio::fs::read(path).await {
            Ok(contents) => {
                let mime = content_type_for(path);
                self.status = StatusCode::OK;
                *self.response.status_mut() = StatusCode::OK;
                self.response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static(mime));
                *self.response.body_mut() = Bytes::from(contents);
                Ok(())
            }
            Err(_) => self.string(StatusCode::NOT_FOUND, "Not Found"),
        }
    }
}

#[cfg(feature = "hyper-server")]
fn content_type_for(path: &std::path::Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") => "application/javascript; charset=utf-8",
        Some("json") => "application/json; charset=utf-8",
        Some("txt") => "text/plain; charset=utf-8",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        _ => "application/octet-stream",
    }
}

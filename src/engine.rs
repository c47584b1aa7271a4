//! The engine: per-method routing trees, the context pool, configuration,
//! and the dispatch loop turning a request into a response.

use std::error::Error;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use http::header::{HeaderValue, ALLOW, CONTENT_TYPE, LOCATION};
use http::{Method, Request, Response, StatusCode};
use percent_encoding::percent_decode_str;

use crate::context::Context;
use crate::group::RouterGroup;
use crate::path::{clean_path, count_params, count_sections, join_paths};
use crate::tree::{Node, SkippedNodes};

/// The error type handlers use to stop a chain.
pub type HandlerError = Box<dyn Error + Send + Sync>;

/// The boxed future every handler returns, borrowing the request context.
pub type HandlerFuture<'a> = BoxFuture<'a, Result<(), HandlerError>>;

/// A request handler. Implemented for any `fn(&mut Context) -> HandlerFuture`
/// shaped function, so plain `fn` items register directly:
///
/// ```
/// use http::StatusCode;
/// use turnpike::{Context, HandlerFuture};
///
/// fn hello(ctx: &mut Context) -> HandlerFuture<'_> {
///     Box::pin(async move { ctx.string(StatusCode::OK, "hello") })
/// }
/// ```
pub trait Handler: Send + Sync + 'static {
    fn call<'a>(&'a self, ctx: &'a mut Context) -> HandlerFuture<'a>;
}

impl<F> Handler for F
where
    F: for<'a> Fn(&'a mut Context) -> HandlerFuture<'a> + Send + Sync + 'static,
{
    fn call<'a>(&'a self, ctx: &'a mut Context) -> HandlerFuture<'a> {
        self(ctx)
    }
}

/// A shared, type-erased handler.
pub type HandlerRef = Arc<dyn Handler>;

/// An ordered handler chain as stored at a route leaf: inherited middleware
/// first, route handlers last, flattened at registration time.
pub type HandlersChain = Vec<HandlerRef>;

/// Callback invoked on any non-2xx outcome (404, 405, handler error, panic).
pub type ErrorHandler = Arc<dyn Fn(&mut Context) + Send + Sync>;

/// Callback invoked unconditionally after the handler chain.
pub type AfterHandler = Arc<dyn Fn(&mut Context) + Send + Sync>;

/// Wraps a handler in a [`HandlerRef`].
pub fn handler<H: Handler>(h: H) -> HandlerRef {
    Arc::new(h)
}

/// Builds a [`HandlersChain`] from handler expressions.
///
/// ```
/// # use http::StatusCode;
/// # use turnpike::{handlers, Context, Engine, HandlerFuture};
/// # fn index(ctx: &mut Context) -> HandlerFuture<'_> {
/// #     Box::pin(async move { ctx.string(StatusCode::OK, "hi") })
/// # }
/// let mut engine = Engine::default();
/// engine.get("/", handlers![index]);
/// ```
#[macro_export]
macro_rules! handlers {
    ($($h:expr),+ $(,)?) => {
        vec![$($crate::handler($h)),+]
    };
}

// A chain longer than this is a registration mistake.
pub(crate) const MAX_CHAIN: usize = 63;

pub(crate) fn merge_chains(base: &HandlersChain, extra: HandlersChain) -> HandlersChain {
    let total = base.len() + extra.len();
    if total > MAX_CHAIN {
        panic!("too many handlers registered for a single route: {}", total);
    }

    let mut merged = Vec::with_capacity(total);
    merged.extend(base.iter().cloned());
    merged.extend(extra);
    merged
}

/// Engine configuration, read-only once the engine is built.
#[derive(Clone)]
pub struct Config {
    /// Largest request body `Context::form_*` will parse, in bytes.
    pub max_multipart_memory: usize,
    /// Wrap dispatch in a panic boundary and turn panics into 500s.
    pub recovery: bool,
    /// Probe the other method trees on a miss and answer 405 instead of 404.
    pub handle_method_not_allowed: bool,
    /// Invoked on any non-2xx outcome instead of the default writer.
    pub error_handler: Option<ErrorHandler>,
    /// Invoked unconditionally after the handler chain.
    pub after_handler: Option<AfterHandler>,
    /// Match against the raw (undecoded) request path.
    pub use_raw_path: bool,
    /// Percent-decode captured parameter values when matching the raw path.
    pub unescape_path_values: bool,
    /// Answer 301/307 when toggling a trailing slash would produce a match.
    pub redirect_trailing_slash: bool,
    /// Attempt case-insensitive path repair (plus cleanup of `..`/`//`)
    /// and redirect to the corrected path.
    pub fix_path: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            max_multipart_memory: 32 << 20, // 32 MiB
            recovery: false,
            handle_method_not_allowed: false,
            error_handler: None,
            after_handler: None,
            use_raw_path: false,
            unescape_path_values: true,
            redirect_trailing_slash: false,
            fix_path: false,
        }
    }
}

/// A registered route, as reported by [`Engine::routes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteInfo {
    pub method: Method,
    pub path: String,
}

struct MethodTree {
    method: Method,
    root: Node<HandlersChain>,
}

/// The routing engine. Routes are registered up front (`&mut self`), then
/// the engine is shared and `serve` dispatches requests (`&self`).
pub struct Engine {
    config: Config,
    trees: Vec<MethodTree>,
    root_chain: HandlersChain,
    max_params: usize,
    max_sections: usize,
    pool: Mutex<Vec<Context>>,
}

impl Default for Engine {
    fn default() -> Engine {
        Engine::new(Config::default())
    }
}

impl Engine {
    pub fn new(config: Config) -> Engine {
        Engine {
            config,
            trees: Vec::with_capacity(9),
            root_chain: Vec::new(),
            max_params: 0,
            max_sections: 0,
            pool: Mutex::new(Vec::new()),
        }
    }

    /// Read-only view of the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Appends middleware to the root chain; it runs before the handlers of
    /// every route registered afterwards.
    pub fn use_middleware(&mut self, chain: HandlersChain) {
        self.root_chain = merge_chains(&self.root_chain, chain);
    }

    /// Creates a sub-group under `relative`, inheriting the root middleware
    /// chain plus `chain`.
    pub fn group(&mut self, relative: &str, chain: HandlersChain) -> RouterGroup<'_> {
        let base_path = join_paths("/", relative);
        let chain = merge_chains(&self.root_chain, chain);
        RouterGroup::new(self, base_path, chain)
    }

    /// Registers `chain` for `method` at `path`, merged after the root
    /// middleware chain.
    pub fn handle(&mut self, method: Method, path: &str, chain: HandlersChain) {
        let merged = merge_chains(&self.root_chain, chain);
        self.add_route(method, &join_paths("/", path), merged);
    }

    pub fn get(&mut self, path: &str, chain: HandlersChain) {
        self.handle(Method::GET, path, chain);
    }

    pub fn post(&mut self, path: &str, chain: HandlersChain) {
        self.handle(Method::POST, path, chain);
    }

    pub fn put(&mut self, path: &str, chain: HandlersChain) {
        self.handle(Method::PUT, path, chain);
    }

    pub fn patch(&mut self, path: &str, chain: HandlersChain) {
        self.handle(Method::PATCH, path, chain);
    }

    pub fn delete(&mut self, path: &str, chain: HandlersChain) {
        self.handle(Method::DELETE, path, chain);
    }

    pub fn head(&mut self, path: &str, chain: HandlersChain) {
        self.handle(Method::HEAD, path, chain);
    }

    pub fn options(&mut self, path: &str, chain: HandlersChain) {
        self.handle(Method::OPTIONS, path, chain);
    }

    /// Registers the same chain under several methods at once.
    pub fn match_methods(&mut self, methods: &[Method], path: &str, chain: HandlersChain) {
        for method in methods {
            self.handle(method.clone(), path, chain.clone());
        }
    }

    /// Every registered route, across all method trees.
    pub fn routes(&self) -> Vec<RouteInfo> {
        let mut routes = Vec::new();
        for tree in &self.trees {
            let mut paths = Vec::new();
            tree.root.collect_routes(&mut paths);
            routes.extend(paths.into_iter().map(|path| RouteInfo {
                method: tree.method.clone(),
                path,
            }));
        }
        routes
    }

    pub(crate) fn add_route(&mut self, method: Method, path: &str, chain: HandlersChain) {
        if !path.starts_with('/') {
            panic!("path must begin with '/' in path '{}'", path);
        }
        if chain.is_empty() {
            panic!("there must be at least one handler for path '{}'", path);
        }

        tracing::debug!(%method, path, handlers = chain.len(), "route registered");

        let index = match self.trees.iter().position(|tree| tree.method == method) {
            Some(index) => index,
            None => {
                self.trees.push(MethodTree {
                    method,
                    root: Node::default(),
                });
                self.trees.len() - 1
            }
        };
        self.trees[index].root.add_route(path, chain);

        // keep the high-water marks used to pre-size per-request buffers
        self.max_params = self.max_params.max(count_params(path));
        self.max_sections = self.max_sections.max(count_sections(path));
    }

    fn tree(&self, method: &Method) -> Option<&Node<HandlersChain>> {
        self.trees
            .iter()
            .find(|tree| &tree.method == method)
            .map(|tree| &tree.root)
    }

    fn acquire_context(&self, request: Request<Bytes>) -> Context {
        let recycled = self
            .pool
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop();

        let mut ctx = match recycled {
            Some(ctx) => ctx,
            None => Context::new(self.config.clone(), self.max_params, self.max_sections),
        };
        ctx.reset();
        ctx.request = request;
        ctx
    }

    fn release_context(&self, mut ctx: Context) {
        ctx.request = Request::default();
        self.pool
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(ctx);
    }

    /// Dispatches one request and produces its response: pooled context
    /// acquisition, tree lookup, chain execution, 404/405/trailing-slash
    /// semantics, and (when configured) the panic recovery boundary.
    pub async fn serve(&self, request: Request<Bytes>) -> Response<Bytes> {
        let mut ctx = self.acquire_context(request);

        if self.config.recovery {
            let outcome = AssertUnwindSafe(self.handle_request(&mut ctx))
                .catch_unwind()
                .await;
            if let Err(payload) = outcome {
                let reason = panic_reason(payload);
                tracing::error!(panic = %reason, "handler panicked");
                ctx.broke = true;
                ctx.status = StatusCode::INTERNAL_SERVER_ERROR;
                ctx.error = Some(reason.into());
                self.fail(&mut ctx);
            }
        } else {
            self.handle_request(&mut ctx).await;
        }

        let response = ctx.take_response();
        self.release_context(ctx);
        response
    }

    async fn handle_request(&self, ctx: &mut Context) {
        let method = ctx.request.method().clone();
        let raw_path = ctx.request.uri().path().to_string();

        // The URI path arrives percent-encoded. By default the whole path is
        // decoded before matching; with `use_raw_path` matching runs on the
        // encoded bytes and `unescape_path_values` governs capture decoding.
        let (matched, unescape) = if self.config.use_raw_path {
            (raw_path.clone(), self.config.unescape_path_values)
        } else {
            let decoded = percent_decode_str(&raw_path)
                .decode_utf8_lossy()
                .into_owned();
            (decoded, false)
        };
        let path = clean_path(&matched);

        if let Some(root) = self.tree(&method) {
            let value = root.get_value(&path, Some(&mut ctx.params), &mut ctx.skipped, unescape);

            if let Some(chain) = value.value {
                ctx.full_path = value.full_path.to_string();
                let chain = chain.clone();
                tracing::trace!(%method, path = %path, route = %ctx.full_path, "route matched");

                self.run_chain(ctx, &chain).await;
                if let Some(after) = &self.config.after_handler {
                    (**after)(ctx);
                }
                return;
            }

            if method != Method::CONNECT && path != "/" {
                if value.tsr && self.config.redirect_trailing_slash {
                    let target = if path.len() > 1 && path.ends_with('/') {
                        path[..path.len() - 1].to_string()
                    } else {
                        format!("{}/", path)
                    };
                    self.redirect_to(ctx, &method, &target);
                    return;
                }

                if self.config.fix_path {
                    if let Some(fixed) = root.find_case_insensitive_path(
                        &clean_path(&raw_path),
                        self.config.redirect_trailing_slash,
                    ) {
                        self.redirect_to(ctx, &method, &fixed);
                        return;
                    }
                }
            }
        }

        if self.config.handle_method_not_allowed {
            let allowed = self.allowed(&method, &path, &mut ctx.skipped);
            if !allowed.is_empty() {
                ctx.broke = true;
                ctx.status = StatusCode::METHOD_NOT_ALLOWED;
                ctx.error = Some("Method Not Allowed".into());
                if let Ok(allow) = HeaderValue::try_from(allowed.join(", ")) {
                    ctx.response.headers_mut().insert(ALLOW, allow);
                }
                tracing::trace!(%method, path = %path, "method not allowed");
                self.fail(ctx);
                return;
            }
        }

        ctx.broke = true;
        ctx.status = StatusCode::NOT_FOUND;
        ctx.error = Some("Not Found".into());
        tracing::trace!(%method, path = %path, "no route matched");
        self.fail(ctx);
    }

    async fn run_chain(&self, ctx: &mut Context, chain: &HandlersChain) {
        for handler in chain {
            if ctx.broke {
                break;
            }
            ctx.cursor += 1;

            if let Err(err) = handler.call(ctx).await {
                ctx.broke = true;
                ctx.status = StatusCode::INTERNAL_SERVER_ERROR;
                ctx.error = Some(err);
                self.fail(ctx);
                break;
            }
        }
    }

    // Methods other than the request's own whose tree matches the path.
    fn allowed(&self, method: &Method, path: &str, skipped: &mut SkippedNodes) -> Vec<String> {
        let mut allowed = Vec::new();
        for tree in &self.trees {
            if &tree.method == method {
                continue;
            }
            let value = tree.root.get_value(path, None, skipped, false);
            if value.value.is_some() {
                allowed.push(tree.method.to_string());
            }
        }
        allowed
    }

    fn redirect_to(&self, ctx: &mut Context, method: &Method, target: &str) {
        // moved permanently for GET, temporary + method-preserving otherwise
        let status = if method == Method::GET {
            StatusCode::MOVED_PERMANENTLY
        } else {
            StatusCode::TEMPORARY_REDIRECT
        };

        tracing::trace!(%method, target, "redirecting");
        ctx.status = status;
        *ctx.response.status_mut() = status;
        if let Ok(location) = HeaderValue::try_from(target) {
            ctx.response.headers_mut().insert(LOCATION, location);
        }
    }

    // Delivers a non-2xx outcome: the configured error handler decides the
    // response, or the minimal default writer runs.
    fn fail(&self, ctx: &mut Context) {
        if let Some(error_handler) = &self.config.error_handler {
            (**error_handler)(ctx);
            return;
        }

        let body = match &ctx.error {
            Some(err) => err.to_string(),
            None => ctx
                .status
                .canonical_reason()
                .unwrap_or_default()
                .to_string(),
        };

        *ctx.response.status_mut() = ctx.status;
        ctx.response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        *ctx.response.body_mut() = Bytes::from(body);
    }
}

fn panic_reason(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_string()
    }
}

//! Route groups: a base path plus an inherited middleware chain, composable
//! into nested scopes. Chains are flattened eagerly at registration time, so
//! the matched leaf stores the complete ordered chain and dispatch never
//! assembles anything.

use http::Method;

use crate::engine::{merge_chains, Engine, HandlersChain};
use crate::path::join_paths;

/// A registration scope: every route registered through the group lives
/// under its base path and runs its inherited middleware first.
///
/// ```
/// # use http::StatusCode;
/// # use turnpike::{handlers, Context, Engine, HandlerFuture};
/// # fn auth(_ctx: &mut Context) -> HandlerFuture<'_> {
/// #     Box::pin(async move { Ok(()) })
/// # }
/// # fn list_users(ctx: &mut Context) -> HandlerFuture<'_> {
/// #     Box::pin(async move { ctx.string(StatusCode::OK, "users") })
/// # }
/// let mut engine = Engine::default();
/// let mut api = engine.group("/api", handlers![auth]);
/// let mut v1 = api.group("/v1", vec![]);
/// v1.get("/users", handlers![list_users]); // GET /api/v1/users, chain [auth, list_users]
/// ```
pub struct RouterGroup<'e> {
    engine: &'e mut Engine,
    base_path: String,
    chain: HandlersChain,
}

impl<'e> RouterGroup<'e> {
    pub(crate) fn new(engine: &'e mut Engine, base_path: String, chain: HandlersChain) -> Self {
        RouterGroup {
            engine,
            base_path,
            chain,
        }
    }

    /// The absolute path this group registers under.
    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// Appends middleware to this group's chain; it runs before the handlers
    /// of every route registered on the group afterwards.
    pub fn use_middleware(&mut self, chain: HandlersChain) {
        self.chain = merge_chains(&self.chain, chain);
    }

    /// Creates a nested group under `relative`, inheriting this group's
    /// chain plus `chain`.
    pub fn group(&mut self, relative: &str, chain: HandlersChain) -> RouterGroup<'_> {
        RouterGroup {
            base_path: join_paths(&self.base_path, relative),
            chain: merge_chains(&self.chain, chain),
            engine: &mut *self.engine,
        }
    }

    /// Registers `chain` for `method` under the group's base path.
    pub fn handle(&mut self, method: Method, relative: &str, chain: HandlersChain) {
        let path = join_paths(&self.base_path, relative);
        let merged = merge_chains(&self.chain, chain);
        self.engine.add_route(method, &path, merged);
    }

    pub fn get(&mut self, relative: &str, chain: HandlersChain) {
        self.handle(Method::GET, relative, chain);
    }

    pub fn post(&mut self, relative: &str, chain: HandlersChain) {
        self.handle(Method::POST, relative, chain);
    }

    pub fn put(&mut self, relative: &str, chain: HandlersChain) {
        self.handle(Method::PUT, relative, chain);
    }

    pub fn patch(&mut self, relative: &str, chain: HandlersChain) {
        self.handle(Method::PATCH, relative, chain);
    }

    pub fn delete(&mut self, relative: &str, chain: HandlersChain) {
        self.handle(Method::DELETE, relative, chain);
    }

    pub fn head(&mut self, relative: &str, chain: HandlersChain) {
        self.handle(Method::HEAD, relative, chain);
    }

    pub fn options(&mut self, relative: &str, chain: HandlersChain) {
        self.handle(Method::OPTIONS, relative, chain);
    }

    /// Registers the same chain under several methods at once.
    pub fn match_methods(&mut self, methods: &[Method], relative: &str, chain: HandlersChain) {
        for method in methods {
            self.handle(method.clone(), relative, chain.clone());
        }
    }
}

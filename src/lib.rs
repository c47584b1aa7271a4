#![deny(rust_2018_idioms)]

//! A lightweight HTTP routing engine: a priority-ordered radix tree per HTTP
//! method dispatches each request to an ordered chain of handlers, carrying
//! captured path parameters through a pooled per-request [`Context`].
//!
//! ```rust
//! use bytes::Bytes;
//! use http::{Request, StatusCode};
//! use turnpike::{handlers, Context, Engine, HandlerFuture};
//!
//! fn hello(ctx: &mut Context) -> HandlerFuture<'_> {
//!     Box::pin(async move {
//!         let user = ctx.path_value("user").to_string();
//!         ctx.string(StatusCode::OK, format!("Hello, {}!", user))
//!     })
//! }
//!
//! let mut engine = Engine::default();
//! engine.get("/hello/:user", handlers![hello]);
//!
//! let request = Request::builder()
//!     .uri("/hello/gordon")
//!     .body(Bytes::new())
//!     .unwrap();
//! let response = futures::executor::block_on(engine.serve(request));
//!
//! assert_eq!(response.status(), StatusCode::OK);
//! assert_eq!(response.body().as_ref(), b"Hello, gordon!");
//! ```
//!
//! The registered path can contain two types of parameters:
//! ```text
//! Syntax    Type
//! :name     named parameter
//! *name     catch-all parameter
//! ```
//!
//! Named parameters are dynamic path segments. They match anything until the
//! next `/` or the path end:
//!
//! ```text
//! Pattern: /user/:user
//!
//!  /user/gordon              match
//!  /user/you                 match
//!  /user/gordon/profile      no match
//!  /user/                    no match
//! ```
//!
//! Catch-all parameters match everything from their position to the end of
//! the path, so they must always sit at the end of the pattern. The `/`
//! before the wildcard only separates it from the parent segment and is not
//! part of the capture:
//!
//! ```text
//! Pattern: /src/*filepath
//!
//!  /src/                     match: filepath=""
//!  /src/somefile.rs          match: filepath="somefile.rs"
//!  /src/subdir/somefile.rs   match: filepath="subdir/somefile.rs"
//! ```
//!
//! A static route and a parameter may share a segment; the static branch is
//! preferred and the matcher falls back to the parameter when it dead-ends.
//! Two *wildcards* at the same position, however, conflict at registration
//! time and panic before the server ever starts.
//!
//! # How it works
//!
//! The engine keeps one tree per HTTP method. Each tree is a compact prefix
//! tree (a [radix tree]) whose edges carry multi-character substrings, which
//! makes heavy use of the common prefixes URL hierarchies naturally have:
//!
//! ```text
//! Priority   Path             Chain
//! 9          \                *<1>
//! 3          ├s               None
//! 2          |├earch\         *<2>
//! 1          |└upport\        *<3>
//! 2          ├blog\           *<4>
//! 1          |    └:post      None
//! 1          |         └\     *<5>
//! 2          ├about-us\       *<6>
//! 1          |        └team\  *<7>
//! 1          └contact\        *<8>
//! ```
//!
//! Every `*<num>` is a registered handler chain. Child nodes at each level
//! are ordered by priority, the number of registered routes passing through
//! them, so the most-traveled edges are checked first and a sequential scan
//! of the index bytes stays cheap.
//!
//! Dispatch acquires a [`Context`] from a pool, resolves the chain in the
//! method's tree (backtracking through skipped wildcard alternatives via an
//! explicit stack rather than recursion), runs the chain in registration
//! order until completion, an [`abort`](Context::abort), or a handler error,
//! and releases the context once the response is produced. Misses turn into
//! 404s, optional 405s (with an `Allow` header), or trailing-slash and
//! case-repair redirects, depending on [`Config`].
//!
//! [radix tree]: https://en.wikipedia.org/wiki/Radix_tree

mod context;
mod engine;
mod group;
mod params;
mod path;
mod tree;

#[cfg(feature = "hyper-server")]
mod service;

pub use context::Context;
pub use engine::{
    handler, AfterHandler, Config, Engine, ErrorHandler, Handler, HandlerError, HandlerFuture,
    HandlerRef, HandlersChain, RouteInfo,
};
pub use group::RouterGroup;
pub use params::{Param, Params};
pub use path::{clean_path, join_paths};

#[cfg(feature = "hyper-server")]
pub use service::{EngineService, MakeEngineService};

//! # sitepipe
//!
//! Build orchestration for a static blog: one source tree, two pipelines.
//!
//! - **dev** (`sitepipe serve`): compile pages and readable assets into a
//!   scratch directory, serve them, watch the source tree and rebuild just
//!   what changed, then push a live reload to open browser tabs.
//! - **dist** (`sitepipe build`): compile, optimize and minify everything into
//!   the distribution directory and exit (`serve dist` keeps serving it).
//!
//! # Architecture
//!
//! ```text
//! mode ──selects──→ pipeline + flow
//!                      │
//!                      ├─ stage 1 ─→ registry ─→ transform
//!                      ├─ stage 2 ─→ registry ─→ transform
//!                      └─ ...
//!                      │
//!  (dev only)  watch ──┴── debounced run_stages ──→ server (live reload)
//! ```
//!
//! Stages are data: a name, a transform name, input [`flow::Location`]s with
//! globs, one output location with the files it produces, the marks it
//! leaves on them and typed options. The ordering constraints
//! between stages (minify after prefixing, inline critical CSS before HTML
//! minification, optimize images only in the distribution tree) follow from
//! those declarations and are checked by [`pipeline::Pipeline::validate`]
//! before anything runs.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`registry`] | Named transforms, invocations and their errors |
//! | [`transforms`] | Built-in transforms: markup, CSS, scripts, images, critical CSS, HTML |
//! | [`pipeline`] | Stage model, static checks, sequential execution, the dev and dist pipelines |
//! | [`flow`] | The source / intermediate / distribution directory triple and resets |
//! | [`mode`] | `serve [dist]`, `build` and the default command |
//! | [`watch`] | Watch rules, debouncing and the rebuild loop |
//! | [`server`] | Static file server with Server-Sent Events live reload |
//! | [`config`] | `sitepipe.toml` and layered site settings |
//! | [`cache`] | Content-addressed cache for optimized images |
//! | [`output`] | CLI output formatting |

pub mod cache;
pub mod config;
pub mod flow;
pub mod mode;
pub mod output;
pub mod pipeline;
pub mod registry;
pub mod server;
pub mod transforms;
pub mod watch;

#[cfg(test)]
pub(crate) mod test_helpers;

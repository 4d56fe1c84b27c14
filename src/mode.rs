//! Command-to-pipeline selection.
//!
//! | Command | Pipeline | Afterwards |
//! |---|---|---|
//! | `serve` | dev | serve intermediate + assets, watch, live reload |
//! | `serve dist` | dist | serve the distribution until terminated |
//! | `build` | dist | exit |
//! | (none) | dev | same as `serve` |
//!
//! A failing one-shot build is fatal, including under `serve dist`: nothing
//! is served. In the dev loop only the initial run is fatal; later rebuild
//! failures are logged and the loop keeps going.

use crate::config::{self, ConfigError, PipelineConfig};
use crate::flow::{FileFlow, Mode};
use crate::pipeline::{self, Pipeline, PipelineError, PipelineReport, StageEvent};
use crate::registry::Registry;
use crate::server::{self, ReloadHub, ServerContext};
use crate::watch::{self, PipelineRebuilder, WatchError, WatchLoop, WatchRules, WatchSummary};
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::Sender;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum ModeError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("Watch error: {0}")]
    Watch(#[from] WatchError),
    #[error("Invalid server address '{0}'")]
    Address(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// What `serve` serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Dev,
    Dist,
}

impl Target {
    /// `Some("dist")` selects the distribution; anything else is the dev path.
    pub fn parse(arg: Option<&str>) -> Self {
        match arg {
            Some("dist") => Target::Dist,
            _ => Target::Dev,
        }
    }
}

/// A loaded project: config, base directory and transforms.
#[derive(Debug, Clone)]
pub struct Project {
    /// Directory every configured path is relative to.
    pub base: PathBuf,
    pub config: PipelineConfig,
    pub registry: Arc<Registry>,
    /// Consult the image processing cache (`--no-cache` turns this off).
    pub use_cache: bool,
}

impl Project {
    pub fn new(base: impl Into<PathBuf>, config: PipelineConfig) -> Self {
        Self {
            base: base.into(),
            config,
            registry: Arc::new(Registry::with_builtins()),
            use_cache: true,
        }
    }

    /// Load `config_path` (missing means stock defaults) for `base`.
    pub fn load(base: &Path, config_path: &Path) -> Result<Self, ModeError> {
        let config = config::load_pipeline_config(config_path)?;
        Ok(Self::new(base, config))
    }

    pub fn flow(&self, mode: Mode) -> FileFlow {
        FileFlow::for_mode(mode, &self.config.paths, &self.base)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.base.join(&self.config.paths.cache)
    }

    pub fn pipeline(&self, mode: Mode) -> Pipeline {
        match mode {
            Mode::Dev => pipeline::dev_pipeline(&self.config),
            Mode::Dist => {
                pipeline::dist_pipeline(&self.config, Some(self.cache_dir()), self.use_cache)
            }
        }
    }

    /// Validate and run the full pipeline for `mode` once.
    pub fn run(
        &self,
        mode: Mode,
        events: Option<&Sender<StageEvent>>,
    ) -> Result<PipelineReport, ModeError> {
        let pipeline = self.pipeline(mode);
        pipeline.validate(&self.registry)?;
        let flow = self.flow(mode);
        tracing::debug!(
            "Running '{}' pipeline: {} → {}",
            pipeline.name,
            flow.source.display(),
            flow.root(flow.scope()).display()
        );
        Ok(pipeline.run(&self.registry, &flow, events)?)
    }

    fn address(&self) -> Result<SocketAddr, ModeError> {
        let raw = format!("{}:{}", self.config.server.host, self.config.server.port);
        raw.parse().map_err(|_| ModeError::Address(raw))
    }
}

/// `build`: the dist pipeline once.
pub fn build(
    project: &Project,
    events: Option<&Sender<StageEvent>>,
) -> Result<PipelineReport, ModeError> {
    project.run(Mode::Dist, events)
}

/// `serve [dist]`: run the selected pipeline, then serve until `shutdown`
/// resolves.
///
/// Returns the report of the initial run and, for the dev path, the watch
/// loop counters.
pub async fn serve<F>(
    project: Project,
    target: Target,
    events: Option<Sender<StageEvent>>,
    shutdown: F,
) -> Result<(PipelineReport, Option<WatchSummary>), ModeError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let mode = match target {
        Target::Dev => Mode::Dev,
        Target::Dist => Mode::Dist,
    };
    let project = Arc::new(project);
    let report = {
        let project = Arc::clone(&project);
        let events = events.clone();
        tokio::task::spawn_blocking(move || project.run(mode, events.as_ref())).await??
    };

    let addr = project.address()?;
    let flow = project.flow(mode);
    match target {
        Target::Dist => {
            let ctx = ServerContext::new(flow.serve_roots(), None);
            server::serve(addr, ctx, shutdown).await?;
            Ok((report, None))
        }
        Target::Dev => {
            let summary = serve_dev(&project, flow, addr, events, shutdown).await?;
            Ok((report, Some(summary)))
        }
    }
}

async fn serve_dev<F>(
    project: &Project,
    flow: FileFlow,
    addr: SocketAddr,
    events: Option<Sender<StageEvent>>,
    shutdown: F,
) -> Result<WatchSummary, ModeError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let pipeline = project.pipeline(Mode::Dev);
    let rules = WatchRules::new(watch::dev_watch_rules(&project.config))?;
    rules.check_against(&pipeline)?;

    // Watchers report canonical paths on some platforms.
    let source = flow
        .source
        .canonicalize()
        .unwrap_or_else(|_| flow.source.clone());
    let (tx, rx) = mpsc::channel(256);
    let watcher = watch::spawn_source_watcher(&source, tx)?;

    let hub = ReloadHub::new();
    let ctx = ServerContext::new(flow.serve_roots(), Some(hub.clone()));
    let rebuilder = Arc::new(PipelineRebuilder {
        pipeline,
        registry: Arc::clone(&project.registry),
        flow,
        events,
    });
    let window = Duration::from_millis(project.config.watch.debounce_ms);
    let watch_task = tokio::spawn(WatchLoop::new(source, rules, window, rebuilder, hub).run(rx));

    let served = server::serve(addr, ctx, shutdown).await;
    // Closing the event channel lets the loop flush and finish.
    drop(watcher);
    let summary = watch_task.await?;
    served?;
    Ok(summary)
}

/// No command: same as `serve` without a target.
pub async fn default<F>(
    project: Project,
    events: Option<Sender<StageEvent>>,
    shutdown: F,
) -> Result<(PipelineReport, Option<WatchSummary>), ModeError>
where
    F: Future<Output = ()> + Send + 'static,
{
    serve(project, Target::Dev, events, shutdown).await
}

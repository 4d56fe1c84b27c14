//! Dev-mode watch loop.
//!
//! Filesystem events from a [`notify`] watcher on the source root are
//! matched against [`WatchRule`]s. Each matching rule is (re)armed in a
//! [`Debouncer`]; once a rule has been quiet for the coalescing window, the
//! union of the due rules' stages re-runs through a [`Rebuild`], one rebuild
//! at a time.
//!
//! ```text
//!            change event              rebuild ok
//!   Idle ─────────────────→ Rebuilding ──────────→ Notifying ──→ Idle
//!                               │
//!                               └── rebuild failed: log ──────→ Idle
//! ```
//!
//! A failed rebuild never notifies: the server keeps serving whatever the
//! last successful run left behind.

pub mod debounce;

pub use debounce::Debouncer;

use crate::config::PipelineConfig;
use crate::flow::FileFlow;
use crate::pipeline::{Pipeline, PipelineError, StageEvent};
use crate::registry::Registry;
use crate::server::ReloadHub;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("invalid watch glob '{pattern}': {source}")]
    Glob {
        pattern: String,
        source: globset::Error,
    },
    #[error("watch rule '{rule}' names unknown stage '{stage}'")]
    UnknownStage { rule: String, stage: String },
    #[error("file watcher error: {0}")]
    Notify(#[from] notify::Error),
}

/// Source globs mapped to the stages that must re-run when they change.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchRule {
    pub name: String,
    /// Patterns relative to the source root.
    pub globs: Vec<String>,
    /// Paths matching these never trigger the rule.
    pub ignore: Vec<String>,
    /// Stages to re-run. Empty means reload only.
    pub stages: Vec<String>,
}

/// The dev pipeline's rules.
pub fn dev_watch_rules(config: &PipelineConfig) -> Vec<WatchRule> {
    let assets = config.paths.assets.as_str();
    let rule = |name: &str, globs: Vec<String>, ignore: Vec<String>, stages: &[&str]| WatchRule {
        name: name.to_string(),
        globs,
        ignore,
        stages: stages.iter().map(|s| s.to_string()).collect(),
    };
    vec![
        rule(
            "markup",
            vec!["**/*.{html,toml,md,mkd,markdown}".to_string()],
            vec![format!("{assets}/**")],
            &["compile-markup"],
        ),
        rule(
            "styles",
            vec![format!("{assets}/css/**/*.css")],
            Vec::new(),
            &["concat-styles", "prefix-styles"],
        ),
        rule(
            "scripts",
            vec![format!("{assets}/js/**/*.js")],
            Vec::new(),
            &["bundle-scripts"],
        ),
        rule(
            "images",
            vec![format!("{assets}/img/**/*.{{gif,jpg,jpeg,png,svg,webp}}")],
            Vec::new(),
            &[],
        ),
    ]
}

fn glob_set(patterns: &[String]) -> Result<GlobSet, WatchError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|source| WatchError::Glob {
                pattern: pattern.clone(),
                source,
            })?;
        builder.add(glob);
    }
    builder.build().map_err(|source| WatchError::Glob {
        pattern: patterns.join(","),
        source,
    })
}

/// Compiled watch rules.
#[derive(Debug, Clone)]
pub struct WatchRules {
    rules: Vec<(WatchRule, GlobSet, GlobSet)>,
}

impl WatchRules {
    pub fn new(rules: Vec<WatchRule>) -> Result<Self, WatchError> {
        let compiled = rules
            .into_iter()
            .map(|rule| {
                let globs = glob_set(&rule.globs)?;
                let ignore = glob_set(&rule.ignore)?;
                Ok((rule, globs, ignore))
            })
            .collect::<Result<Vec<_>, WatchError>>()?;
        Ok(Self { rules: compiled })
    }

    /// Fail when a rule names a stage the pipeline does not have.
    pub fn check_against(&self, pipeline: &Pipeline) -> Result<(), WatchError> {
        for (rule, _, _) in &self.rules {
            if let Some(stage) = rule.stages.iter().find(|s| pipeline.stage(s).is_none()) {
                return Err(WatchError::UnknownStage {
                    rule: rule.name.clone(),
                    stage: stage.clone(),
                });
            }
        }
        Ok(())
    }

    /// Names of the rules a source-relative path triggers.
    pub fn matching(&self, relative: &Path) -> Vec<&str> {
        self.rules
            .iter()
            .filter(|(_, globs, ignore)| globs.is_match(relative) && !ignore.is_match(relative))
            .map(|(rule, _, _)| rule.name.as_str())
            .collect()
    }

    /// Union of the stages of the named rules, first mention first.
    pub fn stages_for(&self, names: &[String]) -> Vec<String> {
        let mut stages: Vec<String> = Vec::new();
        for (rule, _, _) in self.rules.iter().filter(|(r, _, _)| names.contains(&r.name)) {
            for stage in &rule.stages {
                if !stages.contains(stage) {
                    stages.push(stage.clone());
                }
            }
        }
        stages
    }
}

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Rebuilding,
    Notifying,
}

/// Re-runs a subset of stages. Called on the blocking pool.
pub trait Rebuild: Send + Sync + 'static {
    fn rebuild(&self, stages: &[String]) -> Result<(), PipelineError>;
}

/// Rebuilds by running stages of the dev pipeline against its flow.
pub struct PipelineRebuilder {
    pub pipeline: Pipeline,
    pub registry: Arc<Registry>,
    pub flow: FileFlow,
    pub events: Option<std::sync::mpsc::Sender<StageEvent>>,
}

impl Rebuild for PipelineRebuilder {
    fn rebuild(&self, stages: &[String]) -> Result<(), PipelineError> {
        let report = self.pipeline.run_stages(
            stages,
            &self.registry,
            &self.flow,
            self.events.as_ref(),
        )?;
        tracing::info!(
            "Rebuilt {} stage(s) in {:.2}s",
            report.stages.len(),
            report.elapsed.as_secs_f64()
        );
        Ok(())
    }
}

/// Counts reported when the loop ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchSummary {
    pub rebuilds: usize,
    pub failures: usize,
    pub notifications: usize,
}

pub struct WatchLoop<R> {
    source: PathBuf,
    rules: WatchRules,
    debouncer: Debouncer<String>,
    rebuild: Arc<R>,
    reload: ReloadHub,
    state: watch::Sender<LoopState>,
    summary: WatchSummary,
}

impl<R: Rebuild> WatchLoop<R> {
    /// `source` must be the same (canonical) path the watcher reports.
    pub fn new(
        source: PathBuf,
        rules: WatchRules,
        window: Duration,
        rebuild: Arc<R>,
        reload: ReloadHub,
    ) -> Self {
        let (state, _) = watch::channel(LoopState::Idle);
        Self {
            source,
            rules,
            debouncer: Debouncer::new(window),
            rebuild,
            reload,
            state,
            summary: WatchSummary::default(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    /// Consume change events until the channel closes. Pending rules are
    /// flushed once before returning.
    pub async fn run(mut self, mut events: mpsc::Receiver<PathBuf>) -> WatchSummary {
        loop {
            let deadline = self.debouncer.next_deadline();
            tokio::select! {
                received = events.recv() => match received {
                    Some(path) => self.observe(&path),
                    None => {
                        let pending = self.debouncer.drain();
                        if !pending.is_empty() {
                            self.fire(pending).await;
                        }
                        break;
                    }
                },
                _ = wait_until(deadline) => {
                    let due = self.debouncer.take_due(Instant::now());
                    if !due.is_empty() {
                        self.fire(due).await;
                    }
                }
            }
        }
        self.summary
    }

    fn observe(&mut self, path: &Path) {
        let Ok(relative) = path.strip_prefix(&self.source) else {
            return;
        };
        let now = Instant::now();
        for name in self.rules.matching(relative) {
            tracing::debug!("{} changed (rule '{}')", relative.display(), name);
            self.debouncer.record(name.to_string(), now);
        }
    }

    async fn fire(&mut self, rules: Vec<String>) {
        let stages = self.rules.stages_for(&rules);
        self.state.send_replace(LoopState::Rebuilding);

        let result = if stages.is_empty() {
            Ok(())
        } else {
            self.summary.rebuilds += 1;
            let rebuild = Arc::clone(&self.rebuild);
            let to_run = stages.clone();
            match tokio::task::spawn_blocking(move || rebuild.rebuild(&to_run)).await {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(join) => Err(format!("rebuild task failed: {join}")),
            }
        };

        match result {
            Ok(()) => {
                self.state.send_replace(LoopState::Notifying);
                let reached = self.reload.notify(stages);
                self.summary.notifications += 1;
                tracing::debug!("Reload pushed to {} client(s)", reached);
            }
            Err(message) => {
                self.summary.failures += 1;
                tracing::error!("Rebuild failed ({}): {}", rules.join(", "), message);
            }
        }
        self.state.send_replace(LoopState::Idle);
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Watch `source` recursively, forwarding changed paths into `tx`.
///
/// The returned watcher must be kept alive; dropping it closes the channel.
pub fn spawn_source_watcher(
    source: &Path,
    tx: mpsc::Sender<PathBuf>,
) -> Result<RecommendedWatcher, WatchError> {
    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                if event.kind.is_create() || event.kind.is_modify() || event.kind.is_remove() {
                    for path in event.paths {
                        let _ = tx.blocking_send(path);
                    }
                }
            }
            Err(e) => tracing::warn!("File watcher error: {}", e),
        },
        Config::default(),
    )?;
    watcher.watch(source, RecursiveMode::Recursive)?;
    tracing::info!("Watching {}", source.display());
    Ok(watcher)
}

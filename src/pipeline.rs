//! Pipeline definitions and execution.
//!
//! A [`Pipeline`] is an ordered list of [`Stage`]s. Each stage either resets
//! one of the working roots or invokes a registered transform, reading
//! [`Location`]s populated by the source tree or by an earlier stage and
//! writing one output location.
//!
//! ```text
//! dev:   clean → compile-markup → concat-styles → prefix-styles → bundle-scripts
//!        → serve + watch
//!
//! dist:  clean → compile-markup → copy-images → optimize-raster → optimize-vector
//!        → concat-styles → prefix-styles → minify-styles → bundle-scripts
//!        → inline-critical → minify-html
//! ```
//!
//! The ordering constraints (minify after concatenation and prefixing,
//! inline critical CSS after the final stylesheet but before HTML
//! minification, optimize images only once they sit in the distribution
//! tree) are carried by the stages' declarations, so [`Pipeline::validate`]
//! checks them without running anything:
//!
//! - a stage declares the files it produces as globs below its output
//!   location, plus the *marks* it leaves on them (`prefixed`, `minified`)
//! - an input names the files it reads and the marks they must already
//!   carry
//! - a stage that rewrites files it also reads keeps their earlier marks;
//!   any other producer starts them afresh
//!
//! Execution is strictly sequential and stops at the first failing stage.

use crate::config::PipelineConfig;
use crate::flow::{FileFlow, FlowError, Location, Mode, Root};
use crate::registry::{
    Input, Invocation, MarkupOptions, Outcome, RasterOptions, Registry, RegistryError,
    TransformOptions,
};
use crate::server::LIVE_RELOAD_PATH;
use globset::{GlobBuilder, GlobMatcher};
use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Pages the markup compiler picks up below the source root.
pub const PAGE_PATTERNS: &[&str] = &["**/*.{html,md,mkd,markdown}"];

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("stage '{stage}' uses unknown transform '{transform}'")]
    UnknownTransform { stage: String, transform: String },
    #[error("stage '{stage}' reads {input}, which no earlier stage produces")]
    UnreachableInput { stage: String, input: String },
    #[error("stage '{stage}' reads {input} before it is {mark}")]
    InputNotReady {
        stage: String,
        input: String,
        mark: String,
    },
    #[error("stage '{stage}' declares invalid pattern '{pattern}': {source}")]
    Pattern {
        stage: String,
        pattern: String,
        source: globset::Error,
    },
    #[error("stage '{stage}' writes into the source directory")]
    WritesSource { stage: String },
    #[error("duplicate stage name '{0}'")]
    DuplicateStage(String),
    #[error("pipeline '{pipeline}' has no stage '{stage}'")]
    UnknownStage { pipeline: String, stage: String },
    #[error("stage '{stage}' failed: {source}")]
    Flow { stage: String, source: FlowError },
    #[error("stage '{stage}' failed: {source}")]
    Stage { stage: String, source: RegistryError },
}

/// What happens once a pipeline has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterRun {
    Exit,
    ServeWithReload,
}

/// What a stage does.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Empty a whole working root through the file-flow context.
    Reset(Root),
    /// Invoke a registered transform.
    Invoke {
        transform: String,
        options: TransformOptions,
    },
}

/// A location plus the globs selected below it.
#[derive(Debug, Clone, PartialEq)]
pub struct InputSpec {
    pub location: Location,
    pub patterns: Vec<String>,
    /// Marks the selected files must carry by the time the stage runs.
    pub requires: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub name: String,
    pub action: Action,
    pub inputs: Vec<InputSpec>,
    pub output: Location,
    /// Globs below `output` naming the files the stage leaves behind.
    pub produces: Vec<String>,
    /// Marks added to the produced files.
    pub marks: Vec<String>,
}

impl Stage {
    pub fn reset(name: impl Into<String>, root: Root) -> Self {
        Self {
            name: name.into(),
            action: Action::Reset(root),
            inputs: Vec::new(),
            output: Location::new(root, ""),
            produces: Vec::new(),
            marks: Vec::new(),
        }
    }

    /// A transform stage; add inputs with [`read`](Self::read) and set the
    /// output with [`write`](Self::write).
    pub fn invoke(
        name: impl Into<String>,
        transform: impl Into<String>,
        options: TransformOptions,
    ) -> Self {
        Self {
            name: name.into(),
            action: Action::Invoke {
                transform: transform.into(),
                options,
            },
            inputs: Vec::new(),
            output: Location::intermediate(""),
            produces: Vec::new(),
            marks: Vec::new(),
        }
    }

    pub fn read(self, location: Location, patterns: &[&str]) -> Self {
        self.read_marked(location, patterns, &[])
    }

    /// Read files that earlier stages must already have marked.
    pub fn read_marked(mut self, location: Location, patterns: &[&str], requires: &[&str]) -> Self {
        self.inputs.push(InputSpec {
            location,
            patterns: strings(patterns),
            requires: strings(requires),
        });
        self
    }

    pub fn write(mut self, location: Location, produces: &[&str]) -> Self {
        self.output = location;
        self.produces = strings(produces);
        self
    }

    pub fn mark(mut self, mark: &str) -> Self {
        self.marks.push(mark.to_string());
        self
    }

    /// True when the stage rewrites files it also reads.
    fn rewrites(&self, pattern: &str) -> bool {
        self.inputs
            .iter()
            .any(|i| i.location == self.output && i.patterns.iter().any(|p| p == pattern))
    }

    /// Transform name for reports (`reset` for reset stages).
    pub fn transform_name(&self) -> &str {
        match &self.action {
            Action::Reset(_) => "reset",
            Action::Invoke { transform, .. } => transform,
        }
    }
}

/// Pipeline progress, sent to the CLI printer while a run is in flight.
#[derive(Debug, Clone)]
pub enum StageEvent {
    Started {
        index: usize,
        total: usize,
        stage: String,
    },
    Finished {
        index: usize,
        total: usize,
        report: StageReport,
    },
    Failed {
        stage: String,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageReport {
    pub name: String,
    pub transform: String,
    pub outcome: Outcome,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineReport {
    pub pipeline: String,
    pub mode: Mode,
    pub stages: Vec<StageReport>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    pub name: String,
    pub mode: Mode,
    pub stages: Vec<Stage>,
    pub after: AfterRun,
}

impl Pipeline {
    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Static checks: unique stage names, registered transforms, nothing
    /// written into the source tree, and every non-source input produced by
    /// an earlier stage and carrying the marks it requires. A reset forgets
    /// what was produced under its root.
    pub fn validate(&self, registry: &Registry) -> Result<(), PipelineError> {
        let mut names = HashSet::new();
        let mut produced: Vec<Artifact> = Vec::new();
        for stage in &self.stages {
            if !names.insert(stage.name.as_str()) {
                return Err(PipelineError::DuplicateStage(stage.name.clone()));
            }
            if stage.output.root == Root::Source {
                return Err(PipelineError::WritesSource {
                    stage: stage.name.clone(),
                });
            }
            if let Action::Invoke { transform, .. } = &stage.action
                && !registry.contains(transform)
            {
                return Err(PipelineError::UnknownTransform {
                    stage: stage.name.clone(),
                    transform: transform.clone(),
                });
            }
            for input in stage.inputs.iter().filter(|i| i.location.root != Root::Source) {
                for pattern in &input.patterns {
                    let path = artifact_path(&input.location, pattern);
                    let shown = format!("{}:/{}", input.location.root, path);
                    let Some(latest) = latest_match(&produced, input.location.root, &path) else {
                        return Err(PipelineError::UnreachableInput {
                            stage: stage.name.clone(),
                            input: shown,
                        });
                    };
                    if let Some(mark) = input.requires.iter().find(|m| !latest.marks.contains(*m)) {
                        return Err(PipelineError::InputNotReady {
                            stage: stage.name.clone(),
                            input: shown,
                            mark: mark.clone(),
                        });
                    }
                }
            }
            match &stage.action {
                Action::Reset(root) => produced.retain(|a| a.root != *root),
                Action::Invoke { .. } => {
                    let mut fresh = Vec::with_capacity(stage.produces.len());
                    for pattern in &stage.produces {
                        let path = artifact_path(&stage.output, pattern);
                        let mut marks = BTreeSet::new();
                        if stage.rewrites(pattern)
                            && let Some(earlier) = latest_match(&produced, stage.output.root, &path)
                        {
                            marks = earlier.marks.clone();
                        }
                        marks.extend(stage.marks.iter().cloned());
                        fresh.push(Artifact {
                            root: stage.output.root,
                            glob: artifact_glob(&stage.name, &path)?,
                            marks,
                        });
                    }
                    produced.extend(fresh);
                }
            }
        }
        Ok(())
    }

    /// Run every stage in order.
    pub fn run(
        &self,
        registry: &Registry,
        flow: &FileFlow,
        events: Option<&Sender<StageEvent>>,
    ) -> Result<PipelineReport, PipelineError> {
        let all: Vec<&Stage> = self.stages.iter().collect();
        self.execute(&all, registry, flow, events)
    }

    /// Run the named stages only, in pipeline order, each at most once.
    pub fn run_stages(
        &self,
        names: &[String],
        registry: &Registry,
        flow: &FileFlow,
        events: Option<&Sender<StageEvent>>,
    ) -> Result<PipelineReport, PipelineError> {
        if let Some(unknown) = names.iter().find(|n| self.stage(n).is_none()) {
            return Err(PipelineError::UnknownStage {
                pipeline: self.name.clone(),
                stage: unknown.clone(),
            });
        }
        let selected: Vec<&Stage> = self
            .stages
            .iter()
            .filter(|s| names.contains(&s.name))
            .collect();
        self.execute(&selected, registry, flow, events)
    }

    fn execute(
        &self,
        stages: &[&Stage],
        registry: &Registry,
        flow: &FileFlow,
        events: Option<&Sender<StageEvent>>,
    ) -> Result<PipelineReport, PipelineError> {
        let emit = |event: StageEvent| {
            if let Some(tx) = events {
                // A gone printer must not fail the build.
                let _ = tx.send(event);
            }
        };
        let started = Instant::now();
        let total = stages.len();
        let mut reports = Vec::with_capacity(total);

        for (i, stage) in stages.iter().enumerate() {
            let index = i + 1;
            emit(StageEvent::Started {
                index,
                total,
                stage: stage.name.clone(),
            });
            let stage_started = Instant::now();
            let outcome = match run_stage(stage, registry, flow) {
                Ok(outcome) => outcome,
                Err(e) => {
                    emit(StageEvent::Failed {
                        stage: stage.name.clone(),
                        message: e.to_string(),
                    });
                    return Err(e);
                }
            };
            let report = StageReport {
                name: stage.name.clone(),
                transform: stage.transform_name().to_string(),
                outcome,
                elapsed: stage_started.elapsed(),
            };
            emit(StageEvent::Finished {
                index,
                total,
                report: report.clone(),
            });
            reports.push(report);
        }

        Ok(PipelineReport {
            pipeline: self.name.clone(),
            mode: self.mode,
            stages: reports,
            elapsed: started.elapsed(),
        })
    }
}

/// Files an earlier stage left behind, as far as the static check knows.
struct Artifact {
    root: Root,
    glob: GlobMatcher,
    marks: BTreeSet<String>,
}

/// The most recent artifact whose glob covers `path`. Input patterns are
/// matched as literal text, so `img/**/*` covers `img/**/*.svg`.
fn latest_match<'a>(produced: &'a [Artifact], root: Root, path: &str) -> Option<&'a Artifact> {
    produced
        .iter()
        .rev()
        .find(|a| a.root == root && a.glob.is_match(path))
}

fn artifact_path(location: &Location, pattern: &str) -> String {
    if location.path.as_os_str().is_empty() {
        pattern.to_string()
    } else {
        format!("{}/{}", location.path.to_string_lossy(), pattern)
    }
}

fn artifact_glob(stage: &str, path: &str) -> Result<GlobMatcher, PipelineError> {
    GlobBuilder::new(path)
        .literal_separator(true)
        .build()
        .map(|glob| glob.compile_matcher())
        .map_err(|source| PipelineError::Pattern {
            stage: stage.to_string(),
            pattern: path.to_string(),
            source,
        })
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn run_stage(stage: &Stage, registry: &Registry, flow: &FileFlow) -> Result<Outcome, PipelineError> {
    match &stage.action {
        Action::Reset(root) => {
            flow.reset(*root).map_err(|source| PipelineError::Flow {
                stage: stage.name.clone(),
                source,
            })?;
            Ok(Outcome {
                note: Some(format!("reset {}", flow.root(*root).display())),
                ..Outcome::default()
            })
        }
        Action::Invoke { transform, options } => {
            let invocation = Invocation {
                stage: stage.name.clone(),
                inputs: stage
                    .inputs
                    .iter()
                    .map(|input| Input {
                        root: flow.resolve(&input.location),
                        patterns: input.patterns.clone(),
                    })
                    .collect(),
                output: flow.resolve(&stage.output),
                options: options.clone(),
            };
            registry
                .invoke(transform, &invocation)
                .map_err(|source| PipelineError::Stage {
                    stage: stage.name.clone(),
                    source,
                })
        }
    }
}

// ============================================================================
// The two pipelines
// ============================================================================

fn markup_stage(config: &PipelineConfig, mode: Mode) -> Stage {
    let (config_files, live_reload, output) = match mode {
        Mode::Dev => (
            config.markup.dev_config.clone(),
            Some(LIVE_RELOAD_PATH.to_string()),
            Location::intermediate(""),
        ),
        Mode::Dist => (
            config.markup.dist_config.clone(),
            None,
            Location::distribution(""),
        ),
    };
    Stage::invoke(
        "compile-markup",
        "markup",
        TransformOptions::Markup(MarkupOptions {
            config_files,
            live_reload,
            stylesheet: format!("css/{}", config.styles.output),
            script: format!("js/{}", config.scripts.output),
        }),
    )
    .read(Location::source(""), PAGE_PATTERNS)
    .write(output, &["**/*.html"])
}

fn style_stages(config: &PipelineConfig, out: Root) -> Vec<Stage> {
    let css = Location::new(out, "css");
    let fragments: Vec<&str> = config.styles.fragments.iter().map(String::as_str).collect();
    let output = config.styles.output.as_str();
    vec![
        Stage::invoke(
            "concat-styles",
            "concat-css",
            TransformOptions::Concat {
                output: output.to_string(),
            },
        )
        .read(Location::source(format!("{}/css", config.paths.assets)), &fragments)
        .write(css.clone(), &[output]),
        Stage::invoke("prefix-styles", "prefix-css", TransformOptions::Prefix)
            .read(css.clone(), &[output])
            .write(css, &[output])
            .mark("prefixed"),
    ]
}

fn script_stage(config: &PipelineConfig, out: Root, minify: bool) -> Stage {
    Stage::invoke(
        "bundle-scripts",
        "scripts",
        TransformOptions::Scripts {
            output: config.scripts.output.clone(),
            minify,
        },
    )
    .read(
        Location::source(format!("{}/js", config.paths.assets)),
        &["**/*.js"],
    )
    .write(Location::new(out, "js"), &[config.scripts.output.as_str()])
}

/// The live-preview pipeline: readable output in the intermediate
/// directory, followed by serving with live reload.
pub fn dev_pipeline(config: &PipelineConfig) -> Pipeline {
    let mut stages = vec![
        Stage::reset("clean", Root::Intermediate),
        markup_stage(config, Mode::Dev),
    ];
    stages.extend(style_stages(config, Root::Intermediate));
    stages.push(script_stage(config, Root::Intermediate, false));
    Pipeline {
        name: "serve".to_string(),
        mode: Mode::Dev,
        stages,
        after: AfterRun::ServeWithReload,
    }
}

/// The optimized build into the distribution directory.
///
/// `cache_dir` holds the raster optimization cache; with `read_cache` off
/// every image is re-encoded (and the cache refreshed).
pub fn dist_pipeline(
    config: &PipelineConfig,
    cache_dir: Option<PathBuf>,
    read_cache: bool,
) -> Pipeline {
    let img = Location::distribution("img");
    let css = Location::distribution("css");
    let site = Location::distribution("");
    let mut stages = vec![
        Stage::reset("clean", Root::Distribution),
        markup_stage(config, Mode::Dist),
        Stage::invoke(
            "copy-images",
            "copy",
            TransformOptions::Copy { flatten: true },
        )
        .read(
            Location::source(format!("{}/img", config.paths.assets)),
            &["**/*"],
        )
        .write(img.clone(), &["**/*"]),
        Stage::invoke(
            "optimize-raster",
            "optimize-raster",
            TransformOptions::Raster(RasterOptions {
                jpeg_quality: config.images.jpeg_quality,
                cache_dir,
                read_cache,
            }),
        )
        .read(img.clone(), &["**/*.{jpg,jpeg,png}"])
        .write(img.clone(), &["**/*.{jpg,jpeg,png}"])
        .mark("optimized"),
        Stage::invoke(
            "optimize-vector",
            "optimize-vector",
            TransformOptions::Vector,
        )
        .read(img.clone(), &["**/*.svg"])
        .write(img, &["**/*.svg"])
        .mark("optimized"),
    ];
    stages.extend(style_stages(config, Root::Distribution));
    let stylesheet = [config.styles.output.as_str()];
    stages.push(
        Stage::invoke("minify-styles", "minify-css", TransformOptions::MinifyCss)
            .read_marked(css.clone(), &stylesheet, &["prefixed"])
            .write(css.clone(), &stylesheet)
            .mark("minified"),
    );
    stages.push(script_stage(config, Root::Distribution, true));
    stages.push(
        Stage::invoke(
            "inline-critical",
            "critical-css",
            TransformOptions::Critical {
                fold_elements: config.critical.fold_elements,
                minify: config.critical.minify,
            },
        )
        .read(site.clone(), &["**/*.html"])
        .read_marked(css, &stylesheet, &["minified"])
        .write(site.clone(), &["**/*.html"])
        .mark("critical-inlined"),
    );
    stages.push(
        Stage::invoke(
            "minify-html",
            "minify-html",
            TransformOptions::MinifyHtml(config.html.clone()),
        )
        .read_marked(site.clone(), &["**/*.html"], &["critical-inlined"])
        .write(site, &["**/*.html"])
        .mark("minified"),
    );
    Pipeline {
        name: "build".to_string(),
        mode: Mode::Dist,
        stages,
        after: AfterRun::Exit,
    }
}

use clap::{Parser, Subcommand};
use sitepipe::flow::{Mode, tree_digest};
use sitepipe::mode::{self, Project, Target};
use sitepipe::pipeline::StageEvent;
use sitepipe::{config, output, watch};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc;
use std::thread::JoinHandle;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sitepipe")]
#[command(about = "Build pipeline and live-reloading dev server for a static blog")]
#[command(long_about = "\
Build pipeline and live-reloading dev server for a static blog

Project layout (all paths configurable in sitepipe.toml):

  sitepipe.toml                    # Project config (optional)
  blog/                            # Source tree, never written to
  ├── _config.toml                 # Site settings
  ├── _config.build.toml           # Production overrides (build only)
  ├── index.md                     # Pages: Markdown or HTML
  └── _assets/
      ├── css/                     # Stylesheet fragments, concatenated in order
      ├── js/                      # Scripts, bundled
      └── img/                     # Images, optimized on build
  .tmp/                            # Dev output (reset on every serve)
  _site/                           # Build output (reset on every build, .git* kept)

Commands:
  serve         Build readable output, serve it, rebuild and reload on change
  serve dist    Build the optimized site once and serve it
  build         Build the optimized site once and exit

Run 'sitepipe gen-config' to generate a documented sitepipe.toml.")]
#[command(version)]
struct Cli {
    /// Project config file
    #[arg(long, default_value = config::PROJECT_CONFIG_FILE, global = true)]
    config: PathBuf,

    /// Disable the image processing cache and re-encode every image
    #[arg(long, global = true)]
    no_cache: bool,

    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the dev pipeline with live reload, or the built site with `dist`
    Serve {
        /// `dist` to build once and serve the result
        target: Option<String>,
    },
    /// Build the optimized site into the distribution directory
    Build,
    /// Validate both pipelines and print their stages without running them
    Check,
    /// Print a stock sitepipe.toml with all options documented
    GenConfig,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let load = || -> Result<Project, mode::ModeError> {
        let base = cli
            .config
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut project = Project::load(&base, &cli.config)?;
        project.use_cache = !cli.no_cache;
        Ok(project)
    };

    match cli.command {
        Some(Command::Build) => {
            let project = load()?;
            init_thread_pool();
            let (tx, printer) = spawn_printer();
            let result = mode::build(&project, Some(&tx));
            drop(tx);
            join_printer(printer);
            let report = result?;
            let dist = project.flow(Mode::Dist).distribution;
            let digest = tree_digest(&dist)?;
            output::print_pipeline_report(&report, Some(&digest));
            println!("==> Build complete: {}", dist.display());
        }
        Some(Command::Check) => {
            let project = load()?;
            for mode in [Mode::Dev, Mode::Dist] {
                let pipeline = project.pipeline(mode);
                pipeline.validate(&project.registry)?;
                let rules = match mode {
                    Mode::Dev => watch::dev_watch_rules(&project.config),
                    Mode::Dist => Vec::new(),
                };
                watch::WatchRules::new(rules.clone())?.check_against(&pipeline)?;
                output::print_check_output(&pipeline, &rules);
                println!();
            }
            println!("==> Pipelines are valid");
        }
        Some(Command::GenConfig) => {
            print!("{}", config::stock_config_toml());
        }
        Some(Command::Serve { target }) => {
            serve(load()?, Target::parse(target.as_deref()))?;
        }
        None => serve(load()?, Target::Dev)?,
    }
    Ok(())
}

fn serve(project: Project, target: Target) -> Result<(), Box<dyn std::error::Error>> {
    init_thread_pool();
    let runtime = tokio::runtime::Runtime::new()?;
    let (tx, printer) = spawn_printer();
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutting down");
    };
    let result = runtime.block_on(async {
        match target {
            Target::Dev => mode::default(project, Some(tx), shutdown).await,
            Target::Dist => mode::serve(project, Target::Dist, Some(tx), shutdown).await,
        }
    });
    join_printer(printer);
    let (report, summary) = result?;
    output::print_pipeline_report(&report, None);
    if let Some(summary) = summary {
        println!(
            "==> {} rebuild(s), {} failed, {} reload(s)",
            summary.rebuilds, summary.failures, summary.notifications
        );
    }
    Ok(())
}

/// Stage events are printed on their own thread so transforms never block
/// on stdout.
fn spawn_printer() -> (mpsc::Sender<StageEvent>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let printer = std::thread::spawn(move || {
        for event in rx {
            output::print_stage_event(&event);
        }
    });
    (tx, printer)
}

fn join_printer(printer: JoinHandle<()>) {
    if printer.join().is_err() {
        tracing::warn!("Output thread panicked");
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "sitepipe=debug,tower_http=debug"
    } else {
        "sitepipe=info,tower_http=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Size the rayon pool to the available cores.
fn init_thread_pool() {
    let threads = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
        .ok();
}

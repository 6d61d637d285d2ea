// Command-line entry point: load a recipe and run its build pipeline
use clap::Parser;
use color_eyre::eyre::{Result, WrapErr};
use imgforge_actions::size::parse_human_size;
use imgforge_actions::{BuildContext, BuildStorage, NoMachine, Pipeline, Recipe};
use std::io::stderr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, registry, EnvFilter};

// Define the command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Build bootable OS disk images from declarative recipes", long_about = None)]
struct Cli {
    /// Recipe file to build
    recipe: PathBuf,

    /// Directory for the finished artifacts (defaults to the current directory)
    #[arg(long)]
    artifactdir: Option<PathBuf>,

    /// Directory for intermediate files (defaults to a temporary directory)
    #[arg(long)]
    scratchdir: Option<PathBuf>,

    /// Directory for the build machine's scratch disk
    #[arg(short = 'b', long, value_name = "DIR")]
    build_storage: Option<PathBuf>,

    /// Size of the build machine's scratch disk
    #[arg(long, default_value = "10gB")]
    build_storage_size: String,

    /// Run on the host even when a build machine is available
    #[arg(long, default_value_t = false)]
    disable_machine: bool,

    /// Block device prepared by the outer instance; set when running inside the build machine
    #[arg(long, hide = true)]
    internal_image: Option<PathBuf>,

    /// Start an interactive shell in the target root when the build fails
    #[arg(long, default_value_t = false)]
    debug_shell: bool,

    /// Shell used by --debug-shell
    #[arg(long, default_value = "/bin/bash")]
    shell: String,

    /// Verbose output - shows more detailed logs
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;

    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("imgforge={level},imgforge_actions={level}", level = level))
    });
    registry().with(filter).with(fmt::layer().with_writer(stderr)).init();

    debug!(?cli, "Parsed command line");

    let cwd = std::env::current_dir().wrap_err("failed to determine current directory")?;
    let build_storage = match &cli.build_storage {
        Some(dir) => {
            let size = parse_human_size(&cli.build_storage_size)
                .wrap_err("invalid --build-storage-size")?;
            Some(BuildStorage::new(absolute(&cwd, dir), size))
        }
        None => None,
    };

    let recipe_path = absolute(&cwd, &cli.recipe);
    let recipe = Recipe::load(&recipe_path)
        .wrap_err_with(|| format!("failed to load recipe {}", recipe_path.display()))?;
    let recipe_dir = recipe_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| cwd.clone());

    let artifactdir = cli
        .artifactdir
        .as_deref()
        .map(|dir| absolute(&cwd, dir))
        .unwrap_or_else(|| cwd.clone());

    let scratch = Scratch::create(&cwd, cli.scratchdir.as_deref())?;
    info!(scratch = %scratch.path().display(), artifacts = %artifactdir.display(), "Preparing build");

    let mut ctx = BuildContext::new(scratch.path(), &artifactdir, &recipe_dir, &recipe.architecture);
    if let Some(image) = &cli.internal_image {
        ctx = ctx.with_image(image);
    }
    if cli.debug_shell {
        ctx = ctx.with_debug_shell(&cli.shell);
    }

    let mut pipeline = Pipeline::new(recipe.into_actions(), &recipe_path);
    if cli.internal_image.is_some() {
        pipeline = pipeline.inside_machine();
    } else if cli.disable_machine {
        info!("Build machine disabled, running on the host");
    } else {
        pipeline = pipeline.select_machine(&NoMachine);
    }
    if let Some(storage) = build_storage {
        pipeline = pipeline.with_build_storage(storage);
    }

    match pipeline.run(&mut ctx).await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            error!(error = %e, "Build failed");
            if let Some(shell) = ctx.debug_shell() {
                run_debug_shell(shell, ctx.rootdir()).await;
            }
            scratch.keep();
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Scratch directory for one build
enum Scratch {
    /// Given on the command line; left in place
    Given(PathBuf),
    /// Created for this build and removed when dropped
    Temporary(tempfile::TempDir),
}

impl Scratch {
    fn create(cwd: &Path, given: Option<&Path>) -> Result<Self> {
        match given {
            Some(dir) => {
                let dir = absolute(cwd, dir);
                std::fs::create_dir_all(&dir)
                    .wrap_err_with(|| format!("failed to create scratch directory {}", dir.display()))?;
                Ok(Scratch::Given(dir))
            }
            None => {
                let dir = tempfile::Builder::new()
                    .prefix(".imgforge-")
                    .tempdir_in(cwd)
                    .wrap_err("failed to create scratch directory")?;
                Ok(Scratch::Temporary(dir))
            }
        }
    }

    fn path(&self) -> &Path {
        match self {
            Scratch::Given(dir) => dir,
            Scratch::Temporary(dir) => dir.path(),
        }
    }

    /// Leave the scratch directory behind for inspection
    ///
    /// A failed build may still have filesystems mounted below it.
    fn keep(self) {
        if let Scratch::Temporary(dir) = self {
            let dir = dir.keep();
            warn!(scratch = %dir.display(), "Keeping scratch directory of failed build");
        }
    }
}

async fn run_debug_shell(shell: &str, root: &Path) {
    info!(shell = %shell, dir = %root.display(), "Starting debug shell");
    let status = tokio::process::Command::new(shell)
        .current_dir(root)
        .status()
        .await;
    if let Err(e) = status {
        warn!(shell = %shell, error = %e, "Failed to start debug shell");
    }
}

fn absolute(cwd: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

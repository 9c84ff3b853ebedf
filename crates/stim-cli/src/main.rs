use clap::{Parser, Subcommand, ValueEnum};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use stim_core::{
    DisplayConfig, Error, ExperimentConfig, HardwareConfig, Result, StimulusSource, TrackerFamily,
};
use stim_repo::{Location, NewExperiment, Repository};
use stim_session::{
    connect_device, discover_managed, DeviceSession, HeadlessSurface, MarkerOutlet, NullSession,
    RemoteSocketSession, StimulusSession,
};

#[derive(Parser)]
#[command(
    name = "stim",
    version,
    about = "CLI for managing and running synchronized visual stimulation experiments"
)]
struct Cli {
    /// Repository root holding the active/, archive/ and exports/ locations.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Experiment lifecycle: create, archive, export, delete, inspect.
    #[command(subcommand)]
    Experiment(ExperimentCmd),
    /// Generate, shuffle and import stimulus asset lists.
    #[command(subcommand)]
    Assets(AssetsCmd),
    /// Execute presentation sessions.
    #[command(subcommand)]
    Run(RunCmd),
    /// Probe tracking hardware.
    #[command(subcommand)]
    Devices(DevicesCmd),
}

#[derive(Subcommand)]
enum ExperimentCmd {
    /// Create a new experiment skeleton in the active location.
    New {
        name: String,
        #[arg(long, default_value = "")]
        author: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Irreversibly delete an experiment and its active index entry.
    Delete {
        name: String,
        #[arg(long, short)]
        force: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Move an experiment from the active location to the archive.
    Archive {
        name: String,
        #[arg(long, short)]
        force: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Compress an experiment into a timestamped zip snapshot.
    Export {
        name: String,
        #[arg(long, short)]
        force: bool,
    },
    /// Check experiment structure and config fields, reporting every violation.
    Validate {
        /// Experiment name or an explicit directory path.
        target: String,
    },
    /// Show experiment metadata, display settings and existing exports.
    Info { name: String },
    /// List experiments per lifecycle location (directories are authoritative).
    List {
        #[arg(long, value_enum)]
        location: Option<LocationArg>,
    },
}

#[derive(Subcommand)]
enum AssetsCmd {
    /// Scan a stimulus folder and write a shuffled assets.txt.
    Generate {
        exp: String,
        /// Source folder; defaults to the experiment's OBJECTS directory.
        #[arg(long = "from", short)]
        from: Option<PathBuf>,
    },
    /// Re-shuffle an existing assets.txt in place.
    Shuffle { exp: String },
    /// Copy accepted images into OBJECTS, then regenerate assets.txt.
    Import {
        #[arg(long = "from", short)]
        from: PathBuf,
        #[arg(long, short)]
        exp: String,
    },
}

#[derive(Subcommand)]
enum RunCmd {
    /// Start a presentation session.
    Start {
        /// Experiment name; must resolve to the active location.
        #[arg(long, short)]
        exp: Option<String>,
        /// Explicit experiment directory, bypassing the repository.
        #[arg(long, short)]
        path: Option<PathBuf>,
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
        /// Capture each rendered frame into the output directory.
        #[arg(long)]
        capture: bool,
        /// Run without tracking hardware; markers are counted, not sent.
        #[arg(long)]
        dry_run: bool,
    },
    /// Check that an experiment is ready to run, including device reachability.
    Check {
        #[arg(long, short)]
        exp: Option<String>,
        #[arg(long, short)]
        path: Option<PathBuf>,
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
    },
}

#[derive(Subcommand)]
enum DevicesCmd {
    /// Probe for a managed-recording device on the network.
    Discover {
        #[arg(long)]
        address: Option<String>,
        #[arg(long, default_value_t = 5.0)]
        timeout: f64,
    },
    /// Query the clock of a protocol-socket device.
    Clock {
        #[arg(long)]
        address: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LocationArg {
    Active,
    Archive,
    Exports,
}

impl From<LocationArg> for Location {
    fn from(value: LocationArg) -> Self {
        match value {
            LocationArg::Active => Location::Active,
            LocationArg::Archive => Location::Archived,
            LocationArg::Exports => Location::Exported,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    #[value(name = "screen")]
    Screen,
    #[value(name = "asset-list")]
    AssetList,
}

impl From<ModeArg> for StimulusSource {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Screen => StimulusSource::Screen,
            ModeArg::AssetList => StimulusSource::AssetList,
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let repo = Repository::new(&cli.root);
    if let Err(err) = run_command(&repo, cli.command) {
        eprintln!("error: {}", err);
        std::process::exit(err.exit_code());
    }
}

fn run_command(repo: &Repository, command: Commands) -> Result<()> {
    match command {
        Commands::Experiment(cmd) => experiment_command(repo, cmd),
        Commands::Assets(cmd) => assets_command(repo, cmd),
        Commands::Run(cmd) => run_group_command(repo, cmd),
        Commands::Devices(cmd) => devices_command(cmd),
    }
}

fn experiment_command(repo: &Repository, command: ExperimentCmd) -> Result<()> {
    match command {
        ExperimentCmd::New {
            name,
            author,
            description,
        } => {
            let options = NewExperiment {
                author,
                description,
            };
            let path = repo.create(&name, &options)?;
            let config = ExperimentConfig::load_from(&path)?;
            println!("created: {}", path.display());
            println!("uuid: {}", config.experiment.uuid);
        }
        ExperimentCmd::Delete {
            name,
            force,
            dry_run,
        } => {
            let target = repo.experiment_dir(Location::Active, &name);
            if dry_run {
                println!("[dry-run] would delete {}", target.display());
                return Ok(());
            }
            if !force && !confirm(&format!("delete experiment '{}' permanently?", name))? {
                println!("aborted");
                return Ok(());
            }
            repo.delete(&name)?;
            println!("deleted: {}", name);
        }
        ExperimentCmd::Archive {
            name,
            force,
            dry_run,
        } => {
            if dry_run {
                println!(
                    "[dry-run] would move {} -> {}",
                    repo.experiment_dir(Location::Active, &name).display(),
                    repo.experiment_dir(Location::Archived, &name).display()
                );
                return Ok(());
            }
            if !force && !confirm(&format!("archive experiment '{}'?", name))? {
                println!("aborted");
                return Ok(());
            }
            let target = repo.archive(&name)?;
            println!("archived: {}", target.display());
        }
        ExperimentCmd::Export { name, force } => {
            let existing = repo.existing_exports(&name)?;
            if !existing.is_empty() && !force {
                println!("existing exports:");
                for zip in &existing {
                    println!("  {}", zip);
                }
                if !confirm("create another export with a new timestamp?")? {
                    println!("aborted");
                    return Ok(());
                }
            }
            let report = repo.export(&name)?;
            println!("exported: {}", report.zip_path.display());
            println!("source: {}", report.source.as_str());
            println!("sha256: {}", report.sha256);
        }
        ExperimentCmd::Validate { target } => {
            let dir = resolve_target_dir(repo, &target)?;
            let violations = repo.validate_dir(&dir)?;
            if violations.is_empty() {
                println!("ok: {}", dir.display());
            } else {
                for violation in &violations {
                    println!("violation: {}", violation);
                }
                return Err(Error::Validation(format!(
                    "{} violation(s) in {}",
                    violations.len(),
                    dir.display()
                )));
            }
        }
        ExperimentCmd::Info { name } => {
            let info = repo.info(&name)?;
            println!("name: {}", info.name);
            println!("location: {}", info.location.as_str());
            println!("path: {}", info.path.display());
            if let Some(config) = &info.config {
                println!("uuid: {}", config.experiment.uuid);
                println!("created: {}", config.experiment.created);
                println!("author: {}", config.experiment.author);
                println!("description: {}", config.experiment.description);
                println!("version: {}", config.experiment.version);
                println!("tracker: {}", config.hardware.tracker.as_str());
                println!("sampling_rate_hz: {}", config.recording.sampling_rate_hz);
                println!("stimulus_source: {:?}", config.session.source);
            }
            if let Some(display) = &info.display {
                println!(
                    "monitor: {}x{} @ {} Hz",
                    display.monitor.width_px,
                    display.monitor.height_px,
                    display.monitor.refresh_rate_hz
                );
                println!("screen_index: {}", display.display.screen_index);
            }
            if info.exports.is_empty() {
                println!("exports: none");
            } else {
                println!("exports:");
                for zip in &info.exports {
                    println!("  {}", zip);
                }
            }
        }
        ExperimentCmd::List { location } => {
            let locations = match location {
                Some(arg) => vec![Location::from(arg)],
                None => vec![Location::Active, Location::Archived, Location::Exported],
            };
            for location in locations {
                for name in repo.list(location)? {
                    println!("{}/{}", location.as_str(), name);
                }
            }
        }
    }
    Ok(())
}

fn assets_command(repo: &Repository, command: AssetsCmd) -> Result<()> {
    match command {
        AssetsCmd::Generate { exp, from } => {
            let exp_dir = resolve_active(repo, &exp)?;
            let config = load_config_or_default(&exp_dir)?;
            let source = from.unwrap_or_else(|| exp_dir.join(&config.paths.objects));
            let assets_path = exp_dir.join(stim_assets::ASSETS_FILE);

            let mut list = stim_assets::generate(&source)?;
            stim_assets::shuffle(&mut list)?;
            stim_assets::persist(&list, &assets_path)?;
            println!("assets file: {}", assets_path.display());
            println!("entries: {}", list.len());
        }
        AssetsCmd::Shuffle { exp } => {
            let exp_dir = resolve_active(repo, &exp)?;
            let assets_path = exp_dir.join(stim_assets::ASSETS_FILE);
            let mut list = stim_assets::load(&assets_path)?;
            stim_assets::shuffle(&mut list)?;
            stim_assets::persist(&list, &assets_path)?;
            println!("shuffled: {}", assets_path.display());
            println!("entries: {}", list.len());
        }
        AssetsCmd::Import { from, exp } => {
            let exp_dir = resolve_active(repo, &exp)?;
            let config = load_config_or_default(&exp_dir)?;
            let objects_dir = exp_dir.join(&config.paths.objects);
            let copied = stim_assets::import(&from, &objects_dir)?;
            println!("imported: {} file(s)", copied);

            let assets_path = exp_dir.join(stim_assets::ASSETS_FILE);
            let mut list = stim_assets::generate(&objects_dir)?;
            stim_assets::shuffle(&mut list)?;
            stim_assets::persist(&list, &assets_path)?;
            println!("assets file: {}", assets_path.display());
            println!("entries: {}", list.len());
        }
    }
    Ok(())
}

fn run_group_command(repo: &Repository, command: RunCmd) -> Result<()> {
    match command {
        RunCmd::Start {
            exp,
            path,
            mode,
            capture,
            dry_run,
        } => {
            let exp_dir = resolve_run_target(repo, exp.as_deref(), path)?;
            let mut config = load_config_or_default(&exp_dir)?;
            if capture {
                config.session.capture_frames = true;
            }
            let display = DisplayConfig::load_from(&exp_dir)?;

            let device: Box<dyn DeviceSession> = if dry_run {
                Box::new(NullSession::new())
            } else {
                connect_device(&config.hardware)?
            };
            let surface = HeadlessSurface::open(display.display.clone());
            let outlet = MarkerOutlet::open(
                &config.recording.marker_stream,
                &config.recording.marker_target,
            )?;

            let session = StimulusSession::new(
                &exp_dir,
                &config,
                mode.map(Into::into),
                Box::new(surface),
                device,
                outlet,
            )?;
            let report = session.run()?;
            println!("presented: {}", report.presented);
            println!("duration_s: {:.2}", report.duration.as_secs_f64());
            println!("recording_id: {}", report.recording_id);
            println!("order_file: {}", report.order_path.display());
        }
        RunCmd::Check { exp, path, mode } => {
            let exp_dir = resolve_run_target(repo, exp.as_deref(), path)?;
            let mut failures = 0usize;
            let mut report = |label: &str, outcome: Result<String>| match outcome {
                Ok(detail) => println!("check {}: ok ({})", label, detail),
                Err(e) => {
                    failures += 1;
                    println!("check {}: FAIL ({})", label, e);
                }
            };

            let config = match ExperimentConfig::load_from(&exp_dir) {
                Ok(config) => {
                    report("config", Ok("config/experiment.yml parsed".to_string()));
                    config
                }
                Err(e) => {
                    report("config", Err(e));
                    ExperimentConfig::default()
                }
            };

            let source = mode
                .map(StimulusSource::from)
                .unwrap_or(config.session.source);
            match source {
                StimulusSource::Screen => {
                    let objects_dir = exp_dir.join(&config.paths.objects);
                    report(
                        "stimuli",
                        stim_assets::generate(&objects_dir)
                            .map(|list| format!("{} image(s) in {}", list.len(), objects_dir.display())),
                    );
                }
                StimulusSource::AssetList => {
                    let assets_path = exp_dir.join(stim_assets::ASSETS_FILE);
                    report(
                        "stimuli",
                        stim_assets::load(&assets_path)
                            .map(|list| format!("{} identifier(s) in {}", list.len(), assets_path.display())),
                    );
                }
            }

            match config.hardware.tracker {
                TrackerFamily::Socket => {
                    report(
                        "device",
                        RemoteSocketSession::connect(&config.hardware.socket_address)
                            .and_then(|mut session| session.clock())
                            .map(|clock| format!("socket device clock {}", clock)),
                    );
                }
                TrackerFamily::Managed => {
                    report(
                        "device",
                        discover_managed(
                            &config.hardware.discovery_address,
                            Duration::from_secs_f64(config.hardware.discovery_timeout_s.max(0.1)),
                        )
                        .map(|session| format!("managed device at {}", session.base_url())),
                    );
                }
                TrackerFamily::None => {
                    report("device", Ok("no tracker configured".to_string()));
                }
            }

            if failures > 0 {
                return Err(Error::Validation(format!(
                    "environment not ready: {} check(s) failed",
                    failures
                )));
            }
            println!("ready: {}", exp_dir.display());
        }
    }
    Ok(())
}

fn devices_command(command: DevicesCmd) -> Result<()> {
    let defaults = HardwareConfig::default();
    match command {
        DevicesCmd::Discover { address, timeout } => {
            let address = address.unwrap_or(defaults.discovery_address);
            let session = discover_managed(&address, Duration::from_secs_f64(timeout.max(0.1)))?;
            println!("device: {}", session.base_url());
        }
        DevicesCmd::Clock { address } => {
            let address = address.unwrap_or(defaults.socket_address);
            let mut session = RemoteSocketSession::connect(&address)?;
            println!("clock: {}", session.clock()?);
        }
    }
    Ok(())
}

fn load_config_or_default(exp_dir: &Path) -> Result<ExperimentConfig> {
    if ExperimentConfig::path_in(exp_dir).exists() {
        ExperimentConfig::load_from(exp_dir)
    } else {
        Ok(ExperimentConfig::default())
    }
}

/// Resolve a name to its active-location directory; archived and exported
/// experiments are rejected for mutating or run operations.
fn resolve_active(repo: &Repository, name: &str) -> Result<PathBuf> {
    let (path, location) = repo.resolve(name)?;
    match location {
        Location::Active => Ok(path),
        Location::Archived => Err(Error::Validation(format!(
            "experiment '{}' is archived; move it back to the active location first",
            name
        ))),
        Location::Exported => Err(Error::Validation(format!(
            "experiment '{}' exists only as exports",
            name
        ))),
    }
}

fn resolve_run_target(
    repo: &Repository,
    exp: Option<&str>,
    path: Option<PathBuf>,
) -> Result<PathBuf> {
    match (exp, path) {
        (Some(_), Some(_)) => Err(Error::Validation(
            "provide either --exp or --path, not both".to_string(),
        )),
        (Some(name), None) => resolve_active(repo, name),
        (None, Some(path)) => {
            if !path.is_dir() {
                return Err(Error::NotFound(format!(
                    "experiment path not found: {}",
                    path.display()
                )));
            }
            Ok(path)
        }
        (None, None) => Err(Error::Validation(
            "provide --exp or --path".to_string(),
        )),
    }
}

fn resolve_target_dir(repo: &Repository, target: &str) -> Result<PathBuf> {
    let as_path = Path::new(target);
    if as_path.is_dir() {
        return Ok(as_path.to_path_buf());
    }
    let (path, _) = repo.resolve(target)?;
    Ok(path)
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{} [y/N]: ", prompt);
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(matches!(
        line.trim().to_ascii_lowercase().as_str(),
        "y" | "yes"
    ))
}

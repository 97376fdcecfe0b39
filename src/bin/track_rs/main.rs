use std::{path::PathBuf, process::ExitCode};

use clap::{Args, Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use error_stack::ResultExt;
use track_rs::{
    config::{TrackConfig, TrackInstall},
    descriptor::SourceKind,
    error::PipelineError,
    logging::init_logging,
    naming::{Hemisphere, SourceFilter},
    preprocess::TrackingVariable,
};

mod add_field;
mod list;
mod setup;
mod stats;
mod track;

fn main() -> ExitCode {
    let clargs = Cli::parse();
    init_logging(clargs.verbosity.log_level_filter(), clargs.log_file.as_deref());

    match driver(clargs) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("track-rs did not complete successfully:\n{e:?}");
            ExitCode::FAILURE
        }
    }
}

fn driver(clargs: Cli) -> error_stack::Result<(), CliError> {
    let config = TrackConfig::load(clargs.config.as_deref())
        .change_context(CliError::ReadingConfig)?;

    match clargs.command {
        Commands::Track(args) => track::driver(&config, args),
        Commands::Stats(args) => stats::driver(&config, args),
        Commands::AddField(args) => add_field::driver(&config, args),
        Commands::List(args) => list::driver(args),
        Commands::Setup(args) => setup::driver(&config, args),
        Commands::Config => {
            let s = toml::to_string_pretty(&config)
                .change_context(CliError::ReadingConfig)?;
            print!("{s}");
            Ok(())
        },
    }
}

/// Locate the tracker installation named by the configuration.
pub(crate) fn locate_install(config: &TrackConfig) -> error_stack::Result<TrackInstall, PipelineError> {
    let install = config.install().change_context(PipelineError::Config)?;
    log::debug!("Using the tracker installation at {}", install.root.display());
    Ok(install)
}

/// Run the TRACK feature tracker over climate data and post-process its output.
#[derive(Debug, Parser)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    /// A TOML file with settings that override the defaults; TRACK_RS_*
    /// environmental variables override both.
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    /// Also write log messages (at least DEBUG level) to this file.
    #[clap(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(flatten)]
    verbosity: Verbosity<InfoLevel>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Preprocess input files and track cyclones in them.
    Track(TrackCli),
    /// Combine the yearly track files in a directory and compute their statistics.
    Stats(StatsCli),
    /// Average an auxiliary field around each point of an existing track file.
    AddField(AddFieldCli),
    /// List the input files a track run over a directory would use.
    List(ListCli),
    /// Install the control-file templates into the tracker directory.
    Setup(SetupCli),
    /// Print the effective configuration as TOML.
    Config,
}

/// Which input files to use when searching a directory.
#[derive(Debug, Args)]
pub(crate) struct SourceSelection {
    /// First year to include.
    #[clap(long)]
    pub(crate) year_start: Option<i32>,

    /// Last year to include (inclusive).
    #[clap(long)]
    pub(crate) year_end: Option<i32>,

    /// Only files from this experiment (climate model files only).
    #[clap(long)]
    pub(crate) experiment: Option<String>,

    /// Only files from this ensemble member (climate model files only).
    #[clap(long)]
    pub(crate) ensemble: Option<String>,

    /// Only files for this season, e.g. "DJF".
    #[clap(long)]
    pub(crate) season: Option<String>,
}

impl SourceSelection {
    pub(crate) fn filter(&self, kind: SourceKind, variable: Option<&str>) -> SourceFilter {
        let mut filter = SourceFilter::new(
            kind,
            self.year_start.unwrap_or(i32::MIN),
            self.year_end.unwrap_or(i32::MAX),
        );
        filter.variable = variable.map(|v| v.to_string());
        filter.experiment = self.experiment.clone();
        filter.ensemble = self.ensemble.clone();
        filter.season = self.season.clone();
        filter
    }
}

#[derive(Debug, Args)]
pub(crate) struct TrackCli {
    /// Input files: one sea level pressure file, or for vorticity one file with both
    /// wind components or the U and V files in either order. Not needed with --source-dir.
    #[clap(required_unless_present("source_dir"))]
    pub(crate) inputs: Vec<PathBuf>,

    /// Search this directory for the input files instead of listing them.
    #[clap(long)]
    pub(crate) source_dir: Option<PathBuf>,

    #[command(flatten)]
    pub(crate) selection: SourceSelection,

    /// Field to track.
    #[clap(short = 't', long, default_value_t = TrackingVariable::Pressure)]
    pub(crate) variable: TrackingVariable,

    /// Hemisphere to track in.
    #[clap(short = 'H', long, default_value = "NH", ignore_case = true)]
    pub(crate) hemisphere: Hemisphere,

    /// Kind of input data, which determines variable and coordinate names.
    #[clap(short = 'k', long, default_value_t = SourceKind::Reanalysis)]
    pub(crate) source_kind: SourceKind,

    /// Track each calendar year of the input separately instead of only the last year.
    #[clap(long)]
    pub(crate) year_split: bool,

    /// Also convert the dated trajectories to netCDF.
    #[clap(long)]
    pub(crate) netcdf: bool,

    /// Directory under which the per-year run directories are created.
    #[clap(short, long)]
    pub(crate) output_root: PathBuf,
}

#[derive(Debug, Args)]
pub(crate) struct StatsCli {
    /// Directory containing the per-year run directories.
    pub(crate) dir: PathBuf,

    /// Name of the track file to combine from each run directory.
    #[clap(short, long, default_value = "tr_trs_neg")]
    pub(crate) artifact: String,

    /// Suffix for the combined and statistics files.
    #[clap(short, long)]
    pub(crate) label: String,

    /// First year to combine; the earliest year found if not given.
    #[clap(long)]
    pub(crate) year_start: Option<i32>,

    /// Last year to combine; the latest year found if not given.
    #[clap(long)]
    pub(crate) year_end: Option<i32>,
}

#[derive(Debug, Args)]
pub(crate) struct AddFieldCli {
    /// File containing the field to average.
    pub(crate) aux_file: PathBuf,

    /// The (step-indexed) track file to add the field to.
    pub(crate) track_file: PathBuf,

    /// Name of the field variable in the auxiliary file.
    #[clap(short, long)]
    pub(crate) field: String,

    /// Radius in degrees to average over.
    #[clap(short, long)]
    pub(crate) radius: f64,

    /// Factor to multiply the field by.
    #[clap(short, long, default_value_t = 1.0)]
    pub(crate) scaling: f64,

    /// Hours to shift the auxiliary file's timestamps by when dating the new track file.
    #[clap(long, default_value_t = 0, allow_hyphen_values = true)]
    pub(crate) hour_shift: i64,

    /// Kind of auxiliary data.
    #[clap(short = 'k', long, default_value_t = SourceKind::Reanalysis)]
    pub(crate) source_kind: SourceKind,
}

#[derive(Debug, Args)]
pub(crate) struct ListCli {
    /// Directory to search.
    pub(crate) dir: PathBuf,

    #[command(flatten)]
    pub(crate) selection: SourceSelection,

    /// Only files containing this variable, e.g. "msl".
    #[clap(long)]
    pub(crate) variable: Option<String>,

    /// Kind of input data, which determines the file name pattern.
    #[clap(short = 'k', long, default_value_t = SourceKind::Reanalysis)]
    pub(crate) source_kind: SourceKind,

    /// Print a JSON array instead of one path per line.
    #[clap(long)]
    pub(crate) json: bool,
}

#[derive(Debug, Args)]
pub(crate) struct SetupCli {
    /// Directory with the templates to install (`indat/template.*.in`, `trackdir/`,
    /// `data/`). Defaults to `templates_dir` from the configuration.
    #[clap(long)]
    pub(crate) templates_dir: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    #[error("An error occurred while reading the configuration")]
    ReadingConfig,
    #[error("Tracking did not complete")]
    Tracking,
    #[error("Computing the track statistics did not complete")]
    Statistics,
    #[error("Adding the field to the track file did not complete")]
    AddingField,
    #[error("An error occurred while searching for input files")]
    Discovery,
    #[error("An error occurred while installing the templates")]
    Setup,
    #[error("Error in arguments: {0}")]
    BadInput(String),
}

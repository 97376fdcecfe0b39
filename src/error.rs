//! Common errors across the track-rs crate
use std::path::PathBuf;

/// Errors that end one unit of work (one input file, one year, or one aggregation call).
///
/// The variants are deliberately coarse so that calling automation can branch on the
/// failure category; details are carried as attachments on the `error_stack::Report`.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The input file could not be opened or does not look like a gridded dataset
    /// of the expected kind (e.g. it lacks the expected coordinate variables).
    #[error("Could not use {} as an input dataset: {reason}", path.display())]
    InvalidFile { path: PathBuf, reason: String },

    /// A physical variable required for this kind of tracking or field is absent.
    #[error("Variable '{variable}' is required but not present in {}", path.display())]
    MissingVariable { path: PathBuf, variable: String },

    /// Neither of two wind files declares a recognizable U or V component as its trailing variable.
    #[error("Neither {} nor {} declares '{u_name}' or '{v_name}' as its last variable, cannot tell U from V", file1.display(), file2.display())]
    AmbiguousWindComponent {
        file1: PathBuf,
        file2: PathBuf,
        u_name: &'static str,
        v_name: &'static str,
    },

    /// Some years in the requested aggregation range have no track file.
    #[error("Cannot combine '{artifact}' for {first}-{last}: no file for year(s) {}", fmt_years(.missing))]
    IncompleteYearRange {
        artifact: String,
        first: i32,
        last: i32,
        missing: Vec<i32>,
    },

    /// An external tool ran but the file it should have produced is not there.
    #[error("Expected artifact {} does not exist", .0.display())]
    MissingArtifact(PathBuf),

    /// An external tool could not be run or exited with an error.
    #[error("An external tool failed while {0}")]
    ExternalTool(String),

    /// The caller passed a value that cannot be used (e.g. a non-positive step count).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A filesystem operation that is not itself an external tool call failed.
    #[error("I/O error involving {}", .0.display())]
    Io(PathBuf),

    /// The tracker installation or the configuration is unusable.
    #[error("Configuration error")]
    Config,
}

impl PipelineError {
    pub fn invalid_file<P: Into<PathBuf>, S: ToString>(path: P, reason: S) -> Self {
        Self::InvalidFile { path: path.into(), reason: reason.to_string() }
    }

    pub fn missing_variable<P: Into<PathBuf>, S: ToString>(path: P, variable: S) -> Self {
        Self::MissingVariable { path: path.into(), variable: variable.to_string() }
    }

    pub fn external_tool<S: ToString>(during: S) -> Self {
        Self::ExternalTool(during.to_string())
    }

    pub fn invalid_input<S: ToString>(msg: S) -> Self {
        Self::InvalidInput(msg.to_string())
    }

    pub fn io<P: Into<PathBuf>>(path: P) -> Self {
        Self::Io(path.into())
    }

    /// Whether a batch should skip this item and carry on with the next one.
    ///
    /// Gaps in a year range and missing tracker output only invalidate the current
    /// item; validation failures mean the batch itself is set up wrong.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::IncompleteYearRange { .. } | Self::MissingArtifact(_) | Self::ExternalTool(_))
    }
}

fn fmt_years(years: &[i32]) -> String {
    years.iter().map(|y| y.to_string()).collect::<Vec<_>>().join(", ")
}

/// Errors related to reading timestamps out of dataset metadata
#[derive(Debug, thiserror::Error)]
pub enum DateTimeError {
    #[error("'{0}' is not a date in YYYY-MM-DD form")]
    InvalidDate(String),
    #[error("'{0}' is not a time of day in HH:MM:SS form")]
    InvalidTime(String),
    #[error("Dataset lists no timestamps")]
    NoTimestamps,
    #[error("Time step from {first} to {second} is not positive")]
    NonPositiveStep { first: String, second: String },
}

//! File and directory naming conventions.
//!
//! Input files are found by their names, so the two naming schemes in use are parsed
//! eagerly into a [`SourceName`] rather than picked apart by token position wherever a
//! field is needed. Reanalysis files look like `ERA5_msl_6hr_1950.nc` or
//! `ERA5_msl_6hr_1950_SON.nc`; climate model files follow the CMIP pattern
//! `psl_6hrPlev_EC-Earth3_historical_r1i1p1f1_gr_2007_SON.nc`, where the year token may
//! also be a date range (`200701-200712`) whose first four digits are the year.
//!
//! Per-run output directories are named `{hemisphere}_{year}_{label}`, see [`RunDirName`].
use std::{
    fmt::Display,
    path::{Path, PathBuf},
    str::FromStr,
};

use error_stack::ResultExt;

use crate::{descriptor::SourceKind, error::PipelineError};

/// Suffix of the intermediate files written when two wind components are merged;
/// these are never inputs themselves.
pub const MERGED_SUFFIX: &str = "_merged.nc";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NameError {
    #[error("'{0}' does not end in .nc")]
    NotNetcdf(String),
    #[error("'{name}' has {ntok} underscore-separated fields, which matches no known naming scheme")]
    WrongFieldCount { name: String, ntok: usize },
    #[error("'{name}' has '{token}' where a year was expected")]
    BadYear { name: String, token: String },
    #[error("'{0}' is not a valid run directory name")]
    BadRunDir(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, strum::Display, strum::EnumString, clap::ValueEnum)]
pub enum Hemisphere {
    #[value(name = "NH")]
    NH,
    #[value(name = "SH")]
    SH,
}

impl Hemisphere {
    /// Hemisphere token used in the tracker's initialisation file names.
    pub fn tracker_token(&self) -> &'static str {
        match self {
            Hemisphere::NH => "NH",
            Hemisphere::SH => "SH",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReanalysisName {
    pub product: String,
    pub variable: String,
    pub frequency: String,
    pub year: i32,
    pub season: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelName {
    pub variable: String,
    pub table: String,
    pub model: String,
    pub experiment: String,
    pub ensemble: String,
    pub grid: String,
    pub year: i32,
    pub season: Option<String>,
}

/// The parsed name of an input file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceName {
    Reanalysis(ReanalysisName),
    Model(ModelName),
}

impl SourceName {
    /// Parse a file name (not a full path) according to the naming scheme for `kind`.
    pub fn parse(file_name: &str, kind: SourceKind) -> Result<Self, NameError> {
        let stem = file_name
            .strip_suffix(".nc")
            .ok_or_else(|| NameError::NotNetcdf(file_name.to_string()))?;
        let parts: Vec<&str> = stem.split('_').collect();

        match kind {
            SourceKind::Reanalysis => {
                if !(4..=5).contains(&parts.len()) {
                    return Err(NameError::WrongFieldCount { name: file_name.to_string(), ntok: parts.len() });
                }
                Ok(Self::Reanalysis(ReanalysisName {
                    product: parts[0].to_string(),
                    variable: parts[1].to_string(),
                    frequency: parts[2].to_string(),
                    year: parse_year(file_name, parts[3])?,
                    season: parts.get(4).map(|s| s.to_string()),
                }))
            },
            SourceKind::ClimateModel => {
                if !(7..=8).contains(&parts.len()) {
                    return Err(NameError::WrongFieldCount { name: file_name.to_string(), ntok: parts.len() });
                }
                Ok(Self::Model(ModelName {
                    variable: parts[0].to_string(),
                    table: parts[1].to_string(),
                    model: parts[2].to_string(),
                    experiment: parts[3].to_string(),
                    ensemble: parts[4].to_string(),
                    grid: parts[5].to_string(),
                    year: parse_year(file_name, parts[6])?,
                    season: parts.get(7).map(|s| s.to_string()),
                }))
            },
        }
    }

    pub fn year(&self) -> i32 {
        match self {
            Self::Reanalysis(n) => n.year,
            Self::Model(n) => n.year,
        }
    }

    pub fn variable(&self) -> &str {
        match self {
            Self::Reanalysis(n) => &n.variable,
            Self::Model(n) => &n.variable,
        }
    }

    pub fn season(&self) -> Option<&str> {
        match self {
            Self::Reanalysis(n) => n.season.as_deref(),
            Self::Model(n) => n.season.as_deref(),
        }
    }

    pub fn experiment(&self) -> Option<&str> {
        match self {
            Self::Reanalysis(_) => None,
            Self::Model(n) => Some(&n.experiment),
        }
    }

    pub fn ensemble(&self) -> Option<&str> {
        match self {
            Self::Reanalysis(_) => None,
            Self::Model(n) => Some(&n.ensemble),
        }
    }
}

fn parse_year(name: &str, token: &str) -> Result<i32, NameError> {
    let bad = || NameError::BadYear { name: name.to_string(), token: token.to_string() };
    let digits = token.get(..4).ok_or_else(bad)?;
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(bad());
    }
    digits.parse().map_err(|_| bad())
}

/// Criteria for selecting input files; `None` fields match anything.
#[derive(Debug, Clone)]
pub struct SourceFilter {
    pub kind: SourceKind,
    pub variable: Option<String>,
    pub experiment: Option<String>,
    pub ensemble: Option<String>,
    pub season: Option<String>,
    pub year_start: i32,
    pub year_end: i32,
}

impl SourceFilter {
    pub fn new(kind: SourceKind, year_start: i32, year_end: i32) -> Self {
        Self { kind, variable: None, experiment: None, ensemble: None, season: None, year_start, year_end }
    }

    pub fn matches(&self, name: &SourceName) -> bool {
        fn field_ok(want: &Option<String>, have: Option<&str>) -> bool {
            match want {
                Some(w) => have == Some(w.as_str()),
                None => true,
            }
        }

        (self.year_start..=self.year_end).contains(&name.year())
            && field_ok(&self.variable, Some(name.variable()))
            && field_ok(&self.season, name.season())
            && field_ok(&self.experiment, name.experiment())
            && field_ok(&self.ensemble, name.ensemble())
    }
}

/// Recursively find the input files under `dir` whose names parse and match `filter`,
/// sorted by path. Files whose names don't follow the naming scheme are skipped with a
/// debug message; preprocessing intermediates are always skipped.
pub fn discover_sources(dir: &Path, filter: &SourceFilter) -> error_stack::Result<Vec<(PathBuf, SourceName)>, PipelineError> {
    if !dir.is_dir() {
        return Err(PipelineError::io(dir))
            .attach_printable("the directory to search for input files does not exist");
    }

    let pattern = format!("{}/**/*.nc", glob::Pattern::escape(&dir.to_string_lossy()));
    let paths = glob::glob(&pattern)
        .change_context_lazy(|| PipelineError::invalid_input(format!("cannot search {}", dir.display())))?;

    let mut found = vec![];
    for entry in paths {
        let path = entry.change_context_lazy(|| PipelineError::io(dir))
            .attach_printable("could not list directory while searching for input files")?;
        if path.is_dir() {
            continue;
        }

        let file_name = match path.file_name() {
            Some(n) => n.to_string_lossy().to_string(),
            None => continue,
        };
        if is_intermediate(&file_name) {
            continue;
        }
        match SourceName::parse(&file_name, filter.kind) {
            Ok(name) if filter.matches(&name) => found.push((path, name)),
            Ok(_) => (),
            Err(e) => log::debug!("Skipping {}: {e}", path.display()),
        }
    }

    found.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(found)
}

/// Name of the directory holding the tracker output for one hemisphere and year.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDirName {
    pub hemisphere: Hemisphere,
    pub year: i32,
    pub label: String,
}

impl RunDirName {
    pub fn new<S: ToString>(hemisphere: Hemisphere, year: i32, label: S) -> Self {
        Self { hemisphere, year, label: label.to_string() }
    }
}

impl Display for RunDirName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}_{}", self.hemisphere, self.year, self.label)
    }
}

impl FromStr for RunDirName {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || NameError::BadRunDir(s.to_string());
        let mut parts = s.splitn(3, '_');
        let hemisphere = parts.next().and_then(|h| h.parse::<Hemisphere>().ok()).ok_or_else(bad)?;
        let year = parts.next()
            .filter(|y| y.len() == 4)
            .and_then(|y| y.parse::<i32>().ok())
            .ok_or_else(bad)?;
        let label = parts.next().filter(|l| !l.is_empty()).ok_or_else(bad)?;
        Ok(Self { hemisphere, year, label: label.to_string() })
    }
}

/// Which extrema a track listing follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum TrackSign {
    Pos,
    Neg,
}

/// The two listings the tracker writes for each sign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    /// Filtered feature points (`ff_trs_*`).
    Raw,
    /// Linked trajectories (`tr_trs_*`).
    Trajectory,
}

impl ArtifactKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Raw => "ff_trs",
            Self::Trajectory => "tr_trs",
        }
    }

    /// File name of this listing for `sign` in a run directory, e.g. `tr_trs_neg`.
    pub fn file_name(&self, sign: TrackSign) -> String {
        format!("{}_{sign}", self.prefix())
    }
}

/// One track listing written by the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackArtifact {
    pub path: PathBuf,
    pub sign: TrackSign,
    pub kind: ArtifactKind,
    /// True until the time step indices have been rewritten as dates.
    pub step_indexed: bool,
}

impl TrackArtifact {
    pub fn in_run_dir(run_dir: &Path, kind: ArtifactKind, sign: TrackSign) -> Self {
        Self { path: run_dir.join(kind.file_name(sign)), sign, kind, step_indexed: true }
    }

    /// Where the date-resolved copy of `artifact` goes: `dates/<name>` beside it.
    pub fn dated_path(artifact: &Path) -> PathBuf {
        let name = artifact.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        artifact.parent().unwrap_or(Path::new(".")).join("dates").join(name)
    }

    /// The same listing after date resolution.
    pub fn dated(&self) -> Self {
        Self { path: Self::dated_path(&self.path), step_indexed: false, ..self.clone() }
    }
}

/// Suffixes the preprocessing adds to file stems, removed again to form run labels.
const PROCESSING_SUFFIXES: [&str; 4] = ["_filled", "_gaussian", "_extr", "_merged"];

/// Whether `file_name` was written by the preprocessing rather than being an input.
pub fn is_intermediate(file_name: &str) -> bool {
    let stem = file_name.strip_suffix(".nc").unwrap_or(file_name);
    PROCESSING_SUFFIXES.iter().any(|s| stem.ends_with(s))
}

/// The label used in run directory names for an input file: its stem, without any
/// suffixes the preprocessing added.
pub fn run_label(input: &Path) -> String {
    let mut stem = crate::utils::file_stem_string(input).unwrap_or_else(|| "run".to_string());
    loop {
        match PROCESSING_SUFFIXES.iter().find(|s| stem.ends_with(*s)) {
            Some(suffix) => stem.truncate(stem.len() - suffix.len()),
            None => return stem,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reanalysis() {
        let name = SourceName::parse("ERA5_msl_6hr_1950_SON.nc", SourceKind::Reanalysis).unwrap();
        assert_eq!(name, SourceName::Reanalysis(ReanalysisName {
            product: "ERA5".to_string(),
            variable: "msl".to_string(),
            frequency: "6hr".to_string(),
            year: 1950,
            season: Some("SON".to_string()),
        }));

        let name = SourceName::parse("ERA5_u_6hr_2004.nc", SourceKind::Reanalysis).unwrap();
        assert_eq!(name.year(), 2004);
        assert_eq!(name.season(), None);
    }

    #[test]
    fn test_parse_model() {
        let name = SourceName::parse("psl_6hrPlev_EC-Earth3_historical_r1i1p1f1_gr_200701-200712_SON.nc", SourceKind::ClimateModel).unwrap();
        assert_eq!(name.year(), 2007);
        assert_eq!(name.experiment(), Some("historical"));
        assert_eq!(name.ensemble(), Some("r1i1p1f1"));
        assert_eq!(name.season(), Some("SON"));
    }

    #[test]
    fn test_bad_names() {
        assert_eq!(
            SourceName::parse("ERA5_msl_6hr_1950_SON_x.nc", SourceKind::Reanalysis),
            Err(NameError::WrongFieldCount { name: "ERA5_msl_6hr_1950_SON_x.nc".to_string(), ntok: 6 })
        );
        assert!(matches!(SourceName::parse("ERA5_msl_6hr_19x0.nc", SourceKind::Reanalysis), Err(NameError::BadYear { .. })));
        assert!(matches!(SourceName::parse("ERA5_msl_6hr_1950.grb", SourceKind::Reanalysis), Err(NameError::NotNetcdf(_))));
    }

    #[test]
    fn test_run_dir_name() {
        let name = RunDirName::new(Hemisphere::SH, 2004, "ERA5_msl_6hr_2004_SON");
        assert_eq!(name.to_string(), "SH_2004_ERA5_msl_6hr_2004_SON");
        let parsed: RunDirName = "SH_2004_ERA5_msl_6hr_2004_SON".parse().unwrap();
        assert_eq!(parsed, name);
        assert!("total".parse::<RunDirName>().is_err());
        assert!("NH_04_x".parse::<RunDirName>().is_err());
    }

    #[test]
    fn test_run_label() {
        assert_eq!(run_label(Path::new("/d/temp_uv/ERA5_uv_6hr_1950_merged_extr_gaussian_filled.nc")), "ERA5_uv_6hr_1950");
        assert_eq!(run_label(Path::new("psl_2000.nc")), "psl_2000");
    }

    #[test]
    fn test_artifact_paths() {
        let art = TrackArtifact::in_run_dir(Path::new("/out/NH_2004_x"), ArtifactKind::Trajectory, TrackSign::Neg);
        assert_eq!(art.path, PathBuf::from("/out/NH_2004_x/tr_trs_neg"));
        assert_eq!(art.dated().path, PathBuf::from("/out/NH_2004_x/dates/tr_trs_neg"));
        assert!(!art.dated().step_indexed);
    }

    #[test]
    fn test_discover_sources() {
        let dir = tempdir::TempDir::new("naming").unwrap();
        let sub = dir.path().join("msl");
        std::fs::create_dir_all(&sub).unwrap();
        for name in [
            "ERA5_msl_6hr_1951.nc",
            "ERA5_msl_6hr_1950.nc",
            "ERA5_msl_6hr_1960.nc",
            "ERA5_u_6hr_1950.nc",
            "ERA5_uv_6hr_1950_merged.nc",
            "ERA5_msl_6hr_1950_extr.nc",
            "README.txt",
        ] {
            std::fs::write(sub.join(name), "").unwrap();
        }

        let mut filter = SourceFilter::new(SourceKind::Reanalysis, 1950, 1955);
        filter.variable = Some("msl".to_string());
        let found = discover_sources(dir.path(), &filter).unwrap();
        let names: Vec<_> = found.iter().map(|(p, _)| p.file_name().unwrap().to_string_lossy().to_string()).collect();
        assert_eq!(names, ["ERA5_msl_6hr_1950.nc", "ERA5_msl_6hr_1951.nc"]);
    }

    #[test]
    fn test_discover_nested_and_missing() {
        let dir = tempdir::TempDir::new("naming").unwrap();
        let deep = dir.path().join("ERA5/u/SON");
        std::fs::create_dir_all(&deep).unwrap();
        std::fs::write(deep.join("ERA5_u_6hr_2000_SON.nc"), "").unwrap();
        std::fs::write(dir.path().join("ERA5_u_6hr_2001.nc"), "").unwrap();

        let filter = SourceFilter::new(SourceKind::Reanalysis, 2000, 2001);
        let found = discover_sources(dir.path(), &filter).unwrap();
        let years: Vec<_> = found.iter().map(|(_, n)| n.year()).collect();
        assert_eq!(years, [2000, 2001]);

        let err = discover_sources(&dir.path().join("nope"), &filter).unwrap_err();
        assert!(matches!(err.current_context(), PipelineError::Io(_)));
    }
}

//! Rewriting the tracker's time step indices as dates.
//!
//! The tracker numbers time steps from 1 within each file it is given, so listings from
//! different years cannot be combined until each has been converted to absolute
//! timestamps with the tracker's `count` utility. That utility needs the first
//! timestamp (YYYYMMDDHH) and the step length in hours, both taken from the file the
//! tracker read.
use std::{
    fs::File,
    path::{Path, PathBuf},
};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use error_stack::ResultExt;

use crate::{
    config::TrackInstall,
    descriptor::SourceKind,
    error::{DateTimeError, PipelineError},
    naming::TrackArtifact,
    tools::{require_output, ClimateTools, ToolCommand, ToolResultExt},
    utils,
};

/// The arguments the `count` utility needs to date a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartTime {
    /// First time step, as YYYYMMDDHH.
    pub timestamp: String,
    pub cadence_hours: i64,
}

/// Work out the first timestamp and step length from a file's first one or two time
/// steps (`YYYY-MM-DDTHH:MM:SS`), shifted by `hour_shift` hours.
///
/// Reanalysis files take their step from the difference of the first two steps;
/// model output is assumed to be `model_step_hours` apart.
pub fn compute_start(
    first: &str,
    second: Option<&str>,
    kind: SourceKind,
    hour_shift: i64,
    model_step_hours: i64,
) -> Result<StartTime, DateTimeError> {
    let t1 = parse_timestamp(first)?;
    let start = t1 + TimeDelta::hours(hour_shift);

    let cadence_hours = match kind {
        SourceKind::ClimateModel => model_step_hours,
        SourceKind::Reanalysis => {
            let second = second.ok_or(DateTimeError::NoTimestamps)?;
            let step = (parse_timestamp(second)? - t1).num_hours();
            if step <= 0 {
                return Err(DateTimeError::NonPositiveStep { first: first.to_string(), second: second.to_string() });
            }
            step
        },
    };

    Ok(StartTime { timestamp: start.format("%Y%m%d%H").to_string(), cadence_hours })
}

fn parse_timestamp(s: &str) -> Result<NaiveDateTime, DateTimeError> {
    let (date, time) = s.split_once('T').unwrap_or((s, "00:00:00"));
    let date = NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|_| DateTimeError::InvalidDate(date.to_string()))?;
    let time = NaiveTime::parse_from_str(time, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(time, "%H:%M"))
        .map_err(|_| DateTimeError::InvalidTime(time.to_string()))?;
    Ok(NaiveDateTime::new(date, time))
}

/// Make sure `artifact` exists uncompressed, unpacking `<artifact>.gz` if only that is there.
///
/// The compressed file is removed after a successful unpack.
pub fn ensure_decompressed(artifact: &Path) -> error_stack::Result<(), PipelineError> {
    if artifact.exists() {
        return Ok(());
    }

    let gz = gz_path(artifact);
    if !gz.exists() {
        return Err(PipelineError::MissingArtifact(artifact.to_path_buf()))
            .attach_printable_lazy(|| format!("neither {} nor {} exists", artifact.display(), gz.display()));
    }

    log::debug!("Decompressing {}", gz.display());
    let input = File::open(&gz).change_context_lazy(|| PipelineError::io(&gz))?;
    let mut decoder = flate2::read::GzDecoder::new(input);
    let mut output = File::create(artifact).change_context_lazy(|| PipelineError::io(artifact))?;
    if let Err(e) = std::io::copy(&mut decoder, &mut output) {
        // Don't leave a truncated listing that would be mistaken for a good one
        drop(output);
        let _ = std::fs::remove_file(artifact);
        return Err(e).change_context_lazy(|| PipelineError::io(&gz))
            .attach_printable("could not decompress the track listing");
    }
    utils::remove_file_if_exists(&gz).change_context_lazy(|| PipelineError::io(&gz))?;
    Ok(())
}

/// True if the listing exists in either uncompressed or compressed form.
pub fn artifact_present(artifact: &Path) -> bool {
    artifact.exists() || gz_path(artifact).exists()
}

fn gz_path(artifact: &Path) -> PathBuf {
    let mut name = artifact.as_os_str().to_os_string();
    name.push(".gz");
    PathBuf::from(name)
}

pub struct DateResolver<'a> {
    tools: &'a ClimateTools<'a>,
    install: &'a TrackInstall,
}

impl<'a> DateResolver<'a> {
    pub fn new(tools: &'a ClimateTools<'a>, install: &'a TrackInstall) -> Self {
        Self { tools, install }
    }

    /// Read the first timestamp and step length from `reference`.
    pub fn start_time(&self, reference: &Path, kind: SourceKind, hour_shift: i64) -> error_stack::Result<StartTime, PipelineError> {
        let stamps = self.tools.show_timestamps(reference).during("reading timestamps")?;
        let first = stamps.first()
            .ok_or(DateTimeError::NoTimestamps)
            .change_context_lazy(|| PipelineError::invalid_file(reference, "no time steps in file"))?;

        compute_start(first, stamps.get(1).map(|s| s.as_str()), kind, hour_shift, self.install.config.model_step_hours)
            .change_context_lazy(|| PipelineError::invalid_file(reference, "could not determine the first time step"))
    }

    /// Write a copy of `artifact` with dates instead of step numbers to
    /// `dates/<name>` beside it and return its path. An existing dated copy is
    /// overwritten; the step-indexed listing is kept.
    pub fn resolve_dates(&self, artifact: &Path, reference: &Path, kind: SourceKind, hour_shift: i64) -> error_stack::Result<PathBuf, PipelineError> {
        let start = self.start_time(reference, kind, hour_shift)?;
        log::info!(
            "Dating {} from {} every {} h",
            artifact.display(), start.timestamp, start.cadence_hours
        );
        self.resolve_dates_from(artifact, &start)
    }

    /// As [`DateResolver::resolve_dates`], with a start time that is already known.
    pub fn resolve_dates_from(&self, artifact: &Path, start: &StartTime) -> error_stack::Result<PathBuf, PipelineError> {
        ensure_decompressed(artifact)?;

        let dated = TrackArtifact::dated_path(artifact);
        let dates_dir = dated.parent().unwrap_or(Path::new("dates"));
        std::fs::create_dir_all(dates_dir).change_context_lazy(|| PipelineError::io(dates_dir))?;

        // Arguments after the file: lat, lon, radius, all-times mode, no negation.
        let cmd = ToolCommand::new(self.install.count_utility())
            .path_arg(artifact)
            .arg(0).arg(0).arg(5).arg(4).arg(0)
            .arg(&start.timestamp)
            .arg(start.cadence_hours);
        self.tools.runner().run(&cmd).during("converting time steps to dates")?;

        let counted = {
            let mut p = artifact.as_os_str().to_os_string();
            p.push(".new");
            PathBuf::from(p)
        };
        require_output(&counted).during("converting time steps to dates")?;
        utils::move_file(&counted, &dated).change_context_lazy(|| PipelineError::io(&dated))?;
        Ok(dated)
    }
}

//! Attaching an auxiliary field (e.g. precipitation) to existing tracks.
//!
//! The tracker averages the field over a radius around every track point and writes
//! the tracks again with the average appended. The new listing is named
//! `{track file}.{field}{first digit of radius}mean` and then dated like any other
//! listing. Finally the first point's date in the new listing is compared with the
//! dated original; a mismatch is only warned about, see [`DateConsistencyWarning`].
use std::{
    fmt::Display,
    path::{Path, PathBuf},
};

use error_stack::ResultExt;

use crate::{
    config::TrackInstall,
    dates::DateResolver,
    descriptor::{DatasetDescriptor, DatasetInspector, SourceKind},
    error::PipelineError,
    naming::TrackArtifact,
    preprocess::Preprocessor,
    tools::{require_output, ClimateTools, ToolCommand, ToolResultExt},
    utils,
    workdir::{link_or_copy, WorkdirLease},
};

/// Prefix of the log line emitted when dates disagree, so batch logs can be searched for it.
pub const DATE_WARNING_PREFIX: &str = "DATE CONSISTENCY WARNING";

/// 1-based line of a track listing whose first token is the date of the first point.
pub const CONSISTENCY_LINE: usize = 6;

#[derive(Debug, Clone)]
pub struct AttachRequest {
    pub aux_file: PathBuf,
    pub track_file: PathBuf,
    pub radius: f64,
    pub field_name: String,
    pub scaling: f64,
    pub hour_shift: i64,
    pub source_kind: SourceKind,
}

impl AttachRequest {
    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>, S: ToString>(aux_file: P, track_file: Q, radius: f64, field_name: S, source_kind: SourceKind) -> Self {
        Self {
            aux_file: aux_file.into(),
            track_file: track_file.into(),
            radius,
            field_name: field_name.to_string(),
            scaling: 1.0,
            hour_shift: 0,
            source_kind,
        }
    }

    /// `{track file}.{field}{first digit of radius}mean`, beside the track file.
    pub fn attached_path(&self) -> PathBuf {
        let digit = format!("{}", self.radius.abs())
            .chars()
            .find(|c| c.is_ascii_digit())
            .unwrap_or('0');
        let mut name = self.track_file.as_os_str().to_os_string();
        name.push(format!(".{}{digit}mean", self.field_name));
        PathBuf::from(name)
    }
}

/// The dated original and the dated attached-field listing start on different dates.
///
/// Both are dated from their own reference files, so a mismatch usually means the
/// wrong hour shift was given for the auxiliary field. The attached listing is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateConsistencyWarning {
    pub original: PathBuf,
    pub original_date: String,
    pub attached: PathBuf,
    pub attached_date: String,
}

impl Display for DateConsistencyWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f, "{DATE_WARNING_PREFIX}: {} starts at {} but {} starts at {}",
            self.original.display(), self.original_date, self.attached.display(), self.attached_date
        )
    }
}

#[derive(Debug, Clone)]
pub struct AttachOutcome {
    /// The step-indexed listing with the field appended.
    pub attached: PathBuf,
    pub dated: PathBuf,
    pub date_warning: Option<DateConsistencyWarning>,
}

/// Compare the first point's date in two dated listings.
///
/// Returns `Ok(None)` if they agree or if the original has not been dated, in which
/// case there is nothing to compare against.
pub fn check_date_consistency(original_dated: &Path, attached_dated: &Path) -> error_stack::Result<Option<DateConsistencyWarning>, PipelineError> {
    if !original_dated.exists() {
        log::info!("{} does not exist, skipping the date check", original_dated.display());
        return Ok(None);
    }

    let original_date = utils::leading_token_of_line(original_dated, CONSISTENCY_LINE)
        .change_context_lazy(|| PipelineError::invalid_file(original_dated, "not a track listing"))?;
    let attached_date = utils::leading_token_of_line(attached_dated, CONSISTENCY_LINE)
        .change_context_lazy(|| PipelineError::invalid_file(attached_dated, "not a track listing"))?;

    if original_date == attached_date {
        return Ok(None);
    }
    let warning = DateConsistencyWarning {
        original: original_dated.to_path_buf(),
        original_date,
        attached: attached_dated.to_path_buf(),
        attached_date,
    };
    log::warn!("{warning}");
    Ok(Some(warning))
}

fn yes_no(b: bool) -> String {
    if b { "y" } else { "n" }.to_string()
}

pub struct FieldAttacher<'a> {
    install: &'a TrackInstall,
    tools: &'a ClimateTools<'a>,
    inspector: &'a dyn DatasetInspector,
}

impl<'a> FieldAttacher<'a> {
    pub fn new(install: &'a TrackInstall, tools: &'a ClimateTools<'a>, inspector: &'a dyn DatasetInspector) -> Self {
        Self { install, tools, inspector }
    }

    pub fn attach_mean_field(&self, req: &AttachRequest, ext: &str) -> error_stack::Result<AttachOutcome, PipelineError> {
        if req.radius <= 0.0 {
            return Err(PipelineError::invalid_input(format!("radius must be positive, got {}", req.radius)).into());
        }
        if !req.track_file.exists() {
            return Err(PipelineError::MissingArtifact(req.track_file.clone()).into());
        }

        let desc = DatasetDescriptor::describe(&req.aux_file, req.source_kind, self.inspector)?;
        desc.require_variable(&req.field_name)?;
        let mut lease = WorkdirLease::new(format!("addfld {ext}"));
        let aux_ready = Preprocessor::new(self.tools, self.inspector).strip_bounds(&desc, &mut lease)?;
        let outdat = self.install.outdat();

        let edges = desc.edge_rows();
        let ny = edges.effective_rows(desc.ny);
        log::debug!("{} latitude rows, {} used after removing edge rows {edges:?}", desc.ny, ny);

        for leftover in [format!("initial.{ext}"), format!("init_trs.{ext}"), format!("disp_trs.{ext}"), format!("ff_trs.{ext}.nc")] {
            lease.track(outdat.join(leftover));
        }

        let aux_name = format!("{ext}_{}", aux_ready.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default());
        let aux_link = lease.track(self.install.indat().join(&aux_name));
        link_or_copy(&aux_ready, &aux_link)?;

        let track_abs = std::path::absolute(&req.track_file).change_context_lazy(|| PipelineError::io(&req.track_file))?;
        let template = self.install.add_field_template();
        let control = lease.track(self.install.root.join(format!("addfld_{ext}.in")));
        // File paths go last so that placeholder names inside them are left alone.
        utils::render_template(&template, &control, &[
            ("NX", desc.nx.to_string()),
            ("NY", ny.to_string()),
            ("SCALE", req.scaling.to_string()),
            ("RAD1", (req.radius + 1.0).to_string()),
            ("RAD", req.radius.to_string()),
            ("NPOLE", yes_no(edges.north_pole)),
            ("SPOLE", yes_no(edges.south_pole)),
            ("EQUATOR", yes_no(edges.equator)),
            ("VARNAME", req.field_name.clone()),
            ("TRACKFILE", track_abs.to_string_lossy().to_string()),
            ("FIELDFILE", aux_name.clone()),
        ]).change_context_lazy(|| PipelineError::io(&template))?;

        log::info!(
            "Attaching {} averaged over {} deg to {}",
            req.field_name, req.radius, req.track_file.display()
        );
        let cmd = ToolCommand::new(self.install.tracker_exe())
            .arg("-i").arg(&aux_name)
            .arg("-f").arg(ext)
            .stdin_from(&control)
            .current_dir(&self.install.root);
        self.tools.runner().run(&cmd).during("attaching the field")?;

        let produced = lease.track(outdat.join(format!("ff_trs.{ext}")));
        require_output(&produced).during("attaching the field")?;
        let attached = req.attached_path();
        utils::move_file(&produced, &attached).change_context_lazy(|| PipelineError::io(&attached))?;

        let resolver = DateResolver::new(self.tools, self.install);
        let dated = resolver.resolve_dates(&attached, &req.aux_file, req.source_kind, req.hour_shift)?;
        let date_warning = check_date_consistency(&TrackArtifact::dated_path(&req.track_file), &dated)?;

        Ok(AttachOutcome { attached, dated, date_warning })
    }
}

//! Running the tracker on a prepared file, one year at a time.
//!
//! For each year the driver writes the control files the tracker needs into its
//! installation, runs the spectral filter (after computing vorticity from the winds, if
//! tracking vorticity), then runs the chunked `master` script. `master` writes the
//! track listings into `{output_root}/{hemisphere}_{year}_{label}/`; everything else the
//! tracker leaves in its `indat` and `outdat` areas is named with the run's identifier
//! and removed again when the year is finished, successfully or not.
use std::path::{Path, PathBuf};

use error_stack::ResultExt;

use crate::{
    chunks::{plan_chunks, RunIdAllocator, RunIdentifier},
    config::TrackInstall,
    dates::{artifact_present, DateResolver},
    descriptor::{DatasetDescriptor, DatasetInspector, SourceKind},
    error::PipelineError,
    naming::{run_label, ArtifactKind, Hemisphere, RunDirName, TrackArtifact, TrackSign},
    preprocess::{Preprocessor, TrackingVariable},
    tools::{require_output, ClimateTools, ToolCommand, ToolResultExt},
    utils,
    workdir::{link_or_copy, WorkdirLease},
};

/// Spectral truncation used for vorticity regardless of resolution.
const VORTICITY_TRUNCATION: u32 = 42;

/// Everything that identifies one tracking invocation.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// The file as the user gave it; used for the run label and never deleted.
    pub input_file: PathBuf,
    pub output_root: PathBuf,
    pub hemisphere: Hemisphere,
    /// Track each calendar year separately; otherwise only the last year is tracked.
    pub year_split: bool,
    pub run_id: RunIdentifier,
    pub source_kind: SourceKind,
    pub tracking_variable: TrackingVariable,
    /// Also convert the dated trajectories to netCDF with `tr2nc`.
    pub netcdf: bool,
}

/// The caller's choices for one tracking run, before a run identifier is assigned.
#[derive(Debug, Clone)]
pub struct TrackRequest {
    pub output_root: PathBuf,
    pub hemisphere: Hemisphere,
    pub year_split: bool,
    pub netcdf: bool,
    pub source_kind: SourceKind,
    pub tracking_variable: TrackingVariable,
}

/// The outputs for one tracked year.
#[derive(Debug, Clone)]
pub struct YearOutcome {
    pub year: i32,
    pub run_dir: PathBuf,
    pub artifacts: Vec<TrackArtifact>,
}

/// Spectral truncation for the filter step: vorticity is always T42, pressure T63 on
/// grids with at least `threshold_rows` latitudes and T42 otherwise.
pub fn select_truncation(variable: TrackingVariable, ny: usize, threshold_rows: usize) -> u32 {
    match variable {
        TrackingVariable::Vorticity => VORTICITY_TRUNCATION,
        TrackingVariable::Pressure if ny >= threshold_rows => 63,
        TrackingVariable::Pressure => 42,
    }
}

/// The sign of the extrema that are cyclones: pressure minima, and vorticity maxima in
/// the north or minima in the south.
pub fn cyclone_sign(variable: TrackingVariable, hemisphere: Hemisphere) -> TrackSign {
    match (variable, hemisphere) {
        (TrackingVariable::Pressure, _) => TrackSign::Neg,
        (TrackingVariable::Vorticity, Hemisphere::NH) => TrackSign::Pos,
        (TrackingVariable::Vorticity, Hemisphere::SH) => TrackSign::Neg,
    }
}

/// The years to track, given every year in the file.
pub fn years_to_track(all_years: &[i32], year_split: bool) -> Vec<i32> {
    if year_split {
        all_years.to_vec()
    } else {
        all_years.last().map(|y| vec![*y]).unwrap_or_default()
    }
}

fn tracker_settings(variable: TrackingVariable) -> (&'static str, &'static str, &'static str) {
    // (filter template, run settings file, tr2nc metadata)
    match variable {
        TrackingVariable::Pressure => ("specfilt_nc.in", "RUNDATIN.MSLP", "tr2nc_mslp.meta.elinor"),
        TrackingVariable::Vorticity => ("specfilt.in", "RUNDATIN.VOR", "tr2nc.meta.elinor"),
    }
}

pub struct TrackerDriver<'a> {
    install: &'a TrackInstall,
    tools: &'a ClimateTools<'a>,
    inspector: &'a dyn DatasetInspector,
}

impl<'a> TrackerDriver<'a> {
    pub fn new(install: &'a TrackInstall, tools: &'a ClimateTools<'a>, inspector: &'a dyn DatasetInspector) -> Self {
        Self { install, tools, inspector }
    }

    /// Preprocess `inputs` (one pressure file, or one or two wind files) and track them.
    ///
    /// With two wind files they are merged first. Preprocessing intermediates made for
    /// this run are removed at the end, the inputs themselves never are.
    pub fn track_inputs(&self, inputs: &[PathBuf], request: &TrackRequest) -> error_stack::Result<Vec<YearOutcome>, PipelineError> {
        let TrackRequest { output_root, hemisphere, year_split, netcdf, source_kind, tracking_variable } = request.clone();
        let pre = Preprocessor::new(self.tools, self.inspector);
        let mut intermediates = WorkdirLease::new("preprocessing");

        let (input, to_normalize) = match (tracking_variable, inputs) {
            (_, [file]) => (file.clone(), file.clone()),
            (TrackingVariable::Vorticity, [u_or_v, v_or_u]) => {
                let merged = pre.merge_winds(u_or_v, v_or_u, source_kind, &mut intermediates)?;
                (merged.clone(), merged)
            },
            _ => return Err(PipelineError::invalid_input(format!(
                "{tracking_variable} tracking takes {} input file(s), got {}",
                if tracking_variable == TrackingVariable::Pressure { "1" } else { "1 or 2" },
                inputs.len()
            )).into()),
        };

        let prepared = pre.normalize(&to_normalize, source_kind, tracking_variable, &mut intermediates)?;

        let run_id = RunIdAllocator::new(&self.install.outdat()).next_id()?;
        let ctx = RunContext {
            input_file: input,
            output_root,
            hemisphere,
            year_split,
            run_id,
            source_kind,
            tracking_variable,
            netcdf,
        };
        self.invoke(&prepared, &ctx)
    }

    /// Track `prepared` for each selected year and return what was produced.
    ///
    /// Any missing tracker output ends the whole invocation; nothing is retried, since
    /// the tracker works on fixed file names in shared directories.
    pub fn invoke(&self, prepared: &Path, ctx: &RunContext) -> error_stack::Result<Vec<YearOutcome>, PipelineError> {
        let desc = DatasetDescriptor::describe(prepared, ctx.source_kind, self.inspector)?;
        let all_years = self.tools.show_years(prepared).during("listing years")?;
        let years = years_to_track(&all_years, ctx.year_split);
        if years.is_empty() {
            return Err(PipelineError::invalid_file(prepared, "file contains no time steps").into());
        }

        let truncation = select_truncation(ctx.tracking_variable, desc.ny, self.install.config.truncation_threshold_rows);
        let label = run_label(&ctx.input_file);
        log::info!(
            "Tracking {} in {} for {} year(s) at T{truncation} (run {})",
            ctx.tracking_variable, ctx.hemisphere, years.len(), ctx.run_id
        );

        std::fs::create_dir_all(&ctx.output_root).change_context_lazy(|| PipelineError::io(&ctx.output_root))?;

        let mut outcomes = vec![];
        for year in years {
            let outcome = self.track_year(prepared, &desc, ctx, year, truncation, &label)
                .attach_printable_lazy(|| format!("while tracking {year} of {}", ctx.input_file.display()))?;
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    fn track_year(
        &self,
        prepared: &Path,
        desc: &DatasetDescriptor,
        ctx: &RunContext,
        year: i32,
        truncation: u32,
        label: &str,
    ) -> error_stack::Result<YearOutcome, PipelineError> {
        let ext = format!("{}y{year}", ctx.run_id);
        let indat = self.install.indat();
        let outdat = self.install.outdat();
        let root = &self.install.root;
        let mut lease = WorkdirLease::new(&ext);

        // The field for this year, inside the tracker's input area
        let year_file = lease.track(indat.join(format!("{label}_{ext}.nc")));
        if ctx.year_split {
            self.tools.select_year(year, prepared, &year_file).during("selecting one year")?;
        } else {
            link_or_copy(prepared, &year_file)?;
        }

        let year_desc = DatasetDescriptor::describe(&year_file, ctx.source_kind, self.inspector)?;
        let nchunks = plan_chunks(year_desc.time_step_count, self.install.config.chunk_size)
            .attach_printable_lazy(|| format!("{} has no time steps", year_file.display()))?;

        let field_name = match ctx.tracking_variable {
            TrackingVariable::Pressure => file_name_of(&year_file),
            TrackingVariable::Vorticity => self.compute_vorticity(&mut lease, desc, ctx.source_kind, &year_file, &ext)?,
        };

        let filtered = self.spectral_filter(&mut lease, desc, ctx.tracking_variable, &field_name, truncation, &ext)?;

        let run_dir_name = RunDirName::new(ctx.hemisphere, year, label);
        let run_dir = ctx.output_root.join(run_dir_name.to_string());
        for leftover in [format!("initial.{ext}"), format!("interp_th.{ext}"), format!("ff_trs.{ext}.nc"), format!("tr_trs.{ext}.nc")] {
            lease.track(outdat.join(leftover));
        }

        let (_, settings, _) = tracker_settings(ctx.tracking_variable);
        let cmd = ToolCommand::new(self.install.master_script())
            .arg(format!("-c={run_dir_name}"))
            .arg(format!("-e={}", self.install.config.tracker_exe.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default()))
            .arg("-d=now")
            .arg(format!("-i={filtered}"))
            .arg(format!("-f={ext}"))
            .arg("-j=RUN_AT.in")
            .arg(format!("-k=initial.T{truncation}_{}", ctx.hemisphere.tracker_token()))
            .arg(format!("-n=1,{},{nchunks}", self.install.config.chunk_size))
            .arg(format!("-o={}", ctx.output_root.display()))
            .arg("-r=RUN_AT_")
            .arg(format!("-s={settings}"))
            .current_dir(root)
            .env("PATH", path_with_cwd());
        log::info!("Running the tracker for {year} ({nchunks} chunk(s))");
        self.tools.runner().run(&cmd).during("running the tracker")?;

        let sign = cyclone_sign(ctx.tracking_variable, ctx.hemisphere);
        let mut artifacts = vec![];
        for kind in [ArtifactKind::Raw, ArtifactKind::Trajectory] {
            let art = TrackArtifact::in_run_dir(&run_dir, kind, sign);
            if !artifact_present(&art.path) {
                return Err(PipelineError::MissingArtifact(art.path.clone()))
                    .attach_printable("the tracker did not write this listing");
            }
            artifacts.push(art);
        }

        for name in ["ff_trs", "tr_trs"] {
            let src = outdat.join(format!("{name}.{ext}.nc"));
            if src.exists() {
                let dest = run_dir.join(format!("{name}.nc"));
                utils::move_file(&src, &dest).change_context_lazy(|| PipelineError::io(&dest))?;
            }
        }

        let resolver = DateResolver::new(self.tools, self.install);
        let start = resolver.start_time(&year_file, ctx.source_kind, 0)?;
        let mut dated = vec![];
        for art in artifacts.iter() {
            resolver.resolve_dates_from(&art.path, &start)?;
            dated.push(art.dated());
        }

        if ctx.netcdf {
            for art in dated.iter().filter(|a| a.kind == ArtifactKind::Trajectory) {
                self.tr2nc(&art.path, ctx.tracking_variable)?;
            }
        }

        artifacts.extend(dated);
        Ok(YearOutcome { year, run_dir, artifacts })
    }

    /// Run the tracker's vorticity calculation on the wind file; returns the name of the
    /// vorticity file it writes into `indat`.
    fn compute_vorticity(&self, lease: &mut WorkdirLease, desc: &DatasetDescriptor, kind: SourceKind, year_file: &Path, ext: &str) -> error_stack::Result<String, PipelineError> {
        let (u, v) = kind.wind_names();
        let vor_name = format!("vor850_{ext}.dat");
        let vor_file = lease.track(self.install.indat().join(&vor_name));
        let control = lease.track(self.install.root.join(format!("calcvor_{ext}.test")));
        lease.track(self.install.outdat().join(format!("initial.vor850_{ext}")));

        let template = self.install.root.join("calcvor_onelev.in");
        utils::render_template(&template, &control, &[
            ("VAR1", u.to_string()),
            ("VAR2", v.to_string()),
            ("NX", desc.nx.to_string()),
            ("NY", desc.ny.to_string()),
            ("LEV", self.install.config.vorticity_level_pa.to_string()),
            ("VOR", vor_name.clone()),
        ]).change_context_lazy(|| PipelineError::io(&template))?;

        log::info!("Computing vorticity at {} Pa", self.install.config.vorticity_level_pa);
        let cmd = ToolCommand::new(self.install.tracker_exe())
            .arg("-i").arg(file_name_of(year_file))
            .arg("-f").arg(ext)
            .stdin_from(&control)
            .current_dir(&self.install.root);
        self.tools.runner().run(&cmd).during("computing vorticity")?;
        require_output(&vor_file).during("computing vorticity")?;
        Ok(vor_name)
    }

    /// Band-pass filter the field; returns the name of the filtered file in `indat`.
    fn spectral_filter(&self, lease: &mut WorkdirLease, desc: &DatasetDescriptor, variable: TrackingVariable, field_name: &str, truncation: u32, ext: &str) -> error_stack::Result<String, PipelineError> {
        let (template_name, _, _) = tracker_settings(variable);
        let outdat = self.install.outdat();
        let control = lease.track(self.install.root.join(format!("spec_{ext}.test")));
        let band0 = lease.track(outdat.join(format!("specfil.{ext}_band000")));
        let band1 = lease.track(outdat.join(format!("specfil.{ext}_band001")));
        let filt_name = format!("T{truncation}filt_{ext}.dat");
        let filtered = lease.track(self.install.indat().join(&filt_name));

        let template = self.install.root.join(template_name);
        utils::render_template(&template, &control, &[
            ("NX", desc.nx.to_string()),
            ("NY", desc.ny.to_string()),
            ("TRUNC", truncation.to_string()),
        ]).change_context_lazy(|| PipelineError::io(&template))?;

        log::info!("Spectral filtering at T{truncation}");
        let cmd = ToolCommand::new(self.install.tracker_exe())
            .arg("-i").arg(field_name)
            .arg("-f").arg(ext)
            .stdin_from(&control)
            .current_dir(&self.install.root);
        self.tools.runner().run(&cmd).during("spectral filtering")?;
        require_output(&band1).during("spectral filtering")?;
        utils::move_file(&band1, &filtered).change_context_lazy(|| PipelineError::io(&filtered))?;
        log::trace!("discarding {}", band0.display());
        Ok(filt_name)
    }

    fn tr2nc(&self, listing: &Path, variable: TrackingVariable) -> error_stack::Result<(), PipelineError> {
        let (_, _, meta) = tracker_settings(variable);
        let utility = self.install.tr2nc_utility();
        let cwd = utility.parent().map(|p| p.to_path_buf()).unwrap_or_else(|| self.install.root.clone());
        let listing = std::path::absolute(listing).change_context_lazy(|| PipelineError::io(listing))?;
        let cmd = ToolCommand::new(&utility)
            .path_arg(&listing)
            .arg("s")
            .arg(format!("../TR2NC/{meta}"))
            .current_dir(cwd);
        self.tools.runner().run(&cmd).during("converting tracks to netCDF")?;
        Ok(())
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default()
}

/// `master` calls the tracker by bare name from the installation directory.
fn path_with_cwd() -> String {
    match std::env::var("PATH") {
        Ok(p) if !p.is_empty() => format!("{p}:."),
        _ => ".".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::{
        config::TrackConfig,
        descriptor::CdoInspector,
        test_utils::{fake_griddes, fake_header, fake_install, regular_lats, FakeRunner},
    };

    #[rstest]
    #[case(TrackingVariable::Pressure, 96, 63)]
    #[case(TrackingVariable::Pressure, 128, 63)]
    #[case(TrackingVariable::Pressure, 95, 42)]
    #[case(TrackingVariable::Pressure, 64, 42)]
    #[case(TrackingVariable::Vorticity, 64, 42)]
    #[case(TrackingVariable::Vorticity, 256, 42)]
    fn test_truncation(#[case] var: TrackingVariable, #[case] ny: usize, #[case] expected: u32) {
        assert_eq!(select_truncation(var, ny, 96), expected);
    }

    #[test]
    fn test_cyclone_sign() {
        assert_eq!(cyclone_sign(TrackingVariable::Pressure, Hemisphere::NH), TrackSign::Neg);
        assert_eq!(cyclone_sign(TrackingVariable::Pressure, Hemisphere::SH), TrackSign::Neg);
        assert_eq!(cyclone_sign(TrackingVariable::Vorticity, Hemisphere::NH), TrackSign::Pos);
        assert_eq!(cyclone_sign(TrackingVariable::Vorticity, Hemisphere::SH), TrackSign::Neg);
    }

    #[test]
    fn test_years_to_track() {
        assert_eq!(years_to_track(&[2000, 2001, 2002], true), vec![2000, 2001, 2002]);
        assert_eq!(years_to_track(&[2000, 2001, 2002], false), vec![2002]);
        assert!(years_to_track(&[], false).is_empty());
    }

    /// A runner that behaves like the tracker and its utilities for one pressure file.
    fn tracker_runner(install: &TrackInstall, write_tracks: bool) -> FakeRunner {
        let runner = FakeRunner::new();
        runner.respond("ncdump -h", fake_header("lon", "lat", 192, 96, 124, &["psl"]));
        runner.respond("griddes", fake_griddes("gaussian", 192, &regular_lats(96)));
        runner.respond("showyear", "2003 2004\n");
        runner.respond("showtimestamp", "2004-01-01T00:00:00 2004-01-01T06:00:00\n");

        let outdat = install.outdat();
        runner.on("bin/track.linux", move |cmd| {
            let ext = &cmd.args[3];
            std::fs::write(outdat.join(format!("specfil.{ext}_band000")), "b0").unwrap();
            std::fs::write(outdat.join(format!("specfil.{ext}_band001")), "b1").unwrap();
            std::fs::write(outdat.join(format!("interp_th.{ext}")), "").unwrap();
        });
        if write_tracks {
            let outdat = install.outdat();
            runner.on("master", move |cmd| {
                let arg = |prefix: &str| cmd.args.iter().find_map(|a| a.strip_prefix(prefix)).unwrap().to_string();
                let run_dir = Path::new(&arg("-o=")).join(arg("-c="));
                std::fs::create_dir_all(&run_dir).unwrap();
                for name in ["ff_trs_pos", "ff_trs_neg", "tr_trs_pos", "tr_trs_neg"] {
                    std::fs::write(run_dir.join(name), "tracks\n").unwrap();
                }
                std::fs::write(outdat.join(format!("tr_trs.{}.nc", arg("-f="))), "").unwrap();
            });
        }
        runner.on("utils/bin/count", |cmd| {
            std::fs::write(format!("{}.new", cmd.args[0]), "dated\n").unwrap();
        });
        runner
    }

    fn write_templates(install: &TrackInstall) {
        std::fs::write(install.root.join("specfilt_nc.in"), "NX\nNY\nTRUNC\n").unwrap();
        std::fs::write(install.root.join("specfilt.in"), "NX\nNY\nTRUNC\n").unwrap();
        std::fs::write(install.root.join("calcvor_onelev.in"), "VAR1 VAR2 NX NY LEV VOR\n").unwrap();
    }

    fn context(input: &Path, output_root: &Path, year_split: bool) -> RunContext {
        RunContext {
            input_file: input.to_path_buf(),
            output_root: output_root.to_path_buf(),
            hemisphere: Hemisphere::NH,
            year_split,
            run_id: RunIdAllocator::new(output_root.parent().unwrap()).next_id().unwrap(),
            source_kind: SourceKind::ClimateModel,
            tracking_variable: TrackingVariable::Pressure,
            netcdf: false,
        }
    }

    #[test]
    fn test_invoke_pressure() {
        let dir = tempdir::TempDir::new("driver").unwrap();
        let install = fake_install(&dir.path().join("track"));
        write_templates(&install);
        let input = dir.path().join("psl_6hrPlev_M_historical_r1i1p1f1_gn_2004.nc");
        std::fs::write(&input, "data").unwrap();
        let out = dir.path().join("out");

        let runner = tracker_runner(&install, true);
        let config = TrackConfig::default();
        let tools = ClimateTools::new(&runner, &config);
        let inspector = CdoInspector::new(&tools);
        let driver = TrackerDriver::new(&install, &tools, &inspector);

        let ctx = context(&input, &out, true);
        let outcomes = driver.invoke(&input, &ctx).unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[1].run_dir, out.join("NH_2004_psl_6hrPlev_M_historical_r1i1p1f1_gn_2004"));
        assert!(out.join("NH_2004_psl_6hrPlev_M_historical_r1i1p1f1_gn_2004/dates/tr_trs_neg").exists());
        assert!(out.join("NH_2004_psl_6hrPlev_M_historical_r1i1p1f1_gn_2004/tr_trs.nc").exists());
        assert_eq!(runner.count_matching("selyear"), 2);
        assert_eq!(runner.count_matching("-k=initial.T63_NH -n=1,62,2"), 2);

        // Nothing left behind in the tracker's working areas
        assert_eq!(std::fs::read_dir(install.indat()).unwrap().count(), 0);
        let outdat: Vec<_> = std::fs::read_dir(install.outdat()).unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .filter(|n| !n.starts_with(".track_rs"))
            .collect();
        assert!(outdat.is_empty(), "left in outdat: {outdat:?}");
    }

    #[test]
    fn test_invoke_missing_output_cleans_up() {
        let dir = tempdir::TempDir::new("driver").unwrap();
        let install = fake_install(&dir.path().join("track"));
        write_templates(&install);
        let input = dir.path().join("psl.nc");
        std::fs::write(&input, "data").unwrap();
        let out = dir.path().join("out");

        let runner = tracker_runner(&install, false);
        let config = TrackConfig::default();
        let tools = ClimateTools::new(&runner, &config);
        let inspector = CdoInspector::new(&tools);
        let driver = TrackerDriver::new(&install, &tools, &inspector);

        let ctx = context(&input, &out, false);
        let err = driver.invoke(&input, &ctx).unwrap_err();
        assert!(matches!(err.current_context(), PipelineError::MissingArtifact(_)));
        // Only the last year is attempted and nothing is retried
        assert_eq!(runner.count_matching("master"), 1);
        assert_eq!(std::fs::read_dir(install.indat()).unwrap().count(), 0);
        assert!(input.exists());
    }

    #[test]
    fn test_tracker_failure_is_external_tool_error() {
        let dir = tempdir::TempDir::new("driver").unwrap();
        let install = fake_install(&dir.path().join("track"));
        write_templates(&install);
        let input = dir.path().join("psl.nc");
        std::fs::write(&input, "data").unwrap();
        let out = dir.path().join("out");

        let runner = tracker_runner(&install, true);
        runner.fail_on("master");
        let config = TrackConfig::default();
        let tools = ClimateTools::new(&runner, &config);
        let inspector = CdoInspector::new(&tools);
        let driver = TrackerDriver::new(&install, &tools, &inspector);

        let err = driver.invoke(&input, &context(&input, &out, false)).unwrap_err();
        assert!(matches!(err.current_context(), PipelineError::ExternalTool(_)));
        assert_eq!(std::fs::read_dir(install.indat()).unwrap().count(), 0);
    }

    #[test]
    fn test_invoke_netcdf_converts_dated_trajectories() {
        let dir = tempdir::TempDir::new("driver").unwrap();
        let install = fake_install(&dir.path().join("track"));
        write_templates(&install);
        let input = dir.path().join("psl.nc");
        std::fs::write(&input, "data").unwrap();
        let out = dir.path().join("out");

        let runner = tracker_runner(&install, true);
        let config = TrackConfig::default();
        let tools = ClimateTools::new(&runner, &config);
        let inspector = CdoInspector::new(&tools);
        let driver = TrackerDriver::new(&install, &tools, &inspector);

        let mut ctx = context(&input, &out, false);
        ctx.netcdf = true;
        driver.invoke(&input, &ctx).unwrap();
        assert_eq!(runner.count_matching("utils/bin/tr2nc"), 1);
        assert_eq!(runner.count_matching("dates/tr_trs_neg s ../TR2NC/tr2nc_mslp.meta.elinor"), 1);
    }

    #[test]
    fn test_track_inputs_vorticity() {
        let dir = tempdir::TempDir::new("driver").unwrap();
        let install = fake_install(&dir.path().join("track"));
        write_templates(&install);
        let u_file = dir.path().join("ua_6hrPlev_M_historical_r1i1p1f1_gn_2004.nc");
        let v_file = dir.path().join("va_6hrPlev_M_historical_r1i1p1f1_gn_2004.nc");
        std::fs::write(&u_file, "u").unwrap();
        std::fs::write(&v_file, "v").unwrap();
        let out = dir.path().join("out");

        let runner = tracker_runner(&install, true);
        let indat = install.indat();
        runner.on("calcvor", move |cmd| {
            let ext = &cmd.args[3];
            std::fs::write(indat.join(format!("vor850_{ext}.dat")), "vor").unwrap();
        });

        let config = TrackConfig::default();
        let tools = ClimateTools::new(&runner, &config);
        let headers = HeaderByFile;
        let driver = TrackerDriver::new(&install, &tools, &headers);

        let request = TrackRequest {
            output_root: out.clone(),
            hemisphere: Hemisphere::NH,
            year_split: false,
            netcdf: false,
            source_kind: SourceKind::ClimateModel,
            tracking_variable: TrackingVariable::Vorticity,
        };
        let outcomes = driver.track_inputs(&[v_file.clone(), u_file.clone()], &request).unwrap();

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].run_dir, out.join("NH_2004_uv_6hrPlev_M_historical_r1i1p1f1_gn_2004"));
        assert!(outcomes[0].run_dir.join("dates/tr_trs_pos").exists());
        // U goes first in the merge even though V was given first
        assert_eq!(runner.count_matching(" merge "), 1);
        assert!(runner.commands().iter().any(|c| c.contains(" merge ") && c.find("/ua_").unwrap() < c.find("/va_").unwrap()));
        assert_eq!(runner.count_matching("-k=initial.T42_NH"), 1);
        // Every preprocessing file is removed, the inputs are kept
        assert!(!dir.path().join("temp_uv").exists());
        let mut left: Vec<_> = std::fs::read_dir(dir.path()).unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        left.sort();
        assert_eq!(left, ["out", "track", "ua_6hrPlev_M_historical_r1i1p1f1_gn_2004.nc", "va_6hrPlev_M_historical_r1i1p1f1_gn_2004.nc"]);
        assert_eq!(std::fs::read_dir(install.indat()).unwrap().count(), 0);
    }

    /// Describes files by name: `ua_*`/`va_*` hold one wind component, anything else both.
    struct HeaderByFile;

    impl DatasetInspector for HeaderByFile {
        fn inspect(&self, path: &Path) -> error_stack::Result<crate::descriptor::DatasetInfo, PipelineError> {
            let name = path.file_name().unwrap().to_string_lossy().to_string();
            let vars: &[&str] = if name.starts_with("ua_") {
                &["ua"]
            } else if name.starts_with("va_") {
                &["va"]
            } else {
                &["ua", "va"]
            };
            let mut info = crate::descriptor::parse_ncdump_header(&fake_header("lon", "lat", 192, 96, 124, vars)).unwrap();
            info.grid_type = Some("gaussian".to_string());
            info.xsize = Some(192);
            info.ysize = Some(96);
            info.latitudes = regular_lats(96);
            Ok(info)
        }
    }
}

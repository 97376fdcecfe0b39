//! Combining per-year track listings and computing track statistics.
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use error_stack::ResultExt;

use crate::{
    chunks::RunIdentifier,
    config::TrackInstall,
    error::PipelineError,
    naming::RunDirName,
    tools::{require_output, CommandRunner, ToolCommand, ToolResultExt},
    utils,
    workdir::WorkdirLease,
};

/// Name the combine utility gives its output.
const COMBINED_NAME: &str = "combined_tr_trs";
/// Placeholder for the track file in the statistics template.
const STATS_PLACEHOLDER: &str = "tr_trs";
/// Subdirectory of the run directory that receives combined and statistics files.
pub const TOTAL_DIR: &str = "total";

/// What [`Aggregator::combine_and_summarize`] produced.
#[derive(Debug, Clone)]
pub struct StatsOutputs {
    pub combined: PathBuf,
    pub statistics: Vec<PathBuf>,
    pub first_year: i32,
    pub last_year: i32,
}

/// A per-year listing found under a run directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YearArtifact {
    pub year: i32,
    pub path: PathBuf,
}

/// Find `artifact_name` (which may include a subdirectory, e.g. `dates/tr_trs_neg`) in
/// every run directory directly under `dir`. Directories whose names are not run
/// directory names, such as `total`, are ignored.
pub fn find_year_artifacts(dir: &Path, artifact_name: &str) -> error_stack::Result<Vec<YearArtifact>, PipelineError> {
    let pattern = format!(
        "{}/*/{}",
        glob::Pattern::escape(&dir.to_string_lossy()),
        glob::Pattern::escape(artifact_name)
    );
    let paths = glob::glob(&pattern)
        .change_context_lazy(|| PipelineError::invalid_input(format!("bad artifact name '{artifact_name}'")))?;

    let mut found = vec![];
    for entry in paths {
        let path = entry.change_context_lazy(|| PipelineError::io(dir))?;
        let run_dir = path.strip_prefix(dir).ok()
            .and_then(|rel| rel.components().next())
            .map(|c| c.as_os_str().to_string_lossy().to_string());
        match run_dir.as_deref().map(|d| d.parse::<RunDirName>()) {
            Some(Ok(name)) => found.push(YearArtifact { year: name.year, path }),
            _ => log::debug!("Ignoring {}, not in a run directory", path.display()),
        }
    }
    found.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(found)
}

/// Select the artifacts for `first..=last`, failing if any year is missing or
/// appears more than once.
pub fn select_year_range(artifact_name: &str, found: &[YearArtifact], first: i32, last: i32) -> error_stack::Result<Vec<PathBuf>, PipelineError> {
    if last < first {
        return Err(PipelineError::invalid_input(format!("year range {first}-{last} is empty")).into());
    }

    let mut by_year: BTreeMap<i32, Vec<&YearArtifact>> = BTreeMap::new();
    for art in found.iter().filter(|a| (first..=last).contains(&a.year)) {
        by_year.entry(art.year).or_default().push(art);
    }

    if let Some((year, arts)) = by_year.iter().find(|(_, v)| v.len() > 1) {
        let paths = arts.iter().map(|a| a.path.display().to_string()).collect::<Vec<_>>().join(", ");
        return Err(PipelineError::invalid_input(format!("more than one '{artifact_name}' for {year}")))
            .attach_printable(format!("found: {paths}"));
    }

    let n_expected = (last - first + 1) as usize;
    if by_year.len() != n_expected {
        let missing = (first..=last).filter(|y| !by_year.contains_key(y)).collect();
        return Err(PipelineError::IncompleteYearRange {
            artifact: artifact_name.to_string(),
            first,
            last,
            missing,
        }.into());
    }

    let mut paths: Vec<PathBuf> = by_year.into_values().flatten().map(|a| a.path.clone()).collect();
    paths.sort();
    Ok(paths)
}

/// The combine utility's control file: the number of files, two fixed settings, then
/// one path per line.
pub fn manifest_contents(paths: &[PathBuf]) -> String {
    let mut s = format!("{}\n2\n3\n", paths.len());
    for p in paths {
        s.push_str(&p.to_string_lossy());
        s.push('\n');
    }
    s
}

pub struct Aggregator<'a> {
    runner: &'a dyn CommandRunner,
    install: &'a TrackInstall,
}

impl<'a> Aggregator<'a> {
    pub fn new(runner: &'a dyn CommandRunner, install: &'a TrackInstall) -> Self {
        Self { runner, install }
    }

    /// Combine the `artifact_name` listings of every year from `year_start` to `year_end`
    /// (by default, the first and last year found) under `dir`, then run the tracker's
    /// statistics on the combined listing.
    ///
    /// Outputs go to `dir/total`, suffixed with `label`. If a year in the range has no
    /// listing, nothing is written and `IncompleteYearRange` is returned.
    pub fn combine_and_summarize(
        &self,
        dir: &Path,
        artifact_name: &str,
        label: &str,
        run_id: &RunIdentifier,
        year_start: Option<i32>,
        year_end: Option<i32>,
    ) -> error_stack::Result<StatsOutputs, PipelineError> {
        let found = find_year_artifacts(dir, artifact_name)?;
        if found.is_empty() {
            return Err(PipelineError::invalid_input(format!("no '{artifact_name}' files under {}", dir.display())).into());
        }
        let first = year_start.unwrap_or_else(|| found.iter().map(|a| a.year).min().unwrap_or_default());
        let last = year_end.unwrap_or_else(|| found.iter().map(|a| a.year).max().unwrap_or_default());
        let paths = select_year_range(artifact_name, &found, first, last)?;
        log::info!("Combining {} '{artifact_name}' listings for {first}-{last}", paths.len());

        let total = dir.join(TOTAL_DIR);
        std::fs::create_dir_all(&total).change_context_lazy(|| PipelineError::io(&total))?;

        let combined = self.combine(dir, &total, &paths, label)?;
        let statistics = self.statistics(&total, &combined, label, run_id)?;
        Ok(StatsOutputs { combined, statistics, first_year: first, last_year: last })
    }

    fn combine(&self, dir: &Path, total: &Path, paths: &[PathBuf], label: &str) -> error_stack::Result<PathBuf, PipelineError> {
        let mut lease = WorkdirLease::new(format!("combine {label}"));
        let manifest = lease.track(dir.join(format!("combine_{label}.in")));
        std::fs::write(&manifest, manifest_contents(paths))
            .change_context_lazy(|| PipelineError::io(&manifest))?;

        let raw_output = lease.track(total.join(COMBINED_NAME));
        let cmd = ToolCommand::new(self.install.combine_utility())
            .stdin_from(&manifest)
            .current_dir(total);
        self.runner.run(&cmd).during("combining track files")?;
        require_output(&raw_output).during("combining track files")?;

        let combined = total.join(format!("{COMBINED_NAME}.{label}"));
        utils::move_file(&raw_output, &combined).change_context_lazy(|| PipelineError::io(&combined))?;
        Ok(combined)
    }

    fn statistics(&self, total: &Path, combined: &Path, label: &str, run_id: &RunIdentifier) -> error_stack::Result<Vec<PathBuf>, PipelineError> {
        let ext = run_id.as_str();
        let outdat = self.install.outdat();
        let mut lease = WorkdirLease::new(format!("stats {label}"));

        let template = self.install.stats_template();
        let control = lease.track(self.install.indat().join(format!("{}_{ext}", self.install.config.stats_template)));
        utils::render_template(&template, &control, &[(STATS_PLACEHOLDER, combined.to_string_lossy().to_string())])
            .change_context_lazy(|| PipelineError::io(&template))?;

        for leftover in [format!("initial.{ext}"), format!("init_trs.{ext}"), format!("disp_trs.{ext}"), format!("ff_trs.{ext}"), format!("ff_trs.{ext}.nc")] {
            lease.track(outdat.join(leftover));
        }

        let cmd = ToolCommand::new(self.install.tracker_exe())
            .arg(format!("-f{ext}"))
            .stdin_from(&control)
            .current_dir(&self.install.root);
        let stdout = self.runner.run(&cmd).during("computing track statistics")?;
        log::trace!("Tracker statistics output:\n{stdout}");

        let mut outputs = vec![];
        for (produced, renamed) in [
            (format!("stat_trs.{ext}"), format!("stat_trs.{label}")),
            (format!("stat_trs.{ext}_1.nc"), format!("stat_trs.{label}_1.nc")),
            (format!("stat_trs_scl.{ext}"), format!("stat_trs_scl.{label}")),
            (format!("stat_trs_scl.{ext}_1.nc"), format!("stat_trs_scl.{label}_1.nc")),
        ] {
            let src = lease.track(outdat.join(produced));
            require_output(&src).during("computing track statistics")?;
            let dest = total.join(renamed);
            utils::move_file(&src, &dest).change_context_lazy(|| PipelineError::io(&dest))?;
            outputs.push(dest);
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{fake_install, FakeRunner};

    fn make_run_dirs(root: &Path, years: &[i32]) {
        for y in years {
            let d = root.join(format!("NH_{y}_ERA5_msl_6hr_{y}")).join("dates");
            std::fs::create_dir_all(&d).unwrap();
            std::fs::write(d.join("tr_trs_neg"), format!("{y}\n")).unwrap();
        }
        std::fs::create_dir_all(root.join("total")).unwrap();
    }

    fn stats_runner() -> FakeRunner {
        let runner = FakeRunner::new();
        runner.on("utils/bin/combine", |cmd| {
            let manifest = std::fs::read_to_string(cmd.stdin_file.as_ref().unwrap()).unwrap();
            let cwd = cmd.cwd.as_ref().unwrap();
            let paths: Vec<&str> = manifest.lines().skip(3).collect();
            std::fs::write(cwd.join("combined_tr_trs"), paths.join("\n")).unwrap();
        });
        runner.on("bin/track.linux", |cmd| {
            let ext = cmd.args[0].trim_start_matches("-f").to_string();
            let outdat = cmd.cwd.as_ref().unwrap().join("outdat");
            for name in ["stat_trs.", "stat_trs_scl.", "initial.", "ff_trs."] {
                std::fs::write(outdat.join(format!("{name}{ext}")), "").unwrap();
            }
            for name in ["stat_trs.", "stat_trs_scl."] {
                std::fs::write(outdat.join(format!("{name}{ext}_1.nc")), "").unwrap();
            }
        });
        runner
    }

    #[test]
    fn test_manifest() {
        let s = manifest_contents(&[PathBuf::from("/a/NH_2000_x/tr_trs_neg"), PathBuf::from("/a/NH_2001_x/tr_trs_neg")]);
        assert_eq!(s, "2\n2\n3\n/a/NH_2000_x/tr_trs_neg\n/a/NH_2001_x/tr_trs_neg\n");
    }

    #[test]
    fn test_incomplete_range_writes_nothing() {
        let dir = tempdir::TempDir::new("aggregate").unwrap();
        let install = fake_install(&dir.path().join("track"));
        let out = dir.path().join("out");
        make_run_dirs(&out, &[2000, 2001, 2003]);

        let runner = stats_runner();
        let agg = Aggregator::new(&runner, &install);
        let run_id = RunIdentifier::derived(&out, chrono::Utc::now());
        let err = agg.combine_and_summarize(&out, "dates/tr_trs_neg", "neg", &run_id, Some(2000), Some(2003)).unwrap_err();

        match err.current_context() {
            PipelineError::IncompleteYearRange { missing, .. } => assert_eq!(missing, &vec![2002]),
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.current_context().is_recoverable());
        assert_eq!(runner.count_matching("combine"), 0);
        assert!(!out.join("total").join("combined_tr_trs.neg").exists());
    }

    #[test]
    fn test_complete_range_combines_in_order() {
        let dir = tempdir::TempDir::new("aggregate").unwrap();
        let install = fake_install(&dir.path().join("track"));
        std::fs::write(install.stats_template(), "0\ntr_trs\n1\n").unwrap();
        let out = dir.path().join("out");
        make_run_dirs(&out, &[2003, 2001, 2000, 2002]);

        let runner = stats_runner();
        let agg = Aggregator::new(&runner, &install);
        let run_id = RunIdentifier::derived(&out, chrono::Utc::now());
        let res = agg.combine_and_summarize(&out, "dates/tr_trs_neg", "neg", &run_id, None, None).unwrap();

        assert_eq!((res.first_year, res.last_year), (2000, 2003));
        assert_eq!(runner.count_matching("combine"), 1);
        let combined = std::fs::read_to_string(&res.combined).unwrap();
        let years: Vec<String> = combined.lines()
            .map(|l| Path::new(l).parent().unwrap().parent().unwrap().file_name().unwrap().to_string_lossy()[3..7].to_string())
            .collect();
        assert_eq!(years, ["2000", "2001", "2002", "2003"]);

        assert_eq!(res.statistics.len(), 4);
        assert!(res.statistics.iter().all(|p| p.exists()));
        assert!(out.join("total/stat_trs_scl.neg_1.nc").exists());

        // Transient files are gone from both the run directory and the tracker's areas
        assert!(!out.join("combine_neg.in").exists());
        let leftovers: Vec<_> = std::fs::read_dir(install.outdat()).unwrap().collect();
        assert!(leftovers.is_empty());
        let indat: Vec<_> = std::fs::read_dir(install.indat()).unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(indat, ["STATS.in"]);
    }

    #[test]
    fn test_duplicate_years() {
        let found = vec![
            YearArtifact { year: 2000, path: PathBuf::from("NH_2000_a/tr_trs_neg") },
            YearArtifact { year: 2000, path: PathBuf::from("SH_2000_a/tr_trs_neg") },
        ];
        let err = select_year_range("tr_trs_neg", &found, 2000, 2000).unwrap_err();
        assert!(matches!(err.current_context(), PipelineError::InvalidInput(_)));
    }
}

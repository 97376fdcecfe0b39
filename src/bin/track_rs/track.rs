use std::path::{Path, PathBuf};

use error_stack::ResultExt;
use indexmap::IndexMap;
use track_rs::{
    config::TrackConfig,
    descriptor::{CdoInspector, SourceKind},
    driver::{TrackRequest, TrackerDriver},
    naming::{discover_sources, SourceName},
    preprocess::TrackingVariable,
    tools::{ClimateTools, SystemRunner},
};

use crate::{locate_install, CliError, TrackCli};

pub(crate) fn driver(config: &TrackConfig, args: TrackCli) -> error_stack::Result<(), CliError> {
    let install = locate_install(config).change_context(CliError::Tracking)?;
    let runner = SystemRunner;
    let tools = ClimateTools::new(&runner, config);
    let inspector = CdoInspector::new(&tools);
    let tracker = TrackerDriver::new(&install, &tools, &inspector);

    let batches = match &args.source_dir {
        Some(dir) => find_batches(dir, &args)?,
        None => vec![args.inputs.clone()],
    };
    if batches.is_empty() {
        return Err(CliError::BadInput("no input files found".to_string()).into());
    }

    let request = TrackRequest {
        output_root: args.output_root,
        hemisphere: args.hemisphere,
        year_split: args.year_split,
        netcdf: args.netcdf,
        source_kind: args.source_kind,
        tracking_variable: args.variable,
    };

    let mut n_skipped = 0;
    for inputs in batches.iter() {
        let names = inputs.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", ");
        match tracker.track_inputs(inputs, &request) {
            Ok(outcomes) => {
                for outcome in outcomes {
                    log::info!("Tracked {names} for {} into {}", outcome.year, outcome.run_dir.display());
                }
            },
            Err(e) if e.current_context().is_recoverable() => {
                log::error!("Skipping {names}:\n{e:?}");
                n_skipped += 1;
            },
            Err(e) => return Err(e).change_context(CliError::Tracking),
        }
    }

    if n_skipped > 0 {
        return Err(CliError::Tracking)
            .attach_printable(format!("{n_skipped} of {} input(s) could not be tracked, see the log", batches.len()));
    }
    Ok(())
}

/// Group the files found under `dir` into the input lists for each tracking run.
fn find_batches(dir: &Path, args: &TrackCli) -> error_stack::Result<Vec<Vec<PathBuf>>, CliError> {
    let kind = args.source_kind;
    match args.variable {
        TrackingVariable::Pressure => {
            let filter = args.selection.filter(kind, Some(kind.pressure_variable()));
            let found = discover_sources(dir, &filter).change_context(CliError::Discovery)?;
            Ok(found.into_iter().map(|(p, _)| vec![p]).collect())
        },
        TrackingVariable::Vorticity => {
            let (u, v) = kind.wind_names();
            let u_files = discover_sources(dir, &args.selection.filter(kind, Some(u)))
                .change_context(CliError::Discovery)?;
            let v_files = discover_sources(dir, &args.selection.filter(kind, Some(v)))
                .change_context(CliError::Discovery)?;
            Ok(pair_wind_files(u_files, v_files))
        },
    }
}

/// Pair each U file with the V file whose name differs only in the variable. The
/// components are usually kept in separate directory trees, so only the file names
/// are compared. U files without a partner are left out with a warning.
fn pair_wind_files(u_files: Vec<(PathBuf, SourceName)>, v_files: Vec<(PathBuf, SourceName)>) -> Vec<Vec<PathBuf>> {
    let mut v_by_key: IndexMap<String, PathBuf> = v_files
        .into_iter()
        .map(|(p, n)| (pairing_key(&p, &n), p))
        .collect();

    let mut pairs = vec![];
    for (u_path, name) in u_files {
        match v_by_key.swap_remove(&pairing_key(&u_path, &name)) {
            Some(v_path) => pairs.push(vec![u_path, v_path]),
            None => log::warn!("No matching V component file for {}, skipping it", u_path.display()),
        }
    }
    pairs
}

fn pairing_key(path: &Path, name: &SourceName) -> String {
    let var_index = match name {
        SourceName::Reanalysis(_) => 1,
        SourceName::Model(_) => 0,
    };
    let file_name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    file_name
        .split('_')
        .enumerate()
        .filter_map(|(i, tok)| (i != var_index).then_some(tok))
        .collect::<Vec<_>>()
        .join("_")
}

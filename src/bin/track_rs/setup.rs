use std::path::{Path, PathBuf};

use error_stack::ResultExt;
use track_rs::{
    config::{TrackConfig, TrackInstall},
    utils,
};

use crate::{locate_install, CliError, SetupCli};

/// Run-data templates, installed as `indat/RUNDATIN.<name>.in`.
const RUNDATIN_TEMPLATES: [&str; 4] = ["MSLP", "MSLP_A", "VOR", "VOR_A"];

/// Placeholder in the run-data templates for the user's home directory.
const HOME_PLACEHOLDER: &str = "DIR";

pub(crate) fn driver(config: &TrackConfig, args: SetupCli) -> error_stack::Result<(), CliError> {
    let install = locate_install(config).change_context(CliError::Setup)?;
    let templates = args.templates_dir
        .or_else(|| config.templates_dir.clone())
        .ok_or_else(|| CliError::BadInput("no templates directory given with --templates-dir or in the configuration".to_string()))?;
    let home = utils::home_dir()
        .ok_or_else(|| CliError::BadInput("HOME is not set".to_string()))?;

    let installed = install_templates(&templates, &install, &home)?;
    log::info!("Installed {} file(s) into {}", installed.len(), install.root.display());
    Ok(())
}

/// Render the run-data templates into the tracker's `indat` directory and copy the
/// control-file templates (`trackdir/`) and initialisation data (`data/`) into place.
fn install_templates(templates: &Path, install: &TrackInstall, home: &Path) -> error_stack::Result<Vec<PathBuf>, CliError> {
    let mut installed = vec![];
    let home = home.to_string_lossy().to_string();

    for name in RUNDATIN_TEMPLATES {
        let src = templates.join("indat").join(format!("template.{name}.in"));
        let dest = install.indat().join(format!("RUNDATIN.{name}.in"));
        utils::render_template(&src, &dest, &[(HOME_PLACEHOLDER, home.clone())])
            .change_context(CliError::Setup)?;
        log::debug!("Wrote {}", dest.display());
        installed.push(dest);
    }

    for (sub, dest_dir) in [("trackdir", install.root.clone()), ("data", install.root.join("data"))] {
        let src_dir = templates.join(sub);
        if !src_dir.is_dir() {
            log::warn!("{} does not exist, nothing copied from it", src_dir.display());
            continue;
        }
        std::fs::create_dir_all(&dest_dir)
            .change_context(CliError::Setup)
            .attach_printable_lazy(|| format!("could not create {}", dest_dir.display()))?;
        installed.extend(copy_dir_files(&src_dir, &dest_dir)?);
    }
    Ok(installed)
}

fn copy_dir_files(src_dir: &Path, dest_dir: &Path) -> error_stack::Result<Vec<PathBuf>, CliError> {
    let mut copied = vec![];
    let entries = std::fs::read_dir(src_dir)
        .change_context(CliError::Setup)
        .attach_printable_lazy(|| format!("could not list {}", src_dir.display()))?;
    for entry in entries {
        let path = entry.change_context(CliError::Setup)?.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name() else { continue };
        let dest = dest_dir.join(name);
        std::fs::copy(&path, &dest)
            .change_context(CliError::Setup)
            .attach_printable_lazy(|| format!("could not copy {} to {}", path.display(), dest.display()))?;
        copied.push(dest);
    }
    Ok(copied)
}

//! Bring input files into the form the tracker can read.
//!
//! Each step writes its result beside its input with a fixed suffix (`_extr`,
//! `_gaussian`, `_filled`, `_merged`) and records a fingerprint of what it was made
//! from in a hidden sidecar file. A step is skipped when its output exists and the
//! fingerprint still matches, so running the preprocessing twice does no work the
//! second time, but a changed upstream file is never silently reused. Every step
//! registers its output and sidecar with the caller's [`WorkdirLease`], so the
//! intermediates live only as long as the run that needed them.
use std::{
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};

use error_stack::ResultExt;

use crate::{
    descriptor::{DatasetDescriptor, DatasetInspector, GridKind, SourceKind},
    error::PipelineError,
    tools::{ClimateTools, ToolResultExt},
    utils,
    workdir::WorkdirLease,
};

/// Coordinate bounds variables the tracker cannot handle.
pub const BOUNDS_VARIABLES: [&str; 5] = ["time_bnds", "lat_bnds", "lon_bnds", "latitude_bnds", "longitude_bnds"];

/// Which field the tracker follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, clap::ValueEnum)]
#[strum(serialize_all = "lowercase")]
pub enum TrackingVariable {
    /// Mean sea level pressure minima.
    Pressure,
    /// 850 hPa relative vorticity computed from the wind components.
    Vorticity,
}

/// The coarsest Gaussian grid with at least as many latitudes as the input, capped at N80.
pub fn target_gaussian_grid(ny: usize) -> &'static str {
    match ny {
        0..=80 => "n32",
        81..=112 => "n48",
        113..=150 => "n64",
        _ => "n80",
    }
}

/// A digest of the inputs and parameters that produced an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hash the sources' paths, sizes and modification times together with the
    /// operation name and its parameters.
    pub fn compute(sources: &[&Path], operation: &str, params: &[&str]) -> error_stack::Result<Self, PipelineError> {
        let mut ctx = ring::digest::Context::new(&ring::digest::SHA256);
        for src in sources {
            let meta = std::fs::metadata(src)
                .change_context_lazy(|| PipelineError::io(*src))
                .attach_printable("could not stat a preprocessing source")?;
            let mtime = meta.modified().ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_nanos())
                .unwrap_or(0);
            ctx.update(src.to_string_lossy().as_bytes());
            ctx.update(&meta.len().to_le_bytes());
            ctx.update(&mtime.to_le_bytes());
            ctx.update(b"\0");
        }
        ctx.update(operation.as_bytes());
        for p in params {
            ctx.update(b"\0");
            ctx.update(p.as_bytes());
        }
        Ok(Self(hex::encode(ctx.finish().as_ref())))
    }

    /// The sidecar file holding the fingerprint of `artifact`: `.<name>.fingerprint`.
    pub fn sidecar_path(artifact: &Path) -> PathBuf {
        let name = artifact.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        artifact.with_file_name(format!(".{name}.fingerprint"))
    }

    /// True if `artifact` exists and was built from exactly these inputs.
    pub fn matches_artifact(&self, artifact: &Path) -> bool {
        if !artifact.exists() {
            return false;
        }
        std::fs::read_to_string(Self::sidecar_path(artifact))
            .map(|s| s.trim() == self.0)
            .unwrap_or(false)
    }

    pub fn record(&self, artifact: &Path) -> error_stack::Result<(), PipelineError> {
        let sidecar = Self::sidecar_path(artifact);
        std::fs::write(&sidecar, format!("{}\n", self.0))
            .change_context_lazy(|| PipelineError::io(&sidecar))
    }
}

/// Remove a preprocessing artifact together with its fingerprint sidecar.
pub fn remove_artifact(artifact: &Path) -> error_stack::Result<(), PipelineError> {
    for p in [artifact.to_path_buf(), Fingerprint::sidecar_path(artifact)] {
        utils::remove_file_if_exists(&p).change_context_lazy(|| PipelineError::io(&p))?;
    }
    Ok(())
}

/// Register a preprocessing artifact and its fingerprint sidecar for removal.
pub fn lease_artifact(lease: &mut WorkdirLease, artifact: &Path) {
    lease.track(artifact);
    lease.track(Fingerprint::sidecar_path(artifact));
}

pub struct Preprocessor<'a> {
    tools: &'a ClimateTools<'a>,
    inspector: &'a dyn DatasetInspector,
}

impl<'a> Preprocessor<'a> {
    pub fn new(tools: &'a ClimateTools<'a>, inspector: &'a dyn DatasetInspector) -> Self {
        Self { tools, inspector }
    }

    /// Run `build` to make `target` from `sources` unless an up-to-date copy exists.
    /// Returns `true` if the step ran.
    fn cached_step<F>(&self, sources: &[&Path], target: &Path, operation: &str, params: &[&str], build: F) -> error_stack::Result<bool, PipelineError>
    where F: FnOnce() -> error_stack::Result<(), PipelineError>
    {
        let fingerprint = Fingerprint::compute(sources, operation, params)?;
        if fingerprint.matches_artifact(target) {
            log::debug!("{operation}: reusing {}", target.display());
            return Ok(false);
        }

        // A stale fingerprint must not survive a failed rebuild.
        remove_artifact(target)?;
        build()?;
        fingerprint.record(target)?;
        log::debug!("{operation}: wrote {}", target.display());
        Ok(true)
    }

    /// Make `file` ready for tracking `variable` and return the path of the ready file.
    ///
    /// The original file is never modified; every file written on the way is
    /// registered with `lease`. Fails with `MissingVariable` before doing anything if
    /// the file lacks the field needed for `variable`.
    pub fn normalize(&self, file: &Path, kind: SourceKind, variable: TrackingVariable, lease: &mut WorkdirLease) -> error_stack::Result<PathBuf, PipelineError> {
        let desc = DatasetDescriptor::describe(file, kind, self.inspector)?;
        match variable {
            TrackingVariable::Pressure => desc.require_variable(kind.pressure_variable())?,
            TrackingVariable::Vorticity => {
                let (u, v) = kind.wind_names();
                desc.require_variable(u)?;
                desc.require_variable(v)?;
            },
        }

        log::info!("Preprocessing {}", file.display());
        let extracted = self.strip_bounds(&desc, lease)?;
        let gridded = self.regrid_if_needed(&desc, &extracted, lease)?;

        let filled = utils::with_stem_suffix(&gridded, "_filled");
        lease_artifact(lease, &filled);
        self.cached_step(&[gridded.as_path()], &filled, "strip_invalid_attributes", &[], || {
            self.tools.strip_invalid_attributes(&gridded, &filled).during("removing fill value attributes")
        })?;
        Ok(filled)
    }

    /// Drop the coordinate bounds variables, if the file has any. A new file is
    /// registered with `lease`.
    pub fn strip_bounds(&self, desc: &DatasetDescriptor, lease: &mut WorkdirLease) -> error_stack::Result<PathBuf, PipelineError> {
        let present: Vec<&str> = BOUNDS_VARIABLES.iter().copied().filter(|v| desc.has_variable(v)).collect();
        if present.is_empty() {
            return Ok(desc.file_path.clone());
        }

        let out = utils::with_stem_suffix(&desc.file_path, "_extr");
        lease_artifact(lease, &out);
        let varlist = present.join(",");
        self.cached_step(&[desc.file_path.as_path()], &out, "extract_variables", &[varlist.as_str()], || {
            self.tools.extract_variables(&present, &desc.file_path, &out).during("removing bounds variables")
        })?;
        Ok(out)
    }

    fn regrid_if_needed(&self, desc: &DatasetDescriptor, input: &Path, lease: &mut WorkdirLease) -> error_stack::Result<PathBuf, PipelineError> {
        if desc.grid_kind == GridKind::Gaussian {
            log::debug!("{} is already on a Gaussian grid", desc.file_path.display());
            return Ok(input.to_path_buf());
        }

        let grid = target_gaussian_grid(desc.ny);
        let out = utils::with_stem_suffix(input, "_gaussian");
        lease_artifact(lease, &out);
        self.cached_step(&[input], &out, "remap", &[grid], || {
            log::info!("Regridding {} ({} latitudes) to {grid}", input.display(), desc.ny);
            self.tools.remap(grid, input, &out).during("regridding")
        })?;
        Ok(out)
    }

    /// Merge separate U and V files into one, deciding which is which from the last
    /// variable each file declares rather than from the argument order.
    ///
    /// The merged file goes in a `temp_uv` directory beside the U file, named after the
    /// U file with its variable token replaced by `uv` and a `_merged` suffix.
    pub fn merge_winds(&self, first: &Path, second: &Path, kind: SourceKind, lease: &mut WorkdirLease) -> error_stack::Result<PathBuf, PipelineError> {
        let desc1 = DatasetDescriptor::describe(first, kind, self.inspector)?;
        let desc2 = DatasetDescriptor::describe(second, kind, self.inspector)?;
        let (u_name, v_name) = kind.wind_names();
        let (u_file, v_file) = identify_wind_components(&desc1, &desc2, u_name, v_name)?;

        let out = merged_wind_path(u_file, u_name);
        if let Some(parent) = out.parent().filter(|p| !p.exists()) {
            std::fs::create_dir_all(parent).change_context_lazy(|| PipelineError::io(parent))?;
            lease.track(parent);
        }
        lease_artifact(lease, &out);
        let v_str = v_file.to_string_lossy();
        self.cached_step(&[u_file, v_file], &out, "merge", &[v_str.as_ref()], || {
            log::info!("Merging {} (U) and {} (V)", u_file.display(), v_file.display());
            self.tools.merge_variables(u_file, v_file, &out).during("merging wind components")
        })?;
        Ok(out)
    }
}

/// Return the (U, V) files in that order.
pub fn identify_wind_components<'d>(a: &'d DatasetDescriptor, b: &'d DatasetDescriptor, u_name: &'static str, v_name: &'static str)
-> error_stack::Result<(&'d Path, &'d Path), PipelineError> {
    let ta = a.trailing_variable();
    let tb = b.trailing_variable();
    let (pa, pb) = (a.file_path.as_path(), b.file_path.as_path());

    let is_u = |t: Option<&str>| t == Some(u_name);
    let is_v = |t: Option<&str>| t == Some(v_name);

    // One file must be identified and the other must not contradict it
    if (is_u(ta) && !is_u(tb)) || (is_v(tb) && !is_v(ta)) {
        Ok((pa, pb))
    } else if (is_u(tb) && !is_u(ta)) || (is_v(ta) && !is_v(tb)) {
        Ok((pb, pa))
    } else {
        Err(PipelineError::AmbiguousWindComponent {
            file1: a.file_path.clone(),
            file2: b.file_path.clone(),
            u_name,
            v_name,
        })
        .attach_printable_lazy(|| format!("last variables were {ta:?} and {tb:?}"))
    }
}

fn merged_wind_path(u_file: &Path, u_name: &str) -> PathBuf {
    let stem = utils::file_stem_string(u_file).unwrap_or_default();
    let padded = format!("_{stem}_").replacen(&format!("_{u_name}_"), "_uv_", 1);
    let stem = padded.trim_matches('_');
    let dir = u_file.parent().unwrap_or(Path::new(".")).join("temp_uv");
    dir.join(format!("{stem}{}", crate::naming::MERGED_SUFFIX))
}

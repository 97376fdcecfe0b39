//! Scoped ownership of transient files in the tracker's shared working area.
use std::path::{Path, PathBuf};

use error_stack::ResultExt;

use crate::error::PipelineError;

/// Every path registered with a lease is removed when the lease is dropped, whether the
/// stage that created it finished, returned an error, or panicked.
///
/// Call [`WorkdirLease::release`] (or [`WorkdirLease::keep`] for single paths) to hand
/// files over to the caller instead.
#[derive(Debug)]
pub struct WorkdirLease {
    name: String,
    paths: Vec<PathBuf>,
}

impl WorkdirLease {
    pub fn new<S: ToString>(name: S) -> Self {
        Self { name: name.to_string(), paths: vec![] }
    }

    /// Register `path` for removal and return it, for use in expressions.
    pub fn track<P: Into<PathBuf>>(&mut self, path: P) -> PathBuf {
        let path = path.into();
        if !self.paths.contains(&path) {
            self.paths.push(path.clone());
        }
        path
    }

    /// Stop tracking `path`; it will be left in place.
    pub fn keep(&mut self, path: &Path) {
        self.paths.retain(|p| p != path);
    }

    pub fn tracked(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Give up all registered paths without removing them.
    pub fn release(mut self) -> Vec<PathBuf> {
        std::mem::take(&mut self.paths)
    }

    /// Remove every registered path now. Directories are removed recursively.
    pub fn cleanup(&mut self) {
        for p in self.paths.drain(..).rev() {
            let res = if p.is_dir() {
                std::fs::remove_dir_all(&p)
            } else {
                std::fs::remove_file(&p)
            };
            match res {
                Ok(()) => log::trace!("[{}] removed {}", self.name, p.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
                Err(e) => log::warn!("[{}] could not remove transient file {}: {e}", self.name, p.display()),
            }
        }
    }
}

impl Drop for WorkdirLease {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Make `src` available as `dest` in the tracker's input area without copying its
/// data: a symbolic link where the platform has them, a copy otherwise. An existing
/// `dest` is replaced.
#[cfg(unix)]
pub fn link_or_copy(src: &Path, dest: &Path) -> error_stack::Result<(), PipelineError> {
    let src = std::path::absolute(src).change_context_lazy(|| PipelineError::io(src))?;
    let _ = std::fs::remove_file(dest);
    std::os::unix::fs::symlink(&src, dest)
        .change_context_lazy(|| PipelineError::io(dest))
        .attach_printable_lazy(|| format!("could not link {} into the tracker input area", src.display()))
}

#[cfg(not(unix))]
pub fn link_or_copy(src: &Path, dest: &Path) -> error_stack::Result<(), PipelineError> {
    let _ = std::fs::remove_file(dest);
    std::fs::copy(src, dest)
        .map(|_| ())
        .change_context_lazy(|| PipelineError::io(dest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_removes_on_drop() {
        let dir = tempdir::TempDir::new("workdir").unwrap();
        let a = dir.path().join("a.dat");
        let b = dir.path().join("b.dat");
        let never_made = dir.path().join("c.dat");
        std::fs::write(&a, "a").unwrap();
        std::fs::write(&b, "b").unwrap();

        {
            let mut lease = WorkdirLease::new("test");
            lease.track(&a);
            lease.track(&b);
            lease.track(&never_made);
            lease.keep(&b);
        }

        assert!(!a.exists());
        assert!(b.exists());
    }

    #[test]
    fn test_lease_removes_on_error_path() {
        fn failing_stage(dir: &Path) -> Result<(), String> {
            let mut lease = WorkdirLease::new("failing");
            let tmp = lease.track(dir.join("spec.test"));
            std::fs::write(&tmp, "x").unwrap();
            Err("tracker failed".to_string())
        }

        let dir = tempdir::TempDir::new("workdir").unwrap();
        assert!(failing_stage(dir.path()).is_err());
        assert!(!dir.path().join("spec.test").exists());
    }

    #[test]
    fn test_release() {
        let dir = tempdir::TempDir::new("workdir").unwrap();
        let a = dir.path().join("a.dat");
        std::fs::write(&a, "a").unwrap();
        let mut lease = WorkdirLease::new("test");
        lease.track(&a);
        assert_eq!(lease.release(), vec![a.clone()]);
        assert!(a.exists());
    }

    #[test]
    fn test_linked_input_outlives_lease() {
        let dir = tempdir::TempDir::new("workdir").unwrap();
        let src = dir.path().join("ERA5_tp_6hr_2004.nc");
        std::fs::write(&src, "tp").unwrap();
        let indat = dir.path().join("indat");
        std::fs::create_dir(&indat).unwrap();

        {
            let mut lease = WorkdirLease::new("link");
            let dest = lease.track(indat.join("a000001_ERA5_tp_6hr_2004.nc"));
            std::fs::write(&dest, "stale").unwrap();
            link_or_copy(&src, &dest).unwrap();
            assert_eq!(std::fs::read_to_string(&dest).unwrap(), "tp");
            #[cfg(unix)]
            assert!(std::fs::symlink_metadata(&dest).unwrap().file_type().is_symlink());
        }

        assert_eq!(std::fs::read_dir(&indat).unwrap().count(), 0);
        assert_eq!(std::fs::read_to_string(&src).unwrap(), "tp");
    }
}

//! General utilities, not particular to any pipeline stage.
use std::env;
use std::error::Error;
use std::ffi::OsString;
use std::fmt::Display;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};

/// Standard error type for the small file helpers in this module
#[derive(Debug)]
pub enum FileError {
    /// A problem occurred locating the tracker installation. See [`TrackPathErrorKind`]
    TrackPathError(TrackPathErrorKind),
    /// Used when a file could not be opened, e.g. it does not exist or there was a file system error.
    /// `descr` must be a short description of the file type, `path` the path to the file
    /// attempted to open, and `reason` the root cause of being unable to open the file.
    CouldNotOpen { descr: String, path: PathBuf, reason: String },
    /// Used when a problem occurred while reading from a file that could be opened.
    CouldNotRead { path: PathBuf, reason: String },
    /// Used when a file could be read, but did not have the content we expected
    /// (for example, it has fewer lines than needed).
    DataError { path: PathBuf, cause: String },
    /// Used when writing, moving, or removing a file failed.
    CouldNotWrite { path: PathBuf, reason: String },
}

impl Display for FileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TrackPathError(inner) => {
                write!(f, "Error locating the tracker installation: {inner}")
            },
            Self::CouldNotOpen { descr, path, reason } => {
                write!(f, "Could not open {descr} at {} because: {reason}", path.display())
            },
            Self::CouldNotRead { path, reason } => {
                write!(f, "Could not read from {} because: {reason}", path.display())
            },
            Self::DataError { path, cause } => {
                write!(f, "Unexpected content in {}: {cause}", path.display())
            },
            Self::CouldNotWrite { path, reason } => {
                write!(f, "Could not write {} because: {reason}", path.display())
            },
        }
    }
}

impl Error for FileError {}

/// An interior error type for the `TrackPathError` variant of [`FileError`]
#[derive(Debug)]
pub enum TrackPathErrorKind {
    /// Neither TRACK_DIR nor HOME is set, so there is nowhere to look.
    NotSet,
    /// The path points to a directory that doesn't exist at all.
    DoesNotExist(PathBuf),
    /// The path points to *something* but that something is not a directory.
    IsNotDir(PathBuf),
}

impl Display for TrackPathErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotSet => {
                write!(f, "TRACK_DIR/track_dir environmental variables not set and no HOME directory")
            },
            Self::DoesNotExist(p) => {
                write!(f, "Tracker directory ({}) does not exist", p.display())
            },
            Self::IsNotDir(p) => {
                write!(f, "Tracker directory ({}) is not a directory", p.display())
            },
        }
    }
}

/// Get the tracker installation directory as defined in the environment
///
/// This will check for the environmental variables "TRACK_DIR" and "track_dir"
/// in that order, the first one found is used. If neither is set, `$HOME/track-master`
/// is assumed, since that is where the tracker's own build puts itself.
///
/// # Returns
/// A [`Result`] containing the tracker path. It returns an `Err` if no candidate
/// could be formed, or the path does not exist or is not a directory.
pub fn get_track_path() -> Result<PathBuf, FileError> {
    let env_path = env::var_os("TRACK_DIR")
        .or_else(|| env::var_os("track_dir"))
        .map(PathBuf::from)
        .or_else(|| home_dir().map(|h| h.join("track-master")))
        .ok_or_else(|| FileError::TrackPathError(TrackPathErrorKind::NotSet))?;

    check_is_dir(env_path)
}

/// The current user's home directory, from `$HOME`.
pub fn home_dir() -> Option<PathBuf> {
    env::var_os("HOME").filter(|h| !h.is_empty()).map(PathBuf::from)
}

fn check_is_dir(path: PathBuf) -> Result<PathBuf, FileError> {
    if !path.exists() {
        return Err(FileError::TrackPathError(TrackPathErrorKind::DoesNotExist(path)));
    }

    if !path.is_dir() {
        return Err(FileError::TrackPathError(TrackPathErrorKind::IsNotDir(path)));
    }

    Ok(path)
}

/// A wrapper around another struct implementing the [`BufRead`] trait that stores the path
/// of the file opened so that you can reference it more readily in error messages.
///
/// This struct implements dereferencing to the contained [`BufRead`] object, so any
/// [`BufRead`] methods can be called directly on it.
pub struct FileBuf<'p, F: BufRead> {
    reader: F,
    pub path: &'p Path,
}

impl<'p> FileBuf<'p, BufReader<File>> {
    /// Open a file in buffered mode.
    pub fn open(file: &'p Path) -> Result<Self, FileError> {
        let f = File::open(file).map_err(|e| FileError::CouldNotOpen {
            descr: "file".to_owned(),
            path: file.to_owned(),
            reason: e.to_string(),
        })?;
        let r = BufReader::new(f);
        Ok(Self { reader: r, path: file })
    }
}

impl<'p, F: BufRead> FileBuf<'p, F> {
    /// Read and return one line, with its trailing newline removed.
    ///
    /// Returns `Ok(None)` at the end of the file.
    pub fn read_line_opt(&mut self) -> Result<Option<String>, FileError> {
        let mut buf = String::new();
        let n = self.read_line(&mut buf).map_err(|e| FileError::CouldNotRead {
            path: self.path.to_owned(),
            reason: e.to_string(),
        })?;
        if n == 0 {
            return Ok(None);
        }
        let trimmed_len = buf.trim_end_matches(['\n', '\r']).len();
        buf.truncate(trimmed_len);
        Ok(Some(buf))
    }

    /// Return line number `line_num` (1-based) of the file.
    pub fn nth_line(&mut self, line_num: usize) -> Result<String, FileError> {
        let mut i = 0;
        while let Some(line) = self.read_line_opt()? {
            i += 1;
            if i == line_num {
                return Ok(line);
            }
        }
        Err(FileError::DataError {
            path: self.path.to_owned(),
            cause: format!("file has {i} lines, wanted line {line_num}"),
        })
    }
}

impl<'p, F: BufRead> Deref for FileBuf<'p, F> {
    type Target = F;

    fn deref(&self) -> &Self::Target {
        &self.reader
    }
}

impl<'p, F: BufRead> DerefMut for FileBuf<'p, F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.reader
    }
}

/// Return the first whitespace-separated token on line `line_num` (1-based) of `path`.
pub fn leading_token_of_line(path: &Path, line_num: usize) -> Result<String, FileError> {
    let mut f = FileBuf::open(path)?;
    let line = f.nth_line(line_num)?;
    line.split_whitespace()
        .next()
        .map(|s| s.to_string())
        .ok_or_else(|| FileError::DataError {
            path: path.to_owned(),
            cause: format!("line {line_num} is blank"),
        })
}

/// Replace every occurrence of each placeholder with its value, in order.
///
/// This is plain text replacement, the same as the `sed -e "s/A/B/"` edits the
/// tracker's documentation uses, so placeholders that are substrings of other
/// placeholders must be listed after them.
pub fn substitute_placeholders(template: &str, substitutions: &[(&str, String)]) -> String {
    let mut out = template.to_string();
    for (placeholder, value) in substitutions {
        out = out.replace(placeholder, value);
    }
    out
}

/// Read a control-file template, substitute its placeholders, and write it to `out_path`.
pub fn render_template(template_path: &Path, out_path: &Path, substitutions: &[(&str, String)]) -> Result<(), FileError> {
    let template = std::fs::read_to_string(template_path).map_err(|e| FileError::CouldNotOpen {
        descr: "control file template".to_owned(),
        path: template_path.to_owned(),
        reason: e.to_string(),
    })?;
    let rendered = substitute_placeholders(&template, substitutions);
    std::fs::write(out_path, rendered).map_err(|e| FileError::CouldNotWrite {
        path: out_path.to_owned(),
        reason: e.to_string(),
    })
}

/// Insert `suffix` between the file stem and its extension,
/// e.g. `psl_2000.nc` + `_extr` = `psl_2000_extr.nc`.
pub fn with_stem_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.file_stem().map(|s| s.to_os_string()).unwrap_or_default();
    name.push(suffix);
    if let Some(ext) = path.extension() {
        name.push(".");
        name.push(ext);
    }
    path.with_file_name(name)
}

/// The file name of `path` without its last extension, as a `String`.
pub fn file_stem_string(path: &Path) -> Option<String> {
    path.file_stem().map(|s| s.to_string_lossy().to_string())
}

/// Move a file, falling back on copy-and-delete when a rename is not possible
/// (e.g. the tracker's working area is on a different filesystem from the output).
pub fn move_file(from: &Path, to: &Path) -> Result<(), FileError> {
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }

    std::fs::copy(from, to).map_err(|e| FileError::CouldNotWrite {
        path: to.to_owned(),
        reason: format!("copying from {} failed: {e}", from.display()),
    })?;
    std::fs::remove_file(from).map_err(|e| FileError::CouldNotWrite {
        path: from.to_owned(),
        reason: format!("removing after copy failed: {e}"),
    })
}

/// Remove a file if it exists; a file that is already gone is not an error.
pub fn remove_file_if_exists(path: &Path) -> Result<bool, FileError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(FileError::CouldNotWrite { path: path.to_owned(), reason: e.to_string() }),
    }
}

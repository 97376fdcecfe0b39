//! Running the external programs this crate orchestrates.
//!
//! Everything outside this process (the tracker, its utilities, CDO and NCO) is run
//! through the [`CommandRunner`] trait so that the pipeline stages can be exercised in
//! tests without any of those programs installed. [`SystemRunner`] is the real
//! implementation; it treats any non-zero exit status as a failure. Whether the program
//! actually produced the file it should have is checked separately by the caller with
//! [`require_output`], since several of these tools exit 0 after writing nothing.
use std::{
    fmt::Display,
    fs::File,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use error_stack::ResultExt;
use itertools::Itertools;

use crate::{config::TrackConfig, error::PipelineError};

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Could not start '{0}'")]
    Spawn(String),
    #[error("'{command}' exited with status {}", .status.map(|s| s.to_string()).unwrap_or_else(|| "<signal>".to_string()))]
    NonZeroExit { command: String, status: Option<i32> },
    #[error("Could not interpret the output of '{command}': {reason}")]
    BadOutput { command: String, reason: String },
    #[error("Expected output file {} was not created", .0.display())]
    MissingOutput(PathBuf),
    #[error("I/O error while setting up '{0}'")]
    Io(String),
}

/// One invocation of an external program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub stdin_file: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl ToolCommand {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            cwd: None,
            stdin_file: None,
            env: vec![],
        }
    }

    pub fn arg<S: ToString>(mut self, arg: S) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn path_arg<P: AsRef<Path>>(mut self, arg: P) -> Self {
        self.args.push(arg.as_ref().to_string_lossy().to_string());
        self
    }

    pub fn current_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Feed the contents of `file` to the program's standard input, the way the
    /// tracker reads its control scripts (`track.linux < control.in`).
    pub fn stdin_from<P: Into<PathBuf>>(mut self, file: P) -> Self {
        self.stdin_file = Some(file.into());
        self
    }

    pub fn env<K: ToString, V: ToString>(mut self, key: K, value: V) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    /// The base name of the program, e.g. "cdo" for "/usr/bin/cdo".
    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }
}

impl Display for ToolCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program.display())?;
        for a in self.args.iter() {
            write!(f, " {a}")?;
        }
        if let Some(stdin) = &self.stdin_file {
            write!(f, " < {}", stdin.display())?;
        }
        Ok(())
    }
}

/// Something that can execute a [`ToolCommand`] and return its standard output.
pub trait CommandRunner {
    /// Run the command to completion. Implementations must return an error if the
    /// command could not be started or exited unsuccessfully.
    fn run(&self, cmd: &ToolCommand) -> error_stack::Result<String, ToolError>;
}

/// Runs commands as real subprocesses, blocking until each exits.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, cmd: &ToolCommand) -> error_stack::Result<String, ToolError> {
        let cmd_str = cmd.to_string();
        log::debug!("Running: {cmd_str}");

        let mut command = Command::new(&cmd.program);
        command.args(&cmd.args);
        if let Some(cwd) = &cmd.cwd {
            command.current_dir(cwd);
        }
        for (k, v) in cmd.env.iter() {
            command.env(k, v);
        }
        if let Some(stdin) = &cmd.stdin_file {
            let f = File::open(stdin)
                .change_context_lazy(|| ToolError::Io(cmd_str.clone()))
                .attach_printable_lazy(|| format!("could not open {} for stdin", stdin.display()))?;
            command.stdin(Stdio::from(f));
        } else {
            command.stdin(Stdio::null());
        }
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let output = command
            .output()
            .change_context_lazy(|| ToolError::Spawn(cmd_str.clone()))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(error_stack::Report::new(ToolError::NonZeroExit {
                command: cmd_str,
                status: output.status.code(),
            })
            .attach_printable(format!("stderr was:\n{}", stderr.trim_end())));
        }

        if !stderr.trim().is_empty() {
            log::trace!("stderr from {}: {}", cmd.program_name(), stderr.trim_end());
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Check that a tool produced `path`.
pub fn require_output(path: &Path) -> error_stack::Result<(), ToolError> {
    if path.exists() {
        Ok(())
    } else {
        Err(ToolError::MissingOutput(path.to_path_buf()).into())
    }
}

/// Convert tool failures into the pipeline's error taxonomy.
pub trait ToolResultExt<T> {
    /// A missing output becomes [`PipelineError::MissingArtifact`], anything else
    /// [`PipelineError::ExternalTool`] described by `during` (e.g. "regridding").
    fn during<S: ToString>(self, during: S) -> error_stack::Result<T, PipelineError>;
}

impl<T> ToolResultExt<T> for error_stack::Result<T, ToolError> {
    fn during<S: ToString>(self, during: S) -> error_stack::Result<T, PipelineError> {
        self.map_err(|report| {
            let ctx = match report.current_context() {
                ToolError::MissingOutput(p) => PipelineError::MissingArtifact(p.clone()),
                _ => PipelineError::external_tool(during.to_string()),
            };
            report.change_context(ctx)
        })
    }
}

/// The grid remapping, attribute editing, and metadata query tools (CDO and NCO).
///
/// Every method that writes a file checks that the file exists afterwards.
pub struct ClimateTools<'a> {
    runner: &'a dyn CommandRunner,
    config: &'a TrackConfig,
}

impl<'a> ClimateTools<'a> {
    pub fn new(runner: &'a dyn CommandRunner, config: &'a TrackConfig) -> Self {
        Self { runner, config }
    }

    pub fn runner(&self) -> &'a dyn CommandRunner {
        self.runner
    }

    fn cdo(&self) -> ToolCommand {
        ToolCommand::new(&self.config.cdo)
    }

    fn run_to_file(&self, cmd: ToolCommand, output: &Path) -> error_stack::Result<(), ToolError> {
        self.runner.run(&cmd)?;
        require_output(output)
    }

    /// Conservative remapping onto the named Gaussian grid (e.g. "n48").
    pub fn remap(&self, target_grid: &str, input: &Path, output: &Path) -> error_stack::Result<(), ToolError> {
        let cmd = self.cdo()
            .arg("-O")
            .arg(format!("remapcon,{target_grid}"))
            .path_arg(input)
            .path_arg(output);
        self.run_to_file(cmd, output)
    }

    /// Delete the `_FillValue` and `missing_value` attributes from every variable.
    pub fn strip_invalid_attributes(&self, input: &Path, output: &Path) -> error_stack::Result<(), ToolError> {
        let cmd = ToolCommand::new(&self.config.ncatted)
            .arg("-O")
            .arg("-a").arg("_FillValue,,d,,")
            .arg("-a").arg("missing_value,,d,,")
            .path_arg(input)
            .path_arg(output);
        self.run_to_file(cmd, output)
    }

    /// Combine the variables of two files on the same grid and time axis.
    pub fn merge_variables(&self, first: &Path, second: &Path, output: &Path) -> error_stack::Result<(), ToolError> {
        let cmd = self.cdo()
            .arg("-O")
            .arg("merge")
            .path_arg(first)
            .path_arg(second)
            .path_arg(output);
        self.run_to_file(cmd, output)
    }

    pub fn select_year(&self, year: i32, input: &Path, output: &Path) -> error_stack::Result<(), ToolError> {
        let cmd = self.cdo()
            .arg("-O")
            .arg(format!("selyear,{year}"))
            .path_arg(input)
            .path_arg(output);
        self.run_to_file(cmd, output)
    }

    /// Write a copy of `input` without the named variables.
    pub fn extract_variables<S: AsRef<str>>(&self, exclude: &[S], input: &Path, output: &Path) -> error_stack::Result<(), ToolError> {
        let varlist = exclude.iter().map(|v| v.as_ref()).join(",");
        let cmd = ToolCommand::new(&self.config.ncks)
            .arg("-C")
            .arg("-O")
            .arg("-x")
            .arg("-v")
            .arg(varlist)
            .path_arg(input)
            .path_arg(output);
        self.run_to_file(cmd, output)
    }

    pub fn show_years(&self, file: &Path) -> error_stack::Result<Vec<i32>, ToolError> {
        let cmd = self.cdo().arg("-s").arg("showyear").path_arg(file);
        let stdout = self.runner.run(&cmd)?;
        stdout
            .split_whitespace()
            .map(|tok| {
                tok.parse::<i32>().map_err(|e| {
                    error_stack::Report::new(ToolError::BadOutput {
                        command: cmd.to_string(),
                        reason: format!("'{tok}' is not a year ({e})"),
                    })
                })
            })
            .collect()
    }

    /// Date and time of every time step, as `YYYY-MM-DDTHH:MM:SS`.
    pub fn show_timestamps(&self, file: &Path) -> error_stack::Result<Vec<String>, ToolError> {
        let cmd = self.cdo().arg("-s").arg("showtimestamp").path_arg(file);
        let stdout = self.runner.run(&cmd)?;
        Ok(stdout.split_whitespace().map(|s| s.to_string()).collect())
    }

    /// The raw grid description text.
    pub fn grid_description(&self, file: &Path) -> error_stack::Result<String, ToolError> {
        let cmd = self.cdo().arg("-s").arg("griddes").path_arg(file);
        self.runner.run(&cmd)
    }

    /// The raw CDL header of the file.
    pub fn header(&self, file: &Path) -> error_stack::Result<String, ToolError> {
        let cmd = ToolCommand::new(&self.config.ncdump).arg("-h").path_arg(file);
        self.runner.run(&cmd)
    }
}

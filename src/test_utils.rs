//! Helpers shared by the unit tests.
use std::{
    cell::RefCell,
    path::{Path, PathBuf},
};

use crate::{
    config::{TrackConfig, TrackInstall},
    tools::{CommandRunner, ToolCommand, ToolError},
};

type Hook = Box<dyn Fn(&ToolCommand)>;

/// A [`CommandRunner`] that never starts a process.
///
/// Every command is recorded. Commands whose string form contains a registered pattern
/// get the canned standard output for that pattern (first match wins) and run any hooks
/// registered for it, which is how tests make the "tracker" leave output files behind.
/// CDO and NCO calls that write a file (those with `-O`) create their last argument,
/// so the pipeline's output checks pass without the real tools.
pub struct FakeRunner {
    calls: RefCell<Vec<ToolCommand>>,
    responses: RefCell<Vec<(String, String)>>,
    failures: RefCell<Vec<String>>,
    hooks: RefCell<Vec<(String, Hook)>>,
    simulate_outputs: bool,
}

impl Default for FakeRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRunner {
    pub fn new() -> Self {
        Self {
            calls: RefCell::new(vec![]),
            responses: RefCell::new(vec![]),
            failures: RefCell::new(vec![]),
            hooks: RefCell::new(vec![]),
            simulate_outputs: true,
        }
    }

    /// A runner that does not create output files for CDO/NCO calls.
    pub fn without_outputs() -> Self {
        Self { simulate_outputs: false, ..Self::new() }
    }

    pub fn respond<S: ToString>(&self, pattern: &str, stdout: S) {
        self.responses.borrow_mut().push((pattern.to_string(), stdout.to_string()));
    }

    /// Make every command matching `pattern` exit with status 1.
    pub fn fail_on(&self, pattern: &str) {
        self.failures.borrow_mut().push(pattern.to_string());
    }

    pub fn on<F: Fn(&ToolCommand) + 'static>(&self, pattern: &str, hook: F) {
        self.hooks.borrow_mut().push((pattern.to_string(), Box::new(hook)));
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls.borrow().iter().map(|c| c.to_string()).collect()
    }

    pub fn calls(&self) -> Vec<ToolCommand> {
        self.calls.borrow().clone()
    }

    /// How many recorded commands contain `pattern`.
    pub fn count_matching(&self, pattern: &str) -> usize {
        self.calls.borrow().iter().filter(|c| c.to_string().contains(pattern)).count()
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, cmd: &ToolCommand) -> error_stack::Result<String, ToolError> {
        self.calls.borrow_mut().push(cmd.clone());
        let cmd_str = cmd.to_string();

        if self.failures.borrow().iter().any(|p| cmd_str.contains(p.as_str())) {
            return Err(ToolError::NonZeroExit { command: cmd_str, status: Some(1) }.into());
        }

        let name = cmd.program_name();
        let writes_file = matches!(name.as_str(), "cdo" | "ncks" | "ncatted") && cmd.args.iter().any(|a| a == "-O");
        if self.simulate_outputs && writes_file {
            if let Some(out) = cmd.args.last() {
                std::fs::write(out, format!("{cmd_str}\n")).expect("fake tool output should be writable");
            }
        }

        for (pattern, hook) in self.hooks.borrow().iter() {
            if cmd_str.contains(pattern.as_str()) {
                hook(cmd);
            }
        }

        let stdout = self
            .responses
            .borrow()
            .iter()
            .find(|(p, _)| cmd_str.contains(p.as_str()))
            .map(|(_, r)| r.clone())
            .unwrap_or_default();

        Ok(stdout)
    }
}

/// Build the skeleton of a tracker installation (`indat`, `outdat`, `utils/bin`) under `root`.
pub fn fake_install(root: &Path) -> TrackInstall {
    for sub in ["indat", "outdat", "utils/bin", "bin"] {
        std::fs::create_dir_all(root.join(sub)).expect("fake install directories should be creatable");
    }
    TrackInstall::new_unchecked(root, TrackConfig::default())
}

/// An `ncdump -h` header for a file with the given dimensions and data variable.
pub fn fake_header(lon: &str, lat: &str, nx: usize, ny: usize, ntime: usize, variables: &[&str]) -> String {
    let mut s = format!(
        "netcdf fake {{\ndimensions:\n\ttime = UNLIMITED ; // ({ntime} currently)\n\tbnds = 2 ;\n\t{lon} = {nx} ;\n\t{lat} = {ny} ;\nvariables:\n"
    );
    s.push_str("\tdouble time(time) ;\n\t\ttime:units = \"hours since 1900-01-01\" ;\n");
    s.push_str(&format!("\tdouble {lon}({lon}) ;\n\tdouble {lat}({lat}) ;\n"));
    for v in variables {
        s.push_str(&format!("\tfloat {v}(time, {lat}, {lon}) ;\n\t\t{v}:_FillValue = 1.e+20f ;\n"));
    }
    s.push_str("\n// global attributes:\n\t\t:Conventions = \"CF-1.7\" ;\n}\n");
    s
}

/// A `cdo griddes` description with the given grid type and latitudes.
pub fn fake_griddes(gridtype: &str, nx: usize, lats: &[f64]) -> String {
    let yvals = lats.iter().map(|y| format!("{y}")).collect::<Vec<_>>();
    format!(
        "#\n# gridID 1\n#\ngridtype  = {gridtype}\ngridsize  = {}\nxsize     = {nx}\nysize     = {}\nxname     = lon\nyvals     = {}\n          {}\n",
        nx * lats.len(),
        lats.len(),
        yvals[..yvals.len() / 2].join(" "),
        yvals[yvals.len() / 2..].join(" "),
    )
}

/// Evenly spaced latitudes from 90 to -90 inclusive.
pub fn regular_lats(ny: usize) -> Vec<f64> {
    let step = 180.0 / (ny - 1) as f64;
    (0..ny).map(|i| 90.0 - step * i as f64).collect()
}

#[allow(dead_code)]
pub(crate) fn write_file(path: &Path, contents: &str) -> PathBuf {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("test file parent should be creatable");
    }
    std::fs::write(path, contents).expect("test file should be writable");
    path.to_path_buf()
}

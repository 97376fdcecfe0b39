//! Read-only description of one gridded input file.
//!
//! A [`DatasetDescriptor`] is built fresh each time a stage needs to know something
//! about a file (grid size, variables, time steps, edge rows) and then thrown away.
//! The actual reading is done by a [`DatasetInspector`]; the default [`CdoInspector`]
//! asks `ncdump` and `cdo` so that no netCDF library is needed at runtime.
use std::{
    path::{Path, PathBuf},
    sync::LazyLock,
};

use error_stack::ResultExt;
use indexmap::{IndexMap, IndexSet};
use regex::Regex;

use crate::{
    error::PipelineError,
    tools::ClimateTools,
};

/// Where a dataset came from, which determines its coordinate and variable names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, clap::ValueEnum)]
#[strum(serialize_all = "lowercase")]
pub enum SourceKind {
    /// Reanalysis output (ERA5 style names: `longitude`, `latitude`, `u`, `v`, `msl`).
    Reanalysis,
    /// Climate model output (CMIP style names: `lon`, `lat`, `ua`, `va`, `psl`).
    #[strum(to_string = "model")]
    #[value(name = "model")]
    ClimateModel,
}

impl SourceKind {
    /// Names of the (longitude, latitude) coordinate variables.
    pub fn coordinate_names(&self) -> (&'static str, &'static str) {
        match self {
            Self::Reanalysis => ("longitude", "latitude"),
            Self::ClimateModel => ("lon", "lat"),
        }
    }

    /// Names of the (U, V) wind component variables.
    pub fn wind_names(&self) -> (&'static str, &'static str) {
        match self {
            Self::Reanalysis => ("u", "v"),
            Self::ClimateModel => ("ua", "va"),
        }
    }

    /// Name of the sea level pressure variable.
    pub fn pressure_variable(&self) -> &'static str {
        match self {
            Self::Reanalysis => "msl",
            Self::ClimateModel => "psl",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum GridKind {
    Gaussian,
    Other,
}

impl GridKind {
    fn from_gridtype(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("gaussian") {
            Self::Gaussian
        } else {
            Self::Other
        }
    }
}

/// The raw facts an inspector can read from a file.
#[derive(Debug, Clone, Default)]
pub struct DatasetInfo {
    /// Variables in declaration order.
    pub variables: IndexSet<String>,
    pub dimensions: IndexMap<String, usize>,
    pub grid_type: Option<String>,
    pub xsize: Option<usize>,
    pub ysize: Option<usize>,
    pub latitudes: Vec<f64>,
}

pub trait DatasetInspector {
    fn inspect(&self, path: &Path) -> error_stack::Result<DatasetInfo, PipelineError>;
}

/// Reads dataset metadata from the text output of `ncdump -h` and `cdo griddes`.
pub struct CdoInspector<'a> {
    tools: &'a ClimateTools<'a>,
}

impl<'a> CdoInspector<'a> {
    pub fn new(tools: &'a ClimateTools<'a>) -> Self {
        Self { tools }
    }
}

impl<'a> DatasetInspector for CdoInspector<'a> {
    fn inspect(&self, path: &Path) -> error_stack::Result<DatasetInfo, PipelineError> {
        if !path.exists() {
            return Err(PipelineError::invalid_file(path, "file does not exist").into());
        }
        let header = self.tools.header(path)
            .change_context_lazy(|| PipelineError::invalid_file(path, "could not read the file header"))?;
        let mut info = parse_ncdump_header(&header)
            .change_context_lazy(|| PipelineError::invalid_file(path, "could not parse the file header"))?;

        let griddes = self.tools.grid_description(path)
            .change_context_lazy(|| PipelineError::invalid_file(path, "could not read the grid description"))?;
        let grid = parse_griddes(&griddes);
        info.grid_type = grid.grid_type;
        info.xsize = grid.xsize;
        info.ysize = grid.ysize;
        info.latitudes = grid.yvals;
        Ok(info)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Header has no '{0}' section")]
pub struct HeaderParseError(&'static str);

static DIMENSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\w+)\s*=\s*(?:(\d+)\s*;|UNLIMITED\s*;\s*//\s*\((\d+) currently\))")
        .expect("dimension regex should be valid")
});

static VARIABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:byte|char|short|ushort|int|uint|int64|uint64|float|real|double|string)\s+(\w+)\s*[(;]")
        .expect("variable regex should be valid")
});

/// Extract dimension lengths and variable names (in declaration order) from CDL.
pub fn parse_ncdump_header(header: &str) -> Result<DatasetInfo, HeaderParseError> {

    #[derive(PartialEq)]
    enum Section { Preamble, Dimensions, Variables, Attributes }

    let mut section = Section::Preamble;
    let mut saw_dims = false;
    let mut saw_vars = false;
    let mut info = DatasetInfo::default();

    for line in header.lines() {
        let trimmed = line.trim();
        if trimmed == "dimensions:" {
            section = Section::Dimensions;
            saw_dims = true;
            continue;
        } else if trimmed == "variables:" {
            section = Section::Variables;
            saw_vars = true;
            continue;
        } else if trimmed.starts_with("// global attributes") || trimmed == "data:" || trimmed == "}" {
            section = Section::Attributes;
            continue;
        }

        match section {
            Section::Dimensions => {
                if let Some(caps) = DIMENSION_RE.captures(line) {
                    let len = caps.get(2).or_else(|| caps.get(3))
                        .and_then(|m| m.as_str().parse::<usize>().ok())
                        .unwrap_or(0);
                    info.dimensions.insert(caps[1].to_string(), len);
                }
            },
            Section::Variables => {
                if let Some(caps) = VARIABLE_RE.captures(line) {
                    info.variables.insert(caps[1].to_string());
                }
            },
            _ => (),
        }
    }

    if !saw_dims {
        return Err(HeaderParseError("dimensions"));
    }
    if !saw_vars {
        return Err(HeaderParseError("variables"));
    }
    Ok(info)
}

#[derive(Debug, Default)]
struct GridDes {
    grid_type: Option<String>,
    xsize: Option<usize>,
    ysize: Option<usize>,
    yvals: Vec<f64>,
}

/// Parse the first grid of a `cdo griddes` listing. Values of a key may continue
/// over following lines that have no `=`.
fn parse_griddes(text: &str) -> GridDes {
    let mut grid = GridDes::default();
    let mut current_key: Option<String> = None;
    let mut n_grids = 0;

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("# gridID") {
            n_grids += 1;
            if n_grids > 1 {
                break;
            }
            continue;
        }
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let values = if let Some((key, value)) = trimmed.split_once('=') {
            let key = key.trim().to_string();
            match key.as_str() {
                "gridtype" => grid.grid_type = Some(value.trim().to_string()),
                "xsize" => grid.xsize = value.trim().parse().ok(),
                "ysize" => grid.ysize = value.trim().parse().ok(),
                _ => (),
            }
            current_key = Some(key);
            value
        } else {
            trimmed
        };

        if current_key.as_deref() == Some("yvals") {
            grid.yvals.extend(values.split_whitespace().filter_map(|v| v.parse::<f64>().ok()));
        }
    }
    grid
}

/// Which special latitude rows a grid contains.
///
/// The tracker's field-averaging control file needs to know about each of these
/// separately; each one present removes one row from the count it is given.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EdgeRows {
    pub north_pole: bool,
    pub south_pole: bool,
    pub equator: bool,
}

impl EdgeRows {
    pub fn from_latitudes(lats: &[f64]) -> Self {
        let near = |target: f64| lats.iter().any(|&y| approx::abs_diff_eq!(y, target, epsilon = 1e-4));
        Self {
            north_pole: near(90.0),
            south_pole: near(-90.0),
            equator: near(0.0),
        }
    }

    pub fn reduction(&self) -> usize {
        [self.north_pole, self.south_pole, self.equator].into_iter().filter(|&b| b).count()
    }

    pub fn effective_rows(&self, ny: usize) -> usize {
        ny.saturating_sub(self.reduction())
    }
}

#[derive(Debug, Clone)]
pub struct DatasetDescriptor {
    pub file_path: PathBuf,
    pub data_kind: SourceKind,
    pub variable_names: IndexSet<String>,
    pub nx: usize,
    pub ny: usize,
    pub grid_kind: GridKind,
    pub time_step_count: usize,
    pub has_north_pole: bool,
    pub has_south_pole: bool,
    pub has_equator_row: bool,
}

impl DatasetDescriptor {
    /// Describe `path`, which must contain the coordinate variables expected for `kind`.
    pub fn describe(path: &Path, kind: SourceKind, inspector: &dyn DatasetInspector) -> error_stack::Result<Self, PipelineError> {
        let info = inspector.inspect(path)?;
        Self::from_info(path, kind, info)
    }

    pub fn from_info(path: &Path, kind: SourceKind, info: DatasetInfo) -> error_stack::Result<Self, PipelineError> {
        let (lon, lat) = kind.coordinate_names();
        for coord in [lon, lat] {
            if !info.variables.contains(coord) {
                return Err(PipelineError::invalid_file(
                    path,
                    format!("coordinate variable '{coord}' expected for {kind} data is missing")
                ).into());
            }
        }

        let nx = info.xsize.or_else(|| info.dimensions.get(lon).copied())
            .ok_or_else(|| PipelineError::invalid_file(path, format!("no size for dimension '{lon}'")))?;
        let ny = info.ysize.or_else(|| info.dimensions.get(lat).copied())
            .ok_or_else(|| PipelineError::invalid_file(path, format!("no size for dimension '{lat}'")))?;
        let time_step_count = info.dimensions.get("time").copied().unwrap_or(0);
        let grid_kind = info.grid_type.as_deref().map(GridKind::from_gridtype).unwrap_or(GridKind::Other);
        let edges = EdgeRows::from_latitudes(&info.latitudes);

        Ok(Self {
            file_path: path.to_path_buf(),
            data_kind: kind,
            variable_names: info.variables,
            nx,
            ny,
            grid_kind,
            time_step_count,
            has_north_pole: edges.north_pole,
            has_south_pole: edges.south_pole,
            has_equator_row: edges.equator,
        })
    }

    pub fn has_variable(&self, name: &str) -> bool {
        self.variable_names.contains(name)
    }

    pub fn require_variable(&self, name: &str) -> error_stack::Result<(), PipelineError> {
        if self.has_variable(name) {
            Ok(())
        } else {
            Err(PipelineError::missing_variable(&self.file_path, name).into())
        }
    }

    /// The last variable declared in the file, which for single-field files is the field itself.
    pub fn trailing_variable(&self) -> Option<&str> {
        self.variable_names.last().map(|s| s.as_str())
    }

    pub fn edge_rows(&self) -> EdgeRows {
        EdgeRows {
            north_pole: self.has_north_pole,
            south_pole: self.has_south_pole,
            equator: self.has_equator_row,
        }
    }
}

/// Reads dataset metadata with the netCDF library instead of external tools.
#[cfg(feature = "netcdf")]
pub struct NetcdfInspector;

#[cfg(feature = "netcdf")]
impl DatasetInspector for NetcdfInspector {
    fn inspect(&self, path: &Path) -> error_stack::Result<DatasetInfo, PipelineError> {
        let ds = netcdf::open(path)
            .change_context_lazy(|| PipelineError::invalid_file(path, "could not open as netCDF"))?;

        let mut info = DatasetInfo::default();
        for dim in ds.dimensions() {
            info.dimensions.insert(dim.name(), dim.len());
        }
        for var in ds.variables() {
            info.variables.insert(var.name());
        }

        let lat_var = ["lat", "latitude"].into_iter().find_map(|n| ds.variable(n));
        if let Some(var) = lat_var {
            info.latitudes = var.get_values::<f64, _>(..)
                .change_context_lazy(|| PipelineError::invalid_file(path, "could not read latitudes"))?;
        }
        info.ysize = Some(info.latitudes.len());
        info.xsize = ["lon", "longitude"].into_iter().find_map(|n| info.dimensions.get(n).copied());

        // Gaussian latitudes are not evenly spaced; anything that is counts as a regular grid.
        let regular = info.latitudes
            .windows(2)
            .map(|w| w[1] - w[0])
            .collect::<Vec<_>>()
            .windows(2)
            .all(|d| approx::abs_diff_eq!(d[0], d[1], epsilon = 1e-4));
        info.grid_type = Some(if regular { "lonlat" } else { "gaussian" }.to_string());
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::{config::TrackConfig, test_utils::{fake_griddes, fake_header, regular_lats, FakeRunner}};

    #[test]
    fn test_parse_header() {
        let header = fake_header("lon", "lat", 192, 96, 124, &["psl"]);
        let info = parse_ncdump_header(&header).unwrap();
        assert_eq!(info.dimensions.get("time"), Some(&124));
        assert_eq!(info.dimensions.get("lon"), Some(&192));
        let vars: Vec<_> = info.variables.iter().map(|s| s.as_str()).collect();
        assert_eq!(vars, ["time", "lon", "lat", "psl"]);
        assert!(parse_ncdump_header("not a header").is_err());
    }

    #[test]
    fn test_parse_griddes() {
        let text = fake_griddes("gaussian", 8, &[60.0, 20.0, -20.0, -60.0]);
        let grid = parse_griddes(&text);
        assert_eq!(grid.grid_type.as_deref(), Some("gaussian"));
        assert_eq!(grid.xsize, Some(8));
        assert_eq!(grid.ysize, Some(4));
        assert_eq!(grid.yvals, vec![60.0, 20.0, -20.0, -60.0]);
    }

    #[rstest]
    #[case(true, false, true, 2)]
    #[case(false, false, false, 0)]
    #[case(true, true, true, 3)]
    #[case(false, true, false, 1)]
    fn test_edge_row_reduction(#[case] np: bool, #[case] sp: bool, #[case] eq: bool, #[case] expected: usize) {
        let edges = EdgeRows { north_pole: np, south_pole: sp, equator: eq };
        assert_eq!(edges.reduction(), expected);
        assert_eq!(edges.effective_rows(73), 73 - expected);
    }

    #[test]
    fn test_edges_from_latitudes() {
        let mut lats = regular_lats(73);
        lats.pop();
        let edges = EdgeRows::from_latitudes(&lats);
        assert_eq!(edges, EdgeRows { north_pole: true, south_pole: false, equator: true });
        assert_eq!(edges.effective_rows(lats.len()), lats.len() - 2);
    }

    #[test]
    fn test_describe() {
        let runner = FakeRunner::new();
        runner.respond("ncdump -h", fake_header("lon", "lat", 192, 96, 124, &["psl"]));
        runner.respond("griddes", fake_griddes("gaussian", 192, &[88.5, 30.0, -30.0, -88.5]));
        let config = TrackConfig::default();
        let tools = ClimateTools::new(&runner, &config);
        let inspector = CdoInspector::new(&tools);

        let dir = tempdir::TempDir::new("descriptor").unwrap();
        let file = dir.path().join("psl.nc");
        std::fs::write(&file, "").unwrap();

        let desc = DatasetDescriptor::describe(&file, SourceKind::ClimateModel, &inspector).unwrap();
        assert_eq!(desc.nx, 192);
        assert_eq!(desc.ny, 4);
        assert_eq!(desc.time_step_count, 124);
        assert_eq!(desc.grid_kind, GridKind::Gaussian);
        assert_eq!(desc.trailing_variable(), Some("psl"));
        assert!(desc.require_variable("psl").is_ok());
        let err = desc.require_variable("ua").unwrap_err();
        assert!(matches!(err.current_context(), PipelineError::MissingVariable { .. }));

        // The same file is not valid reanalysis data
        let err = DatasetDescriptor::describe(&file, SourceKind::Reanalysis, &inspector).unwrap_err();
        assert!(matches!(err.current_context(), PipelineError::InvalidFile { .. }));
    }

    #[test]
    fn test_source_kind_names() {
        assert_eq!("model".parse::<SourceKind>().unwrap(), SourceKind::ClimateModel);
        assert_eq!(SourceKind::Reanalysis.to_string(), "reanalysis");
        assert_eq!(SourceKind::ClimateModel.wind_names(), ("ua", "va"));
    }
}

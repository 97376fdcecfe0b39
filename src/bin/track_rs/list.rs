use std::path::PathBuf;

use error_stack::ResultExt;
use serde::Serialize;
use track_rs::naming::{discover_sources, SourceName};

use crate::{CliError, ListCli};

#[derive(Debug, Serialize)]
struct ListedSource {
    path: PathBuf,
    year: i32,
    variable: String,
    season: Option<String>,
    experiment: Option<String>,
    ensemble: Option<String>,
}

impl From<(PathBuf, SourceName)> for ListedSource {
    fn from((path, name): (PathBuf, SourceName)) -> Self {
        Self {
            year: name.year(),
            variable: name.variable().to_string(),
            season: name.season().map(|s| s.to_string()),
            experiment: name.experiment().map(|s| s.to_string()),
            ensemble: name.ensemble().map(|s| s.to_string()),
            path,
        }
    }
}

pub(crate) fn driver(args: ListCli) -> error_stack::Result<(), CliError> {
    let filter = args.selection.filter(args.source_kind, args.variable.as_deref());
    let found = discover_sources(&args.dir, &filter).change_context(CliError::Discovery)?;
    log::info!("{} matching file(s) under {}", found.len(), args.dir.display());

    if args.json {
        let listed: Vec<ListedSource> = found.into_iter().map(ListedSource::from).collect();
        let s = serde_json::to_string_pretty(&listed).change_context(CliError::Discovery)?;
        println!("{s}");
    } else {
        for (path, _) in found {
            println!("{}", path.display());
        }
    }
    Ok(())
}

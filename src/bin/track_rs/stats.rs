use error_stack::ResultExt;
use track_rs::{
    aggregate::Aggregator,
    chunks::RunIdAllocator,
    config::TrackConfig,
    tools::SystemRunner,
};

use crate::{locate_install, CliError, StatsCli};

pub(crate) fn driver(config: &TrackConfig, args: StatsCli) -> error_stack::Result<(), CliError> {
    let install = locate_install(config).change_context(CliError::Statistics)?;
    let run_id = RunIdAllocator::new(&install.outdat())
        .next_id()
        .change_context(CliError::Statistics)?;

    let runner = SystemRunner;
    let outputs = Aggregator::new(&runner, &install)
        .combine_and_summarize(&args.dir, &args.artifact, &args.label, &run_id, args.year_start, args.year_end)
        .change_context(CliError::Statistics)?;

    log::info!(
        "Combined {}-{} into {}",
        outputs.first_year, outputs.last_year, outputs.combined.display()
    );
    for p in outputs.statistics {
        println!("{}", p.display());
    }
    Ok(())
}

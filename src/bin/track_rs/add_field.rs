use error_stack::ResultExt;
use track_rs::{
    attach::{AttachRequest, FieldAttacher},
    chunks::RunIdAllocator,
    config::TrackConfig,
    descriptor::CdoInspector,
    tools::{ClimateTools, SystemRunner},
};

use crate::{locate_install, AddFieldCli, CliError};

pub(crate) fn driver(config: &TrackConfig, args: AddFieldCli) -> error_stack::Result<(), CliError> {
    let install = locate_install(config).change_context(CliError::AddingField)?;
    let runner = SystemRunner;
    let tools = ClimateTools::new(&runner, config);
    let inspector = CdoInspector::new(&tools);

    let mut req = AttachRequest::new(&args.aux_file, &args.track_file, args.radius, &args.field, args.source_kind);
    req.scaling = args.scaling;
    req.hour_shift = args.hour_shift;

    let run_id = RunIdAllocator::new(&install.outdat())
        .next_id()
        .change_context(CliError::AddingField)?;
    let outcome = FieldAttacher::new(&install, &tools, &inspector)
        .attach_mean_field(&req, run_id.as_str())
        .change_context(CliError::AddingField)?;

    println!("{}", outcome.attached.display());
    println!("{}", outcome.dated.display());
    if outcome.date_warning.is_some() {
        log::warn!("Check the hour shift given for {}", args.aux_file.display());
    }
    Ok(())
}

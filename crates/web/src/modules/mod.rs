//! Resource modules reachable through `<module>/manage/<verb>/...`

pub mod image;
pub mod machine;
pub mod network;

pub use image::ImageModule;
pub use machine::MachineModule;
pub use network::NetworkModule;

use crate::request::Request;
use qmanager_common::{Filter, Result, Validator, TABLE_VM};

pub(crate) const ERR_NAME_NOT_SPECIFIED: &str = "Machine name not specified";
pub(crate) const ERR_VM_NOT_FOUND: &str = "Virtual machine does not exist";

/// Machine name from the first verb argument, checked against the store
pub(crate) fn target_machine(request: &Request<'_>, args: &[String]) -> Result<String> {
    let name = args.first().cloned().unwrap_or_default();
    let mut v = Validator::from_pairs([("machine_name", name.as_str())]);
    v.required_msg("machine_name", ERR_NAME_NOT_SPECIFIED)
        .machine_name("machine_name")
        .exists(
            request.ctx.store(),
            "machine_name",
            TABLE_VM,
            "name",
            Some(ERR_VM_NOT_FOUND),
        );
    v.finish()?;
    Ok(name)
}

/// Names of all configured machines, for form selects
pub(crate) fn machine_names(request: &Request<'_>) -> Result<Vec<String>> {
    Ok(request
        .ctx
        .store()
        .select(TABLE_VM, &["name"], &Filter::all(), None)?
        .iter()
        .map(|row| row.text("name"))
        .collect())
}

/// `(value, label)` options where value and label are the same
pub(crate) fn options<S: AsRef<str>>(values: &[S]) -> Vec<(String, String)> {
    values
        .iter()
        .map(|v| (v.as_ref().to_string(), v.as_ref().to_string()))
        .collect()
}

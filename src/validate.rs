//! Validation primitives shared by the engine and the flavors.

use crate::error::{Error, Result};

/// Fail when two mutually exclusive options are both given.
pub fn check_conflict(first: (&str, bool), second: (&str, bool)) -> Result<()> {
    if first.1 && second.1 {
        return Err(Error::validation(format!(
            "cannot specify both --{} and --{}",
            first.0, second.0
        )));
    }
    Ok(())
}

/// Fail when `option` is given without the option it depends on.
pub fn check_requires(option: (&str, bool), required: (&str, bool)) -> Result<()> {
    if option.1 && !required.1 {
        return Err(Error::validation(format!(
            "--{} requires --{}",
            option.0, required.0
        )));
    }
    Ok(())
}

/// Fail unless `step` is one of `names`.
pub fn check_step_exists<'a>(
    flag: &str,
    step: &str,
    names: impl IntoIterator<Item = &'a str>,
) -> Result<()> {
    let names: Vec<&str> = names.into_iter().collect();
    if names.contains(&step) {
        return Ok(());
    }
    Err(Error::validation(format!(
        "invalid value '{}' for --{}; expected one of: {}",
        step,
        flag,
        names.join(", ")
    )))
}

/// Resolve a value that must be set before it can be used.
///
/// `what` names the field in the error, e.g. `extra_ppas[0].keep_enabled`.
pub fn require_set<T>(value: Option<T>, what: &str) -> Result<T> {
    value.ok_or_else(|| {
        Error::validation(format!(
            "{what} is not set; this value must be given explicitly"
        ))
    })
}

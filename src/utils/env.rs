// SPDX-License-Identifier: GPL-3.0-only

use std::{path::PathBuf, str::FromStr};

use tracing::warn;

pub fn bool_var(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?.to_lowercase();
    Some(parse_bool(&value))
}

fn parse_bool(value: &str) -> bool {
    ["1", "true", "yes", "y"].contains(&value)
}

pub fn path_var(name: &str) -> Option<PathBuf> {
    std::env::var_os(name)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

/// Reads and parses `name`, ignoring values that do not parse.
pub fn parsed_var<T>(name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let value = std::env::var(name).ok()?;
    value
        .parse()
        .inspect_err(|err| warn!(%err, "Ignoring invalid value of {}", name))
        .ok()
}

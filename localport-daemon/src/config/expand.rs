//! Environment variable expansion for configuration files
//!
//! Shell-style variable expansion in configuration values, supporting
//! ${VAR}, ${VAR:-default}, and ~ expansion. Expansion happens once at
//! load time against the daemon's environment.

use std::borrow::Cow;
use std::collections::HashMap;

/// Expand a string using the given environment map.
pub fn expand_with_env(s: &str, env: &HashMap<String, String>) -> String {
    shellexpand::env_with_context(
        s,
        |var| -> std::result::Result<Option<Cow<'_, str>>, std::env::VarError> {
            Ok(env.get(var).map(|v| Cow::Borrowed(v.as_str())))
        },
    )
    .map(|expanded| expanded.into_owned())
    .unwrap_or_else(|_| s.to_string())
}

/// Expand every string scalar in a YAML document in place.
///
/// Ports and thresholds arrive as YAML numbers and are untouched; only
/// string values can carry `${VAR}` references.
pub fn expand_yaml_value(value: &mut serde_yaml::Value, env: &HashMap<String, String>) {
    match value {
        serde_yaml::Value::String(s) => {
            let expanded = expand_with_env(s, env);
            if expanded != *s {
                *s = expanded;
            }
        }
        serde_yaml::Value::Sequence(seq) => {
            for item in seq {
                expand_yaml_value(item, env);
            }
        }
        serde_yaml::Value::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                expand_yaml_value(v, env);
            }
        }
        _ => {}
    }
}

/// Capture the daemon's environment as an expansion context
pub fn daemon_env() -> HashMap<String, String> {
    std::env::vars().collect()
}

#[cfg(test)]
mod tests;

//! `${VAR}` and `${VAR:-default}` substitution in option strings.

use crate::ConfigError;

/// Name of the variable that could not be resolved.
struct UnsetVar(String);

/// Substitute environment variables into `value`.
///
/// Only the braced forms are recognized. Text outside `${...}` is copied as-is,
/// so a password containing a bare `$` survives even next to a reference.
pub(crate) fn expand_env(value: &str, field: &str) -> Result<String, ConfigError> {
    let lookup = |name: &str| match std::env::var(name) {
        Ok(found) => Ok(Some(found)),
        Err(_) => Err(UnsetVar(name.to_owned())),
    };

    let mut expanded = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start..].find('}') else {
            break;
        };
        let end = start + len + 1;
        expanded.push_str(&rest[..start]);

        let reference = shellexpand::env_with_context(&rest[start..end], lookup).map_err(|e| {
            ConfigError::EnvVar {
                field: field.to_owned(),
                message: format!("${{{}}} not set", e.cause.0),
            }
        })?;
        expanded.push_str(&reference);
        rest = &rest[end..];
    }
    expanded.push_str(rest);

    Ok(expanded)
}

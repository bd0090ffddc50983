//! API token discovery
//!
//! Lookup order: `--api-token` (clap also fills it from `INTERN_TOKEN`),
//! then `~/.intern/intern.cfg`, section `[Default]` before `[Project Service]`.

use crate::error::{CliError, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

const TOKEN_SECTIONS: [&str; 2] = ["Default", "Project Service"];

/// Default location of the intern configuration file
pub fn intern_cfg_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".intern").join("intern.cfg"))
}

pub fn resolve_api_token(explicit: Option<&str>) -> Result<String> {
    resolve_api_token_from(explicit, intern_cfg_path().as_deref())
}

pub fn resolve_api_token_from(explicit: Option<&str>, cfg_path: Option<&Path>) -> Result<String> {
    if let Some(token) = explicit.map(str::trim).filter(|t| !t.is_empty()) {
        return Ok(token.to_string());
    }

    let shown = cfg_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "~/.intern/intern.cfg".to_string());
    let Some(path) = cfg_path.filter(|p| p.is_file()) else {
        return Err(CliError::MissingToken(shown));
    };

    let contents = std::fs::read_to_string(path)?;
    debug!(path = %path.display(), "Reading API token from intern config");
    token_from_cfg(&contents).ok_or(CliError::MissingToken(shown))
}

/// Pull `token` out of an INI document, preferring the first section in `TOKEN_SECTIONS`
pub fn token_from_cfg(contents: &str) -> Option<String> {
    let mut found: [Option<String>; 2] = [None, None];
    let mut section: Option<usize> = None;

    for line in contents.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            section = TOKEN_SECTIONS.iter().position(|s| *s == name.trim());
            continue;
        }
        let Some(idx) = section else { continue };
        let Some((key, value)) = line.split_once(['=', ':']) else {
            continue;
        };
        let value = value.trim();
        if key.trim().eq_ignore_ascii_case("token") && !value.is_empty() {
            found[idx] = Some(value.to_string());
        }
    }

    let [default, project] = found;
    default.or(project)
}

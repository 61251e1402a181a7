//! Dependency manifest discovery.
//!
//! Walks upward from the file a function was defined in until a `Cargo.toml`
//! is found, and records its `[dependencies]` so the remote environment can
//! be provisioned with the same third-party libraries.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const MANIFEST_FILE: &str = "Cargo.toml";

/// Third-party requirements of the crate that defined a function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyManifest {
    pub path: PathBuf,
    /// `name version` strings, sorted by name.
    pub dependencies: Vec<String>,
}

/// Find the nearest manifest at or above `source_file`. Returns None when no
/// manifest exists or it cannot be read.
pub fn discover_manifest(source_file: &Path) -> Option<DependencyManifest> {
    let start = if source_file.is_dir() {
        source_file
    } else {
        source_file.parent()?
    };

    let manifest_path = start
        .ancestors()
        .map(|dir| dir.join(MANIFEST_FILE))
        .find(|candidate| candidate.is_file())?;

    let content = match std::fs::read_to_string(&manifest_path) {
        Ok(c) => c,
        Err(e) => {
            warn!(path = %manifest_path.display(), "cannot read manifest: {e}");
            return None;
        }
    };

    match parse_dependencies(&content) {
        Ok(dependencies) => {
            debug!(path = %manifest_path.display(), count = dependencies.len(), "manifest discovered");
            Some(DependencyManifest {
                path: manifest_path,
                dependencies,
            })
        }
        Err(e) => {
            warn!(path = %manifest_path.display(), "bad manifest: {e}");
            None
        }
    }
}

/// Render the `[dependencies]` table of a Cargo manifest.
pub fn parse_dependencies(content: &str) -> Result<Vec<String>, toml::de::Error> {
    let doc: toml::Table = toml::from_str(content)?;
    let Some(deps) = doc.get("dependencies").and_then(|d| d.as_table()) else {
        return Ok(Vec::new());
    };

    let mut out: Vec<String> = deps
        .iter()
        .map(|(name, spec)| {
            let version = match spec {
                toml::Value::String(v) => Some(v.as_str()),
                toml::Value::Table(t) => t.get("version").and_then(|v| v.as_str()),
                _ => None,
            };
            match version {
                Some(v) => format!("{name} {v}"),
                None => name.clone(),
            }
        })
        .collect();
    out.sort();
    Ok(out)
}

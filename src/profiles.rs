use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::warn;

use crate::graph::TunnelProfile;

pub fn default_profiles_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".warren").join("profiles"))
}

/// Parse one profile file. An empty `id` falls back to the file stem.
pub fn load_file(path: &Path) -> Result<TunnelProfile> {
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let mut profile: TunnelProfile =
        toml::from_str(&content).with_context(|| format!("invalid profile {}", path.display()))?;
    if profile.id.trim().is_empty() {
        profile.id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
    }
    Ok(profile)
}

/// Every `*.toml` profile in `dir`, sorted by id. Unreadable files are logged and skipped.
pub fn load_all(dir: &Path) -> Result<Vec<TunnelProfile>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let pattern = dir.join("*.toml");
    let pattern = pattern.to_string_lossy();
    let paths = glob::glob(&pattern).with_context(|| format!("bad profile path {pattern}"))?;

    let mut profiles = Vec::new();
    for entry in paths {
        let path = match entry {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "cannot read profile entry");
                continue;
            }
        };
        match load_file(&path) {
            Ok(profile) => profiles.push(profile),
            Err(e) => warn!(path = %path.display(), error = %format!("{e:#}"), "skipping profile"),
        }
    }
    profiles.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(profiles)
}

pub fn find(dir: &Path, id: &str) -> Result<Option<TunnelProfile>> {
    Ok(load_all(dir)?.into_iter().find(|p| p.id == id))
}

//! Loading preference profiles from a directory of YAML files, one per user.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use lbw_core::{PreferenceProfile, ProfileFile};
use serde::Serialize;
use tokio::fs;
use tracing::warn;

#[derive(Debug, Clone, Serialize)]
pub struct RejectedProfile {
    pub path: PathBuf,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct LoadedProfiles {
    pub profiles: Vec<PreferenceProfile>,
    pub rejected: Vec<RejectedProfile>,
}

/// Parse one profile file. The user id is the file stem.
pub async fn load_profile_file(path: &Path) -> Result<PreferenceProfile> {
    let user_id = path
        .file_stem()
        .and_then(|s| s.to_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .with_context(|| format!("no user id in file name {}", path.display()))?;
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let file: ProfileFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    PreferenceProfile::from_file(user_id, file)
        .with_context(|| format!("validating {}", path.display()))
}

/// Load every `*.yaml` / `*.yml` file in `dir`, sorted by file name.
///
/// A missing or unreadable directory is an error. Individual bad files are
/// reported in [`LoadedProfiles::rejected`] and skipped.
pub async fn load_profiles_from_dir(dir: &Path) -> Result<LoadedProfiles> {
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("reading profiles directory {}", dir.display()))?;

    let mut paths = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("listing {}", dir.display()))?
    {
        let path = entry.path();
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"));
        if is_yaml && entry.file_type().await.map(|ft| ft.is_file()).unwrap_or(false) {
            paths.push(path);
        }
    }
    paths.sort();

    let mut loaded = LoadedProfiles::default();
    let mut seen = BTreeSet::new();
    for path in paths {
        match load_profile_file(&path).await {
            Ok(profile) if !seen.insert(profile.user_id.clone()) => {
                let error = format!("duplicate profile for user {}", profile.user_id);
                warn!(path = %path.display(), %error, "skipping profile");
                loaded.rejected.push(RejectedProfile { path, error });
            }
            Ok(profile) => loaded.profiles.push(profile),
            Err(err) => {
                let error = format!("{err:#}");
                warn!(path = %path.display(), %error, "skipping invalid profile");
                loaded.rejected.push(RejectedProfile { path, error });
            }
        }
    }
    Ok(loaded)
}

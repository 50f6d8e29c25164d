//! Atomic JSON snapshot I/O shared by the position cache, the pending
//! telemetry buffer, and the geocoding cache. Write-to-temp + rename keeps a
//! crash from leaving a torn file behind.

use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating snapshot dir {}", parent.display()))?;
        }
    }
    let tmp = path.with_extension("tmp");
    let body = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp, body).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("renaming {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

/// Returns `Ok(None)` when no snapshot exists yet; a corrupt file is an
/// error, which callers downgrade to a warning and an empty state.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let body = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let value = serde_json::from_slice(&body)
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(value))
}

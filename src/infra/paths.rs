// src/infra/paths.rs - Path management
//
// All paths respect the STUDYTRACK_HOME environment variable for isolation.
// When unset, everything lives under ~/.studytrack/.

use std::path::{Path, PathBuf};

/// Returns the STUDYTRACK_HOME override, if set.
fn studytrack_home() -> Option<PathBuf> {
    std::env::var_os("STUDYTRACK_HOME").map(PathBuf::from)
}

/// Configuration directory: $STUDYTRACK_HOME/ or ~/.studytrack/
pub fn config_dir() -> PathBuf {
    if let Some(home) = studytrack_home() {
        return home;
    }
    dirs_home().join(".studytrack")
}

/// Home directory (falls back to the working directory when none can be determined)
pub fn dirs_home() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Config file path
pub fn config_file_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Token store path
pub fn auth_file_path() -> PathBuf {
    config_dir().join("auth.json")
}

/// Cache directory: ~/.studytrack/cache/
pub fn cache_dir() -> PathBuf {
    config_dir().join("cache")
}

/// Last good dashboard snapshot
pub fn dashboard_cache_path() -> PathBuf {
    cache_dir().join("dashboard.json")
}

/// Write `contents` to `path` atomically: write a sibling `.tmp` file, restrict
/// it to the owner (Unix), then rename over the target.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);
    std::fs::write(&tmp_path, contents)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
    }

    std::fs::rename(&tmp_path, path)
}

/// Ensure all required directories exist
pub async fn ensure_dirs() -> anyhow::Result<()> {
    for dir in [config_dir(), cache_dir()] {
        tokio::fs::create_dir_all(&dir).await?;
    }
    Ok(())
}

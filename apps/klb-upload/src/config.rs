//! CLI configuration management.
//!
//! Configuration is stored as TOML at `$KLB_UPLOAD_CONFIG`, or by default:
//! - Linux: `~/.config/klb-upload/config.toml`
//! - Windows: `%APPDATA%/klb-upload/config.toml`

use std::path::{Path, PathBuf};

use klb_upload_client::ClientConfig;

/// Environment variable overriding the configuration file path.
pub const CONFIG_ENV: &str = "KLB_UPLOAD_CONFIG";

/// Loads configuration from disk, or creates a default if not found.
pub fn load() -> anyhow::Result<ClientConfig> {
    load_from(&config_path())
}

pub fn load_from(path: &Path) -> anyhow::Result<ClientConfig> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: ClientConfig = toml::from_str(&content)?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    } else {
        let config = ClientConfig::default();
        save_to(&config, path)?;
        Ok(config)
    }
}

/// Writes `config` to `path`, readable by the owner only (it may hold a
/// token).
pub fn save_to(config: &ClientConfig, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    tracing::debug!(path = %path.display(), "configuration saved");
    Ok(())
}

/// Returns the configuration file path.
pub fn config_path() -> PathBuf {
    if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
        return PathBuf::from(path);
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("klb-upload").join("config.toml")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home)
            .join(".config")
            .join("klb-upload")
            .join("config.toml")
    }
}

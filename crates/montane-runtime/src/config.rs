//! Configuration loading from `~/.montane/config.toml` with defaults.

use montane_types::config::EngineConfig;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Load engine configuration from a TOML file, with defaults.
///
/// A missing, unreadable, or unparsable file falls back to
/// [`EngineConfig::default`]. Configuration problems are logged, never
/// fatal.
pub fn load_config(path: Option<&Path>) -> EngineConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if config_path.exists() {
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str::<EngineConfig>(&contents) {
                Ok(config) => {
                    info!(path = %config_path.display(), "Loaded engine configuration");
                    return config;
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        path = %config_path.display(),
                        "Failed to parse config, using defaults"
                    );
                }
            },
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to read config file, using defaults"
                );
            }
        }
    }

    EngineConfig::default()
}

fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".montane")
        .join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = load_config(Some(Path::new("/definitely/not/here.toml")));
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "default_fuel = 250000").unwrap();
        let config = load_config(Some(file.path()));
        assert_eq!(config.default_fuel, 250_000);
        assert_eq!(config.default_timeout_ms, 5_000);
        assert_eq!(config.runtime, "wasmtime");
    }

    #[test]
    fn test_unparsable_file_yields_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "default_fuel = [this is not toml").unwrap();
        let config = load_config(Some(file.path()));
        assert_eq!(config, EngineConfig::default());
    }
}

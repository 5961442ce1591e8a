//! Configuration file support.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Contents of `config.toml`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Fallbacks for command-line flags.
    pub defaults: Defaults,
}

/// Values used when the matching flag is not given.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Defaults {
    /// Behave as if `--verbose` were passed.
    pub verbose: bool,
    /// Behave as if `--quiet` were passed.
    pub quiet: bool,
    /// Log filter used when `RUST_LOG` is unset.
    pub log_level: Option<String>,
    /// Worker count for pipelines that don't set one.
    pub parallelism: Option<usize>,
    /// Retries per failed record.
    pub retries: Option<usize>,
}

impl Config {
    /// Load `~/.config/xylem/config.toml`, if there is one.
    pub fn load() -> Self {
        Self::default_path()
            .map(|path| Self::load_from_path(&path))
            .unwrap_or_default()
    }

    /// Load config from `path`. A missing or malformed file yields defaults.
    pub fn load_from_path(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                eprintln!("Warning: Cannot read {}: {}", path.display(), e);
                return Self::default();
            }
        };
        toml::from_str(&contents).unwrap_or_else(|e| {
            eprintln!("Warning: Ignoring invalid config {}: {}", path.display(), e);
            Self::default()
        })
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("xylem").join("config.toml"))
    }

    /// Log filter to fall back on, given the verbosity flags.
    pub fn log_level(&self, verbose: bool, quiet: bool) -> &str {
        if quiet {
            "error"
        } else if verbose {
            "debug"
        } else {
            self.defaults.log_level.as_deref().unwrap_or("warn")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults() {
        let config: Config = toml::from_str(
            r#"
[defaults]
quiet = true
log_level = "info"
parallelism = 8
"#,
        )
        .unwrap();

        assert!(config.defaults.quiet);
        assert!(!config.defaults.verbose);
        assert_eq!(config.defaults.parallelism, Some(8));
        assert_eq!(config.defaults.retries, None);
        assert_eq!(config.log_level(false, false), "info");
        assert_eq!(config.log_level(true, false), "debug");
        assert_eq!(config.log_level(false, true), "error");
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = Config::load_from_path(Path::new("/nonexistent/xylem.toml"));
        assert_eq!(config.log_level(false, false), "warn");
    }
}

//! Project defaults from `.linewatch.toml`.
//!
//! Looked up in the working directory; anything set on the command line
//! wins over the file. Timeouts are fractional seconds, matching the CLI
//! flags.
//!
//! ```toml
//! idle-timeout = 30.0
//! capture-lines = 20
//! exclude = ["deprecation", "^warning:"]
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

const CONFIG_FILENAME: &str = ".linewatch.toml";

#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileConfig {
    /// Overall timeout, seconds.
    pub timeout: Option<f64>,
    /// Idle timeout, seconds.
    pub idle_timeout: Option<f64>,
    /// First-output timeout, seconds.
    pub first_output_timeout: Option<f64>,
    /// Post-match capture window, seconds.
    pub capture_window: Option<f64>,
    /// Post-match capture budget, lines.
    pub capture_lines: Option<u64>,
    /// Exclusion sub-patterns applied to every matcher.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Case-insensitive matching by default.
    #[serde(default)]
    pub ignore_case: bool,
    /// Prefix echoed lines with channel labels by default.
    #[serde(default)]
    pub label: bool,
    /// Skip the history recorder by default.
    #[serde(default)]
    pub no_history: bool,
}

impl FileConfig {
    /// Load from `dir/.linewatch.toml`. Missing file means defaults; a file
    /// that exists but does not parse is an error, not a silent fallback.
    pub fn load(dir: &Path) -> Result<(Self, Option<PathBuf>)> {
        let path = dir.join(CONFIG_FILENAME);
        if !path.is_file() {
            return Ok((Self::default(), None));
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        Ok((config, Some(path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, path) = FileConfig::load(tmp.path()).unwrap();
        assert_eq!(config, FileConfig::default());
        assert!(path.is_none());
    }

    #[test]
    fn parses_a_full_file() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join(CONFIG_FILENAME),
            r#"
timeout = 600.0
idle-timeout = 30.0
capture-lines = 20
exclude = ["deprecation"]
ignore-case = true
no-history = true
"#,
        )
        .unwrap();

        let (config, path) = FileConfig::load(tmp.path()).unwrap();
        assert!(path.is_some());
        assert_eq!(config.timeout, Some(600.0));
        assert_eq!(config.idle_timeout, Some(30.0));
        assert_eq!(config.capture_lines, Some(20));
        assert_eq!(config.exclude, vec!["deprecation".to_string()]);
        assert!(config.ignore_case);
        assert!(config.no_history);
        assert!(!config.label);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(CONFIG_FILENAME), "idle-timeut = 5.0\n").unwrap();
        assert!(FileConfig::load(tmp.path()).is_err());
    }
}

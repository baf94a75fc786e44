//! Process settings stored in a TOML file (default `modgraph.toml`).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::assertions::{AssertionOptions, Backtrack};
use crate::core::gate::FeatureGate;

/// Environment variable that overrides `experimental` (`1`/`true`/`0`/`false`).
pub const EXPERIMENTAL_ENV: &str = "MODGRAPH_EXPERIMENTAL";

/// Settings (TOML). Missing fields take their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    /// Allow experimental operations (`get_lm`, `set_lm`).
    pub experimental: bool,

    pub assertions: AssertionSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AssertionSettings {
    /// Attempts per top-level invocation, including the first.
    pub max_attempts: u32,

    /// Keep correction hints on predictors after an invocation ends.
    pub keep_hints: bool,
}

impl Default for AssertionSettings {
    fn default() -> Self {
        Self {
            max_attempts: AssertionOptions::default().max_attempts,
            keep_hints: false,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.assertions.max_attempts == 0 {
            return Err(anyhow!("assertions.max_attempts must be > 0"));
        }
        Ok(())
    }

    /// Apply the raw value of [`EXPERIMENTAL_ENV`], if any.
    pub fn apply_experimental_override(&mut self, raw: Option<&str>) -> Result<()> {
        let Some(raw) = raw else {
            return Ok(());
        };
        self.experimental = match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" | "" => false,
            other => bail!("{} must be a boolean, got '{}'", EXPERIMENTAL_ENV, other),
        };
        Ok(())
    }

    pub fn assertion_options(&self) -> AssertionOptions {
        AssertionOptions::with_max_attempts(self.assertions.max_attempts)
    }

    pub fn backtrack(&self) -> Backtrack {
        Backtrack {
            keep_hints: self.assertions.keep_hints,
        }
    }
}

impl FeatureGate for Settings {
    fn experimental_enabled(&self) -> bool {
        self.experimental
    }
}

/// Load settings from a TOML file, then apply the environment override.
///
/// If the file is missing, starts from `Settings::default()`.
pub fn load_settings(path: &Path) -> Result<Settings> {
    let mut settings = if path.exists() {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?
    } else {
        debug!(path = %path.display(), "settings file missing; using defaults");
        Settings::default()
    };
    let raw = std::env::var(EXPERIMENTAL_ENV).ok();
    settings.apply_experimental_override(raw.as_deref())?;
    settings.validate()?;
    Ok(settings)
}

/// Atomically write settings to disk (temp file + rename).
pub fn write_settings(path: &Path, settings: &Settings) -> Result<()> {
    settings.validate()?;
    let mut buf = toml::to_string_pretty(settings).context("serialize settings toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("settings path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp settings {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace settings {}", path.display()))?;
    Ok(())
}

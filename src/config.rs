//! Collector configuration
//!
//! Process-wide knobs: heap ceiling, collector logging, and the
//! concurrent-vs-serial tracing preference. Loaded from defaults, a TOML
//! document, or `HYBRID_GC_*` environment variables, and adjustable at
//! runtime through the `Collector` setters.

use crate::error::{GcError, GcResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Upper bound on live managed bytes. `None` disables the check.
    #[serde(default)]
    pub heap_limit: Option<usize>,

    /// Emit info-level summaries for collections and finalizer drains.
    #[serde(default = "default_true")]
    pub logging: bool,

    /// Trace objects in parallel during collection.
    #[serde(default = "default_false")]
    pub concurrent: bool,
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            heap_limit: None,
            logging: true,
            concurrent: false,
        }
    }
}

impl CollectorConfig {
    /// Parse a TOML document. Missing keys fall back to defaults.
    pub fn from_toml_str(source: &str) -> GcResult<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> GcResult<Self> {
        let source = fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Defaults overlaid with environment variables
    pub fn from_env() -> GcResult<Self> {
        Self::default().with_env()
    }

    /// Overlay `HYBRID_GC_*` environment variables onto this config.
    pub fn with_env(mut self) -> GcResult<Self> {
        // HYBRID_GC_HEAP_LIMIT: bytes, or "none"/"0" to disable
        if let Ok(value) = std::env::var("HYBRID_GC_HEAP_LIMIT") {
            self.heap_limit = parse_limit(&value)?;
        }

        // HYBRID_GC_LOG: 1/true/on or 0/false/off
        if let Ok(value) = std::env::var("HYBRID_GC_LOG") {
            self.logging = parse_flag("HYBRID_GC_LOG", &value)?;
        }

        // HYBRID_GC_CONCURRENT: 1/true/on or 0/false/off
        if let Ok(value) = std::env::var("HYBRID_GC_CONCURRENT") {
            self.concurrent = parse_flag("HYBRID_GC_CONCURRENT", &value)?;
        }

        self.validate()?;
        Ok(self)
    }

    pub fn to_toml_string(&self) -> GcResult<String> {
        toml::to_string(self).map_err(|e| GcError::config(e.to_string()))
    }

    /// Reject settings no collector can honor
    pub fn validate(&self) -> GcResult<()> {
        if self.heap_limit == Some(0) {
            return Err(GcError::config("heap_limit must be greater than zero"));
        }
        Ok(())
    }
}

fn parse_limit(value: &str) -> GcResult<Option<usize>> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("none") || value == "0" {
        return Ok(None);
    }
    value
        .parse::<usize>()
        .map(Some)
        .map_err(|_| GcError::config(format!("HYBRID_GC_HEAP_LIMIT: '{}' is not a byte count", value)))
}

fn parse_flag(name: &str, value: &str) -> GcResult<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        other => Err(GcError::config(format!("{}: '{}' is not a boolean", name, other))),
    }
}

//! Runtime configuration.
//!
//! Defaults come from `RuntimeConfig::default()`; `from_env` and `from_json`
//! layer overrides on top of them.

use std::fmt;

use serde_json::Value as Json;

/// Internal layout of an object space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceRepr {
    /// Slot array indexed by handle, freed slots recycled through a free list.
    Dense,
    /// Map keyed by handle, handles never reused.
    Sparse,
}

impl SpaceRepr {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dense" | "array" => Some(SpaceRepr::Dense),
            "sparse" | "map" => Some(SpaceRepr::Sparse),
            _ => None,
        }
    }
}

impl fmt::Display for SpaceRepr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpaceRepr::Dense => write!(f, "dense"),
            SpaceRepr::Sparse => write!(f, "sparse"),
        }
    }
}

/// Configuration for a [`BridgeRuntime`](super::context::BridgeRuntime).
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub object_space: SpaceRepr,
    /// Slots reserved up front by the dense representation.
    pub initial_capacity: usize,
    /// Negotiate the weak-reference capability with the host.
    pub weak_refs: bool,
    pub trace: bool,
    pub worker_name_prefix: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            object_space: SpaceRepr::Dense,
            initial_capacity: 64,
            weak_refs: cfg!(feature = "weak-refs"),
            trace: false,
            worker_name_prefix: "hostbridge-worker".to_string(),
        }
    }
}

/// A configuration source held a value of the wrong shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub key: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid config `{}`: {}", self.key, self.message)
    }
}

impl std::error::Error for ConfigError {}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError {
        key: key.to_string(),
        message: message.into(),
    }
}

fn parse_flag(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(invalid(key, format!("expected a boolean, got `{}`", other))),
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `HOSTBRIDGE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_vars(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn with_vars<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("HOSTBRIDGE_OBJECT_SPACE") {
            self.object_space = SpaceRepr::parse(&raw).ok_or_else(|| {
                invalid("HOSTBRIDGE_OBJECT_SPACE", format!("unknown layout `{}`", raw))
            })?;
        }
        if let Some(raw) = lookup("HOSTBRIDGE_INITIAL_CAPACITY") {
            self.initial_capacity = raw.trim().parse().map_err(|_| {
                invalid("HOSTBRIDGE_INITIAL_CAPACITY", format!("`{}` is not a count", raw))
            })?;
        }
        if let Some(raw) = lookup("HOSTBRIDGE_WEAK_REFS") {
            self.weak_refs = parse_flag("HOSTBRIDGE_WEAK_REFS", &raw)?;
        }
        if let Some(raw) = lookup("HOSTBRIDGE_TRACE") {
            self.trace = parse_flag("HOSTBRIDGE_TRACE", &raw)?;
        }
        Ok(self)
    }

    /// Defaults overridden by the keys of a JSON object.
    ///
    /// ```json
    /// { "object_space": "sparse", "weak_refs": false, "trace": true }
    /// ```
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let json: Json =
            serde_json::from_str(text).map_err(|e| invalid("<document>", e.to_string()))?;
        let Json::Object(map) = json else {
            return Err(invalid("<document>", "expected a JSON object"));
        };

        let mut config = Self::default();
        for (key, value) in &map {
            match key.as_str() {
                "object_space" => {
                    let raw = value
                        .as_str()
                        .ok_or_else(|| invalid(key, "expected a string"))?;
                    config.object_space = SpaceRepr::parse(raw)
                        .ok_or_else(|| invalid(key, format!("unknown layout `{}`", raw)))?;
                }
                "initial_capacity" => {
                    config.initial_capacity = value
                        .as_u64()
                        .ok_or_else(|| invalid(key, "expected a non-negative integer"))?
                        as usize;
                }
                "weak_refs" => {
                    config.weak_refs =
                        value.as_bool().ok_or_else(|| invalid(key, "expected a boolean"))?;
                }
                "trace" => {
                    config.trace =
                        value.as_bool().ok_or_else(|| invalid(key, "expected a boolean"))?;
                }
                "worker_name_prefix" => {
                    config.worker_name_prefix = value
                        .as_str()
                        .ok_or_else(|| invalid(key, "expected a string"))?
                        .to_string();
                }
                _ => return Err(invalid(key, "unknown key")),
            }
        }
        Ok(config)
    }
}

//! Execution configuration
//!
//! Configuration can be built in code or read from the environment:
//! - `HARP_COMPUTE_DEVICE`: `auto` (default) or a device ordinal
//! - `HARP_COMPUTE_STREAM`: `default` (default) or `dedicated`
//! - `HARP_COMPUTE_STRICT`: when set, unsupported resources are errors

use crate::error::{ComputeError, Result};

pub const DEVICE_ENV: &str = "HARP_COMPUTE_DEVICE";
pub const STREAM_ENV: &str = "HARP_COMPUTE_STREAM";
pub const STRICT_ENV: &str = "HARP_COMPUTE_STRICT";

/// Which device a context is created on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceSelection {
    /// Pick the device with the highest estimated compute throughput
    #[default]
    Auto,
    /// Use the device with this ordinal
    Ordinal(usize),
}

/// Where the kernel is launched and what is synchronized afterwards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamMode {
    /// Launch on the default stream and synchronize the whole device
    #[default]
    Default,
    /// Launch on a stream created for this execution and synchronize only it
    Dedicated,
}

/// Configuration for one [`ComputeRunner`](crate::ComputeRunner)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionConfig {
    pub device: DeviceSelection,
    pub stream: StreamMode,
    /// Fail on texture resources instead of leaving them unbound
    pub strict_resources: bool,
}

impl ExecutionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the device selection
    pub fn with_device(mut self, device: DeviceSelection) -> Self {
        self.device = device;
        self
    }

    /// Set the stream mode
    pub fn with_stream_mode(mut self, stream: StreamMode) -> Self {
        self.stream = stream;
        self
    }

    /// Enable or disable strict resource handling
    pub fn with_strict_resources(mut self, strict: bool) -> Self {
        self.strict_resources = strict;
        self
    }

    /// Read the configuration from `HARP_COMPUTE_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(device) = lookup(DEVICE_ENV) {
            config.device = match device.trim() {
                "" | "auto" => DeviceSelection::Auto,
                ordinal => ordinal
                    .parse()
                    .map(DeviceSelection::Ordinal)
                    .map_err(|_| {
                        ComputeError::Config(format!("{}={} is not `auto` or an ordinal", DEVICE_ENV, device))
                    })?,
            };
        }

        if let Some(stream) = lookup(STREAM_ENV) {
            config.stream = match stream.trim() {
                "" | "default" => StreamMode::Default,
                "dedicated" => StreamMode::Dedicated,
                other => {
                    return Err(ComputeError::Config(format!(
                        "{}={} is not `default` or `dedicated`",
                        STREAM_ENV, other
                    )))
                }
            };
        }

        config.strict_resources = lookup(STRICT_ENV).is_some();

        log::debug!("Execution config: {:?}", config);
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = ExecutionConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ExecutionConfig::default());
        assert_eq!(config.device, DeviceSelection::Auto);
        assert_eq!(config.stream, StreamMode::Default);
        assert!(!config.strict_resources);
    }

    #[test]
    fn test_reads_all_variables() {
        let config = ExecutionConfig::from_lookup(lookup(&[
            (DEVICE_ENV, "2"),
            (STREAM_ENV, "dedicated"),
            (STRICT_ENV, "1"),
        ]))
        .unwrap();

        assert_eq!(config.device, DeviceSelection::Ordinal(2));
        assert_eq!(config.stream, StreamMode::Dedicated);
        assert!(config.strict_resources);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(ExecutionConfig::from_lookup(lookup(&[(DEVICE_ENV, "fastest")])).is_err());
        assert!(ExecutionConfig::from_lookup(lookup(&[(STREAM_ENV, "async")])).is_err());
    }

    #[test]
    fn test_builder() {
        let config = ExecutionConfig::new()
            .with_device(DeviceSelection::Ordinal(1))
            .with_stream_mode(StreamMode::Dedicated)
            .with_strict_resources(true);
        assert_eq!(config.device, DeviceSelection::Ordinal(1));
        assert_eq!(config.stream, StreamMode::Dedicated);
        assert!(config.strict_resources);
    }
}

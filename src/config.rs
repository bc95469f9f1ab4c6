//! Cache Configuration
//!
//! Top-level configuration for the cache, loadable from YAML. Each section is
//! owned by the module that consumes it; this module only aggregates them and
//! provides duration parsing for human-readable values such as `"30s"`.
//!
//! ```yaml
//! default_ttl: 5m
//! fast:
//!   capacity: 67108864
//! durable:
//!   enabled: true
//!   dir: /var/cache/tiercache/durable
//! edge:
//!   enabled: false
//! compression:
//!   min_size_bytes: 1024
//! scheduler:
//!   sweep_interval: 30s
//!   pressure_threshold: 0.9
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::{
    CompressionConfig, DurableConfig, EdgeConfig, FastConfig, SchedulerConfig, DEFAULT_TTL,
};
use crate::error::{Error, Result};

/// Complete cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierCacheConfig {
    /// TTL applied when a write does not specify one
    #[serde(with = "duration_str")]
    pub default_ttl: Duration,
    /// Fast (in-memory) tier
    pub fast: FastConfig,
    /// Durable (on-disk) tier
    pub durable: DurableConfig,
    /// Edge (network-intercepting) tier
    pub edge: EdgeConfig,
    /// Background compression
    pub compression: CompressionConfig,
    /// Maintenance scheduler
    pub scheduler: SchedulerConfig,
}

impl Default for TierCacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_TTL,
            fast: FastConfig::default(),
            durable: DurableConfig::default(),
            edge: EdgeConfig::default(),
            compression: CompressionConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl TierCacheConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&raw)
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration with only in-memory tiers (no durable directory)
    pub fn in_memory() -> Self {
        let mut config = Self::default();
        config.durable.enabled = false;
        config
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.default_ttl.is_zero() {
            return Err(Error::Config("default_ttl must be greater than zero".into()));
        }
        if self.fast.capacity == 0 {
            return Err(Error::Config("fast.capacity must be greater than zero".into()));
        }
        if self.durable.enabled && self.durable.capacity == 0 {
            return Err(Error::Config(
                "durable.capacity must be greater than zero".into(),
            ));
        }
        if self.edge.enabled && self.edge.capacity == 0 {
            return Err(Error::Config("edge.capacity must be greater than zero".into()));
        }
        if self.compression.queue_depth == 0 {
            return Err(Error::Config(
                "compression.queue_depth must be greater than zero".into(),
            ));
        }
        if self.scheduler.sweep_interval.is_zero() {
            return Err(Error::Config(
                "scheduler.sweep_interval must be greater than zero".into(),
            ));
        }
        let threshold = self.scheduler.pressure_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(Error::Config(format!(
                "scheduler.pressure_threshold must be in (0, 1], got {}",
                threshold
            )));
        }
        let fraction = self.scheduler.pressure_eviction_fraction;
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(Error::Config(format!(
                "scheduler.pressure_eviction_fraction must be in (0, 1], got {}",
                fraction
            )));
        }
        Ok(())
    }
}

/// Parse a duration string like "30s", "5m", "250ms", "1h30m" or "2d".
///
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }

    let mut total_ms: u64 = 0;
    let mut chars = s.chars().peekable();

    while chars.peek().is_some() {
        let mut num_buf = String::new();
        while let Some(c) = chars.peek().copied().filter(char::is_ascii_digit) {
            num_buf.push(c);
            chars.next();
        }

        let mut unit = String::new();
        while let Some(c) = chars.peek().copied().filter(char::is_ascii_alphabetic) {
            unit.push(c);
            chars.next();
        }

        if num_buf.is_empty() {
            return Err(Error::DurationParse(format!(
                "invalid number in duration: {}",
                s
            )));
        }
        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;

        let multiplier: u64 = match unit.to_ascii_lowercase().as_str() {
            "ms" => 1,
            "" | "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            other => {
                return Err(Error::DurationParse(format!(
                    "unknown duration unit: {}",
                    other
                )))
            }
        };

        total_ms = num
            .checked_mul(multiplier)
            .and_then(|ms| total_ms.checked_add(ms))
            .ok_or_else(|| Error::DurationParse(format!("duration overflow: {}", s)))?;
    }

    Ok(Duration::from_millis(total_ms))
}

/// Format a duration in the most compact unit `parse_duration` accepts
pub fn format_duration(duration: Duration) -> String {
    let ms = duration.as_millis();
    if ms % 1_000 != 0 {
        return format!("{}ms", ms);
    }
    let secs = ms / 1_000;
    if secs != 0 && secs % 86_400 == 0 {
        format!("{}d", secs / 86_400)
    } else if secs != 0 && secs % 3_600 == 0 {
        format!("{}h", secs / 3_600)
    } else if secs != 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

/// Serde adapter for human-readable durations
pub mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn test_parse_duration_compound() {
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(
            parse_duration("1s500ms").unwrap(),
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn test_parse_duration_errors() {
        assert_matches!(parse_duration(""), Err(Error::DurationParse(_)));
        assert_matches!(parse_duration("10x"), Err(Error::DurationParse(_)));
        assert_matches!(parse_duration("ms"), Err(Error::DurationParse(_)));
        assert_matches!(parse_duration("-5s"), Err(Error::DurationParse(_)));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(300)), "5m");
        assert_eq!(format_duration(Duration::from_secs(7200)), "2h");
        assert_eq!(format_duration(Duration::from_secs(0)), "0s");
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = TierCacheConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_ttl, DEFAULT_TTL);
    }

    #[test]
    fn test_from_yaml_partial() {
        let yaml = r#"
default_ttl: 90s
fast:
  capacity: 4096
durable:
  enabled: false
scheduler:
  sweep_interval: 250ms
"#;
        let config = TierCacheConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.default_ttl, Duration::from_secs(90));
        assert_eq!(config.fast.capacity, 4096);
        assert!(!config.durable.enabled);
        assert_eq!(config.scheduler.sweep_interval, Duration::from_millis(250));
        // Untouched sections keep their defaults
        assert_eq!(
            config.compression.min_size_bytes,
            CompressionConfig::default().min_size_bytes
        );
    }

    #[test]
    fn test_from_yaml_rejects_invalid_values() {
        let yaml = "scheduler:\n  pressure_eviction_fraction: 1.5\n";
        assert_matches!(TierCacheConfig::from_yaml(yaml), Err(Error::Config(_)));

        let yaml = "fast:\n  capacity: 0\n";
        assert_matches!(TierCacheConfig::from_yaml(yaml), Err(Error::Config(_)));

        let yaml = "default_ttl: soon\n";
        assert_matches!(TierCacheConfig::from_yaml(yaml), Err(Error::Yaml(_)));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiercache.yaml");
        std::fs::write(&path, "default_ttl: 10m\nedge:\n  enabled: false\n").unwrap();

        let config = TierCacheConfig::from_file(&path).unwrap();
        assert_eq!(config.default_ttl, Duration::from_secs(600));
        assert!(!config.edge.enabled);
    }

    #[test]
    fn test_in_memory_disables_durable() {
        let config = TierCacheConfig::in_memory();
        assert!(!config.durable.enabled);
        assert!(config.edge.enabled);
    }

    #[test]
    fn test_config_yaml_round_trip_keeps_durations_readable() {
        let config = TierCacheConfig::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(yaml.contains("default_ttl: 5m"));
        let parsed = TierCacheConfig::from_yaml(&yaml).unwrap();
        assert_eq!(parsed.default_ttl, config.default_ttl);
    }
}

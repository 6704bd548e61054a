//! gridshard.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GridshardConfig {
    pub directory: Option<DirectoryConfig>,
    pub coordination: Option<CoordinationConfig>,
    #[serde(default)]
    pub controllers: Vec<ControllerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Path of the redb directory file.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Full re-list interval (e.g., "30s").
    pub resync_interval: Option<String>,
    /// Health / workload report interval (e.g., "10s").
    pub health_interval: Option<String>,
    /// How often the daemon acknowledges an idle sweep (e.g., "1s").
    pub sweep_interval: Option<String>,
    /// Records whose heartbeat is older than this are reaped. Unset disables reaping.
    pub heartbeat_ttl: Option<String>,
    pub max_cas_attempts: Option<u32>,
    pub max_join_attempts: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub controller_type: String,
    /// Number of instances of this type to run in one daemon.
    pub instances: Option<u32>,
}

/// Coordination settings with every default filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCoordination {
    pub resync_interval: Duration,
    pub health_interval: Duration,
    pub sweep_interval: Duration,
    pub heartbeat_ttl: Option<Duration>,
    pub max_cas_attempts: u32,
    pub max_join_attempts: u32,
}

impl Default for ResolvedCoordination {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(30),
            health_interval: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(1),
            heartbeat_ttl: None,
            max_cas_attempts: 5,
            max_join_attempts: 5,
        }
    }
}

impl GridshardConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: GridshardConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Directory file path, falling back to `<data_dir>/gridshard.redb`.
    pub fn directory_path(&self, data_dir: &Path) -> PathBuf {
        self.directory
            .as_ref()
            .and_then(|d| d.path.clone())
            .unwrap_or_else(|| data_dir.join("gridshard.redb"))
    }

    /// Resolve coordination settings, rejecting unparseable durations.
    pub fn coordination(&self) -> anyhow::Result<ResolvedCoordination> {
        let mut resolved = ResolvedCoordination::default();
        let Some(c) = &self.coordination else {
            return Ok(resolved);
        };

        if let Some(s) = &c.resync_interval {
            resolved.resync_interval = require_duration("resync_interval", s)?;
        }
        if let Some(s) = &c.health_interval {
            resolved.health_interval = require_duration("health_interval", s)?;
        }
        if let Some(s) = &c.sweep_interval {
            resolved.sweep_interval = require_duration("sweep_interval", s)?;
        }
        if let Some(s) = &c.heartbeat_ttl {
            resolved.heartbeat_ttl = Some(require_duration("heartbeat_ttl", s)?);
        }
        if let Some(n) = c.max_cas_attempts {
            anyhow::ensure!(n > 0, "max_cas_attempts must be at least 1");
            resolved.max_cas_attempts = n;
        }
        if let Some(n) = c.max_join_attempts {
            anyhow::ensure!(n > 0, "max_join_attempts must be at least 1");
            resolved.max_join_attempts = n;
        }
        if let Some(ttl) = resolved.heartbeat_ttl {
            // Live peers would reap each other between health reports.
            anyhow::ensure!(
                ttl > resolved.health_interval,
                "heartbeat_ttl must be longer than health_interval"
            );
        }
        Ok(resolved)
    }

    /// Scaffold a config running one instance per listed controller type.
    pub fn scaffold(controller_types: &[&str]) -> Self {
        GridshardConfig {
            directory: Some(DirectoryConfig {
                path: Some(PathBuf::from("/var/lib/gridshard/gridshard.redb")),
            }),
            coordination: Some(CoordinationConfig {
                resync_interval: Some("30s".to_string()),
                health_interval: Some("10s".to_string()),
                sweep_interval: Some("1s".to_string()),
                heartbeat_ttl: Some("2m".to_string()),
                max_cas_attempts: Some(5),
                max_join_attempts: Some(5),
            }),
            controllers: controller_types
                .iter()
                .map(|t| ControllerConfig {
                    controller_type: t.to_string(),
                    instances: Some(1),
                })
                .collect(),
        }
    }
}

fn require_duration(field: &str, value: &str) -> anyhow::Result<Duration> {
    let duration = parse_duration(value)
        .ok_or_else(|| anyhow::anyhow!("invalid duration for {field}: {value:?}"))?;
    // Tick periods must be non-zero.
    anyhow::ensure!(!duration.is_zero(), "{field} must be greater than zero");
    Ok(duration)
}

/// Parse a duration like "500ms", "30s", "5m" or a bare number of seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaffold_round_trips() {
        let config = GridshardConfig::scaffold(&["cluster", "site"]);
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("cluster"));
        assert!(toml_str.contains("heartbeat_ttl"));

        let parsed: GridshardConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.controllers.len(), 2);
        assert_eq!(parsed.coordination().unwrap().heartbeat_ttl, Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_parse_minimal() {
        let config: GridshardConfig = toml::from_str("").unwrap();
        assert!(config.controllers.is_empty());
        assert_eq!(config.coordination().unwrap(), ResolvedCoordination::default());
        assert_eq!(
            config.directory_path(Path::new("/tmp/gs")),
            PathBuf::from("/tmp/gs/gridshard.redb")
        );
    }

    #[test]
    fn test_parse_controllers_and_overrides() {
        let toml_str = r#"
[coordination]
resync_interval = "5s"
sweep_interval = "250ms"
max_cas_attempts = 3

[[controllers]]
controller_type = "cluster"
instances = 3
"#;
        let config: GridshardConfig = toml::from_str(toml_str).unwrap();
        let coord = config.coordination().unwrap();
        assert_eq!(coord.resync_interval, Duration::from_secs(5));
        assert_eq!(coord.sweep_interval, Duration::from_millis(250));
        assert_eq!(coord.max_cas_attempts, 3);
        assert_eq!(coord.max_join_attempts, 5);
        assert_eq!(config.controllers[0].instances, Some(3));
    }

    #[test]
    fn test_invalid_duration_rejected() {
        let toml_str = r#"
[coordination]
health_interval = "soon"
"#;
        let config: GridshardConfig = toml::from_str(toml_str).unwrap();
        assert!(config.coordination().is_err());
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let toml_str = r#"
[coordination]
max_cas_attempts = 0
"#;
        let config: GridshardConfig = toml::from_str(toml_str).unwrap();
        assert!(config.coordination().is_err());
    }

    #[test]
    fn test_zero_intervals_rejected() {
        for field in ["resync_interval", "health_interval", "sweep_interval"] {
            for zero in ["0s", "0ms", "0"] {
                let toml_str = format!("[coordination]\n{field} = \"{zero}\"\n");
                let config: GridshardConfig = toml::from_str(&toml_str).unwrap();
                let err = config.coordination().unwrap_err();
                assert!(err.to_string().contains(field), "{field} = {zero}: {err}");
            }
        }
    }

    #[test]
    fn test_ttl_shorter_than_health_interval_rejected() {
        let toml_str = r#"
[coordination]
health_interval = "10s"
heartbeat_ttl = "5s"
"#;
        let config: GridshardConfig = toml::from_str(toml_str).unwrap();
        assert!(config.coordination().is_err());
    }

    #[test]
    fn parse_duration_values() {
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("7"), Some(Duration::from_secs(7)));
        assert_eq!(parse_duration("invalid"), None);
    }
}

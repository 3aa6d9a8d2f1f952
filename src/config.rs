use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::feed::DEFAULT_USER_AGENT;
use crate::scheduler::SchedulerConfig;

pub const DEFAULT_CONFIG_PATH: &str = "gator.yaml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub db_url: String,
    /// Set by `register` and `login`.
    pub current_user_name: Option<String>,
    pub aggregator: AggregatorConfig,
    pub log: LogSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_url: "sqlite:gator.db".to_string(),
            current_user_name: None,
            aggregator: AggregatorConfig::default(),
            log: LogSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub concurrency: usize,
    pub interval_secs: u64,
    pub fetch_timeout_secs: u64,
    pub lease_secs: u64,
    /// Feeds claimed per cycle; defaults to `concurrency`.
    pub batch_size: Option<usize>,
    pub user_agent: String,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            interval_secs: 60,
            fetch_timeout_secs: 30,
            lease_secs: 300,
            batch_size: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl AggregatorConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            concurrency: self.concurrency,
            interval: Duration::from_secs(self.interval_secs),
            fetch_timeout: self.fetch_timeout(),
            lease: Duration::from_secs(self.lease_secs),
            batch_size: self.batch_size.unwrap_or(self.concurrency),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub console_level: String,
    pub file_level: String,
    pub file: Option<String>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            console_level: "info".to_string(),
            file_level: "debug".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Reads the config file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("invalid config file {}", path.display()))?;

        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)
            .with_context(|| format!("failed to write config file {}", path.display()))?;
        Ok(())
    }

    pub fn set_user(&mut self, name: &str, path: &Path) -> Result<()> {
        self.current_user_name = Some(name.to_string());
        self.save(path)
    }
}

/// Parses durations such as `45`, `90s`, `5m`, `1h30m` or `500ms`. A bare
/// number is seconds.
pub fn parse_interval(input: &str) -> Result<Duration> {
    let input = input.trim();
    if input.is_empty() {
        bail!("empty interval");
    }

    let total = match input.parse::<u64>() {
        Ok(secs) => Duration::from_secs(secs),
        Err(_) => {
            let mut total = Duration::ZERO;
            let mut rest = input;

            while !rest.is_empty() {
                let digits = rest
                    .find(|c: char| !c.is_ascii_digit())
                    .unwrap_or(rest.len());
                if digits == 0 {
                    bail!("invalid interval '{}'", input);
                }
                let value: u64 = rest[..digits].parse()?;
                rest = &rest[digits..];

                let unit_len = rest
                    .find(|c: char| c.is_ascii_digit())
                    .unwrap_or(rest.len());
                let unit = &rest[..unit_len];
                rest = &rest[unit_len..];

                let part = match unit {
                    "ms" => Some(Duration::from_millis(value)),
                    "s" => Some(Duration::from_secs(value)),
                    "m" => value.checked_mul(60).map(Duration::from_secs),
                    "h" => value.checked_mul(3600).map(Duration::from_secs),
                    other => bail!("unknown unit '{}' in interval '{}'", other, input),
                };
                total = part
                    .and_then(|part| total.checked_add(part))
                    .with_context(|| format!("interval '{}' is too large", input))?;
            }

            total
        }
    };

    if total.is_zero() {
        bail!("interval must be greater than zero");
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_partial_file_fills_in_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gator.yaml");
        fs::write(
            &path,
            "db_url: sqlite:/tmp/other.db\naggregator:\n  concurrency: 8\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();

        assert_eq!(config.db_url, "sqlite:/tmp/other.db");
        assert_eq!(config.aggregator.concurrency, 8);
        assert_eq!(config.aggregator.interval_secs, 60);
        assert_eq!(config.log, LogSettings::default());

        let scheduler = config.aggregator.scheduler_config();
        assert_eq!(scheduler.batch_size, 8);
        assert_eq!(scheduler.interval, Duration::from_secs(60));
    }

    #[test]
    fn test_set_user_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gator.yaml");

        let mut config = Config::default();
        config.set_user("kahya", &path).unwrap();

        let reloaded = Config::load(&path).unwrap();
        assert_eq!(reloaded.current_user_name.as_deref(), Some("kahya"));
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gator.yaml");
        fs::write(&path, "aggregator: [not, a, map]\n").unwrap();

        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_parse_interval() {
        assert_eq!(parse_interval("45").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_interval("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_interval("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_interval("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_interval("1m500ms").unwrap(), Duration::from_millis(60_500));
    }

    #[test]
    fn test_parse_interval_rejects_garbage() {
        assert!(parse_interval("").is_err());
        assert!(parse_interval("0").is_err());
        assert!(parse_interval("m5").is_err());
        assert!(parse_interval("5d").is_err());
        assert!(parse_interval("0s").is_err());
    }

    #[test]
    fn test_parse_interval_rejects_overflow() {
        let err = parse_interval("5124095576030432h").unwrap_err();
        assert!(err.to_string().contains("too large"));

        let max = u64::MAX.to_string();
        assert!(parse_interval(&format!("{}m", max)).is_err());
        assert!(parse_interval(&format!("{}s{}s", max, max)).is_err());
        assert_eq!(
            parse_interval(&format!("{}s", max)).unwrap(),
            Duration::from_secs(u64::MAX)
        );
    }
}

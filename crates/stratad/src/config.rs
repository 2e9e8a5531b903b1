//! stratad.toml configuration.
//!
//! Every field has a default, so an empty file (or none at all) runs a
//! single-node control plane. Durations are written as `"500ms"`, `"30s"`,
//! `"2m"` or `"1h"`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use strata_activator::ActivatorConfig;
use strata_entity::schema::Resources;
use strata_entity::DEFAULT_WATCH_BUFFER;
use strata_runner::RunnerConfig;
use strata_scheduler::SchedulerConfig;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub log_format: LogFormat,
    /// Used when `RUST_LOG` is unset.
    pub log_filter: String,
    pub store: StoreConfig,
    pub scheduler: SchedulerSection,
    pub activator: ActivatorSection,
    pub runner: RunnerSection,
    pub network: NetworkConfig,
    pub disk: DiskConfig,
    pub ingress: IngressSection,
    pub api: ApiSection,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Text,
            log_filter: "info,strata=debug".to_string(),
            store: StoreConfig::default(),
            scheduler: SchedulerSection::default(),
            activator: ActivatorSection::default(),
            runner: RunnerSection::default(),
            network: NetworkConfig::default(),
            disk: DiskConfig::default(),
            ingress: IngressSection::default(),
            api: ApiSection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    /// Keep everything in memory; nothing survives a restart.
    pub in_memory: bool,
    /// Events a watcher may fall behind before it is disconnected.
    pub watch_buffer: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/strata"),
            in_memory: false,
            watch_buffer: DEFAULT_WATCH_BUFFER,
        }
    }
}

impl StoreConfig {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("strata.redb")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    #[serde(with = "duration_str")]
    pub retry_base: Duration,
    #[serde(with = "duration_str")]
    pub retry_max: Duration,
    pub max_placement_attempts: u32,
    #[serde(with = "duration_str")]
    pub heartbeat_staleness: Duration,
    #[serde(with = "duration_str")]
    pub resync_interval: Duration,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        let d = SchedulerConfig::default();
        Self {
            retry_base: d.retry_base,
            retry_max: d.retry_max,
            max_placement_attempts: d.max_placement_attempts,
            heartbeat_staleness: d.heartbeat_staleness,
            resync_interval: d.resync_interval,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivatorSection {
    #[serde(with = "duration_str")]
    pub cold_start_timeout: Duration,
    #[serde(with = "duration_str")]
    pub sweep_interval: Duration,
    /// Idle time before a window is retired, when the version sets none.
    #[serde(with = "duration_str")]
    pub default_idle_ttl: Duration,
    pub default_port: u16,
}

impl Default for ActivatorSection {
    fn default() -> Self {
        let d = ActivatorConfig::default();
        Self {
            cold_start_timeout: d.cold_start_timeout,
            sweep_interval: d.sweep_interval,
            default_idle_ttl: d.default_scale_down_delay,
            default_port: d.default_port,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSection {
    pub node_name: String,
    /// Host sandboxes bind and advertise.
    pub address: String,
    pub cpu_millis: u64,
    pub memory_mb: u64,
    #[serde(with = "duration_str")]
    pub heartbeat_interval: Duration,
    #[serde(with = "duration_str")]
    pub resync_interval: Duration,
}

impl Default for RunnerSection {
    fn default() -> Self {
        let d = RunnerConfig::default();
        Self {
            node_name: d.node_name,
            address: d.address,
            cpu_millis: d.capacity.cpu_millis,
            memory_mb: d.capacity.memory_mb,
            heartbeat_interval: d.heartbeat_interval,
            resync_interval: d.resync_interval,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// CIDR service addresses are allocated from.
    pub service_subnet: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            service_subnet: "10.96.0.0/16".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    /// How long released leases are kept before deletion.
    #[serde(with = "duration_str")]
    pub released_retention: Duration,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            released_retention: strata_controllers::DEFAULT_RELEASED_RETENTION,
        }
    }
}

macro_rules! listen_section {
    ($(#[$meta:meta])* $name:ident, $port:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(default)]
        pub struct $name {
            pub host: IpAddr,
            pub port: u16,
        }

        impl Default for $name {
            fn default() -> Self {
                Self {
                    host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                    port: $port,
                }
            }
        }

        impl $name {
            pub fn addr(&self) -> SocketAddr {
                SocketAddr::new(self.host, self.port)
            }
        }
    };
}

listen_section!(
    /// Where the app-facing ingress listens.
    IngressSection,
    8080
);
listen_section!(
    /// Where the REST API listens.
    ApiSection,
    8443
);

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            retry_base: self.scheduler.retry_base,
            retry_max: self.scheduler.retry_max,
            max_placement_attempts: self.scheduler.max_placement_attempts,
            heartbeat_staleness: self.scheduler.heartbeat_staleness,
            resync_interval: self.scheduler.resync_interval,
        }
    }

    pub fn activator_config(&self) -> ActivatorConfig {
        ActivatorConfig {
            cold_start_timeout: self.activator.cold_start_timeout,
            sweep_interval: self.activator.sweep_interval,
            default_scale_down_delay: self.activator.default_idle_ttl,
            default_port: self.activator.default_port,
            ..ActivatorConfig::default()
        }
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            node_name: self.runner.node_name.clone(),
            address: self.runner.address.clone(),
            capacity: Resources::new(self.runner.cpu_millis, self.runner.memory_mb),
            heartbeat_interval: self.runner.heartbeat_interval,
            resync_interval: self.runner.resync_interval,
        }
    }
}

/// Parse `"250ms"`, `"30s"`, `"2m"` or `"1h"`. A bare number is seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let n: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration {s:?}"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(n)),
        "" | "s" => Ok(Duration::from_secs(n)),
        "m" => Ok(Duration::from_secs(n * 60)),
        "h" => Ok(Duration::from_secs(n * 3600)),
        other => Err(format!("unknown duration unit {other:?} in {s:?}")),
    }
}

/// Inverse of [`parse_duration`], in the largest exact unit.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms == 0 {
        return "0s".to_string();
    }
    if ms % 1000 != 0 {
        return format!("{ms}ms");
    }
    let secs = ms / 1000;
    if secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_duration(&raw).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5d").is_err());
        assert!(parse_duration("ms").is_err());

        for d in ["250ms", "30s", "2m", "1h", "90s"] {
            assert_eq!(format_duration(parse_duration(d).unwrap()), d);
        }
    }

    #[test]
    fn empty_file_gives_defaults() {
        let config = DaemonConfig::from_toml_str("").unwrap();
        assert_eq!(config, DaemonConfig::default());
        assert_eq!(config.api.port, 8443);
        assert_eq!(config.ingress.port, 8080);
        assert_eq!(config.activator_config().cold_start_timeout, Duration::from_secs(30));
    }

    #[test]
    fn partial_sections_override() {
        let config = DaemonConfig::from_toml_str(
            r#"
log_format = "json"

[store]
in_memory = true

[activator]
cold_start_timeout = "5s"
default_idle_ttl = "10m"

[runner]
node_name = "edge-1"
cpu_millis = 8000

[network]
service_subnet = "10.200.0.0/24"

[api]
port = 9000
"#,
        )
        .unwrap();
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(config.store.in_memory);
        let activator = config.activator_config();
        assert_eq!(activator.cold_start_timeout, Duration::from_secs(5));
        assert_eq!(activator.default_scale_down_delay, Duration::from_secs(600));
        assert_eq!(activator.sweep_interval, Duration::from_secs(20));
        let runner = config.runner_config();
        assert_eq!(runner.node_name, "edge-1");
        assert_eq!(runner.capacity, Resources::new(8000, 4096));
        assert_eq!(config.network.service_subnet, "10.200.0.0/24");
        assert_eq!(config.api.addr().port(), 9000);
    }

    #[test]
    fn bad_duration_is_rejected() {
        let err = DaemonConfig::from_toml_str("[scheduler]\nretry_base = \"soon\"\n").unwrap_err();
        assert!(err.to_string().contains("invalid duration"));
    }

    #[test]
    fn serialized_config_parses_back() {
        let config = DaemonConfig::default();
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("cold_start_timeout = \"30s\""));
        assert_eq!(DaemonConfig::from_toml_str(&text).unwrap(), config);
    }
}

//! Run configuration, loaded once from a TOML file at startup and passed by
//! reference to everything that needs it. Never mutated after load.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: General,
    pub tester: EndpointConfig,
    pub sut: EndpointConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct General {
    /// Packet sizes to sweep, in bytes including CRC.
    pub pkt_sizes: Vec<u32>,
    /// Hold time of one measurement window, in seconds.
    pub test_duration: f64,
    /// Minimum distinguishable interval for the bisection search.
    pub test_precision: f64,
    /// Packet loss tolerated before a probe counts as failed, in percent.
    pub tolerated_loss: f64,
    pub number_of_ports: u32,
    /// Names of the calibration tests to run, resolved via the registry.
    pub tests: Vec<String>,
}

impl Default for General {
    fn default() -> Self {
        Self {
            pkt_sizes: vec![64, 128, 256, 512, 1024, 1280, 1518],
            test_duration: 5.0,
            test_precision: 1.0,
            tolerated_loss: 0.0,
            number_of_ports: 4,
            tests: vec!["throughput".to_string()],
        }
    }
}

/// Connection and installation parameters for one remote endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub ip: String,
    #[serde(default = "default_user")]
    pub user: String,
    /// Installation directory of the traffic engine on the remote host.
    #[serde(default = "default_engine_dir")]
    pub engine_dir: String,
    /// Engine binary, relative to `engine_dir`.
    #[serde(default = "default_engine_bin")]
    pub engine_bin: String,
    /// Extra arguments passed to the engine on launch.
    #[serde(default)]
    pub engine_args: String,
    /// Engine configuration file, copied to the remote host before launch.
    #[serde(default)]
    pub config_file: Option<String>,
    /// NUMA socket the engine's cores are expected on.
    #[serde(default)]
    pub socket_id: u32,
    #[serde(default = "default_control_port")]
    pub control_port: u16,
}

fn default_user() -> String {
    "root".to_string()
}

fn default_engine_dir() -> String {
    "/root/prox".to_string()
}

fn default_engine_bin() -> String {
    "./build/prox".to_string()
}

fn default_control_port() -> u16 {
    8474
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Config> {
        let cfg: Config = toml::from_str(text)?;
        if let Some(&bad) = cfg.general.pkt_sizes.iter().find(|&&s| s < 64) {
            bail!("packet size {} is below the 64-byte Ethernet minimum", bad);
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[tester]
ip = "10.0.0.1"

[sut]
ip = "10.0.0.2"
"#;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let cfg = Config::parse(MINIMAL).unwrap();
        assert_eq!(cfg.general.pkt_sizes, vec![64, 128, 256, 512, 1024, 1280, 1518]);
        assert_eq!(cfg.general.test_duration, 5.0);
        assert_eq!(cfg.general.test_precision, 1.0);
        assert_eq!(cfg.general.tolerated_loss, 0.0);
        assert_eq!(cfg.general.number_of_ports, 4);
        assert_eq!(cfg.tester.user, "root");
        assert_eq!(cfg.tester.control_port, 8474);
        assert_eq!(cfg.sut.socket_id, 0);
        assert!(cfg.sut.config_file.is_none());
    }

    #[test]
    fn test_explicit_values_override_defaults() {
        let cfg = Config::parse(
            r#"
[general]
pkt_sizes = [64, 1518]
test_duration = 10.0
test_precision = 0.5
tolerated_loss = 0.001
number_of_ports = 1
tests = ["throughput"]

[tester]
ip = "192.168.1.10"
user = "perf"
engine_dir = "/opt/engine"
config_file = "gen.cfg"
socket_id = 1
control_port = 9999

[sut]
ip = "192.168.1.20"
"#,
        )
        .unwrap();
        assert_eq!(cfg.general.pkt_sizes, vec![64, 1518]);
        assert_eq!(cfg.general.test_precision, 0.5);
        assert_eq!(cfg.tester.user, "perf");
        assert_eq!(cfg.tester.control_port, 9999);
        assert_eq!(cfg.tester.config_file.as_deref(), Some("gen.cfg"));
        assert_eq!(cfg.tester.socket_id, 1);
        assert_eq!(cfg.sut.engine_dir, "/root/prox");
    }

    #[test]
    fn test_pkt_size_below_ethernet_minimum_is_rejected() {
        let err = Config::parse(
            r#"
[general]
pkt_sizes = [64, 32]

[tester]
ip = "10.0.0.1"

[sut]
ip = "10.0.0.2"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("32"));
    }

    #[test]
    fn test_missing_endpoint_is_an_error() {
        assert!(Config::parse("[tester]\nip = \"10.0.0.1\"\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loadcal.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.tester.ip, "10.0.0.1");
    }
}

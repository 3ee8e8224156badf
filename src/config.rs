use crate::prelude::*;

use crate::sma::session::{SessionConfig, UserGroup};
use crate::sma::packet::PASSWORD_LEN;

use serde_with::{serde_as, DisplayFromStr};
use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub plants: Vec<Plant>,

    #[serde(default = "Config::default_loglevel")]
    pub loglevel: String,

    /// Optional path to append JSON reports to; stdout when unset
    pub report_file: Option<String>,
}

// Plant {{{
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct Plant {
    pub name: String,

    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    #[serde_as(as = "DisplayFromStr")]
    pub address: DeviceAddress,

    pub device: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,

    #[serde(default)]
    pub login: UserGroup,
    #[serde(default = "Config::default_password")]
    pub password: String,

    #[serde(default = "Config::default_retry")]
    pub retry: u32,
    #[serde(default = "Config::default_read_timeout")]
    pub read_timeout: u64,
    #[serde(default = "Config::default_logon_rounds")]
    pub logon_rounds: usize,

    #[serde_as(as = "Vec<DisplayFromStr>")]
    #[serde(default = "Config::default_data_points")]
    pub data_points: Vec<DataPoint>,
}

/// How the plant's byte stream is reached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Link {
    Device(String),
    Tcp(String, u16),
}

impl Plant {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    pub fn link(&self) -> Result<Link> {
        match (&self.device, &self.host, self.port) {
            (Some(device), None, _) => Ok(Link::Device(device.clone())),
            (None, Some(host), Some(port)) => Ok(Link::Tcp(host.clone(), port)),
            (None, Some(_), None) => bail!("plant {}: host needs a port", self.name),
            (Some(_), Some(_), _) => bail!("plant {}: set either device or host, not both", self.name),
            (None, None, _) => bail!("plant {}: one of device or host is required", self.name),
        }
    }

    pub fn retry(&self) -> u32 {
        self.retry.max(1)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        match self.read_timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn data_points(&self) -> &[DataPoint] {
        &self.data_points
    }

    /// Distinct groups covering the requested data points, in protocol order.
    pub fn query_groups(&self) -> Vec<QueryGroup> {
        self.data_points
            .iter()
            .filter_map(|dp| dp.group())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            address: self.address,
            user_group: self.login,
            password: self.password.clone(),
            logon_rounds: self.logon_rounds,
        }
    }
} // }}}

impl Config {
    pub fn new(file: &str) -> Result<Self> {
        let content = std::fs::read_to_string(file)
            .map_err(|err| anyhow!("error reading {}: {}", file, err))?;

        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("error parsing {}", file))?;

        config.validate()?;
        Ok(config)
    }

    pub fn log_summary(&self) {
        info!("Configuration loaded successfully:");
        info!(
            "  Plants: {} configured, {} enabled",
            self.plants.len(),
            self.plants.iter().filter(|p| p.enabled).count()
        );
        for plant in &self.plants {
            info!("    Plant {}:", plant.name);
            info!("      Enabled: {}", plant.enabled);
            info!("      Address: {}", plant.address);
            match plant.link() {
                Ok(Link::Device(device)) => info!("      Device: {}", device),
                Ok(Link::Tcp(host, port)) => info!("      Bridge: {}:{}", host, port),
                Err(_) => {}
            }
            info!("      Login: {:?}", plant.login);
            info!("      Retry: {}", plant.retry);
            info!("      Read Timeout: {}s", plant.read_timeout);
            info!("      Logon Rounds: {}", plant.logon_rounds);
            info!(
                "      Data Points: {}",
                plant
                    .data_points
                    .iter()
                    .map(|dp| dp.name())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        info!("  Report File: {}", self.report_file.as_deref().unwrap_or("stdout"));
        info!("  Log Level: {}", self.loglevel);
    }

    fn validate(&self) -> Result<()> {
        if self.plants.is_empty() {
            bail!("no plants configured");
        }

        let mut names = HashSet::new();
        for (i, plant) in self.plants.iter().enumerate() {
            if plant.name.is_empty() {
                bail!("plant[{}].name cannot be empty", i);
            }
            if !names.insert(plant.name.as_str()) {
                bail!("plant name {} is used twice", plant.name);
            }
            if !plant.enabled {
                continue;
            }

            plant.link()?;
            if plant.port == Some(0) {
                bail!("plant {}: port must be between 1 and 65535", plant.name);
            }
            if plant.password.len() > PASSWORD_LEN {
                bail!(
                    "plant {}: password is longer than {} characters",
                    plant.name,
                    PASSWORD_LEN
                );
            }
            if plant.logon_rounds == 0 {
                bail!("plant {}: logon_rounds must be at least 1", plant.name);
            }
            if plant.data_points.is_empty() {
                bail!("plant {}: no data points requested", plant.name);
            }
            if let Some(dp) = plant.data_points.iter().find(|dp| dp.group().is_none()) {
                bail!("plant {}: {} cannot be queried on its own", plant.name, dp);
            }
        }

        Ok(())
    }

    fn default_enabled() -> bool {
        true
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }

    fn default_password() -> String {
        "0000".to_string()
    }

    fn default_retry() -> u32 {
        10
    }

    fn default_read_timeout() -> u64 {
        10
    }

    fn default_logon_rounds() -> usize {
        10
    }

    fn default_data_points() -> Vec<DataPoint> {
        vec![
            DataPoint::MeteringTotWhOut,
            DataPoint::MeteringDyWhOut,
            DataPoint::GridMsTotW,
        ]
    }
}

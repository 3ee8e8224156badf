use crate::prelude::*;

use crate::config::Link;
use crate::registry;
use crate::sma::session::SessionController;
use crate::sma::transport::{DeviceTransport, TcpTransport, Transport};

use std::collections::{BTreeMap, HashMap};

/// Values of one inverter after a successful poll.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct InverterReport {
    pub utc_timestamp: i64,
    pub plant: String,
    pub address: DeviceAddress,
    pub serial: SmaSerial,
    pub values: BTreeMap<String, Value>,
}

/// Polls the configured plants, one session per plant.
pub struct Coordinator {
    config: Config,
    registries: HashMap<String, SharedRegistry>,
}

impl Coordinator {
    pub fn new(config: Config) -> Self {
        let registries = config
            .plants
            .iter()
            .map(|p| (p.name.clone(), InverterRegistry::shared()))
            .collect();

        Self { config, registries }
    }

    pub fn registry(&self, plant: &str) -> Option<&SharedRegistry> {
        self.registries.get(plant)
    }

    /// Polls every enabled plant, or just `only`, concurrently.
    pub async fn poll(&self, only: Option<&str>) -> Result<Vec<(String, Result<Vec<InverterReport>>)>> {
        let plants: Vec<&Plant> = self
            .config
            .plants
            .iter()
            .filter(|p| p.enabled())
            .filter(|p| only.map_or(true, |name| p.name() == name))
            .collect();

        if plants.is_empty() {
            match only {
                Some(name) => bail!("no enabled plant named {}", name),
                None => bail!("no enabled plants"),
            }
        }

        let polls = plants.into_iter().map(|plant| async move {
            (plant.name().to_string(), self.poll_plant(plant).await)
        });

        Ok(futures::future::join_all(polls).await)
    }

    pub async fn poll_plant(&self, plant: &Plant) -> Result<Vec<InverterReport>> {
        let registry = self
            .registries
            .get(plant.name())
            .cloned()
            .ok_or_else(|| anyhow!("plant {} has no registry", plant.name()))?;

        let transport: Box<dyn Transport> = match plant.link()? {
            Link::Device(path) => Box::new(DeviceTransport::new(path, plant.read_timeout())),
            Link::Tcp(host, port) => Box::new(TcpTransport::new(&host, port, plant.read_timeout())),
        };

        Self::poll_with(plant, transport, registry).await
    }

    /// Runs sessions against `transport` until one succeeds or the plant's
    /// retry budget is spent.
    pub async fn poll_with<T: Transport>(
        plant: &Plant,
        transport: T,
        registry: SharedRegistry,
    ) -> Result<Vec<InverterReport>> {
        let groups = plant.query_groups();
        let mut session = SessionController::new(transport, plant.session_config(), registry.clone());

        let mut attempt = 1;
        let result = loop {
            info!("plant {}: session {} of {}", plant.name(), attempt, plant.retry());
            match session.run(&groups).await {
                Ok(()) => break Ok(()),
                Err(e) if attempt < plant.retry() => {
                    warn!("plant {}: {}, retrying", plant.name(), e);
                    attempt += 1;
                }
                Err(e) => break Err(e),
            }
        };

        session.stats().print_summary(plant.name());
        result.with_context(|| format!("plant {} failed after {} session(s)", plant.name(), attempt))?;

        Ok(Self::reports(plant, &registry))
    }

    fn reports(plant: &Plant, registry: &SharedRegistry) -> Vec<InverterReport> {
        let utc_timestamp = chrono::Utc::now().timestamp();
        let registry = registry::read(registry);

        registry
            .iter()
            .filter_map(|record| {
                let serial = record.serial()?;
                let values = plant
                    .data_points()
                    .iter()
                    .filter(|dp| record.is_fresh(**dp))
                    .filter_map(|dp| record.value(*dp).map(|v| (dp.name(), v.clone())))
                    .collect();

                Some(InverterReport {
                    utc_timestamp,
                    plant: plant.name().to_string(),
                    address: record.address(),
                    serial,
                    values,
                })
            })
            .collect()
    }
}

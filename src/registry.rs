use crate::error::Result;
use crate::sma::address::{DeviceAddress, SmaSerial, ADDRESS_LEN};
use crate::sma::data_point::{DataPoint, QueryGroup};
use crate::sma::decoder::{Decoded, Reading, Value};

use log::debug;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

// InverterRecord {{{
/// Latest telemetry of one inverter.
#[derive(Clone, Debug)]
pub struct InverterRecord {
    address: DeviceAddress,
    serial: Option<SmaSerial>,
    readings: HashMap<DataPoint, Reading>,
    // populated since the last query of their group
    fresh: BTreeSet<DataPoint>,
}

impl InverterRecord {
    pub fn new(address: DeviceAddress) -> Self {
        Self {
            address,
            serial: None,
            readings: HashMap::new(),
            fresh: BTreeSet::new(),
        }
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    pub fn serial(&self) -> Option<SmaSerial> {
        self.serial
    }

    pub fn reading(&self, data_point: DataPoint) -> Option<&Reading> {
        self.readings.get(&data_point)
    }

    pub fn value(&self, data_point: DataPoint) -> Option<&Value> {
        self.reading(data_point).map(|r| &r.value)
    }

    pub fn is_fresh(&self, data_point: DataPoint) -> bool {
        self.fresh.contains(&data_point)
    }

    pub fn fresh(&self) -> impl Iterator<Item = DataPoint> + '_ {
        self.fresh.iter().copied()
    }

    /// Clears freshness for the data points a new query of `group` will fetch.
    pub fn invalidate(&mut self, group: QueryGroup) {
        for data_point in group.data_points() {
            self.fresh.remove(&data_point);
        }
    }

    pub fn apply(&mut self, decoded: &Decoded) {
        for (data_point, reading) in &decoded.readings {
            self.readings.insert(*data_point, reading.clone());
            self.fresh.insert(*data_point);
        }
    }
} // }}}

// InverterRegistry {{{
/// Inverters discovered on a plant, indexed by exact address and by serial.
#[derive(Clone, Debug, Default)]
pub struct InverterRegistry {
    records: Vec<InverterRecord>,
    by_address: HashMap<[u8; ADDRESS_LEN], usize>,
    by_serial: HashMap<SmaSerial, usize>,
}

pub type SharedRegistry = Arc<RwLock<InverterRegistry>>;

impl InverterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedRegistry {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Adds an inverter seen in the topology. Existing records keep their readings.
    pub fn register(&mut self, address: DeviceAddress) -> &mut InverterRecord {
        let index = match self.by_address.get(address.as_bytes()) {
            Some(index) => *index,
            None => {
                debug!("registering inverter {}", address);
                self.records.push(InverterRecord::new(address));
                let index = self.records.len() - 1;
                self.by_address.insert(*address.as_bytes(), index);
                index
            }
        };
        &mut self.records[index]
    }

    /// Records the identity reported by the inverter at `address`.
    /// Returns false when the address was never registered.
    pub fn assign_serial(&mut self, address: &DeviceAddress, serial: SmaSerial) -> bool {
        let Some(&index) = self.by_address.get(address.as_bytes()) else {
            return false;
        };

        let record = &mut self.records[index];
        if let Some(previous) = record.serial.replace(serial) {
            if previous != serial {
                self.by_serial.remove(&previous);
            }
        }
        self.by_serial.insert(serial, index);
        true
    }

    pub fn contains_address(&self, address: &DeviceAddress) -> bool {
        self.by_address.contains_key(address.as_bytes())
    }

    pub fn contains_serial(&self, serial: &SmaSerial) -> bool {
        self.by_serial.contains_key(serial)
    }

    pub fn by_address(&self, address: &DeviceAddress) -> Option<&InverterRecord> {
        self.by_address
            .get(address.as_bytes())
            .map(|index| &self.records[*index])
    }

    pub fn by_serial(&self, serial: &SmaSerial) -> Option<&InverterRecord> {
        self.by_serial.get(serial).map(|index| &self.records[*index])
    }

    pub fn invalidate(&mut self, group: QueryGroup) {
        for record in &mut self.records {
            record.invalidate(group);
        }
    }

    /// Stores a decode pass for `serial`. Returns false for unknown serials.
    pub fn apply(&mut self, serial: &SmaSerial, decoded: &Decoded) -> bool {
        match self.by_serial.get(serial) {
            Some(index) => {
                self.records[*index].apply(decoded);
                true
            }
            None => false,
        }
    }

    /// Looks up a data point by mnemonic or code for an inverter.
    pub fn value(&self, serial: &SmaSerial, name: &str) -> Result<Option<&Value>> {
        let data_point = DataPoint::from_name(name)?;
        Ok(self.by_serial(serial).and_then(|r| r.value(data_point)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &InverterRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
} // }}}

// A poisoned lock still holds a consistent registry; records only change in
// apply and assign_serial.
pub fn read(registry: &SharedRegistry) -> RwLockReadGuard<'_, InverterRegistry> {
    registry.read().unwrap_or_else(PoisonError::into_inner)
}

pub fn write(registry: &SharedRegistry) -> RwLockWriteGuard<'_, InverterRegistry> {
    registry.write().unwrap_or_else(PoisonError::into_inner)
}

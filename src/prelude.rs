pub use anyhow::{anyhow, bail, Context, Result};
pub use log::{debug, error, info, trace, warn};
pub use serde::{Deserialize, Serialize};
pub use std::str::FromStr;

pub use crate::config::{Config, Plant};
pub use crate::options::Options;
pub use crate::registry::{InverterRegistry, SharedRegistry};
pub use crate::sma::address::{DeviceAddress, SmaSerial};
pub use crate::sma::data_point::{DataPoint, QueryGroup};
pub use crate::sma::decoder::Value;

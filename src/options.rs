use clap::Parser;

/// SMA Bridge - polls SMA inverters over Bluetooth
#[derive(Debug, Parser)]
#[clap(author, version)]
pub struct Options {
    /// Config file to read
    #[clap(short = 'c', long = "config", default_value = "config.yaml")]
    pub config_file: String,

    /// Only poll the plant with this name
    #[clap(short = 'p', long = "plant")]
    pub plant: Option<String>,
}

impl Options {
    pub fn new() -> Self {
        Self::parse()
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}

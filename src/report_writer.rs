use crate::prelude::*;

use crate::coordinator::InverterReport;

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Appends reports as JSON lines to a file, or to stdout.
#[derive(Clone)]
pub struct ReportWriter {
    sink: Arc<Mutex<Box<dyn Write + Send>>>,
    target: String,
    reports_written: Arc<Mutex<u64>>,
}

impl ReportWriter {
    pub fn new(path: Option<&str>) -> Result<Self> {
        let (sink, target): (Box<dyn Write + Send>, String) = match path {
            Some(path) => {
                info!("Opening report file at {}", path);
                if let Some(parent) = Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }

                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("failed to open report file {}", path))?;
                (Box::new(file), path.to_string())
            }
            None => (Box::new(std::io::stdout()), "stdout".to_string()),
        };

        Ok(Self {
            sink: Arc::new(Mutex::new(sink)),
            target,
            reports_written: Arc::new(Mutex::new(0)),
        })
    }

    pub fn write(&self, report: &InverterReport) -> Result<()> {
        let line = serde_json::to_string(report)?;

        let mut sink = self
            .sink
            .lock()
            .map_err(|_| anyhow!("Failed to lock report sink"))?;
        writeln!(sink, "{}", line).with_context(|| format!("failed to write to {}", self.target))?;
        sink.flush()?;

        let mut written = self
            .reports_written
            .lock()
            .map_err(|_| anyhow!("Failed to lock report counter"))?;
        *written += 1;
        debug!("{} report(s) written to {}", *written, self.target);

        Ok(())
    }

    pub fn reports_written(&self) -> u64 {
        self.reports_written.lock().map(|n| *n).unwrap_or_default()
    }
}

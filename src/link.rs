use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;

use crate::error::ScanError;

/// Opening the port resets the board; commands sent before it boots are lost.
const BOARD_RESET_DELAY: Duration = Duration::from_secs(2);

/// Write-only line channel to a firmware. Clones share the same port, so
/// the motor and the LED ring can drive one board.
#[derive(Clone)]
pub struct SerialLink {
    port_name: String,
    writer: Arc<Mutex<Option<Box<dyn Write + Send>>>>,
}

impl SerialLink {
    pub fn connect(port_name: &str, baud_rate: u32) -> Result<SerialLink> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(Duration::from_secs(1))
            .open()
            .map_err(|e| {
                ScanError::Connection(format!("{port_name} at {baud_rate} baud: {e}"))
            })?;
        log::info!("Initializing serial connection on {port_name}");
        std::thread::sleep(BOARD_RESET_DELAY);
        Ok(SerialLink::from_writer(port_name, Box::new(port)))
    }

    pub fn from_writer(port_name: &str, writer: Box<dyn Write + Send>) -> SerialLink {
        SerialLink {
            port_name: port_name.to_string(),
            writer: Arc::new(Mutex::new(Some(writer))),
        }
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Writes one framed line. There is no acknowledgement.
    pub fn send(&self, line: &str) -> Result<()> {
        let mut guard = self
            .writer
            .lock()
            .map_err(|_| ScanError::Connection(format!("{}: link poisoned", self.port_name)))?;
        let writer = guard
            .as_mut()
            .ok_or_else(|| ScanError::Connection(format!("{}: link is closed", self.port_name)))?;
        writer.write_all(line.as_bytes())?;
        writer.flush()?;
        log::debug!("{} <- {:?}", self.port_name, line);
        Ok(())
    }

    pub fn close(&self) {
        if let Ok(mut guard) = self.writer.lock() {
            if guard.take().is_some() {
                log::info!("Serial connection {} closed", self.port_name);
            }
        }
    }
}

//! RFCOMM Connection Module
//!
//! Finds the paired target device and opens its RFCOMM stream.

use crate::domain::error::LinkError;
use crate::domain::settings::{DeviceBinding, Settings};
use crate::infrastructure::bluetooth::channel::{ByteChannel, SerialChannel};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

/// A device in the system's paired list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairedDevice {
    pub address: String,
    /// Where the device's stream is reached (serial node for bound RFCOMM).
    pub endpoint: String,
}

/// Platform Bluetooth access the link depends on.
pub trait Adapter: Send + Sync {
    /// Fails with `AdapterUnavailable` when there is no usable adapter.
    fn check_available(&self) -> Result<(), LinkError>;
    fn paired_devices(&self) -> Result<Vec<PairedDevice>, LinkError>;
    fn open_rfcomm(&self, device: &PairedDevice, service: u128)
        -> io::Result<Box<dyn ByteChannel>>;
}

/// The live link to the rig.
pub struct LinkHandle {
    pub id: u64,
    pub address: String,
    pub channel: Box<dyn ByteChannel>,
}

impl std::fmt::Debug for LinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkHandle")
            .field("id", &self.id)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Look up `address` among paired devices and open its stream.
///
/// Blocking; a single attempt with no internal retry.
pub fn open_link(
    adapter: &dyn Adapter,
    address: &str,
    service: u128,
) -> Result<LinkHandle, LinkError> {
    adapter.check_available()?;

    let device = adapter
        .paired_devices()?
        .into_iter()
        .find(|d| d.address == address)
        .ok_or_else(|| LinkError::NotPaired(address.to_string()))?;

    debug!("Opening RFCOMM stream to {} via {}", address, device.endpoint);
    let channel = adapter.open_rfcomm(&device, service)?;

    let id = NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed);
    info!("Link {} open to {}", id, address);
    Ok(LinkHandle {
        id,
        address: address.to_string(),
        channel,
    })
}

/// Adapter for RFCOMM channels bound to serial device nodes.
///
/// The configured bindings whose node exists form the paired-device list.
pub struct SerialAdapter {
    adapter_path: PathBuf,
    bindings: Vec<DeviceBinding>,
    baud_rate: u32,
    read_timeout: Duration,
}

impl SerialAdapter {
    pub fn new(settings: &Settings) -> Self {
        Self {
            adapter_path: PathBuf::from(&settings.adapter_sysfs_path),
            bindings: settings.paired_devices.clone(),
            baud_rate: settings.baud_rate,
            read_timeout: Duration::from_millis(settings.read_timeout_ms),
        }
    }
}

impl Adapter for SerialAdapter {
    fn check_available(&self) -> Result<(), LinkError> {
        let has_controller = std::fs::read_dir(&self.adapter_path)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false);

        if has_controller {
            Ok(())
        } else {
            Err(LinkError::AdapterUnavailable(format!(
                "no controller under {}",
                self.adapter_path.display()
            )))
        }
    }

    fn paired_devices(&self) -> Result<Vec<PairedDevice>, LinkError> {
        Ok(self
            .bindings
            .iter()
            .filter(|b| Path::new(&b.port).exists())
            .map(|b| PairedDevice {
                address: b.address.clone(),
                endpoint: b.port.clone(),
            })
            .collect())
    }

    fn open_rfcomm(
        &self,
        device: &PairedDevice,
        _service: u128,
    ) -> io::Result<Box<dyn ByteChannel>> {
        // The binding already targets the SPP channel; the UUID is fixed.
        let channel = SerialChannel::open(&device.endpoint, self.baud_rate, self.read_timeout)?;
        Ok(Box::new(channel))
    }
}

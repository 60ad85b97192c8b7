//! Driver facade
//!
//! Device and tag registration on top of sessions, schedulers and
//! supervisors. A tag name maps to a `CA.IOA.TypeID[.ElementIndex]` address
//! on a registered device; reads come from the covering block's last-value
//! cache, writes dispatch commands through the device's session.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::info;

use crate::address::TagAddress;
use crate::codec::asdu::Cause;
use crate::codec::time::Cp56Time2a;
use crate::codec::value::{QualityDescriptor, Value};
use crate::config::DeviceConfig;
use crate::error::{Iec104Error, Result};
use crate::scheduler::BlockScheduler;
use crate::session::Iec104Session;
use crate::supervisor::{BackoffPolicy, SessionSupervisor};

/// One coerced tag read: value plus its delivery context
#[derive(Debug, Clone, PartialEq)]
pub struct TagReading {
    pub value: Value,
    pub quality: QualityDescriptor,
    /// When the client ingested the value
    pub received_at: DateTime<Utc>,
    /// Peer-supplied time tag, where the type carries one
    pub time_tag: Option<Cp56Time2a>,
    /// Why the peer sent it (cyclic, spontaneous, interrogated, ...)
    pub cause: Cause,
}

struct TagEntry {
    device: String,
    address: TagAddress,
}

/// Everything running on behalf of one registered device
struct DeviceRuntime {
    config: DeviceConfig,
    session: Arc<Iec104Session>,
    scheduler: Arc<BlockScheduler>,
    scheduler_task: tokio::task::JoinHandle<()>,
    supervisor_task: tokio::task::JoinHandle<()>,
    shutdown: tokio_util::sync::CancellationToken,
}

/// The driver facade: registry of devices and tags
#[derive(Default)]
pub struct Iec104Driver {
    devices: DashMap<String, Arc<DeviceRuntime>>,
    /// Endpoint ("host:port") to device name, for session lookup
    endpoints: DashMap<String, String>,
    tags: DashMap<String, TagEntry>,
}

impl Iec104Driver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device: builds its session, spawns the reconnect
    /// supervisor and the block scheduler. One session per (host, port).
    pub fn register_device(&self, config: DeviceConfig) -> Result<()> {
        config.validate()?;
        let name = config.name.clone();
        let endpoint = config.session.endpoint();

        if self.devices.contains_key(&name) {
            return Err(Iec104Error::config(format!(
                "device {name:?} already registered"
            )));
        }
        if self.endpoints.contains_key(&endpoint) {
            return Err(Iec104Error::config(format!(
                "endpoint {endpoint} already owned by another device"
            )));
        }

        let session = Arc::new(Iec104Session::new(name.clone(), config.session.clone())?);
        let scheduler = Arc::new(BlockScheduler::new(
            Arc::clone(&session),
            config.blocks.clone(),
        ));
        let scheduler_task = Arc::clone(&scheduler).spawn();

        let supervisor = SessionSupervisor::new(Arc::clone(&session), BackoffPolicy::default());
        let shutdown = supervisor.shutdown_token();
        let supervisor_task = supervisor.spawn();

        self.endpoints.insert(endpoint.clone(), name.clone());
        self.devices.insert(
            name.clone(),
            Arc::new(DeviceRuntime {
                config,
                session,
                scheduler,
                scheduler_task,
                supervisor_task,
                shutdown,
            }),
        );
        info!(
            session = %name,
            event_kind = "device_registered",
            detail = %endpoint,
            "device registered"
        );
        Ok(())
    }

    /// Stop a device's tasks, disconnect its session and drop its tags.
    pub async fn remove_device(&self, name: &str) -> Result<()> {
        let (_, runtime) = self
            .devices
            .remove(name)
            .ok_or_else(|| Iec104Error::NoSession(name.to_string()))?;

        runtime.shutdown.cancel();
        runtime.scheduler_task.abort();
        runtime.supervisor_task.abort();
        runtime.session.disconnect().await;

        self.endpoints.remove(&runtime.config.session.endpoint());
        self.tags.retain(|_, entry| entry.device != name);
        info!(
            session = %name,
            event_kind = "device_removed",
            detail = "",
            "device removed"
        );
        Ok(())
    }

    /// Register a tag name against a device and an address string of the
    /// form `CA.IOA.TypeID[.ElementIndex]`.
    pub fn register_tag(&self, device: &str, tag: &str, address: &str) -> Result<()> {
        if !self.devices.contains_key(device) {
            return Err(Iec104Error::NoSession(device.to_string()));
        }
        let address = TagAddress::parse(address)?;
        self.tags.insert(
            tag.to_string(),
            TagEntry {
                device: device.to_string(),
                address,
            },
        );
        Ok(())
    }

    pub fn remove_tag(&self, tag: &str) {
        self.tags.remove(tag);
    }

    pub fn tag_address(&self, tag: &str) -> Option<TagAddress> {
        self.tags.get(tag).map(|entry| entry.address)
    }

    pub fn device_names(&self) -> Vec<String> {
        self.devices.iter().map(|e| e.key().clone()).collect()
    }

    /// Read a tag from its block's last-value cache.
    ///
    /// `Stale` means the session is down, no block covers the address, or no
    /// value has been delivered yet; `TagNotFound` means the name was never
    /// registered.
    pub fn read_tag(&self, tag: &str) -> Result<TagReading> {
        let entry = self
            .tags
            .get(tag)
            .ok_or_else(|| Iec104Error::TagNotFound(tag.to_string()))?;
        let runtime = self
            .devices
            .get(&entry.device)
            .ok_or_else(|| Iec104Error::NoSession(entry.device.clone()))?;

        if !runtime.session.state().is_connected() {
            return Err(Iec104Error::Stale(format!("{tag}: session is down")));
        }

        let address = entry.address;
        let ioa = address.effective_ioa();
        let block = runtime
            .scheduler
            .block_covering(address.common_addr, ioa)
            .ok_or_else(|| {
                Iec104Error::Stale(format!(
                    "{tag}: no enabled block covers CA {} IOA {ioa}",
                    address.common_addr
                ))
            })?;

        let cached = block
            .cache()
            .get(ioa)
            .ok_or_else(|| Iec104Error::Stale(format!("{tag}: no value cached yet")))?;

        if cached.type_id != address.type_id {
            return Err(Iec104Error::Stale(format!(
                "{tag}: cached type {:?} does not match declared {:?}",
                cached.type_id, address.type_id
            )));
        }

        Ok(TagReading {
            value: cached.object.value,
            quality: cached.object.quality,
            received_at: cached.received_at,
            time_tag: cached.object.time,
            cause: cached.cause,
        })
    }

    /// Dispatch a command write through the tag's session.
    ///
    /// Monitoring-direction tags are rejected with `TagReadOnly`;
    /// `NoSession` when the device's session is not in data transfer.
    pub async fn write_tag(&self, tag: &str, value: Value) -> Result<()> {
        let (device, address) = {
            let entry = self
                .tags
                .get(tag)
                .ok_or_else(|| Iec104Error::TagNotFound(tag.to_string()))?;
            (entry.device.clone(), entry.address)
        };
        if !address.is_writable() {
            return Err(Iec104Error::TagReadOnly(tag.to_string()));
        }

        let runtime = self
            .devices
            .get(&device)
            .ok_or_else(|| Iec104Error::NoSession(device.clone()))?;
        if !runtime.session.is_active() {
            return Err(Iec104Error::NoSession(format!(
                "{device}: session not active"
            )));
        }

        let session = Arc::clone(&runtime.session);
        drop(runtime);
        session
            .send_command(
                address.common_addr,
                address.effective_ioa(),
                address.type_id,
                value,
                false,
            )
            .await
    }

    /// Session diagnostics for one device.
    pub fn diagnostics(&self, device: &str) -> Option<std::collections::HashMap<String, String>> {
        self.devices.get(device).map(|runtime| {
            let mut diag = runtime.session.diagnostics();
            diag.insert(
                "blocks".to_string(),
                runtime.scheduler.blocks().len().to_string(),
            );
            diag.insert("tags".to_string(), {
                self.tags
                    .iter()
                    .filter(|t| t.value().device == device)
                    .count()
                    .to_string()
            });
            diag
        })
    }
}

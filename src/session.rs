//! Session facade
//!
//! Caller-facing surface over one outstation connection. Every mutating
//! operation is forwarded into the engine mailbox, so sequence state and the
//! outbound socket can never interleave between callers. The facade itself
//! is `&self` throughout and is shared behind an `Arc` by the scheduler and
//! supervisor tasks.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::info;

use crate::codec::asdu::{Asdu, Cause, InformationObject, TypeId};
use crate::codec::time::Cp56Time2a;
use crate::codec::value::Value;
use crate::config::Iec104Config;
use crate::engine::{self, ConnectionState, EngineCommand, EngineHandle};
use crate::error::{Iec104Error, Result};
use crate::transport::Transport;

/// Qualifier of interrogation: station interrogation.
pub const QOI_STATION: u8 = 20;

/// Qualifier of counter interrogation: general request, no freeze/reset.
pub const QCC_GENERAL: u8 = 5;

/// One client session against one outstation
pub struct Iec104Session {
    name: String,
    config: Iec104Config,
    engine: RwLock<Option<EngineHandle>>,
    task: RwLock<Option<tokio::task::JoinHandle<()>>>,
    /// Serializes connect/disconnect against each other
    lifecycle: Mutex<()>,
}

impl Iec104Session {
    /// Build a session; nothing touches the network until [`connect`].
    ///
    /// [`connect`]: Iec104Session::connect
    pub fn new(name: impl Into<String>, config: Iec104Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config,
            engine: RwLock::new(None),
            task: RwLock::new(None),
            lifecycle: Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &Iec104Config {
        &self.config
    }

    pub fn endpoint(&self) -> String {
        self.config.endpoint()
    }

    /// Current connection state; `Disconnected` before the first connect.
    pub fn state(&self) -> ConnectionState {
        self.engine
            .read()
            .as_ref()
            .map(|e| e.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    /// Establish the TCP session and start the protocol tasks. Sequence
    /// counters start from zero; a session that died must reconnect through
    /// here and never reuses counters.
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.state().is_connected() {
            return Ok(());
        }

        let transport = Transport::connect(&self.config.transport_config()).await?;
        let (handle, task) = engine::spawn(self.name.clone(), &self.config, transport);
        *self.engine.write() = Some(handle);
        *self.task.write() = Some(task);
        info!(
            session = %self.name,
            event_kind = "connected",
            detail = %self.endpoint(),
            "session connected"
        );
        Ok(())
    }

    /// Tear the session down and wait for its tasks to finish. Outstanding
    /// API calls are drained with `Disconnected`.
    pub async fn disconnect(&self) {
        let _guard = self.lifecycle.lock().await;
        let handle = self.engine.write().take();
        if let Some(handle) = handle {
            handle.disconnect().await;
        }
        let task = self.task.write().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// STARTDT handshake; `Ok` once the peer confirms within t1.
    pub async fn start_data_transfer(&self) -> Result<()> {
        self.request_u(|reply| EngineCommand::StartDataTransfer { reply })
            .await
    }

    /// STOPDT handshake; `Ok` once the peer confirms within t1.
    pub async fn stop_data_transfer(&self) -> Result<()> {
        self.request_u(|reply| EngineCommand::StopDataTransfer { reply })
            .await
    }

    /// TESTFR probe; `Ok` once the peer confirms within t1.
    pub async fn send_test_frame(&self) -> Result<()> {
        self.request_u(|reply| EngineCommand::SendTestFrame { reply })
            .await
    }

    /// Station or group interrogation (TypeID 100, COT activation, IOA 0).
    /// Returns once the I-frame is on the wire; replies arrive through
    /// [`dequeue_received_asdus`].
    ///
    /// [`dequeue_received_asdus`]: Iec104Session::dequeue_received_asdus
    pub async fn send_interrogation(&self, common_addr: u16, qoi: u8) -> Result<()> {
        let asdu = Asdu::new(
            TypeId::InterrogationCommand,
            Cause::Activation,
            common_addr,
            vec![InformationObject::new(0, Value::Qualifier(qoi))],
        );
        self.send_asdu(asdu, false).await
    }

    /// Counter interrogation (TypeID 101, COT activation, IOA 0).
    pub async fn send_counter_interrogation(&self, common_addr: u16, qcc: u8) -> Result<()> {
        let asdu = Asdu::new(
            TypeId::CounterInterrogationCommand,
            Cause::Activation,
            common_addr,
            vec![InformationObject::new(0, Value::Qualifier(qcc))],
        );
        self.send_asdu(asdu, false).await
    }

    /// Clock synchronization (TypeID 103, COT activation, IOA 0).
    pub async fn send_clock_sync(&self, common_addr: u16, time: Cp56Time2a) -> Result<()> {
        let asdu = Asdu::new(
            TypeId::ClockSyncCommand,
            Cause::Activation,
            common_addr,
            vec![InformationObject::new(0, Value::Time(time))],
        );
        self.send_asdu(asdu, false).await
    }

    /// Read command for one object (TypeID 102, COT request).
    pub async fn send_read_command(&self, common_addr: u16, ioa: u32) -> Result<()> {
        let asdu = Asdu::new(
            TypeId::ReadCommand,
            Cause::Request,
            common_addr,
            vec![InformationObject::new(ioa, Value::Qualifier(0))],
        );
        self.send_asdu(asdu, false).await
    }

    /// Issue a control-direction command and await its activation
    /// confirmation.
    ///
    /// With `select` the S/E bit of the command qualifier is set; executing
    /// requires a second call with `select = false`. Select/execute pairing
    /// is the caller's obligation, the engine does not track it. A negative
    /// confirmation surfaces as `CommandRejected`.
    pub async fn send_command(
        &self,
        common_addr: u16,
        ioa: u32,
        type_id: TypeId,
        value: Value,
        select: bool,
    ) -> Result<()> {
        if !type_id.is_command() {
            return Err(Iec104Error::UnsupportedType(type_id.to_byte()));
        }
        let object = InformationObject::new(ioa, value).with_select(select);
        let asdu = Asdu::new(type_id, Cause::Activation, common_addr, vec![object]);
        self.send_asdu(asdu, true).await
    }

    /// Emit an arbitrary ASDU as one I-frame. With `confirm` the call blocks
    /// until the matching activation confirmation (or the read timeout).
    pub async fn send_asdu(&self, asdu: Asdu, confirm: bool) -> Result<()> {
        self.handle()?
            .request(
                |reply| EngineCommand::SendAsdu {
                    asdu,
                    confirm,
                    reply,
                },
                self.config.read_timeout(),
            )
            .await
    }

    /// Atomically drain the inbound queue in on-wire order.
    pub fn dequeue_received_asdus(&self) -> Vec<Asdu> {
        self.engine
            .read()
            .as_ref()
            .map(|e| e.queue().drain())
            .unwrap_or_default()
    }

    /// Watch state transitions (used by the supervisor and the scheduler).
    pub fn state_watch(&self) -> Option<tokio::sync::watch::Receiver<ConnectionState>> {
        self.engine.read().as_ref().map(|e| e.state_watch())
    }

    pub fn diagnostics(&self) -> HashMap<String, String> {
        let mut diag = HashMap::new();
        diag.insert("protocol".to_string(), "IEC60870-5-104".to_string());
        diag.insert("session".to_string(), self.name.clone());
        diag.insert("endpoint".to_string(), self.endpoint());
        diag.insert("state".to_string(), self.state().to_string());
        diag.insert("k".to_string(), self.config.k.to_string());
        diag.insert("w".to_string(), self.config.w.to_string());
        if let Some(engine) = self.engine.read().as_ref() {
            diag.insert("queue_len".to_string(), engine.queue().len().to_string());
            diag.insert(
                "queue_overflows".to_string(),
                engine.queue().overflow_count().to_string(),
            );
        }
        diag
    }

    async fn request_u(
        &self,
        make: impl FnOnce(tokio::sync::oneshot::Sender<Result<()>>) -> EngineCommand,
    ) -> Result<()> {
        // t1 governs U-frame confirmations; the extra margin lets the
        // engine's own expiry report T1Timeout instead of a generic timeout
        let deadline = self.config.t1() + Duration::from_secs(1);
        self.handle()?.request(make, deadline).await
    }

    /// Clone the engine handle out of the lock; never held across an await.
    fn handle(&self) -> Result<EngineHandle> {
        match self.engine.read().as_ref() {
            Some(handle) if handle.state().is_connected() => Ok(handle.clone()),
            Some(_) => Err(Iec104Error::disconnected("session is down")),
            None => Err(Iec104Error::NoSession(self.name.clone())),
        }
    }
}

impl std::fmt::Debug for Iec104Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Iec104Session")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint())
            .field("state", &self.state())
            .finish()
    }
}

//! Protocol engine
//!
//! One task owns every piece of mutable protocol state: the V(S)/V(R)
//! sequence variables, the k/w window counters, the t1..t3 timers, the
//! connection state and the outbound socket. The receive task feeds it raw
//! frames; API callers reach it through a command mailbox. Nothing else in
//! the crate touches a sequence number.

pub mod queue;
pub mod sequence;
pub mod timers;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::codec::asdu::{Asdu, Cause, TypeId};
use crate::codec::frame::{Apdu, ApciType, UFunction};
use crate::config::Iec104Config;
use crate::error::{Iec104Error, Result};
use crate::transport::{FrameReader, FrameWriter, Transport};
use crate::util::format_hex_pretty;

use queue::ReceiveQueue;
use sequence::SequenceState;
use timers::{ProtocolTimers, TimerKind};

/// Connection and data-transfer state of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No TCP session, or a fatal error tore it down
    Disconnected,
    /// TCP up, data transfer not started
    Connected,
    /// STARTDT activation sent, confirmation outstanding
    AwaitingStartCon,
    /// Data transfer running
    Active,
    /// STOPDT activation sent, confirmation outstanding
    AwaitingStopCon,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self != ConnectionState::Disconnected
    }

    pub fn is_active(self) -> bool {
        self == ConnectionState::Active
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::AwaitingStartCon => "awaiting_startdt_con",
            Self::Active => "active",
            Self::AwaitingStopCon => "awaiting_stopdt_con",
        };
        f.write_str(name)
    }
}

/// Commands accepted by the engine mailbox
pub(crate) enum EngineCommand {
    StartDataTransfer {
        reply: oneshot::Sender<Result<()>>,
    },
    StopDataTransfer {
        reply: oneshot::Sender<Result<()>>,
    },
    SendTestFrame {
        reply: oneshot::Sender<Result<()>>,
    },
    /// Emit one ASDU as an I-frame. With `confirm` the reply is withheld
    /// until the peer's activation confirmation arrives (negative
    /// confirmations surface as `CommandRejected`).
    SendAsdu {
        asdu: Asdu,
        confirm: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

/// A command awaiting its activation confirmation
struct PendingCommand {
    type_id: TypeId,
    common_addr: u16,
    ioa: u32,
    reply: oneshot::Sender<Result<()>>,
}

/// Cloneable handle to a running engine task
#[derive(Debug, Clone)]
pub struct EngineHandle {
    cmd_tx: mpsc::Sender<EngineCommand>,
    state_rx: watch::Receiver<ConnectionState>,
    queue: ReceiveQueue,
}

impl EngineHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch for state transitions (used by the supervisor and tests).
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn queue(&self) -> &ReceiveQueue {
        &self.queue
    }

    /// Issue a command and await its reply within `deadline`.
    pub(crate) async fn request(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<()>>) -> EngineCommand,
        deadline: Duration,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| Iec104Error::disconnected("engine task stopped"))?;
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Iec104Error::disconnected("engine task stopped")),
            Err(_) => Err(Iec104Error::ReadTimeout(format!(
                "no reply within {deadline:?}"
            ))),
        }
    }

    /// Tear the session down; idempotent.
    pub async fn disconnect(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(EngineCommand::Disconnect { reply: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

/// The engine task state
struct Engine {
    channel: String,
    seq: SequenceState,
    timers: ProtocolTimers,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    writer: FrameWriter,
    frame_rx: mpsc::Receiver<Result<Bytes>>,
    cmd_rx: mpsc::Receiver<EngineCommand>,
    queue: ReceiveQueue,
    pending_start: Option<oneshot::Sender<Result<()>>>,
    pending_stop: Option<oneshot::Sender<Result<()>>>,
    pending_test: Option<oneshot::Sender<Result<()>>>,
    /// TESTFR activation emitted by the t3 idle probe, without a caller
    test_probe_outstanding: bool,
    pending_commands: Vec<PendingCommand>,
}

/// Spawn the engine and its receive task on a connected transport.
///
/// Sequence counters start at zero and are never reused: a reconnect goes
/// through a fresh spawn.
pub(crate) fn spawn(
    channel: String,
    config: &Iec104Config,
    transport: Transport,
) -> (EngineHandle, JoinHandle<()>) {
    let (reader, writer) = transport.into_split();
    let (frame_tx, frame_rx) = mpsc::channel(64);
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);
    let queue = ReceiveQueue::new(config.queue_capacity);

    let reader_task = tokio::spawn(receive_loop(reader, frame_tx));

    let engine = Engine {
        channel: channel.clone(),
        seq: SequenceState::new(config.k, config.w),
        timers: ProtocolTimers::new(config.t1(), config.t2(), config.t3()),
        state: ConnectionState::Connected,
        state_tx,
        writer,
        frame_rx,
        cmd_rx,
        queue: queue.clone(),
        pending_start: None,
        pending_stop: None,
        pending_test: None,
        test_probe_outstanding: false,
        pending_commands: Vec::new(),
    };

    let task = tokio::spawn(async move {
        engine.run(reader_task).await;
    });

    (
        EngineHandle {
            cmd_tx,
            state_rx,
            queue,
        },
        task,
    )
}

/// Receive task: blocks on transport reads and feeds the engine. It never
/// calls into application code.
async fn receive_loop(mut reader: FrameReader, tx: mpsc::Sender<Result<Bytes>>) {
    loop {
        match reader.read_frame().await {
            Ok(bytes) => {
                if tx.send(Ok(bytes)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                break;
            }
        }
    }
}

impl Engine {
    async fn run(mut self, reader_task: JoinHandle<()>) {
        info!(session = %self.channel, event_kind = "session_up", "engine started");
        self.timers.rearm_t3(Instant::now());

        let reason = loop {
            let deadline = self.timers.next_deadline();
            let sleep_until = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            let step = tokio::select! {
                maybe_cmd = self.cmd_rx.recv() => match maybe_cmd {
                    Some(EngineCommand::Disconnect { reply }) => {
                        let _ = reply.send(());
                        break Iec104Error::disconnected("disconnect requested");
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break Iec104Error::disconnected("session handle dropped"),
                },
                maybe_frame = self.frame_rx.recv() => match maybe_frame {
                    Some(Ok(bytes)) => self.handle_frame(&bytes).await,
                    Some(Err(e)) => {
                        // the reader stops on its first error; a framing
                        // error at the stream level means the byte stream
                        // lost its frame boundaries
                        if e.is_fatal() {
                            break e;
                        }
                        break Iec104Error::disconnected(format!("receive stream failed: {e}"));
                    }
                    None => break Iec104Error::disconnected("receive task ended"),
                },
                _ = tokio::time::sleep_until(sleep_until), if deadline.is_some() => {
                    self.handle_timers().await
                }
            };

            if let Err(e) = step {
                if e.is_fatal() {
                    break e;
                }
                warn!(
                    session = %self.channel,
                    event_kind = %e.kind(),
                    detail = %e,
                    "local protocol error, frame dropped"
                );
            }
        };

        reader_task.abort();
        self.fail_all_pending(&reason);
        self.timers.disarm_all();
        self.queue.clear();
        self.set_state(ConnectionState::Disconnected);
        info!(
            session = %self.channel,
            event_kind = "session_down",
            detail = %reason,
            "engine stopped"
        );
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(
                session = %self.channel,
                event_kind = "state_change",
                detail = %format!("{} -> {}", self.state, state),
                "state transition"
            );
            self.state = state;
            let _ = self.state_tx.send(state);
        }
    }

    // ------------------------------------------------------------------
    // Mailbox commands
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, cmd: EngineCommand) -> Result<()> {
        match cmd {
            EngineCommand::StartDataTransfer { reply } => match self.state {
                ConnectionState::Active => {
                    let _ = reply.send(Ok(()));
                    Ok(())
                }
                ConnectionState::Connected => {
                    if let Err(e) = self.send_u(UFunction::StartDtAct).await {
                        let _ = reply.send(Err(e.clone()));
                        return Err(e);
                    }
                    self.set_state(ConnectionState::AwaitingStartCon);
                    self.timers.arm_t1(Instant::now());
                    self.pending_start = Some(reply);
                    Ok(())
                }
                _ => {
                    let _ = reply.send(Err(Iec104Error::NotActive));
                    Ok(())
                }
            },
            EngineCommand::StopDataTransfer { reply } => match self.state {
                ConnectionState::Connected => {
                    let _ = reply.send(Ok(()));
                    Ok(())
                }
                ConnectionState::Active => {
                    if let Err(e) = self.send_u(UFunction::StopDtAct).await {
                        let _ = reply.send(Err(e.clone()));
                        return Err(e);
                    }
                    self.set_state(ConnectionState::AwaitingStopCon);
                    self.timers.arm_t1(Instant::now());
                    self.pending_stop = Some(reply);
                    Ok(())
                }
                _ => {
                    let _ = reply.send(Err(Iec104Error::NotActive));
                    Ok(())
                }
            },
            EngineCommand::SendTestFrame { reply } => {
                if !self.state.is_connected() {
                    let _ = reply.send(Err(Iec104Error::NotActive));
                    return Ok(());
                }
                if let Err(e) = self.send_u(UFunction::TestFrAct).await {
                    let _ = reply.send(Err(e.clone()));
                    return Err(e);
                }
                self.timers.arm_t1(Instant::now());
                self.pending_test = Some(reply);
                Ok(())
            }
            EngineCommand::SendAsdu {
                asdu,
                confirm,
                reply,
            } => self.handle_send_asdu(asdu, confirm, reply).await,
            EngineCommand::Disconnect { .. } => unreachable!("handled by the run loop"),
        }
    }

    async fn handle_send_asdu(
        &mut self,
        asdu: Asdu,
        confirm: bool,
        reply: oneshot::Sender<Result<()>>,
    ) -> Result<()> {
        if self.state != ConnectionState::Active {
            let _ = reply.send(Err(Iec104Error::NotActive));
            return Ok(());
        }
        if !self.seq.can_send() {
            let _ = reply.send(Err(Iec104Error::WindowFull));
            return Ok(());
        }
        let body = match asdu.encode() {
            Ok(body) => body,
            Err(e) => {
                let _ = reply.send(Err(e));
                return Ok(());
            }
        };

        let n_s = self.seq.claim_send_seq()?;
        let apdu = Apdu::new_i_frame(n_s, self.seq.v_r, body);
        // the I-frame's N(R) acknowledges everything received so far
        self.seq.clear_recv_window();
        self.timers.cancel_t2();
        if let Err(e) = self.write_frame(&apdu).await {
            let _ = reply.send(Err(e.clone()));
            return Err(e);
        }
        self.timers.arm_t1(Instant::now());

        debug!(
            session = %self.channel,
            event_kind = "i_frame_sent",
            detail = %format!("N(S)={n_s} type={:?} ca={}", asdu.type_id, asdu.common_addr),
            "sent I-frame"
        );

        if confirm {
            self.pending_commands.push(PendingCommand {
                type_id: asdu.type_id,
                common_addr: asdu.common_addr,
                ioa: asdu.objects.first().map(|o| o.ioa).unwrap_or(0),
                reply,
            });
        } else {
            let _ = reply.send(Ok(()));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inbound frames
    // ------------------------------------------------------------------

    async fn handle_frame(&mut self, bytes: &Bytes) -> Result<()> {
        let apdu = match Apdu::decode(bytes) {
            Ok(apdu) => apdu,
            Err(e) => {
                warn!(
                    session = %self.channel,
                    event_kind = %e.kind(),
                    detail = %format!("{e}; frame {}", format_hex_pretty(bytes)),
                    "dropped malformed frame"
                );
                return Ok(());
            }
        };

        // every received APDU rearms the idle probe
        self.timers.rearm_t3(Instant::now());

        match apdu.apci {
            ApciType::UFrame(function) => self.handle_u_frame(function).await,
            ApciType::SFrame { recv_seq } => {
                self.seq.apply_ack(recv_seq)?;
                self.maybe_cancel_t1();
                Ok(())
            }
            ApciType::IFrame { send_seq, recv_seq } => {
                if let Err(e) = self.seq.accept_recv_seq(send_seq) {
                    // no acknowledgment for a violating frame; log it and die
                    warn!(
                        session = %self.channel,
                        event_kind = "sequence_error",
                        detail = %format!("{e}; frame {}", format_hex_pretty(bytes)),
                        "sequence violation"
                    );
                    return Err(e);
                }
                self.seq.apply_ack(recv_seq)?;
                self.maybe_cancel_t1();

                match Asdu::decode(&apdu.body) {
                    Ok(asdu) if asdu.partial => {
                        warn!(
                            session = %self.channel,
                            event_kind = "partial_info_object",
                            detail = %format!(
                                "type={:?} ca={} kept {} objects",
                                asdu.type_id, asdu.common_addr, asdu.objects.len()
                            ),
                            "dropped partially decodable ASDU"
                        );
                    }
                    Ok(asdu) => {
                        self.resolve_pending_command(&asdu);
                        self.queue.push(asdu, &self.channel);
                    }
                    Err(e) => {
                        warn!(
                            session = %self.channel,
                            event_kind = %e.kind(),
                            detail = %e,
                            "dropped undecodable ASDU"
                        );
                    }
                }

                if self.seq.ack_due() {
                    self.send_s_frame().await?;
                } else {
                    self.timers.arm_t2(Instant::now());
                }
                Ok(())
            }
        }
    }

    async fn handle_u_frame(&mut self, function: UFunction) -> Result<()> {
        match function {
            UFunction::StartDtAct => {
                self.send_u(UFunction::StartDtCon).await?;
                self.set_state(ConnectionState::Active);
            }
            UFunction::StopDtAct => {
                self.send_u(UFunction::StopDtCon).await?;
                self.set_state(ConnectionState::Connected);
            }
            UFunction::TestFrAct => {
                self.send_u(UFunction::TestFrCon).await?;
            }
            UFunction::StartDtCon => match self.pending_start.take() {
                Some(reply) => {
                    self.set_state(ConnectionState::Active);
                    let _ = reply.send(Ok(()));
                    self.maybe_cancel_t1();
                }
                None => self.unexpected_u(function),
            },
            UFunction::StopDtCon => match self.pending_stop.take() {
                Some(reply) => {
                    self.set_state(ConnectionState::Connected);
                    let _ = reply.send(Ok(()));
                    self.maybe_cancel_t1();
                }
                None => self.unexpected_u(function),
            },
            UFunction::TestFrCon => {
                if let Some(reply) = self.pending_test.take() {
                    let _ = reply.send(Ok(()));
                    self.maybe_cancel_t1();
                } else if self.test_probe_outstanding {
                    self.test_probe_outstanding = false;
                    self.maybe_cancel_t1();
                } else {
                    self.unexpected_u(function);
                }
            }
        }
        Ok(())
    }

    fn unexpected_u(&self, function: UFunction) {
        warn!(
            session = %self.channel,
            event_kind = "unexpected_u_frame",
            detail = %format!("{function:?} with no matching request"),
            "unexpected U-frame confirmation"
        );
    }

    /// Match an activation confirmation against the oldest pending command
    /// with the same type, common address and object address.
    fn resolve_pending_command(&mut self, asdu: &Asdu) {
        if asdu.cot.cause != Cause::ActivationCon {
            return;
        }
        let ioa = asdu.objects.first().map(|o| o.ioa).unwrap_or(0);
        let Some(index) = self.pending_commands.iter().position(|p| {
            p.type_id == asdu.type_id && p.common_addr == asdu.common_addr && p.ioa == ioa
        }) else {
            return;
        };
        let pending = self.pending_commands.remove(index);
        let result = if asdu.cot.negative {
            Err(Iec104Error::CommandRejected(format!(
                "negative confirmation for type {:?} ca={} ioa={}",
                asdu.type_id, asdu.common_addr, ioa
            )))
        } else {
            Ok(())
        };
        let _ = pending.reply.send(result);
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    async fn handle_timers(&mut self) -> Result<()> {
        let now = Instant::now();
        while let Some(kind) = self.timers.take_expired(now) {
            match kind {
                TimerKind::T1 => {
                    return Err(Iec104Error::T1Timeout(format!(
                        "unacknowledged APDU in state {} ({} I-frames outstanding)",
                        self.state, self.seq.unack_sent
                    )));
                }
                TimerKind::T2 => {
                    if self.seq.unack_recv > 0 {
                        self.send_s_frame().await?;
                    }
                }
                TimerKind::T3 => {
                    if self.state == ConnectionState::Active {
                        debug!(
                            session = %self.channel,
                            event_kind = "test_probe",
                            detail = "line idle",
                            "sending TESTFR activation"
                        );
                        self.send_u(UFunction::TestFrAct).await?;
                        self.test_probe_outstanding = true;
                        self.timers.arm_t1(now);
                    }
                    self.timers.rearm_t3(now);
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Outbound helpers
    // ------------------------------------------------------------------

    async fn send_u(&mut self, function: UFunction) -> Result<()> {
        self.write_frame(&Apdu::new_u_frame(function)).await
    }

    async fn send_s_frame(&mut self) -> Result<()> {
        let apdu = Apdu::new_s_frame(self.seq.v_r);
        self.write_frame(&apdu).await?;
        self.seq.clear_recv_window();
        self.timers.cancel_t2();
        Ok(())
    }

    /// A failed socket write means the session is gone.
    async fn write_frame(&mut self, apdu: &Apdu) -> Result<()> {
        self.writer
            .write_frame(apdu)
            .await
            .map_err(|e| Iec104Error::disconnected(format!("write failed: {e}")))
    }

    fn maybe_cancel_t1(&mut self) {
        let apdu_outstanding = self.seq.unack_sent > 0
            || self.pending_start.is_some()
            || self.pending_stop.is_some()
            || self.pending_test.is_some()
            || self.test_probe_outstanding;
        if !apdu_outstanding {
            self.timers.cancel_t1();
        }
    }

    fn fail_all_pending(&mut self, reason: &Iec104Error) {
        if let Some(reply) = self.pending_start.take() {
            let _ = reply.send(Err(reason.clone()));
        }
        if let Some(reply) = self.pending_stop.take() {
            let _ = reply.send(Err(reason.clone()));
        }
        if let Some(reply) = self.pending_test.take() {
            let _ = reply.send(Err(reason.clone()));
        }
        for pending in self.pending_commands.drain(..) {
            let _ = pending.reply.send(Err(reason.clone()));
        }
    }
}

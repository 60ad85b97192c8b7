//! Sequence-number arithmetic and k/w window bookkeeping
//!
//! All sequence variables live modulo 2^15. The acknowledgment distance for
//! an incoming N(R) is computed against the oldest unacknowledged frame,
//! `(N(R) - (V_S - unack_sent)) mod 32768`, and must not exceed the number
//! of frames actually outstanding; anything larger is a protocol violation.

use crate::codec::frame::SEQ_MODULO;
use crate::error::{Iec104Error, Result};

/// Modular distance `(a - b) mod 32768`.
pub fn seq_distance(a: u16, b: u16) -> u16 {
    (a.wrapping_sub(b)) & (SEQ_MODULO - 1)
}

/// Advance a sequence variable by one, wrapping at 2^15.
pub fn seq_next(seq: u16) -> u16 {
    (seq + 1) % SEQ_MODULO
}

/// Send/receive sequence state and window counters for one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceState {
    /// Send sequence variable V(S): N(S) of the next emitted I-frame
    pub v_s: u16,
    /// Receive sequence variable V(R): expected N(S) of the next inbound I-frame
    pub v_r: u16,
    /// Sent I-frames not yet acknowledged by the peer
    pub unack_sent: u16,
    /// Received I-frames we have not yet acknowledged
    pub unack_recv: u16,
    /// Maximum outstanding sent I-frames (k)
    pub k: u16,
    /// Acknowledge at the latest after this many received I-frames (w)
    pub w: u16,
}

impl SequenceState {
    pub fn new(k: u16, w: u16) -> Self {
        Self {
            v_s: 0,
            v_r: 0,
            unack_sent: 0,
            unack_recv: 0,
            k,
            w,
        }
    }

    /// True when another I-frame may be emitted without breaching k.
    pub fn can_send(&self) -> bool {
        self.unack_sent < self.k
    }

    /// Claim the N(S) for an outgoing I-frame and advance V(S).
    /// Fails with `WindowFull` when k frames are already outstanding.
    pub fn claim_send_seq(&mut self) -> Result<u16> {
        if !self.can_send() {
            return Err(Iec104Error::WindowFull);
        }
        let n_s = self.v_s;
        self.v_s = seq_next(self.v_s);
        self.unack_sent += 1;
        Ok(n_s)
    }

    /// Apply an acknowledgment N(R) from an inbound I- or S-frame.
    ///
    /// Returns the number of frames it newly acknowledged. An N(R) claiming
    /// more frames than are outstanding is a sequence violation.
    pub fn apply_ack(&mut self, n_r: u16) -> Result<u16> {
        let oldest_unacked = seq_distance(self.v_s, self.unack_sent);
        let acked = seq_distance(n_r, oldest_unacked);
        if acked > self.unack_sent {
            return Err(Iec104Error::sequence(format!(
                "ack N(R)={n_r} acknowledges {acked} frames but only {} outstanding (V(S)={})",
                self.unack_sent, self.v_s
            )));
        }
        self.unack_sent -= acked;
        Ok(acked)
    }

    /// Validate and account an inbound I-frame's N(S).
    ///
    /// N(S) must equal V(R) exactly; a gap or replay disconnects the session.
    pub fn accept_recv_seq(&mut self, n_s: u16) -> Result<()> {
        if n_s != self.v_r {
            return Err(Iec104Error::sequence(format!(
                "received N(S)={n_s}, expected V(R)={}",
                self.v_r
            )));
        }
        self.v_r = seq_next(self.v_r);
        self.unack_recv += 1;
        Ok(())
    }

    /// True once w received frames are waiting for an acknowledgment.
    pub fn ack_due(&self) -> bool {
        self.unack_recv >= self.w
    }

    /// Mark every received frame as acknowledged (an S-frame or an I-frame
    /// carrying V(R) went out).
    pub fn clear_recv_window(&mut self) {
        self.unack_recv = 0;
    }
}

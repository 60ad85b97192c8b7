//! Scripted mock outstation for integration scenarios
//!
//! Binds a loopback listener and exposes frame-level send/expect helpers so
//! each test can script the peer side of the conversation exactly.

#![allow(dead_code)]

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use voltage_iec104::{Apdu, ApciType, Asdu, Iec104Config, UFunction};

pub const IO_DEADLINE: Duration = Duration::from_secs(5);

/// Route crate logs through the test harness; safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

/// Listener side of the mock outstation
pub struct MockOutstation {
    listener: TcpListener,
    host: String,
    port: u16,
}

impl MockOutstation {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        Self {
            listener,
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }

    /// Session config pointed at this outstation with test-friendly timers.
    pub fn config(&self) -> Iec104Config {
        Iec104Config {
            host: self.host.clone(),
            port: self.port,
            t0_ms: 2_000,
            t1_ms: 2_000,
            t2_ms: 500,
            t3_ms: 60_000,
            read_timeout_ms: 3_000,
            ..Iec104Config::default()
        }
    }

    pub async fn accept(&self) -> Peer {
        let (stream, _) = timeout(IO_DEADLINE, self.listener.accept())
            .await
            .expect("accept deadline")
            .expect("accept");
        Peer {
            stream,
            send_seq: 0,
            recv_seq: 0,
        }
    }
}

/// One accepted connection, with the peer's own sequence counters
pub struct Peer {
    stream: TcpStream,
    /// N(S) of the next I-frame this peer emits
    pub send_seq: u16,
    /// Highest N(S) received from the client plus one; used as N(R)
    pub recv_seq: u16,
}

impl Peer {
    /// Read exactly one frame (start octet, length, body).
    pub async fn read_frame(&mut self) -> Vec<u8> {
        timeout(IO_DEADLINE, self.read_frame_inner())
            .await
            .expect("read deadline")
    }

    async fn read_frame_inner(&mut self) -> Vec<u8> {
        let mut header = [0u8; 2];
        self.stream.read_exact(&mut header).await.expect("frame header");
        assert_eq!(header[0], 0x68, "start byte");
        let mut frame = vec![0u8; header[1] as usize + 2];
        frame[..2].copy_from_slice(&header);
        self.stream.read_exact(&mut frame[2..]).await.expect("frame body");
        frame
    }

    /// Read one frame and decode it, tracking the client's send sequence.
    pub async fn read_apdu(&mut self) -> Apdu {
        let raw = self.read_frame().await;
        let apdu = Apdu::decode(&raw).expect("well-formed frame");
        if let ApciType::IFrame { send_seq, .. } = apdu.apci {
            self.recv_seq = (send_seq + 1) % 32_768;
        }
        apdu
    }

    /// Read frames until one is an I-frame, answering nothing in between.
    pub async fn read_i_frame(&mut self) -> (Apdu, Asdu) {
        loop {
            let apdu = self.read_apdu().await;
            if matches!(apdu.apci, ApciType::IFrame { .. }) {
                let asdu = Asdu::decode(&apdu.body).expect("decodable ASDU");
                return (apdu, asdu);
            }
        }
    }

    /// Expect the next frame to be the given U function and consume it.
    pub async fn expect_u(&mut self, function: UFunction) {
        let apdu = self.read_apdu().await;
        assert_eq!(
            apdu.apci,
            ApciType::UFrame(function),
            "expected {function:?}"
        );
    }

    /// True if the peer sees a frame matching `pred` within `wait`.
    pub async fn saw_frame_matching(
        &mut self,
        wait: Duration,
        mut pred: impl FnMut(&Apdu) -> bool,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match timeout(remaining, self.read_frame_inner()).await {
                Ok(raw) => {
                    let apdu = Apdu::decode(&raw).expect("well-formed frame");
                    if let ApciType::IFrame { send_seq, .. } = apdu.apci {
                        self.recv_seq = (send_seq + 1) % 32_768;
                    }
                    if pred(&apdu) {
                        return true;
                    }
                }
                Err(_) => return false,
            }
        }
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("peer write");
    }

    pub async fn send_apdu(&mut self, apdu: &Apdu) {
        let bytes = apdu.encode().expect("encode");
        self.send_raw(&bytes).await;
    }

    pub async fn send_u(&mut self, function: UFunction) {
        self.send_apdu(&Apdu::new_u_frame(function)).await;
    }

    pub async fn send_s(&mut self, recv_seq: u16) {
        self.send_apdu(&Apdu::new_s_frame(recv_seq)).await;
    }

    /// Emit an ASDU as the peer's next I-frame, advancing its N(S).
    pub async fn send_i(&mut self, asdu: &Asdu) {
        let body = asdu.encode().expect("encode asdu");
        let apdu = Apdu::new_i_frame(self.send_seq, self.recv_seq, body);
        self.send_seq = (self.send_seq + 1) % 32_768;
        self.send_apdu(&apdu).await;
    }

    /// Serve the STARTDT handshake: expect the activation, confirm it.
    pub async fn serve_startdt(&mut self) {
        self.expect_u(UFunction::StartDtAct).await;
        self.send_u(UFunction::StartDtCon).await;
    }

    pub fn shutdown(self) {
        drop(self.stream);
    }
}

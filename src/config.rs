//! Session, block and device configuration
//!
//! All parameters are passed in explicitly at construction; nothing is read
//! from ambient state. Serde defaults mirror the IEC 60870-5-104 companion
//! standard values.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::codec::asdu::COMMON_ADDR_MAX;
use crate::error::{Iec104Error, Result};
use crate::transport::{TransportConfig, DEFAULT_PORT};

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_common_address() -> u16 {
    1
}
fn default_k() -> u16 {
    12
}
fn default_w() -> u16 {
    8
}
fn default_t0_ms() -> u64 {
    30_000
}
fn default_t1_ms() -> u64 {
    15_000
}
fn default_t2_ms() -> u64 {
    10_000
}
fn default_t3_ms() -> u64 {
    20_000
}
fn default_read_timeout_ms() -> u64 {
    10_000
}
fn default_poll_period_ms() -> u64 {
    60_000
}
fn default_response_timeout_ms() -> u64 {
    5_000
}
fn default_queue_capacity() -> usize {
    1024
}

/// Per-session protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Iec104Config {
    /// Outstation host address
    pub host: String,
    /// Outstation TCP port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Default common address for commands
    #[serde(default = "default_common_address")]
    pub common_address: u16,
    /// Maximum number of outstanding I format APDUs (k)
    #[serde(default = "default_k")]
    pub k: u16,
    /// Latest acknowledgement after receiving w I format APDUs; must be < k
    #[serde(default = "default_w")]
    pub w: u16,
    /// Connection establishment timeout (ms)
    #[serde(default = "default_t0_ms")]
    pub t0_ms: u64,
    /// Send or test APDU acknowledgment timeout (ms)
    #[serde(default = "default_t1_ms")]
    pub t1_ms: u64,
    /// Acknowledgement emission timeout when no data is sent (ms)
    #[serde(default = "default_t2_ms")]
    pub t2_ms: u64,
    /// Idle test-frame timeout (ms)
    #[serde(default = "default_t3_ms")]
    pub t3_ms: u64,
    /// Deadline for blocking API calls (ms)
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Received-ASDU queue bound; the oldest entry is dropped on overflow
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for Iec104Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: default_port(),
            common_address: default_common_address(),
            k: default_k(),
            w: default_w(),
            t0_ms: default_t0_ms(),
            t1_ms: default_t1_ms(),
            t2_ms: default_t2_ms(),
            t3_ms: default_t3_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Iec104Config {
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Iec104Error::config("host cannot be empty"));
        }
        if self.common_address == 0 || self.common_address > COMMON_ADDR_MAX {
            return Err(Iec104Error::config(format!(
                "common_address {} outside 1..=65534",
                self.common_address
            )));
        }
        if self.k == 0 || self.k > 32_767 {
            return Err(Iec104Error::config(format!("k {} outside 1..=32767", self.k)));
        }
        if self.w == 0 || self.w >= self.k {
            return Err(Iec104Error::config(format!(
                "w {} must be in 1..k (k = {})",
                self.w, self.k
            )));
        }
        if self.t2_ms >= self.t1_ms {
            return Err(Iec104Error::config(format!(
                "t2 ({} ms) must be less than t1 ({} ms)",
                self.t2_ms, self.t1_ms
            )));
        }
        if self.queue_capacity == 0 {
            return Err(Iec104Error::config("queue_capacity cannot be zero"));
        }
        Ok(())
    }

    pub fn t0(&self) -> Duration {
        Duration::from_millis(self.t0_ms)
    }
    pub fn t1(&self) -> Duration {
        Duration::from_millis(self.t1_ms)
    }
    pub fn t2(&self) -> Duration {
        Duration::from_millis(self.t2_ms)
    }
    pub fn t3(&self) -> Duration {
        Duration::from_millis(self.t3_ms)
    }
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Endpoint key for session lookup in the driver facade.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            host: self.host.clone(),
            port: self.port,
            connect_timeout: self.t0(),
            ..TransportConfig::default()
        }
    }
}

/// One interrogation block: a periodic interrogation of a common address
/// plus the filter deciding which returned objects are cached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockConfig {
    /// Common address the block interrogates and ingests
    pub common_addr: u16,
    /// Qualifier of interrogation: 20 station, 21..=36 group 1..16
    pub qoi: u8,
    /// Lowest retained information object address
    pub ioa_from: u32,
    /// Highest retained information object address (inclusive)
    pub ioa_to: u32,
    /// Retained type identifications; empty retains every type
    #[serde(default)]
    pub type_ids: Vec<u8>,
    /// Disabled blocks neither interrogate nor cache
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    /// Interrogation period (ms)
    #[serde(default = "default_poll_period_ms")]
    pub period_ms: u64,
    /// Deadline for the activation-termination reply (ms)
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
}

fn enabled_default() -> bool {
    true
}

impl BlockConfig {
    /// Parse one block from the `CA-QOI-IOAfrom-IOAto/TypeID[,TypeID...]/enabled`
    /// grammar, e.g. `"1-20-1-1000/1,3,9/true"`.
    pub fn parse(input: &str) -> Result<Self> {
        let bad = || Iec104Error::InvalidAddress(format!("bad block config: {input:?}"));

        let mut sections = input.trim().split('/');
        let addressing = sections.next().ok_or_else(bad)?;
        let types = sections.next().ok_or_else(bad)?;
        let enabled = sections.next().ok_or_else(bad)?;
        if sections.next().is_some() {
            return Err(bad());
        }

        let parts: Vec<&str> = addressing.split('-').collect();
        let [ca, qoi, ioa_from, ioa_to] = parts.as_slice() else {
            return Err(bad());
        };
        let common_addr: u16 = ca.parse().map_err(|_| bad())?;
        if common_addr == 0 || common_addr > COMMON_ADDR_MAX {
            return Err(bad());
        }
        let qoi: u8 = qoi.parse().map_err(|_| bad())?;
        if !(20..=36).contains(&qoi) {
            return Err(bad());
        }
        let ioa_from: u32 = ioa_from.parse().map_err(|_| bad())?;
        let ioa_to: u32 = ioa_to.parse().map_err(|_| bad())?;
        if ioa_from == 0 || ioa_to < ioa_from || ioa_to > crate::codec::asdu::IOA_MAX {
            return Err(bad());
        }

        let type_ids = if types.is_empty() {
            Vec::new()
        } else {
            types
                .split(',')
                .map(|t| t.parse::<u8>().map_err(|_| bad()))
                .collect::<Result<Vec<u8>>>()?
        };

        let enabled = match enabled {
            "true" => true,
            "false" => false,
            _ => return Err(bad()),
        };

        Ok(Self {
            common_addr,
            qoi,
            ioa_from,
            ioa_to,
            type_ids,
            enabled,
            period_ms: default_poll_period_ms(),
            response_timeout_ms: default_response_timeout_ms(),
        })
    }

    /// Parse a `|`-joined list of block configs.
    pub fn parse_list(input: &str) -> Result<Vec<Self>> {
        input.split('|').map(Self::parse).collect()
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Filter applied to every ingested information object.
    pub fn retains(&self, ioa: u32, type_id: u8) -> bool {
        if ioa < self.ioa_from || ioa > self.ioa_to {
            return false;
        }
        self.type_ids.is_empty() || self.type_ids.contains(&type_id)
    }
}

impl fmt::Display for BlockConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}/{}/{}",
            self.common_addr,
            self.qoi,
            self.ioa_from,
            self.ioa_to,
            self.type_ids
                .iter()
                .map(|t| t.to_string())
                .collect::<Vec<_>>()
                .join(","),
            self.enabled
        )
    }
}

/// Device-level configuration for the driver facade: one session endpoint
/// plus its interrogation blocks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name tags are registered under
    pub name: String,
    /// Session parameters (endpoint, window, timers)
    #[serde(flatten)]
    pub session: Iec104Config,
    /// Default interrogation period applied to blocks (ms)
    #[serde(default = "default_poll_period_ms")]
    pub poll_period_ms: u64,
    /// Interrogation blocks
    #[serde(default)]
    pub blocks: Vec<BlockConfig>,
}

impl DeviceConfig {
    pub fn new(name: impl Into<String>, session: Iec104Config) -> Self {
        Self {
            name: name.into(),
            session,
            poll_period_ms: default_poll_period_ms(),
            blocks: Vec::new(),
        }
    }

    /// Attach blocks from the `|`-joined grammar, inheriting the device
    /// poll period.
    pub fn with_block_string(mut self, blocks: &str) -> Result<Self> {
        let mut parsed = BlockConfig::parse_list(blocks)?;
        for block in &mut parsed {
            block.period_ms = self.poll_period_ms;
        }
        self.blocks = parsed;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Iec104Error::config("device name cannot be empty"));
        }
        self.session.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_companion_standard() {
        let config = Iec104Config::default();
        assert_eq!(config.port, 2404);
        assert_eq!(config.k, 12);
        assert_eq!(config.w, 8);
        assert_eq!(config.t0_ms, 30_000);
        assert_eq!(config.t1_ms, 15_000);
        assert_eq!(config.t2_ms, 10_000);
        assert_eq!(config.t3_ms, 20_000);
        assert_eq!(config.read_timeout_ms, 10_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_rejects_bad_windows_and_timers() {
        let mut config = Iec104Config::default();
        config.w = config.k;
        assert!(config.validate().is_err());

        let mut config = Iec104Config::default();
        config.k = 0;
        assert!(config.validate().is_err());

        let mut config = Iec104Config::default();
        config.t2_ms = config.t1_ms;
        assert!(config.validate().is_err());

        let mut config = Iec104Config::default();
        config.common_address = 65_535;
        assert!(config.validate().is_err());
    }

    #[test]
    fn block_grammar_round_trip() {
        let block = BlockConfig::parse("1-20-1-1000/1,3,9/true").unwrap();
        assert_eq!(block.common_addr, 1);
        assert_eq!(block.qoi, 20);
        assert_eq!(block.ioa_from, 1);
        assert_eq!(block.ioa_to, 1000);
        assert_eq!(block.type_ids, vec![1, 3, 9]);
        assert!(block.enabled);
        assert_eq!(block.to_string(), "1-20-1-1000/1,3,9/true");
    }

    #[test]
    fn block_list_parses_on_pipe() {
        let blocks = BlockConfig::parse_list("1-20-1-1000/1,3,9/true|2-21-1-50/13/false").unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].common_addr, 2);
        assert_eq!(blocks[1].qoi, 21);
        assert!(!blocks[1].enabled);
    }

    #[test]
    fn block_grammar_rejects_malformed() {
        for input in [
            "",
            "1-20-1/1/true",
            "1-20-1-1000/1,3,9",
            "1-19-1-1000/1/true",   // QOI below station interrogation
            "1-37-1-1000/1/true",   // QOI above group 16
            "0-20-1-1000/1/true",   // CA zero
            "1-20-0-1000/1/true",   // IOA zero
            "1-20-100-50/1/true",   // inverted range
            "1-20-1-1000/1/maybe",  // bad enabled flag
            "1-20-1-1000/x/true",   // bad type id
            "1-20-1-1000/1/true/x", // trailing section
        ] {
            assert!(BlockConfig::parse(input).is_err(), "accepted {input:?}");
        }
    }

    #[test]
    fn empty_type_filter_retains_everything() {
        let block = BlockConfig::parse("1-20-1-100//true").unwrap();
        assert!(block.type_ids.is_empty());
        assert!(block.retains(50, 13));
        assert!(block.retains(100, 1));
        assert!(!block.retains(101, 1));
    }

    #[test]
    fn type_filter_is_exact() {
        let block = BlockConfig::parse("1-20-1-100/9,13/true").unwrap();
        assert!(block.retains(10, 9));
        assert!(block.retains(10, 13));
        assert!(!block.retains(10, 1));
    }

    #[test]
    fn json_config_fills_defaults() {
        let config: Iec104Config =
            serde_json::from_str(r#"{"host": "192.168.1.50", "k": 6, "w": 4}"#).unwrap();
        assert_eq!(config.host, "192.168.1.50");
        assert_eq!(config.port, 2404);
        assert_eq!(config.k, 6);
        assert_eq!(config.w, 4);
        assert_eq!(config.t3_ms, 20_000);
        assert!(config.validate().is_ok());

        let device: DeviceConfig = serde_json::from_str(
            r#"{"name": "rtu-7", "host": "10.0.0.7", "poll_period_ms": 5000}"#,
        )
        .unwrap();
        assert_eq!(device.name, "rtu-7");
        assert_eq!(device.session.host, "10.0.0.7");
        assert!(device.blocks.is_empty());
        assert!(device.validate().is_ok());
    }

    #[test]
    fn device_block_string_inherits_poll_period() {
        let mut device = DeviceConfig::new("rtu-1", Iec104Config::default());
        device.poll_period_ms = 5_000;
        let device = device.with_block_string("1-20-1-1000/1,3,9/true").unwrap();
        assert_eq!(device.blocks[0].period_ms, 5_000);
    }
}

//! # voltage-iec104
//!
//! An IEC 60870-5-104 client for SCADA telecontrol over TCP/IP.
//!
//! The crate covers the whole client-side stack: APCI framing with 15-bit
//! sliding-window sequence numbers, the t1..t3 protocol timers, the
//! STARTDT/STOPDT/TESTFR state machine, an ASDU codec for the common
//! monitoring and control type identifications with CP56Time2a time tags,
//! periodic interrogation blocks with a filtered last-value cache, and a
//! tag-oriented driver facade for higher-level SCADA integration.
//!
//! ## Layers
//!
//! - [`codec`]: pure encode/decode of APDUs, ASDUs and time tags
//! - [`transport`]: framed TCP I/O to one outstation
//! - [`engine`]: sequence numbers, k/w flow control, timers, state machine
//! - [`session`]: connect / start / interrogate / command surface
//! - [`scheduler`]: per-common-address interrogation blocks and caches
//! - [`driver`]: device and tag registration, read-tag / write-tag
//! - [`supervisor`]: reconnect loop with exponential backoff
//!
//! ## Example
//!
//! ```rust,no_run
//! use voltage_iec104::{Iec104Config, Iec104Session, QOI_STATION};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Iec104Config {
//!         host: "192.168.1.50".to_string(),
//!         port: 2404,
//!         ..Iec104Config::default()
//!     };
//!
//!     let session = Iec104Session::new("substation-a", config)?;
//!     session.connect().await?;
//!     session.start_data_transfer().await?;
//!
//!     // general interrogation of common address 1
//!     session.send_interrogation(1, QOI_STATION).await?;
//!     tokio::time::sleep(std::time::Duration::from_secs(1)).await;
//!
//!     for asdu in session.dequeue_received_asdus() {
//!         println!("{:?} ca={} objects={}", asdu.type_id, asdu.common_addr, asdu.objects.len());
//!     }
//!
//!     session.disconnect().await;
//!     Ok(())
//! }
//! ```

pub mod address;
pub mod codec;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod scheduler;
pub mod session;
pub mod supervisor;
pub mod transport;
mod util;

// Re-export the main types for convenience
pub use address::TagAddress;
pub use codec::{
    Apdu, ApciType, Asdu, Cause, CauseOfTransmission, Cp56Time2a, DoublePointState,
    InformationObject, QualityDescriptor, TypeId, UFunction, Value,
};
pub use config::{BlockConfig, DeviceConfig, Iec104Config};
pub use driver::{Iec104Driver, TagReading};
pub use engine::ConnectionState;
pub use error::{Iec104Error, Result};
pub use scheduler::{Block, BlockCache, BlockScheduler, CachedObject};
pub use session::{Iec104Session, QCC_GENERAL, QOI_STATION};
pub use supervisor::{BackoffPolicy, SessionSupervisor};
pub use transport::{Transport, TransportConfig};

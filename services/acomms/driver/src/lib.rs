//! Transport drivers for acomms.
//!
//! A driver owns one channel and moves [`Transmission`](acomms_wire::Transmission)s
//! across it. Every transport shares the same contract:
//!
//! - **startup / shutdown**: acquire and release the channel; startup failure is fatal
//! - **do_work**: one nonblocking pass of pending I/O
//! - **handle_initiate_transmission**: modify hook, payload request, send
//! - **Auto-ACK**: DATA asking for acknowledgement and addressed to us is answered
//!
//! Transports:
//!
//! - **Framed**: CBOR transmissions inside byte-stuffed, CRC-16 checked messages
//!   over TCP (client or single-peer server)
//! - **UDP**: one CBOR transmission per datagram
//! - **Store**: periodic request/reply exchange with a [`StoreServer`]
//!
//! ## Outbound Path
//!
//! ```text
//! MAC ──initiate──► Driver ──modify_transmission──► hooks
//!                     │    ──data_request─────────► hooks (queue manager)
//!                     ▼
//!              frame_start, time, src
//!                     │
//!                     ▼
//!                  channel ──► DriverEvent::TransmitResult
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod common;
pub mod config;
pub mod driver;
pub mod error;
pub mod framed;
pub mod store;
pub mod store_server;
pub mod stream;
pub mod udp;

// Re-export main types
pub use common::{DriverCore, DriverEvent};
pub use config::{DriverConfig, StreamEndpoint, TransportConfig, UdpPeer, TRANSMISSION_OVERHEAD};
pub use driver::Driver;
pub use error::DriverError;
pub use framed::FramedDriver;
pub use store::{StoreDriver, StoreRequest, StoreResponse};
pub use store_server::StoreServer;
pub use stream::{pipe, ByteStream, FramedConnection};
pub use udp::UdpDriver;

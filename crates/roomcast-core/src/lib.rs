//! # roomcast-core
//!
//! Room membership, per-connection endpoints and the bus bridge for the
//! roomcast relay.
//!
//! - **RoomRegistry** - which connections are in which rooms
//! - **ConnectionEndpoint** - inbound/outbound loops for one connection
//! - **BusBridge** - publishes messages to the bus and fans bus payloads out
//!   to room members
//! - **Bus** - publish/subscribe abstraction, with [`LocalBus`] in-process
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐ join/exit ┌──────────────┐
//! │  Endpoint   │──────────▶│ RoomRegistry │
//! └─────────────┘           └──────────────┘
//!    │      ▲                      ▲
//!    │      │ deliver              │ members_of
//!    │      │               ┌──────────────┐
//!    │      └───────────────│  BusBridge   │
//!    │        message       └──────────────┘
//!    └──────────────────────▶   │      ▲
//!                       publish ▼      │ subscribe
//!                           ┌──────────────┐
//!                           │     Bus      │
//!                           └──────────────┘
//! ```
//!
//! Messages always travel through the bus, even between two connections on
//! the same process, so every relay process sharing a bus sees every message.

pub mod bridge;
pub mod bus;
pub mod endpoint;
pub mod handle;
pub mod keepalive;
pub mod metrics;
pub mod registry;
pub mod room;

pub use bridge::{BridgeConfig, BusBridge};
pub use bus::{Bus, BusError, BusSubscription, LocalBus};
pub use endpoint::{ConnectionEndpoint, ConnectionState, EndpointConfig, EndpointError};
pub use handle::{ConnectionHandle, DeliveryError};
pub use keepalive::{KeepAlive, KeepAliveConfig, KeepAliveError};
pub use registry::{RegistryConfig, RegistryStats, RoomRegistry};
pub use room::Room;

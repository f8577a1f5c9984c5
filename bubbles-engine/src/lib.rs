//! # bubbles-engine: Shared-canvas session engine
//!
//! Each participant is a colored bubble on a shared logical canvas. A
//! session joins a room on a relay, publishes the local bubble's position
//! and keeps a roster of everyone else's, which the renderer walks once per
//! frame through the plot cursor.
//!
//! ## Architecture
//!
//! ```text
//!  touch / autopilot                       renderer (per frame)
//!        │                                        ▲
//!        ▼                                        │ plot_start … plot_done
//! ┌──────────────┐   dirty    ┌────────────┐   ┌──┴───────────────┐
//! │ LocalPointer │ ─────────► │ connection │ ─►│ PositionRoster   │
//! └──────────────┘            │ (I/O loop) │   └──────────────────┘
//!                             └─────┬──────┘
//!                                   │ WebSocket (+ mutual TLS)
//!                             ┌─────▼──────┐
//!                             │ RelayServer│ ── rooms ── BroadcastGroup
//!                             └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`session`]: Lifecycle facade and the per-frame plot cursor
//! - [`protocol`]: Binary wire protocol (bincode-encoded WireMessage)
//! - [`transport`]: TCP / mutual-TLS dialing and accepting, PEM credentials
//! - [`roster`]: Remote participant positions
//! - [`plot`]: Snapshot cursor for the render loop
//! - [`mapper`]: Logical ⇄ pixel coordinates
//! - [`autopilot`]: Synthetic movement
//! - [`server`] / [`broadcast`]: The relay and its per-room fan-out
//! - [`ffi`]: C ABI for native UI shells

pub mod autopilot;
pub mod broadcast;
pub mod compression;
pub mod config;
mod connection;
pub mod error;
pub mod ffi;
pub mod lifecycle;
pub mod mapper;
pub mod plot;
pub mod pointer;
pub mod protocol;
pub mod roster;
pub mod server;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use autopilot::AutopilotPath;
pub use broadcast::{BroadcastGroup, BroadcastStats, ColorAllocator, RoomEvent, RoomManager};
pub use compression::Compression;
pub use config::{EngineConfig, ReconnectPolicy};
pub use error::EngineError;
pub use lifecycle::LifecycleState;
pub use mapper::{reverse_scale, scale, Frame, LOGICAL_EXTENT};
pub use plot::{PlotCursor, PlotSnapshot};
pub use pointer::{Driver, PointerSnapshot};
pub use protocol::{
    MessageType, PositionReport, ProtocolError, RejectReason, WireMessage, PROTOCOL_VERSION,
};
pub use roster::Participant;
pub use server::{BoundRelay, RelayServer, ServerConfig, ServerStats};
pub use session::{SecurityMode, Session, SessionEndpoint, SessionEvent, SessionStats};
pub use transport::{ClientTls, CredentialBundle, ServerTls};

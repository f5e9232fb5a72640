//! Parley protocol engine.
//!
//! Everything here is Sans-IO: the state machine and the registry decide what
//! should happen, and the runtime in `parley-server` performs the I/O.
//!
//! ## Architecture
//!
//! ```text
//! parley-core
//!   ├─ Connection       (per-connection state machine, returns actions)
//!   ├─ ChannelRegistry  (channel id -> members, broadcast fan-out)
//!   ├─ Participant      (one client: profile, outbox, liveness)
//!   ├─ reliability      (message ids, duplicate filter, retry schedule)
//!   └─ Transport        (duplex message stream both transports implement)
//! ```
//!
//! ## Flow
//!
//! A runtime admits a peer through [`ChannelRegistry::admit`], wraps the
//! participant in a [`Connection`] and feeds it decoded messages. Each call
//! returns [`ConnectionAction`]s that must be executed in order: direct sends
//! to the peer, broadcasts to a channel, and finally a close.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod connection;
mod error;
mod participant;
mod registry;
pub mod reliability;
mod transport;

pub use connection::{CloseReason, Connection, ConnectionAction, ConnectionState, texts};
pub use error::ConnectionError;
pub use participant::{Participant, ParticipantId, Profile, TransportKind};
pub use registry::{ChannelRegistry, DuplicateUsername};
pub use transport::{Transport, TransportError};

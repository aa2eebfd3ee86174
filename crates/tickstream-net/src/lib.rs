//! Line-oriented TCP streaming: header parsing, resumable stateful sessions
//! with idle eviction, stateless doubling streams, and a resuming client.

pub mod checksum;
pub mod client;
pub mod error;
pub mod header;
pub mod reconnection;
pub mod sequence;
pub mod stateful;
pub mod stateless;
pub mod store;
pub mod stream;
pub mod tcp_server;
pub mod timer;

pub use checksum::{Checksum, ChecksumError};
pub use client::{ClientError, ServerLine, StatefulRun, StatelessRun, run_stateful, run_stateless};
pub use error::StreamError;
pub use header::{Header, HeaderError, Mode, StatefulParams, StatelessParams};
pub use reconnection::{ReconnectConfig, ReconnectState};
pub use stateful::{StatefulOutcome, handle_stateful};
pub use stateless::{StatelessOutcome, handle_stateless};
pub use store::{Removal, SessionId, SessionInfo, SessionStore, StoreError};
pub use stream::StreamSettings;
pub use tcp_server::{ConnectionId, IdGenerator, ServerConfig, StreamServer};

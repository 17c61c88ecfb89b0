//! Transport-facing contract between the scriptd core and its network
//! adapters.
//!
//! Adapters build a [`protocol::Request`] from whatever wire form they speak
//! and hand it to the dispatcher; the resulting [`protocol::Response`] is
//! shaped for both JSON serialization and the line-oriented text protocol.

pub mod protocol;

pub use protocol::{Request, RequestError, Response, RunStatus, TransportKind};

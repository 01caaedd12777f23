//! Connection-oriented broadcast chat over TCP.
//!
//! A server accepts many concurrent connections, keeps a roster of who has
//! joined, and fans every message out to every connected participant, the
//! sender included. The client half speaks the same protocol from the other
//! end and reports what it sees as typed events.
//!
//! - [`envelope`] defines the wire unit and its length-prefixed binary framing.
//! - [`server`] owns the listener, one handler task per connection, the
//!   registry of live connections and the broadcast fan-out.
//! - [`peer`] is the client-side connection state machine.
//! - [`cli`] and [`client`] are the thin terminal front end used by the binary.
//! - [`error`] holds the error taxonomy shared by both sides.

pub mod cli;
pub mod client;
pub mod envelope;
pub mod error;
pub mod peer;
pub mod server;

pub use envelope::{Envelope, EnvelopeKind};
pub use error::{ChatError, ProtocolError};
pub use peer::{PeerConnection, PeerEvent, PeerState};
pub use server::ChatServer;

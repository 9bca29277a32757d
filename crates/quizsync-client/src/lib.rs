//! # quizsync-client
//!
//! Client runtime that keeps a quiz participant or host in sync with the
//! session authority over one persistent WebSocket.
//!
//! - [`EventDispatcher`]: ordered, panic-isolated publish/subscribe
//! - [`ConnectionManager`]: connect, heartbeat, linear-backoff reconnect
//! - [`RequestCorrelator`]: command/reply matching with per-operation budgets
//! - [`GameSessionClient`]: join, answer, host actions, realtime broadcasts
//! - [`SessionMirror`]: local snapshot folded from broadcasts
//! - [`DiagnosticsReport`]: connection self-test
//!
//! ```ignore
//! let settings = quizsync_settings::load_settings()?;
//! let client = GameSessionClient::new(settings);
//! client.connect(Some(token)).await?;
//! client.join("sess-1", "u-42").await?;
//! ```

#![deny(unsafe_code)]

pub mod connection;
pub mod correlator;
pub mod diagnostics;
pub mod dispatcher;
pub mod heartbeat;
pub mod mirror;
pub mod session;
pub mod testing;
pub mod transport;

pub use connection::{ConnectionManager, InboundObserver};
pub use correlator::{Operation, RequestCorrelator};
pub use diagnostics::{DiagnosticsReport, PingOutcome};
pub use dispatcher::{ANY, EventDispatcher};
pub use mirror::SessionMirror;
pub use session::{GameSessionClient, SessionHandle};
pub use transport::{Connector, Transport, WsConnector};

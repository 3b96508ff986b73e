//! skein-sdk: multi-network IRC client runtime.
//!
//! - [`client`]: one IRC connection, registration, flow control, lag probes
//! - [`pool`] / [`reconnect`]: per-network connections, backoff, active network
//! - [`router`] / [`batch`]: map events to conversation tabs and coalesce writes
//! - [`dcc`]: DCC CHAT/SEND offers and the auto-accept policy
//! - [`runtime`]: supervisors tying the pieces together

pub mod batch;
pub mod client;
pub mod config;
pub mod ctcp;
pub mod dcc;
pub mod error;
pub mod event;
pub mod flow;
pub mod hub;
pub mod irc;
pub mod lag;
pub mod pool;
pub mod reconnect;
pub mod router;
pub mod runtime;
pub mod session;
pub mod store;
pub mod target;

pub use config::{ClientConfig, NetworkConfig, SettingsStore};
pub use error::{ConfigError, SendError};
pub use event::Event;
pub use runtime::Runtime;
pub use target::{ConversationTarget, NetworkId};

pub mod addr;
pub mod config;
pub mod connect;
pub mod connector;
pub mod error;
pub mod events;
pub mod handle;
pub mod proxy_protocol;
pub mod target;
pub mod timer;

pub use connector::{BackendConnector, ConnectOptions};
pub use error::ConnError;
pub use handle::ConnectionHandle;
pub use proxy_protocol::{ProxyProtocolMode, SessionEndpoints};
pub use target::BackendTarget;

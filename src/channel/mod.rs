//! Channel lifecycle management for the voice connection.
//!
//! The [`ChannelManager`] keeps a single duplex channel open, reconnecting
//! with exponential backoff after unintentional closes.

pub mod backoff;
pub mod credentials;
pub mod manager;
pub mod mock;
pub mod transport;

pub use backoff::ReconnectPolicy;
pub use credentials::{CredentialProvider, EnvCredentials, StaticCredentials};
pub use manager::{ChannelConfig, ChannelManager, ConnectionState, DisconnectInfo, build_url};
pub use mock::{MockAttempt, MockConnector, MockOutcome, MockPeer};
pub use transport::{CloseInfo, Connector, Frame, TransportEvent, TransportLink, WebSocketConnector};

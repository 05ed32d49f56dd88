//! Mesh relay tunnel client
//!
//! Lets two devices with no inbound connectivity exchange TCP streams by
//! multiplexing routes over one authenticated relay session.
//!
//! - [`RelaySession`]: the relay connection, its read loop and single writer
//! - [`RouteTable`]: route id → forwarder inbound queue
//! - [`RouteForwarder`]: bridges one local socket and one route
//! - [`Exposer`] / [`TunnelConnector`]: the two user-facing tunnel modes

pub mod connect;
pub mod credentials;
pub mod error;
pub mod expose;
pub mod forwarder;
pub mod mesh;
pub mod route_table;
pub mod session;
pub mod tunnel;

pub use connect::{ConnectOptions, ConnectOutcome, ConnectState, TunnelConnector};
pub use credentials::{Credential, CredentialSource, RelayAccess};
pub use error::ErrorKind;
pub use expose::{ExposeOptions, ExposeOutcome, ExposeState, Exposer};
pub use forwarder::{ForwardStats, ForwarderError, RouteForwarder};
pub use mesh::{resolve_peer, MeshPresence};
pub use route_table::{Delivery, Direction, Lifecycle, RouteInfo, RouteTable, RouteTableError};
pub use session::{
    InboundRouteHandler, PendingRoute, RelaySession, RouteRequest, SessionConfig, SessionError,
    SessionHealth, SessionState,
};
pub use tunnel::{TunnelContext, TunnelError};

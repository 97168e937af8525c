pub mod auth;
pub mod protocol;
pub mod socket;
pub mod transport;

pub use auth::{ApiBackend, Authenticator, Credentials, HttpAuthenticator};
pub use protocol::{Payload, Resource, Response};
pub use socket::{Remote, Socket, SocketEvent, SocketHandle, SocketMode, SocketSpec, SocketStatus};
pub use transport::{Connector, FrameChannel, WsConnector};

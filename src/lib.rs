// REST Access - authenticated request execution over a refreshable OAuth2 session

pub mod auth;
pub mod config;
pub mod error;
pub mod http_client;
pub mod response;
pub mod transport;

pub use auth::AccessConfig;
pub use error::{AccessError, Result};
pub use http_client::AuthenticatedAccess;
pub use response::ResponseEnvelope;
pub use transport::{HttpTransport, OutboundRequest, RawResponse, ReqwestTransport};

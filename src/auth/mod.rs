// Authentication module
// Manages the access token lifecycle and the refresh-token grant

mod credentials;
mod manager;
mod refresh;
mod types;

pub use manager::{AuthManager, TokenSnapshot};
pub use refresh::{parse_token_response, token_endpoint_url, TokenEndpointClient, TOKEN_PATH};
pub use types::{AccessConfig, AccessToken, Credentials, TokenEndpointResponse, DEFAULT_TOKEN_TYPE};

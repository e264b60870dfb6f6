//! Gateway server implementation

mod admin;
pub mod auth;
mod pipeline;
pub mod response;
mod router;
mod server;

pub use auth::{AdminAuth, AuthFailure, ClientAuthenticator};
pub use response::{BufferedResponse, CacheStatus, X_CACHE};
pub use router::{AppState, create_router};
pub use server::{Gateway, run_worker};

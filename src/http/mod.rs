//! HTTP transport subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, middleware)
//!     → request.rs (request ID)
//!     → resources.rs (suspend, dispatch worker, await outcome)
//!     → response.rs (outcome → status + body)
//!     → Send to client
//! ```

pub mod request;
pub mod resources;
pub mod response;
pub mod server;
pub mod status;

pub use request::{request_id, X_REQUEST_ID};
pub use server::{AppState, HttpServer};

//! HTTP surface of the workload.
//!
//! - [`router`] — endpoints and their response bodies
//! - [`server`] — `Workload`: identity startup, both listeners, shutdown

pub mod router;
pub mod server;

pub use router::{
    AppState, HealthResponse, IdentityResponse, SECURE_MESSAGE, SecureResponse,
    create_plain_router, create_router,
};
pub use server::{Workload, log_identity};

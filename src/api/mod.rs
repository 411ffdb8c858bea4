//! HTTP/WS surface: routing, handlers, and the transports (SSE, WS) spec
//! §4.4/§4.5/§6 describe. Grounded on the teacher's `api` module layout
//! (`error`, `middleware`, `routes`, `ws` siblings under one `api` mod).

pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod rate_limit;
pub mod routes;
pub mod sse;
pub mod ws;

pub use error::{ApiError, ApiResult};
pub use routes::{create_router, AppState};

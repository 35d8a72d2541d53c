//! Request/response and duplex client surfaces of the relay

pub mod http;
pub mod impls;

pub use http::{create_router, AppState};

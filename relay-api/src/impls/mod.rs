// Module: impls
// Transport-agnostic client session logic shared by duplex transports

pub mod session;

pub use session::{ClientSession, ClientStream, Inbound};

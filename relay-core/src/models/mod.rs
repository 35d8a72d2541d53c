pub mod history;
pub mod id;

pub use history::HistoryEntry;
pub use id::{ConnectionId, InstanceId};

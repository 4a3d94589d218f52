pub mod arbiter;
pub mod coordinator;
pub mod directory;
pub mod http;
pub mod limits;
pub mod model;
pub mod observability;
pub mod reaper;
pub mod store;
pub mod wal;

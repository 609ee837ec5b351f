pub mod broker;
pub mod store;
pub mod subscription;

pub use broker::EventBroker;
pub use store::{JobEventStore, JobRecord, MemoryJobEventStore};
pub use subscription::{RelayService, TERMINAL_GRACE};

pub mod update_log;

pub use update_log::UpdateLogStore;

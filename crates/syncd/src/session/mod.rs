pub mod persistence;
pub mod registry;
#[allow(clippy::module_inception)]
pub mod session;

pub use persistence::PersistenceBinding;
pub use registry::SessionRegistry;
pub use session::{CollabSession, SessionErrorEvent, OUTBOUND_QUEUE_FRAMES};

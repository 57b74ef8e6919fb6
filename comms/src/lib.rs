mod endpoint;
mod error;
mod mailbox;
pub mod msg;
mod topology;

use std::sync::Arc;

use parking_lot::ReentrantMutex;

pub use endpoint::{ClientEndpoint, ServerEndpoint};
pub use error::{CommsErr, Result};
pub use topology::Topology;

/// Guards exclusive access to the compute device.
///
/// Shared by every execution unit of a training task. It is reentrant so a
/// role holding it may call into code that locks it again.
pub type DeviceLock = Arc<ReentrantMutex<()>>;

/// Creates a new, unlocked `DeviceLock`.
pub fn device_lock() -> DeviceLock {
    Arc::new(ReentrantMutex::new(()))
}

//! Permission-error reporter, the gateway's listener on the
//! permission-error bus.
//!
//! ```text
//!  connection task ── denied request ──► PermissionErrorBus
//!                                              │
//!                                              ▼
//!                                       reporter::mount()
//!                                              │
//!                                              ▼
//!                                       log::warn! (describe())
//! ```

use hearth_collab::{spawn_reporter, PermissionError, PermissionErrorBus};
use tokio::task::JoinHandle;

/// Render a report line block for one rejection.
pub fn render(error: &PermissionError) -> String {
    format!("Access denied by security rules\n{}", error.describe())
}

/// Log every published rejection until the bus goes away.
pub fn mount(bus: &PermissionErrorBus) -> JoinHandle<()> {
    spawn_reporter(bus, |error| log::warn!("{}", render(error)))
}

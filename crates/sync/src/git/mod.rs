// Git integration: command worker and working-tree state capture/restore.

pub mod state;
pub mod worker;

pub use state::{state_hash, CheckoutTarget, GitStateService, RestoreReport, MAX_PATCH_BYTES};

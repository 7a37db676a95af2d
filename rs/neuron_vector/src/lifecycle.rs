//! Module dealing with the lifecycle methods of the canister.
pub mod init;
pub mod upgrade;

pub use init::init;
pub use upgrade::{post_upgrade, pre_upgrade};

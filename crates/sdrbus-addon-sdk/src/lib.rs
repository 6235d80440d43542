//! Everything an out-of-process addon needs to speak the broker's ABI and
//! control plane: the C ABI types and `export_plugin!` macro (`abi`), a
//! client for the broker's UDS control plane (`control`), and a small
//! per-addon command dispatch convention (`dispatch`).

pub mod abi;
pub mod control;
pub mod dispatch;
pub mod error;

pub use control::ControlClient;
pub use dispatch::{run_command_loop, CommandDispatcher, WithBaseCommands};
pub use error::{AddonError, Result};

//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled                  |
//! |-----------|-----------------------------------|
//! | `queue`   | `Enqueue`, `List`, `Requeue`      |
//! | `cycle`   | `Cycle`, `Drain`                  |
//! | `serve`   | `Serve`                           |
//! | `suggest` | `Suggest`                         |
//! | `config`  | `Config`                          |

pub mod config;
pub mod cycle;
pub mod queue;
pub mod serve;
pub mod suggest;

pub use config::cmd_config;
pub use cycle::{cmd_cycle, cmd_drain};
pub use queue::{cmd_enqueue, cmd_list, cmd_requeue};
pub use serve::cmd_serve;
pub use suggest::cmd_suggest;

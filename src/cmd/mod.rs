//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `serve`  | `Serve`          |
//! | `ask`    | `Ask`            |
//! | `config` | `Config`         |

pub mod ask;
pub mod config;
pub mod serve;

pub use ask::{AskArgs, cmd_ask};
pub use config::cmd_config;
pub use serve::cmd_serve;

//! The transcoder: deterministic encoder invocations, option validation,
//! process supervision and resource monitoring.

mod command;
mod monitor;
mod supervisor;
mod validate;

pub use command::*;
pub use monitor::*;
pub use supervisor::*;
pub use validate::*;

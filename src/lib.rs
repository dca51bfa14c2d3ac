#[macro_use]
extern crate tracing;

pub mod agent;
pub mod args;
pub mod daemon;
mod errors;
mod logging;
pub mod scheduler;

pub use args::{
    Args,
    Command,
};
pub use errors::init_errors;
pub use logging::init_logging;

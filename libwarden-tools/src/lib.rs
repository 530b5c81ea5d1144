#[macro_use]
extern crate log;

mod analyzer;
mod config;
mod context;
mod duration;
mod engine;
mod error;
mod packet;

pub use analyzer::*;
pub use config::Config;
pub use context::*;
pub use duration::Duration;
pub use engine::*;
pub use error::*;
pub use packet::*;

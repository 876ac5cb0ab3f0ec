#![forbid(unsafe_code)]

mod accident;
mod config;
mod descriptor;
mod engine;
mod error;
mod event;
mod retry;
mod store;

pub use accident::*;
pub use config::*;
pub use descriptor::*;
pub use engine::*;
pub use error::*;
pub use event::*;
pub use retry::*;
pub use store::*;

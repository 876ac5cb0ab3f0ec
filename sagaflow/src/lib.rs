#![forbid(unsafe_code)]

mod accident;
mod channel;
mod config;
mod dispatcher;
mod error;
mod leader;
mod scanner;

pub use accident::*;
pub use channel::*;
pub use config::*;
pub use dispatcher::*;
pub use error::*;
pub use leader::*;
pub use scanner::*;

pub use sagaflow_store as store;

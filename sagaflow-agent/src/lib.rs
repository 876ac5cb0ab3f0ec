#![forbid(unsafe_code)]

mod analyzer;
mod error;
mod executor;
mod interceptor;
mod sender;
mod synthesizer;

pub use analyzer::*;
pub use error::*;
pub use executor::*;
pub use interceptor::*;
pub use sender::*;
pub use synthesizer::*;

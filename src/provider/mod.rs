pub mod cerebras;
mod error;
pub mod sse;
mod types;

pub use error::ChatError;
pub use types::*;

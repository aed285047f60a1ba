pub mod error;
pub mod key;

pub use error::{Result, RuntimeError};
pub use key::{EntityKey, FailureDetails};

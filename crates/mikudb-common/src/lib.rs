pub mod error;
pub mod types;

pub use error::{MikuError, MikuResult};
pub use types::*;

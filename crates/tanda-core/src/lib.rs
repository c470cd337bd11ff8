pub mod constants;
pub mod error;
pub mod model;
pub mod money;
pub mod types;

pub use error::Error;
pub use model::*;
pub use money::Money;
pub use types::*;

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::TrellisConfig;
pub use error::{Result, TrellisError};
pub use traits::{LanguageModel, RequestManager, Tool};
pub use types::*;

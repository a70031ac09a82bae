pub mod error;
pub mod service;

pub use error::PersistError;
pub use service::{PersistConfig, PersistenceService};

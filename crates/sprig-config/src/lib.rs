mod loader;
mod raw;
pub mod error;

pub use error::ConfigError;
pub use loader::{load_site, DeviceKind, DeviceSpec, SiteConfig};

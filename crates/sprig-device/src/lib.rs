pub mod device;
pub mod error;
pub mod properties;
pub mod registry;
pub mod sim;

pub use device::{Device, DeviceCore};
pub use error::DeviceError;
pub use properties::{PropertyBag, PropertyChange, PropertyChangeHandler, value_type_tag};
pub use registry::DeviceRegistry;
pub use sim::{SimulatedController, SimulatedPump, SimulatedSensor};

mod types;

pub use types::{ApplicationsSyncPolicy, ControllerConfig};

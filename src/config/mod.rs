pub mod env;
pub mod store;
pub mod types;

pub use env::EnvSettings;
pub use store::Store;
pub use types::{Account, Config, RuntimeLimits, get_model_config, known_models};

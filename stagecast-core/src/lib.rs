pub mod config;
pub mod encoder;
pub mod error;
pub mod events;
pub mod logging;
pub mod recording;
pub mod relay;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};
pub use events::MediaEvent;

pub mod config;
pub mod error;
pub mod proxy;
pub mod tap;

pub use beacon_reactor as reactor;
pub use beacon_support as support;
pub use beacon_writer as writer;

pub use config::{FileSettings, Settings};
pub use error::BeaconError;

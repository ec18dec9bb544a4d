pub mod acquisition;
pub mod baseline;
pub mod config;
pub mod daq;
pub mod error;
pub mod export;
pub mod peaks;
pub mod session;
pub mod signal;
pub mod simulated;
pub mod stimulus;
pub mod trial;
pub mod types;

pub mod backup;
pub mod codec;
pub mod config;
pub mod detect;
pub mod error;
pub mod fs;
pub mod manifest;
pub mod path_safety;
pub mod restore;
pub mod rotation;
pub mod store;
pub mod transport;

pub use error::Error;

pub mod config;
pub mod lease;
pub mod presence;
pub mod validate;

pub mod compilation;
pub mod config;
pub mod error;
pub mod host;
pub mod layout;
pub mod log;
pub mod request;
pub mod session;

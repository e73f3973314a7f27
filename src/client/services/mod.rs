pub mod connection;
pub mod downloads;
pub mod error;
pub mod favorites;
pub mod friends;
pub mod http;
pub mod wire;

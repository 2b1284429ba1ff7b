pub mod client;
pub mod conf;
pub mod config;
pub mod crypto;
pub mod device;
pub mod handshake;
pub mod peer;
pub mod scripts;
pub mod server;
pub mod stats;
pub mod transport;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;

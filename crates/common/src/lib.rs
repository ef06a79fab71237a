pub mod bloom;
pub mod handshake;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

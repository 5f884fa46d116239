//! Wire protocols spoken to running game servers and the local network.

pub mod lan;
pub mod ping;
pub mod query;

use thiserror::Error;

pub use ping::PingResult;
pub use query::FullStat;

/// 프로토콜 통신 오류 타입
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Connection failed: {0}")]
    ConnectionError(String),

    #[error("Timeout: {0}")]
    TimeoutError(String),

    /// The peer answered, but not in a format we understand.
    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Socket error: {0}")]
    Socket(#[from] std::io::Error),
}

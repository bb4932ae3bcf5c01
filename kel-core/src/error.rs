use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel disconnected: {0}")]
    ChannelDisconnected(&'static str),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

pub type Result<T> = std::result::Result<T, KeelError>;

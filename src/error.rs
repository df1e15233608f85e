use thiserror::Error;

/// Wind fusion error types
#[derive(Error, Debug)]
pub enum FusionError {
    #[error("Failed to open serial port {port}: {source}")]
    SerialOpen {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("Serial communication error: {0}")]
    SerialIo(#[source] std::io::Error),

    #[error("Failed to bind UDP port {port}: {source}")]
    UdpBind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Persistence error for {path}: {source}")]
    Persist {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Publish error: {0}")]
    Publish(#[source] std::io::Error),

    #[error("Firewall command failed: {0}")]
    Firewall(String),
}

pub type Result<T> = std::result::Result<T, FusionError>;

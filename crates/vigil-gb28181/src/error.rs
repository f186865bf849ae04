use thiserror::Error;

use crate::sip::message::ParseError;

#[derive(Error, Debug)]
pub enum Gb28181Error {
    #[error("Malformed SIP message: {0}")]
    MalformedRequest(#[from] ParseError),

    #[error("Authentication failed for device {0}")]
    AuthenticationFailed(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Session not found: {device_id}/{channel_id}")]
    SessionNotFound {
        device_id: String,
        channel_id: String,
    },

    #[error("Playback session not found: {0}")]
    PlaybackNotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("XML error: {0}")]
    Xml(String),

    #[error("Other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Gb28181Error>;

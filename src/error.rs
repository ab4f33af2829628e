//! Error types for the modem, the MQTT session and the tracker loop

use thiserror_no_std::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModemError {
    #[error("timed out waiting for the modem")]
    Timeout,
    #[error("modem rejected the command")]
    Rejected,
    #[error("serial port failure")]
    Serial,
    #[error("modem response did not fit the receive buffer")]
    Overflow,
    #[error("unexpected modem response")]
    Parse,
}

impl From<atat::Error> for ModemError {
    fn from(err: atat::Error) -> Self {
        match err {
            atat::Error::Timeout => ModemError::Timeout,
            atat::Error::Parse => ModemError::Parse,
            _ => ModemError::Rejected,
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientError {
    #[error("MQTT session is not connected")]
    NotConnected,
    #[error("broker refused the connection")]
    Refused,
    #[error("MQTT packet could not be encoded or decoded")]
    Codec,
    #[error("MQTT packet did not fit the buffer")]
    Overflow,
    #[error("transport failure: {0}")]
    Transport(ModemError),
}

impl From<ModemError> for ClientError {
    fn from(err: ModemError) -> Self {
        ClientError::Transport(err)
    }
}

/// Startup failures surfaced to the firmware entry point.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerError {
    #[error("failed to drive the modem reset pin")]
    ResetPin,
    #[error("failed to drive the LED pin")]
    LedPin,
    #[error("network not available before the timeout")]
    NetworkUnavailable,
}

//! Capability traits the tracker loop is written against

use embassy_time::{Duration, Instant};
use heapless::String;

use crate::error::{ClientError, ModemError};
use crate::model::{GpsFix, InboundMessage};

/// Monotonic time source
pub trait Clock {
    fn now(&self) -> Instant;
}

/// Cellular modem with an integrated GNSS receiver
pub trait NetworkModem {
    /// Soft-restart the modem and wait until it answers again
    fn restart(&mut self) -> Result<(), ModemError>;

    /// Identification string reported by the modem
    fn modem_info(&mut self) -> Result<String<64>, ModemError>;

    /// Attach to the packet network using the given APN
    fn gprs_connect(&mut self, apn: &str) -> Result<(), ModemError>;

    /// Block until the modem is registered on the network. Returns `false` on timeout.
    fn wait_for_network(&mut self, timeout: Duration) -> bool;

    fn is_gprs_connected(&mut self) -> bool;

    fn enable_gps(&mut self) -> Result<(), ModemError>;

    /// Latest valid fix, or `None` while the receiver has no position
    fn gps_fix(&mut self) -> Option<GpsFix>;
}

/// Publish/subscribe session with a single broker
pub trait MessageClient {
    /// Remember the broker address used by later `connect` calls
    fn set_server(&mut self, host: &'static str, port: u16);

    fn connect(&mut self, client_id: &str, username: &str, password: &str)
    -> Result<(), ClientError>;

    fn is_connected(&mut self) -> bool;

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), ClientError>;

    fn subscribe(&mut self, topic: &str) -> Result<(), ClientError>;

    /// Service keepalive and reads. Returns at most one received message per call.
    fn poll(&mut self) -> Result<Option<InboundMessage>, ClientError>;
}

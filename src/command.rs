//! SIM808 AT commands used by the tracker
//!
//! Replies that do not end in a standard result code (`SHUT OK`, the bare
//! address printed by `AT+CIFSR`, `CLOSE OK`) are handled as raw lines by
//! [`AtLink`](crate::at::AtLink) instead.

use atat::atat_derive::{AtatCmd, AtatResp, AtatUrc};
use atat::heapless::String;

#[derive(Debug, Clone, AtatResp)]
pub struct NoResponse;

/// `AT`, used to check that the modem is listening
#[derive(Clone, AtatCmd)]
#[at_cmd("", NoResponse, timeout_ms = 500)]
pub struct Attention;

#[derive(Clone, AtatCmd)]
#[at_cmd("E0", NoResponse)]
pub struct DisableEcho;

/// `AT+CFUN=<fun>,<rst>`
#[derive(Clone, AtatCmd)]
#[at_cmd("+CFUN", NoResponse, timeout_ms = 10000)]
pub struct SetFunctionality {
    #[at_arg(position = 0)]
    pub fun: u8,
    #[at_arg(position = 1)]
    pub reset: u8,
}

#[derive(Clone, AtatCmd)]
#[at_cmd("I", ModemIdentity)]
pub struct GetModemIdentity;

#[derive(Debug, Clone, AtatResp)]
pub struct ModemIdentity {
    #[at_arg(position = 0)]
    pub info: String<64>,
}

/// `AT+CIPMODE=1` puts the next socket in transparent mode
#[derive(Clone, AtatCmd)]
#[at_cmd("+CIPMODE", NoResponse)]
pub struct SetTransparentMode {
    #[at_arg(position = 0)]
    pub mode: u8,
}

#[derive(Clone, AtatCmd)]
#[at_cmd("+CGATT", NoResponse, timeout_ms = 10000)]
pub struct SetGprsAttach {
    #[at_arg(position = 0)]
    pub state: u8,
}

#[derive(Clone, AtatCmd)]
#[at_cmd("+CGATT?", GprsAttach)]
pub struct GetGprsAttach;

#[derive(Debug, Clone, AtatResp)]
pub struct GprsAttach {
    #[at_arg(position = 0)]
    pub state: u8,
}

#[derive(Clone, AtatCmd)]
#[at_cmd("+CSTT", NoResponse)]
pub struct SetApn<'a> {
    #[at_arg(position = 0, len = 64)]
    pub apn: &'a str,
}

/// Bring up the wireless connection. Can take most of a minute.
#[derive(Clone, AtatCmd)]
#[at_cmd("+CIICR", NoResponse, timeout_ms = 60000)]
pub struct BringUpWireless;

#[derive(Clone, AtatCmd)]
#[at_cmd("+CREG?", NetworkRegistration)]
pub struct GetNetworkRegistration;

/// `+CREG: <n>,<stat>`
#[derive(Debug, Clone, AtatResp)]
pub struct NetworkRegistration {
    #[at_arg(position = 0)]
    pub n: u8,
    #[at_arg(position = 1)]
    pub stat: u8,
}

impl NetworkRegistration {
    /// Registered on the home network (1) or roaming (5)
    pub fn is_registered(&self) -> bool {
        matches!(self.stat, 1 | 5)
    }
}

#[derive(Clone, AtatCmd)]
#[at_cmd("+CGNSPWR", NoResponse)]
pub struct SetGnssPower {
    #[at_arg(position = 0)]
    pub on: u8,
}

/// `AT+CIPSTART="TCP","<host>",<port>`. `OK` only means the attempt started;
/// `CONNECT` or `CONNECT FAIL` follows.
#[derive(Clone, AtatCmd)]
#[at_cmd("+CIPSTART", NoResponse, timeout_ms = 2000)]
pub struct StartConnection<'a> {
    #[at_arg(position = 0, len = 3)]
    pub protocol: &'a str,
    #[at_arg(position = 1, len = 64)]
    pub host: &'a str,
    #[at_arg(position = 2)]
    pub port: u16,
}

/// Status lines the modem prints on its own after a reboot
#[derive(Debug, Clone, AtatUrc)]
pub enum Urc {
    #[at_urc("RDY")]
    Ready,
    #[at_urc("Call Ready")]
    CallReady,
    #[at_urc("SMS Ready")]
    SmsReady,
}

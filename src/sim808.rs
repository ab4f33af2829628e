//! SIM808 GSM/GPRS modem with integrated GNSS

use core::cell::RefCell;

use embassy_time::Duration;
use embedded_io::{Read, ReadReady, Write};
use heapless::String;

use crate::at::{AtLink, read_available};
use crate::command::{
    BringUpWireless, DisableEcho, GetGprsAttach, GetModemIdentity, GetNetworkRegistration, Attention,
    SetApn, SetFunctionality, SetGnssPower, SetGprsAttach, SetTransparentMode,
};
use crate::error::ModemError;
use crate::model::GpsFix;
use crate::nmea::{NmeaReader, Rmc};
use crate::traits::{Clock, NetworkModem};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);
const RESTART_TIMEOUT: Duration = Duration::from_secs(10);
const REGISTRATION_RETRY: Duration = Duration::from_millis(500);
/// Receiver emits one RMC per second
const FIX_TIMEOUT: Duration = Duration::from_millis(2_000);

/// Modem driver. The AT port is shared with the MQTT session, which owns it
/// while the socket is in data mode.
pub struct Sim808<'a, U, G, K> {
    link: &'a RefCell<AtLink<U, K>>,
    gps: G,
    nmea: NmeaReader,
}

impl<'a, U, G, K> Sim808<'a, U, G, K>
where
    U: Read + ReadReady + Write,
    G: Read + ReadReady,
    K: Clock,
{
    pub fn new(link: &'a RefCell<AtLink<U, K>>, gps: G) -> Self {
        Self {
            link,
            gps,
            nmea: NmeaReader::new(),
        }
    }

    /// Feed everything the GNSS port has buffered and return the newest RMC result.
    fn drain_gps(&mut self) -> Result<Option<Rmc>, ModemError> {
        let mut chunk = [0u8; 32];
        let mut latest = None;
        loop {
            let n = read_available(&mut self.gps, &mut chunk)?;
            if n == 0 {
                return Ok(latest);
            }
            for &b in &chunk[..n] {
                if let Some(rmc) = self.nmea.feed(b) {
                    latest = Some(rmc);
                }
            }
        }
    }
}

impl<U, G, K> NetworkModem for Sim808<'_, U, G, K>
where
    U: Read + ReadReady + Write,
    G: Read + ReadReady,
    K: Clock,
{
    fn restart(&mut self) -> Result<(), ModemError> {
        let cell = self.link;
        let mut link = cell.borrow_mut();

        log::info!("[MODEM] Restarting");
        // Some firmware revisions reboot before answering
        if let Err(e) = link.send(&SetFunctionality { fun: 1, reset: 1 }) {
            log::debug!("[MODEM] CFUN answered {}", e);
        }

        let deadline = link.now() + RESTART_TIMEOUT;
        while link.send(&Attention).is_err() {
            if link.now() >= deadline {
                return Err(ModemError::Timeout);
            }
        }
        link.send(&DisableEcho)?;
        Ok(())
    }

    fn modem_info(&mut self) -> Result<String<64>, ModemError> {
        let identity = self.link.borrow_mut().send(&GetModemIdentity)?;
        let mut info = String::new();
        for c in identity.info.chars() {
            if info.push(c).is_err() {
                break;
            }
        }
        Ok(info)
    }

    fn gprs_connect(&mut self, apn: &str) -> Result<(), ModemError> {
        let cell = self.link;
        let mut link = cell.borrow_mut();

        link.send_line("AT+CIPSHUT")?;
        link.wait_for("SHUT OK", COMMAND_TIMEOUT)?;
        link.send(&SetTransparentMode { mode: 1 })?;
        link.send(&SetGprsAttach { state: 1 })?;
        link.send(&SetApn { apn })?;
        link.send(&BringUpWireless)?;

        link.send_line("AT+CIFSR")?;
        let ip = link.read_line(COMMAND_TIMEOUT)?;
        log::info!("[MODEM] Local IP {}", ip);
        Ok(())
    }

    fn wait_for_network(&mut self, timeout: Duration) -> bool {
        let cell = self.link;
        let mut link = cell.borrow_mut();

        let deadline = link.now() + timeout;
        loop {
            match link.send(&GetNetworkRegistration) {
                Ok(registration) if registration.is_registered() => {
                    if registration.stat == 5 {
                        log::info!("[MODEM] Registered (roaming)");
                    }
                    return true;
                }
                Ok(registration) => {
                    log::debug!("[MODEM] Registration status {}", registration.stat)
                }
                Err(e) => log::debug!("[MODEM] CREG failed: {}", e),
            }
            if link.now() >= deadline {
                return false;
            }
            link.pause(REGISTRATION_RETRY);
        }
    }

    fn is_gprs_connected(&mut self) -> bool {
        self.link
            .borrow_mut()
            .send(&GetGprsAttach)
            .map(|attach| attach.state == 1)
            .unwrap_or(false)
    }

    fn enable_gps(&mut self) -> Result<(), ModemError> {
        self.link.borrow_mut().send(&SetGnssPower { on: 1 })?;
        Ok(())
    }

    /// Newest RMC already buffered on the GNSS port, or the next one to
    /// arrive when nothing complete is buffered.
    fn gps_fix(&mut self) -> Option<GpsFix> {
        let deadline = self.link.borrow().now() + FIX_TIMEOUT;
        loop {
            match self.drain_gps() {
                Ok(Some(Rmc::Fix(fix))) => return Some(fix),
                Ok(Some(Rmc::Void)) => return None,
                Ok(None) => {}
                Err(e) => {
                    log::warn!("[GPS] Read failed: {}", e);
                    return None;
                }
            }
            if self.link.borrow().now() >= deadline {
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeSerial, TickingClock};

    type TestLink = RefCell<AtLink<FakeSerial, TickingClock>>;

    const MUNICH: &[u8] =
        b"$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A\r\n";
    const JAKARTA: &[u8] =
        b"$GNRMC,023044.000,A,0612.0000,S,10649.0000,E,6.48,54.7,181026,,,A*63\r\n";

    fn link(input: &[u8]) -> TestLink {
        RefCell::new(AtLink::new(
            FakeSerial::with_input(input),
            TickingClock::new(1),
        ))
    }

    fn modem<'a>(link: &'a TestLink, gps: &[u8]) -> Sim808<'a, FakeSerial, FakeSerial, TickingClock> {
        Sim808::new(link, FakeSerial::with_input(gps))
    }

    fn sent(link: &TestLink) -> std::vec::Vec<std::string::String> {
        link.borrow_mut().serial_mut().sent_commands()
    }

    #[test]
    fn test_restart_waits_for_modem() {
        let link = link(b"\r\nOK\r\n\r\nOK\r\n\r\nOK\r\n");
        let mut sim = modem(&link, b"");

        assert_eq!(sim.restart(), Ok(()));
        assert_eq!(sent(&link), ["AT+CFUN=1,1", "AT", "ATE0"]);
    }

    #[test]
    fn test_restart_times_out_when_modem_stays_silent() {
        let link = link(b"");
        let mut sim = modem(&link, b"");

        assert_eq!(sim.restart(), Err(ModemError::Timeout));
    }

    #[test]
    fn test_modem_info_first_line() {
        let link = link(b"\r\nSIM808 R14.18\r\n\r\nOK\r\n");
        let mut sim = modem(&link, b"");

        assert_eq!(sim.modem_info().unwrap().as_str(), "SIM808 R14.18");
    }

    #[test]
    fn test_gprs_connect_sequence() {
        let link = link(
            b"\r\nSHUT OK\r\n\r\nOK\r\n\r\nOK\r\n\r\nOK\r\n\r\nOK\r\n\r\n10.1.2.3\r\n",
        );
        let mut sim = modem(&link, b"");

        assert_eq!(sim.gprs_connect("internet"), Ok(()));
        assert_eq!(
            sent(&link),
            [
                "AT+CIPSHUT",
                "AT+CIPMODE=1",
                "AT+CGATT=1",
                "AT+CSTT=\"internet\"",
                "AT+CIICR",
                "AT+CIFSR",
            ]
        );
    }

    #[test]
    fn test_gprs_connect_stops_on_error() {
        let link = link(b"\r\nSHUT OK\r\n\r\nOK\r\n\r\nERROR\r\n");
        let mut sim = modem(&link, b"");

        assert_eq!(sim.gprs_connect("internet"), Err(ModemError::Rejected));
        assert_eq!(sent(&link).len(), 3);
    }

    #[test]
    fn test_wait_for_network_until_registered() {
        let link = link(b"\r\n+CREG: 0,2\r\n\r\nOK\r\n\r\n+CREG: 0,1\r\n\r\nOK\r\n");
        let mut sim = modem(&link, b"");

        assert!(sim.wait_for_network(Duration::from_secs(10)));
        assert_eq!(sent(&link), ["AT+CREG?", "AT+CREG?"]);
    }

    #[test]
    fn test_wait_for_network_accepts_roaming() {
        let link = link(b"\r\n+CREG: 0,5\r\n\r\nOK\r\n");
        let mut sim = modem(&link, b"");

        assert!(sim.wait_for_network(Duration::from_secs(10)));
    }

    #[test]
    fn test_wait_for_network_times_out() {
        let link = link(b"");
        let mut sim = modem(&link, b"");

        assert!(!sim.wait_for_network(Duration::from_secs(10)));
    }

    #[test]
    fn test_gprs_attach_query() {
        let link = link(b"\r\n+CGATT: 1\r\n\r\nOK\r\n\r\n+CGATT: 0\r\n\r\nOK\r\n");
        let mut sim = modem(&link, b"");

        assert!(sim.is_gprs_connected());
        assert!(!sim.is_gprs_connected());
    }

    #[test]
    fn test_enable_gps_powers_receiver() {
        let link = link(b"\r\nOK\r\n");
        let mut sim = modem(&link, b"");

        assert_eq!(sim.enable_gps(), Ok(()));
        assert_eq!(sent(&link), ["AT+CGNSPWR=1"]);
    }

    #[test]
    fn test_gps_fix_from_nmea_port() {
        let link = link(b"");
        let mut sim = modem(&link, JAKARTA);

        let fix = sim.gps_fix().unwrap();
        assert!((fix.latitude - -6.2).abs() < 1e-5);
        assert_eq!(fix.speed as i32, 12);

        // Nothing new on the port
        assert_eq!(sim.gps_fix(), None);
    }

    #[test]
    fn test_gps_fix_prefers_newest_buffered_sentence() {
        let link = link(b"");
        let mut queued = MUNICH.to_vec();
        queued.extend_from_slice(JAKARTA);
        let mut sim = modem(&link, &queued);

        let fix = sim.gps_fix().unwrap();
        assert!((fix.latitude - -6.2).abs() < 1e-5);
        assert!((fix.longitude - 106.816666).abs() < 1e-4);
    }

    #[test]
    fn test_gps_fix_void_sentence() {
        let link = link(b"");
        let mut sim = modem(&link, b"$GPRMC,023045.000,V,,,,,,,181026,,,N*41\r\n");

        assert_eq!(sim.gps_fix(), None);
    }

    #[test]
    fn test_gps_fix_waits_for_sentence_split_across_reads() {
        let link = link(b"");
        let (head, tail) = JAKARTA.split_at(20);
        let mut sim = modem(&link, head);

        assert_eq!(sim.gps_fix(), None);

        sim.gps.feed(tail);
        assert!(sim.gps_fix().is_some());
    }
}

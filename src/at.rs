//! AT channel to the modem
//!
//! Commands are `atat` types and replies are framed by `DefaultDigester`.
//! The link feeds the digester from the UART itself because the same port
//! carries raw socket bytes once a transparent connection is up.

use atat::{AtatCmd, DefaultDigester, DigestResult, Digester};
use embassy_time::{Duration, Instant};
use embedded_io::{Read, ReadReady, Write};
use heapless::{String, Vec};

use crate::command::Urc;
use crate::error::ModemError;
use crate::traits::Clock;

pub const LINE_CAPACITY: usize = 128;
const RX_CAPACITY: usize = 256;
const TX_CAPACITY: usize = 128;

/// Escape guard time required around `+++`
const ESCAPE_GUARD: Duration = Duration::from_millis(1_000);

pub type Line = String<LINE_CAPACITY>;

/// Read whatever is already buffered without blocking.
pub(crate) fn read_available<S>(serial: &mut S, buf: &mut [u8]) -> Result<usize, ModemError>
where
    S: Read + ReadReady,
{
    if buf.is_empty() || !serial.read_ready().map_err(|_| ModemError::Serial)? {
        return Ok(0);
    }
    serial.read(buf).map_err(|_| ModemError::Serial)
}

pub struct AtLink<U, K> {
    serial: U,
    clock: K,
    digester: DefaultDigester<Urc>,
    rx: Vec<u8, RX_CAPACITY>,
    tx: [u8; TX_CAPACITY],
}

impl<U, K> AtLink<U, K>
where
    U: Read + ReadReady + Write,
    K: Clock,
{
    pub fn new(serial: U, clock: K) -> Self {
        Self {
            serial,
            clock,
            digester: DefaultDigester::<Urc>::default(),
            rx: Vec::new(),
            tx: [0; TX_CAPACITY],
        }
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Spin until `duration` has passed
    pub fn pause(&self, duration: Duration) {
        let until = self.clock.now() + duration;
        while self.clock.now() < until {}
    }

    /// Send a command and wait for its final result, up to the command's own timeout.
    pub fn send<Cmd: AtatCmd>(&mut self, cmd: &Cmd) -> Result<Cmd::Response, ModemError> {
        if Cmd::MAX_LEN > TX_CAPACITY {
            return Err(ModemError::Overflow);
        }
        let len = cmd.write(&mut self.tx);
        if let Ok(text) = core::str::from_utf8(&self.tx[..len]) {
            log::debug!("[AT] > {}", text.trim_end());
        }
        self.serial
            .write_all(&self.tx[..len])
            .map_err(|_| ModemError::Serial)?;
        self.serial.flush().map_err(|_| ModemError::Serial)?;

        let deadline = self.clock.now() + Duration::from_millis(u64::from(Cmd::MAX_TIMEOUT_MS));
        loop {
            let received = self.pump()?;

            let (result, used) = self.digester.digest(&self.rx);
            let reply = match result {
                DigestResult::Response(response) => Some(cmd.parse(response)),
                DigestResult::Urc(urc) => {
                    log::debug!("[AT] URC {}", core::str::from_utf8(urc).unwrap_or("?"));
                    None
                }
                DigestResult::Prompt(_) | DigestResult::None => None,
            };
            self.consume(used);

            if let Some(reply) = reply {
                return reply.map_err(ModemError::from);
            }
            if used == 0 && received == 0 {
                if self.rx.is_full() {
                    self.rx.clear();
                    return Err(ModemError::Overflow);
                }
                if self.clock.now() >= deadline {
                    return Err(ModemError::Timeout);
                }
            }
        }
    }

    /// Write a command whose reply is read back with [`read_line`](Self::read_line)
    /// or [`wait_for`](Self::wait_for).
    pub fn send_line(&mut self, cmd: &str) -> Result<(), ModemError> {
        log::debug!("[AT] > {}", cmd);
        self.serial
            .write_all(cmd.as_bytes())
            .map_err(|_| ModemError::Serial)?;
        self.write_raw(b"\r")
    }

    /// Next non-empty line
    pub fn read_line(&mut self, timeout: Duration) -> Result<Line, ModemError> {
        let deadline = self.clock.now() + timeout;
        self.next_line(deadline)
    }

    /// Wait for a line equal to `token`. Lines reporting a failure end the wait early.
    pub fn wait_for(&mut self, token: &str, timeout: Duration) -> Result<(), ModemError> {
        let deadline = self.clock.now() + timeout;
        loop {
            let line = self.next_line(deadline)?;
            let text = line.as_str();
            if text == token {
                return Ok(());
            }
            if text.contains("ERROR") || text.contains("FAIL") {
                log::warn!("[AT] {} while waiting for {}", text, token);
                return Err(ModemError::Rejected);
            }
            log::debug!("[AT] < {}", text);
        }
    }

    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<(), ModemError> {
        self.serial.write_all(bytes).map_err(|_| ModemError::Serial)?;
        self.serial.flush().map_err(|_| ModemError::Serial)
    }

    /// Non-blocking read of data-mode bytes, starting with anything already
    /// pulled off the UART while waiting for a reply.
    pub fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize, ModemError> {
        if self.rx.is_empty() {
            return read_available(&mut self.serial, buf);
        }
        let n = buf.len().min(self.rx.len());
        buf[..n].copy_from_slice(&self.rx[..n]);
        self.consume(n);
        Ok(n)
    }

    /// Drop any buffered input.
    pub fn discard_input(&mut self) -> Result<(), ModemError> {
        self.rx.clear();
        let mut scratch = [0u8; 32];
        while read_available(&mut self.serial, &mut scratch)? > 0 {}
        Ok(())
    }

    /// Leave transparent data mode and return to command mode.
    pub fn escape_data_mode(&mut self) -> Result<(), ModemError> {
        self.pause(ESCAPE_GUARD);
        self.write_raw(b"+++")?;
        self.pause(ESCAPE_GUARD);
        self.discard_input()
    }

    /// Move buffered UART bytes into `rx`. Returns how many were moved.
    fn pump(&mut self) -> Result<usize, ModemError> {
        let free = RX_CAPACITY - self.rx.len();
        let mut chunk = [0u8; 64];
        let take = free.min(chunk.len());
        let n = read_available(&mut self.serial, &mut chunk[..take])?;
        self.rx
            .extend_from_slice(&chunk[..n])
            .map_err(|_| ModemError::Overflow)?;
        Ok(n)
    }

    fn consume(&mut self, n: usize) {
        let n = n.min(self.rx.len());
        let rest = self.rx.len() - n;
        self.rx.copy_within(n.., 0);
        self.rx.truncate(rest);
    }

    fn next_line(&mut self, deadline: Instant) -> Result<Line, ModemError> {
        loop {
            if let Some(line) = self.take_line()? {
                return Ok(line);
            }
            if self.pump()? == 0 && self.clock.now() >= deadline {
                return Err(ModemError::Timeout);
            }
        }
    }

    fn take_line(&mut self) -> Result<Option<Line>, ModemError> {
        while let Some(end) = self.rx.iter().position(|&b| b == b'\n') {
            let line = match core::str::from_utf8(&self.rx[..end]) {
                Ok(text) if text.trim().is_empty() => None,
                Ok(text) => {
                    let mut owned = Line::new();
                    Some(
                        owned
                            .push_str(text.trim())
                            .map(|_| owned)
                            .map_err(|_| ModemError::Overflow),
                    )
                }
                Err(_) => Some(Err(ModemError::Serial)),
            };
            self.consume(end + 1);
            if let Some(line) = line {
                return line.map(Some);
            }
        }
        if self.rx.is_full() {
            self.rx.clear();
            return Err(ModemError::Overflow);
        }
        Ok(None)
    }
}

#[cfg(test)]
impl<U, K> AtLink<U, K> {
    pub(crate) fn serial_mut(&mut self) -> &mut U {
        &mut self.serial
    }
}

// In-memory serial port and clock shared by the host tests

use core::cell::Cell;
use core::convert::Infallible;
use std::collections::VecDeque;
use std::rc::Rc;

use embassy_time::Instant;
use embedded_io::{ErrorType, Read, ReadReady, Write};

use crate::traits::Clock;

#[derive(Default)]
pub struct FakeSerial {
    pub rx: VecDeque<u8>,
    pub tx: Vec<u8>,
}

impl FakeSerial {
    pub fn with_input(input: &[u8]) -> Self {
        Self {
            rx: input.iter().copied().collect(),
            tx: Vec::new(),
        }
    }

    pub fn feed(&mut self, input: &[u8]) {
        self.rx.extend(input.iter().copied());
    }

    pub fn written(&self) -> String {
        String::from_utf8_lossy(&self.tx).into_owned()
    }

    /// Written commands with their line terminators stripped
    pub fn sent_commands(&self) -> Vec<String> {
        self.written()
            .split(['\r', '\n'])
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect()
    }
}

impl ErrorType for FakeSerial {
    type Error = Infallible;
}

impl Read for FakeSerial {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let mut n = 0;
        while n < buf.len() {
            match self.rx.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}

impl ReadReady for FakeSerial {
    fn read_ready(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.rx.is_empty())
    }
}

impl Write for FakeSerial {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.tx.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Clock that moves forward by `step_ms` every time it is read, so busy
/// waits in the code under test always terminate.
#[derive(Clone)]
pub struct TickingClock {
    now_ms: Rc<Cell<u64>>,
    step_ms: u64,
}

impl TickingClock {
    pub fn new(step_ms: u64) -> Self {
        Self {
            now_ms: Rc::new(Cell::new(0)),
            step_ms,
        }
    }

    pub fn advance_ms(&self, ms: u64) {
        self.now_ms.set(self.now_ms.get() + ms);
    }
}

impl Clock for TickingClock {
    fn now(&self) -> Instant {
        let now = self.now_ms.get();
        self.now_ms.set(now + self.step_ms);
        Instant::from_millis(now)
    }
}

use embassy_time::Instant;
use esp_hal::gpio::AnyPin;
use esp_hal::{
    Blocking,
    delay::Delay,
    gpio::{Level, Output, OutputConfig},
    peripherals::{UART1, UART2},
    uart::{Config as UartConfig, Uart},
};

use crate::traits::Clock;

/// Rate the SIM808 autobauds to on the AT port
const MODEM_BAUD: u32 = 4_800;
/// SIM808 GNSS NMEA port
const GPS_BAUD: u32 = 9_600;

/// Time source backed by the embassy time driver started by `esp_rtos`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

pub struct TrackerHardware<'a> {
    pub modem_uart: Uart<'a, Blocking>,
    pub gps_uart: Uart<'a, Blocking>,
    pub reset: Output<'a>,
    pub led: Output<'a>,
    pub delay: Delay,
}

impl<'a> TrackerHardware<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new<MRX, MTX, GRX, RST, LED>(
        modem_periph: UART1<'a>,
        gps_periph: UART2<'a>,
        modem_rx: MRX,
        modem_tx: MTX,
        gps_rx: GRX,
        reset_gpio: RST,
        led_gpio: LED,
    ) -> Result<Self, &'static str>
    where
        MRX: Into<AnyPin<'a>>,
        MTX: Into<AnyPin<'a>>,
        GRX: Into<AnyPin<'a>>,
        RST: Into<AnyPin<'a>>,
        LED: Into<AnyPin<'a>>,
    {
        let modem_uart = Uart::new(
            modem_periph,
            UartConfig::default().with_baudrate(MODEM_BAUD),
        )
        .map_err(|_| "Failed to configure modem UART")?
        .with_rx(modem_rx.into())
        .with_tx(modem_tx.into());

        let gps_uart = Uart::new(gps_periph, UartConfig::default().with_baudrate(GPS_BAUD))
            .map_err(|_| "Failed to configure GPS UART")?
            .with_rx(gps_rx.into());

        // Modem held out of reset until the tracker pulses it
        let reset = Output::new(reset_gpio.into(), Level::High, OutputConfig::default());
        let led = Output::new(led_gpio.into(), Level::Low, OutputConfig::default());

        Ok(Self {
            modem_uart,
            gps_uart,
            reset,
            led,
            delay: Delay::new(),
        })
    }
}

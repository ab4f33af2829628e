#![no_std]
#![no_main]

use core::cell::RefCell;
use core::panic::PanicInfo;
use embassy_executor::Spawner;
use embassy_time::{Duration, Timer};
use esp_backtrace as _;
use esp_hal::{delay::Delay, timer::timg::TimerGroup};

use gprs_tracker::{
    at::AtLink,
    config::TrackerConfig,
    hardware::{SystemClock, TrackerHardware},
    logic::Tracker,
    mqtt::MqttSession,
    sim808::Sim808,
};

const HEART_BEAT_INTERVAL_MS: u64 = 5_000;
const POLL_INTERVAL_MS: u64 = 10;

// Wiring:
// GPIO18 <- SIM808 TXD, GPIO17 -> SIM808 RXD  (AT port, UART1)
// GPIO16 <- SIM808 GPS_TXD                    (NMEA, UART2)
// GPIO4  -> SIM808 RST
// GPIO13 -> LED

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    esp_println::println!("[PANIC] {:?}", info);
    let delay = Delay::new();
    loop {
        delay.delay_millis(1_000);
        esp_println::println!("[PANIC] continue...");
    }
}

esp_bootloader_esp_idf::esp_app_desc!();

#[embassy_executor::task]
async fn run_heartbeat() {
    loop {
        esp_println::println!("[HEARTBEAT] System is alive");
        Timer::after(Duration::from_millis(HEART_BEAT_INTERVAL_MS)).await;
    }
}

async fn park() -> ! {
    loop {
        Timer::after(Duration::from_secs(1)).await;
    }
}

#[esp_rtos::main]
async fn main(spawner: Spawner) {
    esp_println::logger::init_logger_from_env();
    let peripherals = esp_hal::init(esp_hal::Config::default());

    esp_println::println!("=== GPRS Tracker ===");

    // Initialize RTOS timer for embassy
    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    if let Err(e) = spawner.spawn(run_heartbeat()) {
        esp_println::println!("[ERROR] Failed to spawn task: {:?}", e);
    }

    let hw = match TrackerHardware::new(
        peripherals.UART1,
        peripherals.UART2,
        peripherals.GPIO18,
        peripherals.GPIO17,
        peripherals.GPIO16,
        peripherals.GPIO4,
        peripherals.GPIO13,
    ) {
        Ok(hw) => hw,
        Err(e) => {
            esp_println::println!("[ERROR] Hardware init failed: {}", e);
            park().await
        }
    };

    let config = TrackerConfig::DEFAULT;
    let link = RefCell::new(AtLink::new(hw.modem_uart, SystemClock));
    let modem = Sim808::new(&link, hw.gps_uart);
    let client = MqttSession::new(&link, config.keep_alive_secs);
    let mut tracker = Tracker::new(
        modem,
        client,
        hw.reset,
        hw.led,
        hw.delay,
        SystemClock,
        config,
    );

    if let Err(e) = tracker.initialize() {
        esp_println::println!("[ERROR] Startup failed: {}", e);
        park().await;
    }

    loop {
        tracker.poll();
        Timer::after(Duration::from_millis(POLL_INTERVAL_MS)).await;
    }
}

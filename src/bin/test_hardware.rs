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
    command::Attention,
    hardware::{SystemClock, TrackerHardware},
    logic::format_gps_payload,
    model::GpsFix,
    nmea::{Rmc, parse_rmc},
    sim808::Sim808,
    traits::NetworkModem,
};

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    esp_println::println!("[PANIC] {:?}", info);
    let delay = Delay::new();
    loop {
        delay.delay_millis(1_000);
    }
}

esp_bootloader_esp_idf::esp_app_desc!();

// Test result tracking
struct TestResults {
    passed: u32,
    failed: u32,
    total: u32,
}

impl TestResults {
    fn new() -> Self {
        Self {
            passed: 0,
            failed: 0,
            total: 0,
        }
    }

    fn assert(&mut self, condition: bool, test_name: &str) {
        self.total += 1;
        if condition {
            self.passed += 1;
            esp_println::println!("  ✓ {}", test_name);
        } else {
            self.failed += 1;
            esp_println::println!("  ✗ {} FAILED", test_name);
        }
    }

    fn assert_eq<T: PartialEq + core::fmt::Debug>(&mut self, left: T, right: T, test_name: &str) {
        self.total += 1;
        if left == right {
            self.passed += 1;
            esp_println::println!("  ✓ {}", test_name);
        } else {
            self.failed += 1;
            esp_println::println!("  ✗ {} FAILED: {:?} != {:?}", test_name, left, right);
        }
    }

    fn print_summary(&self) {
        esp_println::println!("\n==========================================");
        esp_println::println!("Test Summary:");
        esp_println::println!("  Total:  {}", self.total);
        esp_println::println!("  Passed: {}", self.passed);
        esp_println::println!("  Failed: {}", self.failed);
        if self.failed == 0 {
            esp_println::println!("\n✓ ALL TESTS PASSED!");
        } else {
            esp_println::println!("\n✗ SOME TESTS FAILED");
        }
        esp_println::println!("==========================================");
    }
}

fn test_payload_format(results: &mut TestResults) {
    esp_println::println!("\n[TEST] GPS payload on target float formatting");

    let fix = GpsFix {
        latitude: -6.2,
        longitude: 106.816666,
        speed: 12.0,
    };
    results.assert_eq(
        format_gps_payload(&fix).as_str(),
        "-6.200000,106.816666,12",
        "fix formats with six decimals",
    );

    let fix = GpsFix {
        latitude: 1.0,
        longitude: 2.0,
        speed: 3.99,
    };
    results.assert_eq(
        format_gps_payload(&fix).as_str(),
        "1.000000,2.000000,3",
        "speed truncated",
    );

    let parsed = parse_rmc("$GNRMC,023044.000,A,0612.0000,S,10649.0000,E,6.48,54.7,181026,,,A*63");
    results.assert(matches!(parsed, Some(Rmc::Fix(_))), "RMC sentence parses");
}

fn test_modem(results: &mut TestResults, hw: TrackerHardware<'static>) {
    esp_println::println!("\n[TEST] SIM808 modem");

    let link = RefCell::new(AtLink::new(hw.modem_uart, SystemClock));

    results.assert(
        link.borrow_mut().send(&Attention).is_ok(),
        "modem answers AT",
    );

    let mut modem = Sim808::new(&link, hw.gps_uart);
    match modem.modem_info() {
        Ok(info) => {
            esp_println::println!("    Modem: {}", info);
            results.assert(info.contains("SIM808"), "modem identifies as SIM808");
        }
        Err(e) => {
            esp_println::println!("    ATI failed: {}", e);
            results.assert(false, "modem info");
        }
    }

    results.assert(
        modem.wait_for_network(Duration::from_secs(30)),
        "registered on network",
    );
    results.assert(modem.enable_gps().is_ok(), "GNSS power on");

    esp_println::println!("  Waiting for NMEA output...");
    match modem.gps_fix() {
        Some(fix) => esp_println::println!(
            "    Fix: {:.6}, {:.6} @ {:.1} km/h",
            fix.latitude,
            fix.longitude,
            fix.speed
        ),
        None => esp_println::println!("    No fix yet (expected indoors)"),
    }
}

#[esp_rtos::main]
async fn main(_spawner: Spawner) {
    esp_println::logger::init_logger_from_env();
    let peripherals = esp_hal::init(esp_hal::Config::default());

    esp_println::println!("\n==========================================");
    esp_println::println!("=== Hardware Unit Test Runner ===");
    esp_println::println!("==========================================");

    let mut results = TestResults::new();

    // Run tests that don't need hardware
    test_payload_format(&mut results);

    // Initialize RTOS timer for embassy (this consumes TIMG0)
    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    match TrackerHardware::new(
        peripherals.UART1,
        peripherals.UART2,
        peripherals.GPIO18,
        peripherals.GPIO17,
        peripherals.GPIO16,
        peripherals.GPIO4,
        peripherals.GPIO13,
    ) {
        Ok(hw) => test_modem(&mut results, hw),
        Err(e) => {
            esp_println::println!("  Hardware init failed: {}", e);
            results.assert(false, "hardware init");
        }
    }

    results.print_summary();

    esp_println::println!("\nTest run complete. Looping...");
    loop {
        if results.failed == 0 {
            Timer::after(Duration::from_millis(200)).await;
        } else {
            Timer::after(Duration::from_millis(1000)).await;
        }
    }
}

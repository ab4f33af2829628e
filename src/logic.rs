//! Tracker control loop (hardware-independent)

use core::fmt::Write;

use embassy_time::{Duration, Instant};
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{OutputPin, StatefulOutputPin};

use crate::config::TrackerConfig;
use crate::error::TrackerError;
use crate::model::GpsFix;
use crate::traits::{Clock, MessageClient, NetworkModem};

const RESET_PULSE_MS: u32 = 200;
const MODEM_SETTLE_MS: u32 = 6_000;
const RESTART_SETTLE_MS: u32 = 1_000;

pub type GpsPayload = heapless::String<60>;

/// Format a fix as `lat,lon,speed`: six decimals for the coordinates,
/// speed truncated toward zero.
pub fn format_gps_payload(fix: &GpsFix) -> GpsPayload {
    let mut buffer = GpsPayload::new();
    let _ = write!(
        buffer,
        "{:.6},{:.6},{}",
        fix.latitude, fix.longitude, fix.speed as i32
    );
    buffer
}

fn elapsed_since(now: Instant, earlier: Instant) -> Duration {
    now.saturating_duration_since(earlier)
}

/// Owns every collaborator and the loop timing state.
pub struct Tracker<M, C, R, L, D, K> {
    modem: M,
    client: C,
    reset: R,
    led: L,
    delay: D,
    clock: K,
    config: TrackerConfig,
    last_reconnect: Option<Instant>,
    last_upload: Instant,
}

impl<M, C, R, L, D, K> Tracker<M, C, R, L, D, K>
where
    M: NetworkModem,
    C: MessageClient,
    R: OutputPin,
    L: StatefulOutputPin,
    D: DelayNs,
    K: Clock,
{
    pub fn new(modem: M, client: C, reset: R, led: L, delay: D, clock: K, config: TrackerConfig) -> Self {
        let last_upload = clock.now();
        Self {
            modem,
            client,
            reset,
            led,
            delay,
            clock,
            config,
            last_reconnect: None,
            last_upload,
        }
    }

    /// Power the modem, attach to the network and prepare the session.
    ///
    /// Returns `TrackerError::NetworkUnavailable` when the modem does not
    /// register within the configured timeout. Nothing is retried here; the
    /// caller decides whether to halt or reboot.
    pub fn initialize(&mut self) -> Result<(), TrackerError> {
        log::info!("[MODEM] Powering modem on");
        self.reset.set_low().map_err(|_| TrackerError::ResetPin)?;
        self.delay.delay_ms(RESET_PULSE_MS);
        self.reset.set_high().map_err(|_| TrackerError::ResetPin)?;
        self.delay.delay_ms(RESET_PULSE_MS);

        self.delay.delay_ms(MODEM_SETTLE_MS);
        if let Err(e) = self.modem.restart() {
            log::warn!("[MODEM] Restart failed: {}", e);
        }
        self.delay.delay_ms(RESTART_SETTLE_MS);

        match self.modem.modem_info() {
            Ok(info) => log::info!("[MODEM] Info: {}", info),
            Err(e) => log::warn!("[MODEM] Info unavailable: {}", e),
        }

        log::info!("[MODEM] Connecting to APN '{}'", self.config.apn);
        if let Err(e) = self.modem.gprs_connect(self.config.apn) {
            log::warn!("[MODEM] GPRS attach reported: {}", e);
        }

        if !self.modem.wait_for_network(self.config.network_timeout) {
            log::error!("[MODEM] Network not available");
            return Err(TrackerError::NetworkUnavailable);
        }
        if self.modem.is_gprs_connected() {
            log::info!("[MODEM] GPRS connected");
        } else {
            log::warn!("[MODEM] Registered but GPRS not attached");
        }

        self.client
            .set_server(self.config.broker_host, self.config.broker_port);

        log::info!("[GPS] Enabling receiver");
        if let Err(e) = self.modem.enable_gps() {
            log::warn!("[GPS] Enable failed: {}", e);
        }

        self.led.set_low().map_err(|_| TrackerError::LedPin)?;
        self.last_upload = self.clock.now();
        Ok(())
    }

    /// One iteration of the control loop
    pub fn poll(&mut self) {
        if !self.client.is_connected() {
            log::info!("[MQTT] Disconnected");
            let now = self.clock.now();
            let due = match self.last_reconnect {
                None => true,
                Some(last) => elapsed_since(now, last) > self.config.reconnect_interval,
            };
            if due {
                self.last_reconnect = Some(now);
                if self.connect() {
                    self.last_reconnect = None;
                }
            }
            self.delay
                .delay_ms(self.config.disconnected_backoff.as_millis() as u32);
        }

        let now = self.clock.now();
        if elapsed_since(now, self.last_upload) > self.config.publish_interval {
            self.last_upload = now;
            self.send_gps_location();
        }

        match self.client.poll() {
            Ok(Some(message)) => self.on_message(&message.topic, &message.payload),
            Ok(None) => {}
            Err(e) => log::warn!("[MQTT] Poll failed: {}", e),
        }
    }

    /// Open the MQTT session, announce ourselves and subscribe to commands.
    pub fn connect(&mut self) -> bool {
        log::info!("[MQTT] Connecting to {}", self.config.broker_host);

        if let Err(e) = self.client.connect(
            self.config.client_id,
            self.config.username,
            self.config.password,
        ) {
            log::warn!("[MQTT] Connect failed: {}", e);
            return false;
        }
        log::info!("[MQTT] Connected");

        if let Err(e) = self.client.publish(self.config.topic_init, b"START") {
            log::warn!("[MQTT] Init publish failed: {}", e);
        }
        if let Err(e) = self.client.subscribe(self.config.topic_led) {
            log::warn!("[MQTT] Subscribe to {} failed: {}", self.config.topic_led, e);
        }

        self.client.is_connected()
    }

    /// Handle a message received on a subscribed topic.
    pub fn on_message(&mut self, topic: &str, payload: &[u8]) {
        log::info!(
            "[MQTT] Message [{}]: {}",
            topic,
            core::str::from_utf8(payload).unwrap_or("<binary>")
        );

        if topic != self.config.topic_led {
            return;
        }

        let driven = if payload == b"1" {
            self.led.set_high()
        } else {
            self.led.set_low()
        };
        if driven.is_err() {
            log::error!("[LED] Failed to drive output");
            return;
        }

        let status: &[u8] = match self.led.is_set_high() {
            Ok(true) => b"1",
            Ok(false) => b"0",
            Err(_) => {
                log::error!("[LED] Failed to read output state");
                return;
            }
        };
        if let Err(e) = self.client.publish(self.config.topic_status, status) {
            log::warn!("[MQTT] Status publish failed: {}", e);
        }
    }

    fn send_gps_location(&mut self) {
        let Some(fix) = self.modem.gps_fix() else {
            log::info!("[GPS] Not ready");
            return;
        };

        if fix.speed.is_nan() || fix.speed <= self.config.min_speed_kmh {
            log::info!(
                "[GPS] LAT:{:.6}, LON:{:.6}, SPD:{:.2} no movement",
                fix.latitude,
                fix.longitude,
                fix.speed
            );
            return;
        }
        log::info!(
            "[GPS] LAT:{:.6}, LON:{:.6}, SPD:{:.2}",
            fix.latitude,
            fix.longitude,
            fix.speed
        );

        let payload = format_gps_payload(&fix);
        if let Err(e) = self
            .client
            .publish(self.config.topic_gps, payload.as_bytes())
        {
            log::warn!("[MQTT] GPS publish failed: {}", e);
        }
    }
}

//! Compiled-in tracker configuration

use embassy_time::Duration;

/// Every constant the tracker needs, fixed at build time.
///
/// A handful of deployment-specific strings can be overridden through
/// environment variables when the firmware is compiled.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub apn: &'static str,
    pub broker_host: &'static str,
    pub broker_port: u16,
    pub client_id: &'static str,
    pub username: &'static str,
    pub password: &'static str,

    /// Inbound LED command topic (subscribed)
    pub topic_led: &'static str,
    /// LED state mirror (published)
    pub topic_status: &'static str,
    /// Published once after every successful connect
    pub topic_init: &'static str,
    /// GPS fixes as `lat,lon,speed`
    pub topic_gps: &'static str,

    pub reconnect_interval: Duration,
    pub publish_interval: Duration,
    pub network_timeout: Duration,
    /// Back-off applied on every poll while the session is down
    pub disconnected_backoff: Duration,
    /// Fixes at or below this speed (km/h) are treated as stationary
    pub min_speed_kmh: f32,
    pub keep_alive_secs: u16,
}

const fn env_or(value: Option<&'static str>, default: &'static str) -> &'static str {
    match value {
        Some(v) => v,
        None => default,
    }
}

impl TrackerConfig {
    pub const DEFAULT: Self = Self {
        apn: env_or(option_env!("TRACKER_APN"), "internet"),
        broker_host: env_or(option_env!("TRACKER_MQTT_HOST"), "mqtt.putrasukarno.my.id"),
        broker_port: 1883,
        client_id: "ARDUINO",
        username: env_or(option_env!("TRACKER_MQTT_USER"), "mosquitto"),
        password: env_or(option_env!("TRACKER_MQTT_PASSWORD"), "mqttuser"),

        topic_led: "tracker/led",
        topic_status: "tracker/status",
        topic_init: "tracker/init",
        topic_gps: "tracker/gps",

        reconnect_interval: Duration::from_secs(10),
        publish_interval: Duration::from_secs(10),
        network_timeout: Duration::from_secs(10),
        disconnected_backoff: Duration::from_millis(100),
        min_speed_kmh: 3.0,
        keep_alive_secs: 15,
    };
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

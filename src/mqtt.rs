//! MQTT 3.1.1 session over the SIM808 transparent TCP socket
//!
//! Packet encoding and decoding is delegated to `mqttrs`. This module only
//! moves frames between the codec and the AT port and tracks keepalive.

use core::cell::RefCell;

use embassy_time::{Duration, Instant};
use embedded_io::{Read, ReadReady, Write};
use heapless::Vec;
use mqttrs::{
    Connect, ConnectReturnCode, Packet, Pid, Protocol, Publish, QoS, QosPid, Subscribe,
    SubscribeTopic,
};

use crate::at::AtLink;
use crate::command::StartConnection;
use crate::error::{ClientError, ModemError};
use crate::model::InboundMessage;
use crate::traits::{Clock, MessageClient};

const RX_CAPACITY: usize = 512;
const TX_CAPACITY: usize = 256;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);
const SOCKET_TIMEOUT: Duration = Duration::from_secs(20);
const CONNACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Total length of the first frame in `buf`, once its fixed header is complete.
fn frame_len(buf: &[u8]) -> Result<Option<usize>, ClientError> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };
    // Packet types 0 and 15 are reserved; seeing one means the stream is not
    // MQTT any more (the modem prints `CLOSED` when the socket drops)
    if matches!(first >> 4, 0 | 15) {
        return Err(ClientError::Codec);
    }

    let mut remaining = 0usize;
    for (i, byte) in buf.iter().skip(1).take(4).enumerate() {
        remaining |= ((byte & 0x7F) as usize) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some(1 + (i + 1) + remaining));
        }
    }
    if buf.len() >= 5 {
        return Err(ClientError::Codec);
    }
    Ok(None)
}

enum Event {
    ConnAck { accepted: bool },
    Message(Option<InboundMessage>),
    PingResp,
    Other,
}

pub struct MqttSession<'a, U, K> {
    link: &'a RefCell<AtLink<U, K>>,
    host: &'static str,
    port: u16,
    keep_alive_secs: u16,
    connected: bool,
    /// The modem is (or may be) in data mode
    socket_open: bool,
    rx: Vec<u8, RX_CAPACITY>,
    /// Bytes of an oversized frame still to be dropped
    discard: usize,
    tx: [u8; TX_CAPACITY],
    next_pid: Pid,
    last_sent: Instant,
    ping_sent: Option<Instant>,
}

impl<'a, U, K> MqttSession<'a, U, K>
where
    U: Read + ReadReady + Write,
    K: Clock,
{
    pub fn new(link: &'a RefCell<AtLink<U, K>>, keep_alive_secs: u16) -> Self {
        Self {
            link,
            host: "",
            port: 1883,
            keep_alive_secs,
            connected: false,
            socket_open: false,
            rx: Vec::new(),
            discard: 0,
            tx: [0; TX_CAPACITY],
            next_pid: Pid::new(),
            last_sent: Instant::from_ticks(0),
            ping_sent: None,
        }
    }

    fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs as u64)
    }

    fn send_packet(&mut self, link: &mut AtLink<U, K>, packet: &Packet) -> Result<(), ClientError> {
        let len = mqttrs::encode_slice(packet, &mut self.tx).map_err(|_| ClientError::Codec)?;
        link.write_raw(&self.tx[..len])?;
        self.last_sent = link.now();
        Ok(())
    }

    fn fill_rx(&mut self, link: &mut AtLink<U, K>) -> Result<(), ClientError> {
        let mut chunk = [0u8; 64];
        loop {
            let free = RX_CAPACITY - self.rx.len();
            if free == 0 {
                return Ok(());
            }
            let take = free.min(chunk.len());
            let n = link.read_raw(&mut chunk[..take])?;
            if n == 0 {
                return Ok(());
            }
            self.rx
                .extend_from_slice(&chunk[..n])
                .map_err(|_| ClientError::Overflow)?;
        }
    }

    fn consume(&mut self, n: usize) {
        let n = n.min(self.rx.len());
        let rest = self.rx.len() - n;
        self.rx.copy_within(n.., 0);
        self.rx.truncate(rest);
    }

    /// Decode and remove the first complete frame in the receive buffer.
    fn take_event(&mut self) -> Result<Option<Event>, ClientError> {
        if self.discard > 0 {
            let n = self.discard.min(self.rx.len());
            self.consume(n);
            self.discard -= n;
            if self.discard > 0 {
                return Ok(None);
            }
        }

        let Some(len) = frame_len(&self.rx)? else {
            return Ok(None);
        };
        if len > RX_CAPACITY {
            log::warn!("[MQTT] Dropping {} byte packet", len);
            self.discard = len;
            return Ok(Some(Event::Other));
        }
        if self.rx.len() < len {
            return Ok(None);
        }

        let event = match mqttrs::decode_slice(&self.rx[..len]) {
            Ok(Some(Packet::Connack(ack))) => Event::ConnAck {
                accepted: matches!(ack.code, ConnectReturnCode::Accepted),
            },
            Ok(Some(Packet::Publish(publish))) => {
                Event::Message(InboundMessage::new(publish.topic_name, publish.payload))
            }
            Ok(Some(Packet::Pingresp)) => Event::PingResp,
            Ok(Some(_)) => Event::Other,
            Ok(None) | Err(_) => return Err(ClientError::Codec),
        };

        self.consume(len);
        Ok(Some(event))
    }

    fn open_socket(&mut self, link: &mut AtLink<U, K>) -> Result<(), ModemError> {
        if self.socket_open {
            link.escape_data_mode()?;
            link.send_line("AT+CIPCLOSE")?;
            if let Err(e) = link.wait_for("CLOSE OK", COMMAND_TIMEOUT) {
                log::debug!("[MQTT] CIPCLOSE answered {}", e);
            }
            self.socket_open = false;
        }

        link.send(&StartConnection {
            protocol: "TCP",
            host: self.host,
            port: self.port,
        })?;
        link.wait_for("CONNECT", SOCKET_TIMEOUT)?;
        self.socket_open = true;
        Ok(())
    }

    fn handshake(
        &mut self,
        link: &mut AtLink<U, K>,
        client_id: &str,
        username: &str,
        password: &str,
    ) -> Result<(), ClientError> {
        self.rx.clear();
        self.discard = 0;
        self.open_socket(link)?;

        let connect = Packet::Connect(Connect {
            protocol: Protocol::MQTT311,
            keep_alive: self.keep_alive_secs,
            client_id,
            clean_session: true,
            last_will: None,
            username: Some(username),
            password: Some(password.as_bytes()),
        });
        self.send_packet(link, &connect)?;

        let deadline = link.now() + CONNACK_TIMEOUT;
        loop {
            self.fill_rx(link)?;
            match self.take_event()? {
                Some(Event::ConnAck { accepted: true }) => return Ok(()),
                Some(Event::ConnAck { accepted: false }) => return Err(ClientError::Refused),
                Some(_) => {}
                None if link.now() >= deadline => {
                    return Err(ClientError::Transport(ModemError::Timeout));
                }
                None => {}
            }
        }
    }

    fn service(&mut self, link: &mut AtLink<U, K>) -> Result<Option<InboundMessage>, ClientError> {
        self.fill_rx(link)?;
        while let Some(event) = self.take_event()? {
            match event {
                Event::Message(Some(message)) => return Ok(Some(message)),
                Event::Message(None) => log::warn!("[MQTT] Dropped oversized message"),
                Event::PingResp => self.ping_sent = None,
                Event::ConnAck { .. } | Event::Other => {}
            }
        }

        let now = link.now();
        if let Some(sent) = self.ping_sent {
            if now.saturating_duration_since(sent) >= self.keep_alive() {
                log::warn!("[MQTT] Broker stopped answering pings");
                return Err(ClientError::Transport(ModemError::Timeout));
            }
        } else if now.saturating_duration_since(self.last_sent) >= self.keep_alive() {
            self.send_packet(link, &Packet::Pingreq)?;
            self.ping_sent = Some(now);
        }
        Ok(None)
    }

    fn lose_connection(&mut self, err: ClientError) -> ClientError {
        if self.connected {
            log::warn!("[MQTT] Connection lost: {}", err);
        }
        self.connected = false;
        err
    }
}

impl<U, K> MessageClient for MqttSession<'_, U, K>
where
    U: Read + ReadReady + Write,
    K: Clock,
{
    fn set_server(&mut self, host: &'static str, port: u16) {
        self.host = host;
        self.port = port;
    }

    fn connect(&mut self, client_id: &str, username: &str, password: &str) -> Result<(), ClientError> {
        let cell = self.link;
        let mut link = cell.borrow_mut();

        self.connected = false;
        self.ping_sent = None;
        self.handshake(&mut link, client_id, username, password)?;
        self.connected = true;
        Ok(())
    }

    fn is_connected(&mut self) -> bool {
        self.connected
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), ClientError> {
        if !self.connected {
            return Err(ClientError::NotConnected);
        }
        let cell = self.link;
        let mut link = cell.borrow_mut();

        let packet = Packet::Publish(Publish {
            dup: false,
            qospid: QosPid::AtMostOnce,
            retain: false,
            topic_name: topic,
            payload,
        });
        self.send_packet(&mut link, &packet)
            .map_err(|e| self.lose_connection(e))
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), ClientError> {
        if !self.connected {
            return Err(ClientError::NotConnected);
        }
        let cell = self.link;
        let mut link = cell.borrow_mut();

        let mut subscribe = Subscribe {
            pid: self.next_pid,
            topics: Default::default(),
        };
        subscribe
            .topics
            .push(SubscribeTopic {
                topic_path: topic.parse().map_err(|_| ClientError::Overflow)?,
                qos: QoS::AtMostOnce,
            })
            .map_err(|_| ClientError::Overflow)?;
        self.next_pid = self.next_pid + 1;

        self.send_packet(&mut link, &Packet::Subscribe(subscribe))
            .map_err(|e| self.lose_connection(e))
    }

    fn poll(&mut self) -> Result<Option<InboundMessage>, ClientError> {
        if !self.connected {
            return Ok(None);
        }
        let cell = self.link;
        let mut link = cell.borrow_mut();

        self.service(&mut link).map_err(|e| self.lose_connection(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeSerial, TickingClock};

    const SOCKET_UP: &[u8] = b"\r\nOK\r\n\r\nCONNECT\r\n";
    const CONNACK_ACCEPTED: [u8; 4] = [0x20, 0x02, 0x00, 0x00];

    type TestLink = RefCell<AtLink<FakeSerial, TickingClock>>;

    fn link(input: &[u8], clock: &TickingClock) -> TestLink {
        RefCell::new(AtLink::new(FakeSerial::with_input(input), clock.clone()))
    }

    fn session(link: &TestLink) -> MqttSession<'_, FakeSerial, TickingClock> {
        let mut session = MqttSession::new(link, 15);
        session.set_server("broker.test", 1883);
        session
    }

    fn connected(link: &TestLink) -> MqttSession<'_, FakeSerial, TickingClock> {
        link.borrow_mut().serial_mut().feed(SOCKET_UP);
        link.borrow_mut().serial_mut().feed(&CONNACK_ACCEPTED);
        let mut session = session(link);
        session.connect("ARDUINO", "mosquitto", "mqttuser").unwrap();
        link.borrow_mut().serial_mut().tx.clear();
        session
    }

    fn publish_frame(topic: &str, payload: &[u8]) -> std::vec::Vec<u8> {
        let mut frame = std::vec![0x30, (2 + topic.len() + payload.len()) as u8, 0x00];
        frame.push(topic.len() as u8);
        frame.extend_from_slice(topic.as_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn test_frame_len() {
        assert_eq!(frame_len(&[]), Ok(None));
        assert_eq!(frame_len(&[0x20]), Ok(None));
        assert_eq!(frame_len(&[0x20, 0x02, 0x00]), Ok(Some(4)));
        assert_eq!(frame_len(&[0x30, 0xD8]), Ok(None));
        assert_eq!(frame_len(&[0x30, 0xD8, 0x04]), Ok(Some(603)));
        assert_eq!(frame_len(b"\r\nCLOSED\r\n"), Err(ClientError::Codec));
        assert_eq!(frame_len(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF]), Err(ClientError::Codec));
    }

    #[test]
    fn test_connect_opens_socket_and_handshakes() {
        let clock = TickingClock::new(1);
        let link = link(SOCKET_UP, &clock);
        link.borrow_mut().serial_mut().feed(&CONNACK_ACCEPTED);
        let mut session = session(&link);

        assert_eq!(session.connect("ARDUINO", "mosquitto", "mqttuser"), Ok(()));
        assert!(session.is_connected());

        let mut at = link.borrow_mut();
        let tx = &at.serial_mut().tx;
        assert!(tx.starts_with(b"AT+CIPSTART=\"TCP\",\"broker.test\",1883"));
        let protocol = tx.windows(4).position(|w| w == b"MQTT").unwrap();
        let connect = &tx[protocol - 4..];
        assert_eq!(connect[0], 0x10);
        assert!(connect.windows(7).any(|w| w == b"ARDUINO"));
        assert!(connect.windows(9).any(|w| w == b"mosquitto"));
    }

    #[test]
    fn test_connect_refused() {
        let clock = TickingClock::new(1);
        let link = link(SOCKET_UP, &clock);
        link.borrow_mut().serial_mut().feed(&[0x20, 0x02, 0x00, 0x05]);
        let mut session = session(&link);

        assert_eq!(
            session.connect("ARDUINO", "mosquitto", "wrong"),
            Err(ClientError::Refused)
        );
        assert!(!session.is_connected());
    }

    #[test]
    fn test_connect_fails_when_socket_does_not_open() {
        let clock = TickingClock::new(1);
        let link = link(b"\r\nOK\r\n\r\nCONNECT FAIL\r\n", &clock);
        let mut session = session(&link);

        assert_eq!(
            session.connect("ARDUINO", "mosquitto", "mqttuser"),
            Err(ClientError::Transport(ModemError::Rejected))
        );
        assert!(!session.is_connected());
    }

    #[test]
    fn test_publish_requires_connection() {
        let clock = TickingClock::new(1);
        let link = link(b"", &clock);
        let mut session = session(&link);

        assert_eq!(
            session.publish("tracker/gps", b"1,2,3"),
            Err(ClientError::NotConnected)
        );
        assert!(link.borrow_mut().serial_mut().tx.is_empty());
    }

    #[test]
    fn test_publish_writes_qos0_frame() {
        let clock = TickingClock::new(1);
        let link = link(b"", &clock);
        let mut session = connected(&link);

        session.publish("tracker/status", b"1").unwrap();

        assert_eq!(
            link.borrow_mut().serial_mut().tx,
            publish_frame("tracker/status", b"1")
        );
    }

    #[test]
    fn test_subscribe_writes_subscribe_frame() {
        let clock = TickingClock::new(1);
        let link = link(b"", &clock);
        let mut session = connected(&link);

        session.subscribe("tracker/led").unwrap();

        let mut expected = std::vec![0x82, 16, 0x00, 0x01, 0x00, 11];
        expected.extend_from_slice(b"tracker/led");
        expected.push(0x00);
        assert_eq!(link.borrow_mut().serial_mut().tx, expected);
    }

    #[test]
    fn test_poll_returns_inbound_messages_one_at_a_time() {
        let clock = TickingClock::new(1);
        let link = link(b"", &clock);
        let mut session = connected(&link);

        {
            let mut at = link.borrow_mut();
            at.serial_mut().feed(&publish_frame("tracker/led", b"1"));
            at.serial_mut().feed(&publish_frame("tracker/led", b"0"));
        }

        let first = session.poll().unwrap().unwrap();
        assert_eq!(first.topic.as_str(), "tracker/led");
        assert_eq!(&first.payload[..], b"1");

        let second = session.poll().unwrap().unwrap();
        assert_eq!(&second.payload[..], b"0");

        assert_eq!(session.poll(), Ok(None));
    }

    #[test]
    fn test_oversized_packet_is_skipped_without_dropping_session() {
        let clock = TickingClock::new(1);
        let link = link(b"", &clock);
        let mut session = connected(&link);

        // PUBLISH with a 600 byte remaining length, larger than the receive buffer
        let mut oversized = std::vec![0x30, 0xD8, 0x04, 0x00, 0x03];
        oversized.extend_from_slice(b"a/b");
        oversized.resize(3 + 600, b'x');
        {
            let mut at = link.borrow_mut();
            at.serial_mut().feed(&oversized);
            at.serial_mut().feed(&publish_frame("tracker/led", b"1"));
        }

        let mut received = None;
        for _ in 0..4 {
            if let Some(message) = session.poll().unwrap() {
                received = Some(message);
                break;
            }
        }

        let message = received.unwrap();
        assert_eq!(message.topic.as_str(), "tracker/led");
        assert_eq!(&message.payload[..], b"1");
        assert!(session.is_connected());
    }

    #[test]
    fn test_poll_detects_closed_socket() {
        let clock = TickingClock::new(1);
        let link = link(b"", &clock);
        let mut session = connected(&link);

        link.borrow_mut().serial_mut().feed(b"\r\nCLOSED\r\n");

        assert_eq!(session.poll(), Err(ClientError::Codec));
        assert!(!session.is_connected());
        assert_eq!(session.poll(), Ok(None));
    }

    #[test]
    fn test_keepalive_ping_and_timeout() {
        let clock = TickingClock::new(1);
        let link = link(b"", &clock);
        let mut session = connected(&link);

        clock.advance_ms(15_000);
        assert_eq!(session.poll(), Ok(None));
        assert_eq!(link.borrow_mut().serial_mut().tx, [0xC0, 0x00]);

        // Answered ping keeps the session alive
        link.borrow_mut().serial_mut().feed(&[0xD0, 0x00]);
        assert_eq!(session.poll(), Ok(None));
        assert!(session.is_connected());

        // Unanswered ping drops it
        clock.advance_ms(15_000);
        assert_eq!(session.poll(), Ok(None));
        clock.advance_ms(15_000);
        assert!(session.poll().is_err());
        assert!(!session.is_connected());
    }
}

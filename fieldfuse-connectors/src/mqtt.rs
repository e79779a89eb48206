//! MQTT push source
//!
//! ## Overview
//!
//! A remote camera node publishes two kinds of message to the broker,
//! distinguished by a 3-byte tag:
//!
//! ```text
//! IMG | timestamp[14] | source id[2] | aec[5] | agc[3] | base64 JPEG ...
//! SNR | name:int,name:int,...
//! ```
//!
//! - An all-`0` IMG timestamp means the node's clock is unset; the receipt
//!   time is used instead
//! - IMG bodies are decoded and written to `<image_dir>/<id>_<timestamp>.jpg`
//!   before the snapshot is touched, so a published filename always exists
//! - SNR readings are stamped with the receipt time
//!
//! Anything else is a [`ProtocolError`]: logged, counted and dropped.
//!
//! ## Connection Handling
//!
//! [`PushSource::run`](fieldfuse_core::SensorSource::run) drives a
//! `rumqttc` event loop on its own current-thread runtime. The topic filter
//! is (re)subscribed on every ConnAck; connection errors back off
//! exponentially and the event loop reconnects on the next poll.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use fieldfuse_connectors::mqtt::{MqttConfig, PushSource};
//! use fieldfuse_core::{ManualClock, Timestamp};
//!
//! let clock = Arc::new(ManualClock::new(Timestamp::parse("20250601120000").unwrap()));
//! let source = PushSource::new(MqttConfig::new("localhost"), "/tmp", clock);
//!
//! source.update(b"SNR amb:812, r:301").unwrap();
//! assert_eq!(source.stats().messages_received, 1);
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use thiserror::Error;

use fieldfuse_core::errors::{ChannelError, ProtocolError, SetupError, SourceError};
use fieldfuse_core::snapshot::{MergeReport, SensorSnapshot, SnapshotBuffer, StalenessPolicy};
use fieldfuse_core::time::{Clock, Timestamp, TIMESTAMP_WIDTH};
use fieldfuse_core::{Reading, SensorSource, StopSignal, UnifiedRecord};

use crate::{Backoff, ConnectionStats};

/// Fields the push source starts out owning
pub const PUSH_FIELDS: [&str; 7] = ["image", "aec_level", "agc_gain", "amb", "r", "g", "b"];

const TAG_WIDTH: usize = 3;
const ID_WIDTH: usize = 2;
const AEC_WIDTH: usize = 5;
const AGC_WIDTH: usize = 3;
const IMG_HEADER_WIDTH: usize = TIMESTAMP_WIDTH + ID_WIDTH + AEC_WIDTH + AGC_WIDTH;

/// Push-source failures
#[derive(Debug, Error)]
pub enum PushError {
    /// Message could not be decoded
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Decoded image could not be written
    #[error("Failed to store image: {0}")]
    Io(#[from] io::Error),
}

/// TLS material for the broker connection
#[derive(Debug, Clone, PartialEq)]
pub struct TlsFiles {
    pub ca: PathBuf,
    /// Client certificate and key, for mutual TLS
    pub client: Option<(PathBuf, PathBuf)>,
}

/// MQTT configuration
#[derive(Debug, Clone, PartialEq)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub topic: String,
    pub credentials: Option<(String, String)>,
    pub tls: Option<TlsFiles>,
    pub keep_alive: Duration,
    /// Largest accepted packet; image messages are big
    pub max_packet_size: usize,
}

impl MqttConfig {
    /// Create new configuration for `host` on the default port
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 1883,
            client_id: format!("fieldfuse-{}", std::process::id()),
            topic: "sensor/#".into(),
            credentials: None,
            tls: None,
            keep_alive: Duration::from_secs(60),
            max_packet_size: 8 * 1024 * 1024,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = id.into();
        self
    }

    /// Topic filter to subscribe to
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// Set username/password authentication
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    pub fn tls(mut self, tls: TlsFiles) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    fn options(&self) -> Result<MqttOptions, SetupError> {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_max_packet_size(self.max_packet_size, 64 * 1024);

        if let Some((user, pass)) = &self.credentials {
            options.set_credentials(user, pass);
        }

        if let Some(tls) = &self.tls {
            let read = |path: &Path| {
                fs::read(path).map_err(|e| SetupError::Config(format!("cannot read {}: {e}", path.display())))
            };
            let client_auth = match &tls.client {
                Some((cert, key)) => Some((read(cert)?, read(key)?)),
                None => None,
            };
            options.set_transport(Transport::Tls(TlsConfiguration::Simple {
                ca: read(&tls.ca)?,
                alpn: None,
                client_auth,
            }));
        }

        Ok(options)
    }
}

/// Decoded IMG message
#[derive(Debug, Clone, PartialEq)]
pub struct ImageMessage {
    /// Node timestamp, `None` when unset on the node
    pub timestamp: Option<Timestamp>,
    pub source_id: String,
    pub aec_level: i64,
    pub agc_gain: i64,
    pub jpeg: Vec<u8>,
}

/// Decoded message body
#[derive(Debug, Clone, PartialEq)]
pub enum PushMessage {
    Image(ImageMessage),
    Readings(Vec<(String, i64)>),
}

/// Split a raw payload into its tag and decoded body
pub fn decode_message(payload: &[u8]) -> Result<PushMessage, ProtocolError> {
    if payload.len() < TAG_WIDTH {
        return Err(ProtocolError::Truncated { needed: TAG_WIDTH, got: payload.len() });
    }
    let (tag, body) = payload.split_at(TAG_WIDTH);
    match tag {
        b"IMG" => decode_image(body).map(PushMessage::Image),
        b"SNR" => decode_readings(body).map(PushMessage::Readings),
        other => Err(ProtocolError::UnknownTag(String::from_utf8_lossy(other).into_owned())),
    }
}

fn decode_image(body: &[u8]) -> Result<ImageMessage, ProtocolError> {
    if body.len() < IMG_HEADER_WIDTH {
        return Err(ProtocolError::Truncated { needed: IMG_HEADER_WIDTH, got: body.len() });
    }
    let (header, encoded) = body.split_at(IMG_HEADER_WIDTH);
    let (stamp, rest) = header.split_at(TIMESTAMP_WIDTH);
    let (source_id, rest) = rest.split_at(ID_WIDTH);
    let (aec, agc) = rest.split_at(AEC_WIDTH);

    let timestamp = if stamp.iter().all(|&b| b == b'0') {
        None
    } else {
        let stamp = header_field("timestamp", stamp, u8::is_ascii_digit)?;
        Some(Timestamp::parse(stamp).map_err(|e| ProtocolError::Malformed(e.to_string()))?)
    };
    let source_id = header_field("source id", source_id, u8::is_ascii_alphanumeric)?;

    let number = |name: &'static str, raw: &[u8]| {
        let text = header_field(name, raw, |b| b.is_ascii_digit() || *b == b' ' || *b == b'-')?;
        text.trim()
            .parse::<i64>()
            .map_err(|_| ProtocolError::Malformed(format!("{name} {text:?} is not an integer")))
    };

    let encoded: Vec<u8> = encoded.iter().copied().filter(|b| !b.is_ascii_whitespace()).collect();
    let jpeg = base64::engine::general_purpose::STANDARD
        .decode(&encoded)
        .map_err(|e| ProtocolError::Malformed(format!("image body: {e}")))?;

    Ok(ImageMessage {
        timestamp,
        source_id: source_id.to_string(),
        aec_level: number("aec", aec)?,
        agc_gain: number("agc", agc)?,
        jpeg,
    })
}

/// Fixed-width header field whose every byte passes `accept`
fn header_field<'a>(name: &str, raw: &'a [u8], accept: impl Fn(&u8) -> bool) -> Result<&'a str, ProtocolError> {
    if !raw.iter().all(accept) {
        return Err(ProtocolError::Malformed(format!(
            "image header {name} {:?} has unexpected characters",
            String::from_utf8_lossy(raw)
        )));
    }
    std::str::from_utf8(raw).map_err(|_| ProtocolError::Malformed(format!("image header {name} is not ASCII")))
}

fn decode_readings(body: &[u8]) -> Result<Vec<(String, i64)>, ProtocolError> {
    let text = std::str::from_utf8(body).map_err(|_| ProtocolError::Malformed("readings are not UTF-8".into()))?;

    let readings = text
        .split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (name, value) = pair
                .split_once(':')
                .ok_or_else(|| ProtocolError::Malformed(format!("reading {pair:?} has no ':'")))?;
            let value = value
                .trim()
                .parse::<i64>()
                .map_err(|_| ProtocolError::Malformed(format!("reading {pair:?} is not an integer")))?;
            Ok((name.trim().to_string(), value))
        })
        .collect::<Result<Vec<_>, ProtocolError>>()?;

    if readings.is_empty() {
        return Err(ProtocolError::Malformed("no readings".into()));
    }
    Ok(readings)
}

/// Sensor source fed by an MQTT broker
pub struct PushSource {
    config: MqttConfig,
    image_dir: PathBuf,
    clock: Arc<dyn Clock>,
    buffer: SnapshotBuffer,
    stats: Mutex<ConnectionStats>,
}

impl PushSource {
    pub fn new(config: MqttConfig, image_dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            image_dir: image_dir.into(),
            clock,
            buffer: SnapshotBuffer::new("push", PUSH_FIELDS),
            stats: Mutex::new(ConnectionStats::default()),
        }
    }

    /// Decode one delivered payload and publish it
    pub fn update(&self, payload: &[u8]) -> Result<(), PushError> {
        let result = self.apply(payload);

        let mut stats = self.stats_lock();
        stats.bytes_received += payload.len() as u64;
        match &result {
            Ok(()) => stats.messages_received += 1,
            Err(e) => {
                stats.protocol_errors += 1;
                stats.last_error = Some(e.to_string());
            }
        }
        result
    }

    /// Copy of the current snapshot
    pub fn snapshot(&self) -> SensorSnapshot {
        self.buffer.snapshot()
    }

    /// Get connection statistics
    pub fn stats(&self) -> ConnectionStats {
        self.stats_lock().clone()
    }

    fn apply(&self, payload: &[u8]) -> Result<(), PushError> {
        match decode_message(payload)? {
            PushMessage::Image(image) => {
                let timestamp = image.timestamp.unwrap_or_else(|| self.clock.now());
                let filename = format!("{}_{}.jpg", image.source_id, timestamp);
                let path = self.image_dir.join(&filename);
                if path.parent() != Some(self.image_dir.as_path()) {
                    let reason = format!("image name {filename:?} leaves the image directory");
                    return Err(ProtocolError::Malformed(reason).into());
                }
                fs::write(&path, &image.jpeg)?;

                debug!(
                    "Image from camera {}: {} | aec: {} | agc: {}",
                    image.source_id, timestamp, image.aec_level, image.agc_gain
                );
                self.buffer.publish(
                    timestamp,
                    [
                        ("image", Some(Reading::Text(filename))),
                        ("aec_level", Some(Reading::Int(image.aec_level))),
                        ("agc_gain", Some(Reading::Int(image.agc_gain))),
                    ],
                );
            }
            PushMessage::Readings(readings) => {
                debug!("Sensor readings: {:?}", readings);
                self.buffer.publish(
                    self.clock.now(),
                    readings.into_iter().map(|(name, value)| (name, Some(Reading::Int(value)))),
                );
            }
        }
        Ok(())
    }

    async fn listen(&self, stop: &StopSignal) -> Result<(), SourceError> {
        let (client, mut eventloop) = AsyncClient::new(self.config.options()?, 16);
        let mut backoff = Backoff::default();
        let mut connected_once = false;

        info!("Connecting to MQTT broker {}:{}", self.config.host, self.config.port);
        loop {
            let event = tokio::select! {
                _ = stop.cancelled() => break,
                event = eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to broker, subscribing to {}", self.config.topic);
                    if connected_once {
                        self.stats_lock().reconnections += 1;
                    }
                    connected_once = true;
                    backoff.reset();
                    if let Err(e) = client.subscribe(&self.config.topic, QoS::AtMostOnce).await {
                        warn!("Subscribe to {} failed: {}", self.config.topic, e);
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if let Err(e) = self.update(&publish.payload) {
                        error!("Dropped message on {}: {}", publish.topic, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    let err = ChannelError::Connect(e.to_string());
                    let delay = backoff.next_delay();
                    warn!("MQTT connection error: {}; retrying in {:?}", err, delay);
                    self.stats_lock().last_error = Some(err.to_string());
                    if stop.sleep(delay).await {
                        break;
                    }
                }
            }
        }

        if let Err(e) = client.try_disconnect() {
            debug!("Disconnect after shutdown failed: {}", e);
        }
        info!("MQTT push source stopped");
        Ok(())
    }

    fn stats_lock(&self) -> std::sync::MutexGuard<'_, ConnectionStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SensorSource for PushSource {
    fn name(&self) -> &str {
        self.buffer.source()
    }

    fn merge(&self, target: &mut UnifiedRecord, policy: StalenessPolicy) -> MergeReport {
        self.buffer.merge_into(target, policy)
    }

    fn needs_thread(&self) -> bool {
        true
    }

    fn run(&self, stop: &StopSignal) -> Result<(), SourceError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(ChannelError::Io)?;
        runtime.block_on(self.listen(stop))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldfuse_core::ManualClock;

    fn ts(text: &str) -> Timestamp {
        Timestamp::parse(text).unwrap()
    }

    fn image_payload(stamp: &str, jpeg: &[u8]) -> Vec<u8> {
        let mut payload = format!("IMG{stamp}01  120 16").into_bytes();
        payload.extend(base64::engine::general_purpose::STANDARD.encode(jpeg).into_bytes());
        payload
    }

    fn source(dir: &Path) -> PushSource {
        let clock = Arc::new(ManualClock::new(ts("20250601120000")));
        PushSource::new(MqttConfig::new("localhost"), dir, clock)
    }

    #[test]
    fn image_message_writes_file_then_publishes() {
        let dir = tempfile::tempdir().unwrap();
        let source = source(dir.path());

        source.update(&image_payload("20250601115500", b"\xff\xd8jpeg")).unwrap();

        let snap = source.snapshot();
        assert_eq!(snap.timestamp, ts("20250601115500"));
        assert_eq!(snap.get("image"), Some(&Reading::Text("01_20250601115500.jpg".into())));
        assert_eq!(snap.get("aec_level"), Some(&Reading::Int(120)));
        assert_eq!(snap.get("agc_gain"), Some(&Reading::Int(16)));
        assert_eq!(fs::read(dir.path().join("01_20250601115500.jpg")).unwrap(), b"\xff\xd8jpeg");
    }

    #[test]
    fn unset_node_clock_uses_receipt_time() {
        let dir = tempfile::tempdir().unwrap();
        let source = source(dir.path());

        source.update(&image_payload("00000000000000", b"x")).unwrap();

        assert_eq!(source.snapshot().timestamp, ts("20250601120000"));
        assert!(dir.path().join("01_20250601120000.jpg").exists());
    }

    #[test]
    fn readings_are_integers_stamped_on_receipt() {
        let dir = tempfile::tempdir().unwrap();
        let source = source(dir.path());

        source.update(b"SNRamb:812, r:301,g:288 ,b:190").unwrap();

        let snap = source.snapshot();
        assert_eq!(snap.timestamp, ts("20250601120000"));
        assert_eq!(snap.get("amb"), Some(&Reading::Int(812)));
        assert_eq!(snap.get("b"), Some(&Reading::Int(190)));
        assert_eq!(snap.get("image"), None);
    }

    #[test]
    fn bad_messages_are_dropped_and_counted() {
        let dir = tempfile::tempdir().unwrap();
        let source = source(dir.path());

        assert!(matches!(
            source.update(b"TXT hello"),
            Err(PushError::Protocol(ProtocolError::UnknownTag(_)))
        ));
        assert!(matches!(
            source.update(b"IMG2025"),
            Err(PushError::Protocol(ProtocolError::Truncated { .. }))
        ));
        assert!(matches!(
            source.update(b"SNRamb:12,r:abc"),
            Err(PushError::Protocol(ProtocolError::Malformed(_)))
        ));
        assert!(matches!(source.update(b"SN"), Err(PushError::Protocol(ProtocolError::Truncated { .. }))));

        let stats = source.stats();
        assert_eq!(stats.protocol_errors, 4);
        assert_eq!(stats.messages_received, 0);
        assert_eq!(source.snapshot().get("amb"), None);
    }

    #[test]
    fn non_ascii_header_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let source = source(dir.path());

        let mut payload = "IMG0000000000000\u{e9}01  120 1".as_bytes().to_vec();
        payload.extend(b"eA==");
        assert!(matches!(source.update(&payload), Err(PushError::Protocol(ProtocolError::Malformed(_)))));

        let mut payload = b"IMG2025060111550001 \xff120 16".to_vec();
        payload.extend(b"eA==");
        assert!(matches!(source.update(&payload), Err(PushError::Protocol(ProtocolError::Malformed(_)))));
        assert_eq!(source.stats().protocol_errors, 2);
    }

    #[test]
    fn source_id_cannot_leave_image_dir() {
        let root = tempfile::tempdir().unwrap();
        let images = root.path().join("images");
        fs::create_dir(&images).unwrap();
        let source = source(&images);

        for id in ["/.", "..", "./", "a/"] {
            let mut payload = format!("IMG20250601115500{id}  120 16").into_bytes();
            payload.extend(b"eA==");
            assert!(
                matches!(source.update(&payload), Err(PushError::Protocol(ProtocolError::Malformed(_)))),
                "id {id:?} accepted"
            );
        }

        assert_eq!(fs::read_dir(&images).unwrap().count(), 0);
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 1);
        assert_eq!(source.snapshot().get("image"), None);
    }

    #[test]
    fn missing_image_dir_is_io_error() {
        let source = source(Path::new("/nonexistent/fieldfuse/images"));
        assert!(matches!(source.update(&image_payload("20250601115500", b"x")), Err(PushError::Io(_))));
        assert_eq!(source.snapshot().get("image"), None);
    }

    #[test]
    fn builder_sets_fields() {
        let config = MqttConfig::new("broker").port(8883).credentials("u", "p").topic("cam/#");
        assert_eq!(config.port, 8883);
        assert_eq!(config.credentials, Some(("u".into(), "p".into())));
        assert_eq!(config.topic, "cam/#");
        assert!(config.options().is_ok());
    }
}

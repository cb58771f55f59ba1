//! # Frame Transports
//!
//! A transport moves complete RTU frames: it writes one request frame and
//! returns one response frame, leaving validation to the frame codec.
//!
//! ## Implementations
//!
//! ### `RtuStreamTransport<S>`
//! - Any `AsyncRead + AsyncWrite` byte stream; [`SerialTransport`] is the
//!   serial-port flavour built on `tokio-serial`
//! - Waits 3.5 character times before each request
//! - Frames responses by function code and byte count, falling back to the
//!   inter-frame silence for unknown function codes
//!
//! ### `WebSocketBridgeTransport<S>`
//! - For devices exposed by a serial-to-WebSocket bridge
//! - Requests go out as binary messages; replies may be binary or hex text
//!
//! ## Usage
//!
//! ```rust,no_run
//! use thermo_modbus::config::SerialConfig;
//! use thermo_modbus::protocol::build_read_holding_registers_frame;
//! use thermo_modbus::transport::{FrameTransport, SerialTransport};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut transport = SerialTransport::open(&SerialConfig::default())?;
//!     let request = build_read_holding_registers_frame(1, 0, 8)?;
//!     let response = transport.transact(&request, Duration::from_secs(1)).await?;
//!     println!("{} bytes", response.len());
//!     transport.close().await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, warn};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::{AcquisitionConfig, SerialConfig};
use crate::error::{ThermoError, ThermoResult};
use crate::logging::log_packet;
use crate::protocol::{expected_response_len, ModbusFunction};

/// Transport abstraction used by the register client
///
/// Implementations own their connection; the scheduler holds the transport
/// exclusively for the lifetime of an acquisition run, so only `Send` is
/// required.
#[async_trait]
pub trait FrameTransport: Send {
    /// Write `request` and wait up to `timeout` for the complete response
    ///
    /// Errors:
    /// - `Timeout` when no complete frame arrived in time
    /// - `Connection` when the transport is closed or the peer went away
    /// - `Io` / `Frame` for stream failures and oversized frames
    async fn transact(&mut self, request: &[u8], timeout: Duration) -> ThermoResult<Vec<u8>>;

    /// Local view of the connection; does not probe the device
    fn is_connected(&self) -> bool;

    /// Release the underlying port or socket
    async fn close(&mut self) -> ThermoResult<()>;

    fn get_stats(&self) -> TransportStats;
}

#[async_trait]
impl<T: FrameTransport + ?Sized> FrameTransport for Box<T> {
    async fn transact(&mut self, request: &[u8], timeout: Duration) -> ThermoResult<Vec<u8>> {
        (**self).transact(request, timeout).await
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    async fn close(&mut self) -> ThermoResult<()> {
        (**self).close().await
    }

    fn get_stats(&self) -> TransportStats {
        (**self).get_stats()
    }
}

/// Transport layer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl TransportStats {
    fn record_failure(&mut self, error: &ThermoError) {
        self.errors += 1;
        if matches!(error, ThermoError::Timeout { .. }) {
            self.timeouts += 1;
        }
    }
}

/// 3.5 character times at `baud_rate`, 11 bits per character
pub fn frame_gap(baud_rate: u32) -> Duration {
    let char_time_us = 11_000_000 / baud_rate.max(1) as u64;
    Duration::from_micros(char_time_us * 35 / 10)
}

fn is_known_function(code: u8) -> bool {
    code & 0x80 != 0 || ModbusFunction::from_u8(code).is_ok()
}

/// RTU framing over an async byte stream
pub struct RtuStreamTransport<S> {
    stream: Option<S>,
    name: String,
    frame_gap: Duration,
    stats: TransportStats,
    packet_logging: bool,
}

/// RTU transport over a serial port
pub type SerialTransport = RtuStreamTransport<tokio_serial::SerialStream>;

impl SerialTransport {
    /// Open the serial port described by `config`
    pub fn open(config: &SerialConfig) -> ThermoResult<Self> {
        let builder = tokio_serial::new(&config.port, config.baud_rate)
            .data_bits(config.data_bits()?)
            .stop_bits(config.stop_bits()?)
            .parity(config.parity.into());

        let port = tokio_serial::SerialStream::open(&builder).map_err(|e| {
            ThermoError::connection(format!("Failed to open serial port {}: {}", config.port, e))
        })?;

        debug!("Opened serial port {} at {} baud", config.port, config.baud_rate);
        Ok(Self::new(port, config.port.clone(), config.baud_rate))
    }
}

impl<S> RtuStreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new<N: Into<String>>(stream: S, name: N, baud_rate: u32) -> Self {
        Self {
            stream: Some(stream),
            name: name.into(),
            frame_gap: frame_gap(baud_rate),
            stats: TransportStats::default(),
            packet_logging: false,
        }
    }

    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn frame_gap(&self) -> Duration {
        self.frame_gap
    }

    async fn exchange(&mut self, request: &[u8]) -> ThermoResult<Vec<u8>> {
        let gap = self.frame_gap;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ThermoError::connection("Serial port not connected"))?;

        let stale = discard_pending(stream).await;
        if stale > 0 {
            debug!("Discarded {} stale bytes before request", stale);
        }

        tokio::time::sleep(gap).await;
        stream.write_all(request).await?;
        stream.flush().await?;
        self.stats.requests_sent += 1;
        self.stats.bytes_sent += request.len() as u64;
        if self.packet_logging {
            log_packet("RTU", "send", request, request.first().copied());
        }

        read_frame(stream, gap).await
    }
}

/// Drop bytes already buffered on the stream (late replies)
async fn discard_pending<S: AsyncRead + Unpin>(stream: &mut S) -> usize {
    let mut scratch = [0u8; 64];
    let mut dropped = 0;
    loop {
        match timeout(Duration::ZERO, stream.read(&mut scratch)).await {
            Ok(Ok(n)) if n > 0 => dropped += n,
            _ => return dropped,
        }
    }
}

async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S, gap: Duration) -> ThermoResult<Vec<u8>> {
    let mut frame = Vec::with_capacity(crate::MAX_RTU_FRAME_SIZE);
    let mut chunk = [0u8; crate::MAX_RTU_FRAME_SIZE];

    loop {
        let unknown_layout = frame.len() >= 2 && !is_known_function(frame[1]);
        let n = if unknown_layout {
            // Only the silence after the last byte marks the end
            match timeout(gap, stream.read(&mut chunk)).await {
                Ok(read) => read?,
                Err(_) => return Ok(frame),
            }
        } else {
            stream.read(&mut chunk).await?
        };

        if n == 0 {
            return Err(ThermoError::connection("Stream closed while reading response"));
        }
        frame.extend_from_slice(&chunk[..n]);

        if let Some(expected) = expected_response_len(&frame) {
            if frame.len() >= expected {
                if frame.len() > expected {
                    debug!("Dropping {} trailing bytes", frame.len() - expected);
                    frame.truncate(expected);
                }
                return Ok(frame);
            }
        }
        if frame.len() > crate::MAX_RTU_FRAME_SIZE {
            return Err(ThermoError::frame("RTU frame too large"));
        }
    }
}

#[async_trait]
impl<S> FrameTransport for RtuStreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn transact(&mut self, request: &[u8], limit: Duration) -> ThermoResult<Vec<u8>> {
        let result = match timeout(limit, self.exchange(request)).await {
            Ok(result) => result,
            Err(_) => Err(ThermoError::timeout(
                "read response frame",
                limit.as_millis() as u64,
            )),
        };

        match result {
            Ok(frame) => {
                self.stats.responses_received += 1;
                self.stats.bytes_received += frame.len() as u64;
                if self.packet_logging {
                    log_packet("RTU", "receive", &frame, frame.first().copied());
                }
                Ok(frame)
            }
            Err(e) => {
                self.stats.record_failure(&e);
                if matches!(e, ThermoError::Connection { .. }) {
                    self.stream = None;
                }
                Err(e)
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn close(&mut self) -> ThermoResult<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!("Closed {}", self.name);
        }
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

/// RTU frames tunnelled through a WebSocket bridge
pub struct WebSocketBridgeTransport<S = MaybeTlsStream<TcpStream>> {
    socket: Option<WebSocketStream<S>>,
    url: String,
    stats: TransportStats,
    packet_logging: bool,
}

impl WebSocketBridgeTransport {
    /// Connect to a bridge such as `ws://192.168.1.20:8080/modbus`
    pub async fn connect(url: &str) -> ThermoResult<Self> {
        let (socket, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ThermoError::connection(format!("Failed to connect to {}: {}", url, e)))?;
        debug!("Connected to bridge {}", url);
        Ok(Self::from_stream(socket, url))
    }
}

impl<S> WebSocketBridgeTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn from_stream<U: Into<String>>(socket: WebSocketStream<S>, url: U) -> Self {
        Self {
            socket: Some(socket),
            url: url.into(),
            stats: TransportStats::default(),
            packet_logging: false,
        }
    }

    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn exchange(&mut self, request: &[u8]) -> ThermoResult<Vec<u8>> {
        let socket = self
            .socket
            .as_mut()
            .ok_or_else(|| ThermoError::connection("Bridge not connected"))?;

        socket.send(Message::Binary(request.to_vec())).await?;
        self.stats.requests_sent += 1;
        self.stats.bytes_sent += request.len() as u64;
        if self.packet_logging {
            log_packet("WS", "send", request, request.first().copied());
        }

        let mut frame = Vec::new();
        loop {
            let message = socket
                .next()
                .await
                .ok_or_else(|| ThermoError::connection("Bridge closed the connection"))??;

            match message {
                Message::Binary(data) => frame.extend_from_slice(&data),
                Message::Text(text) => {
                    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
                    let data = hex::decode(&compact).map_err(|e| {
                        ThermoError::frame(format!("Bridge sent non-hex text '{}': {}", text, e))
                    })?;
                    frame.extend_from_slice(&data);
                }
                Message::Close(_) => {
                    return Err(ThermoError::connection("Bridge closed the connection"))
                }
                _ => continue,
            }

            match expected_response_len(&frame) {
                Some(expected) if frame.len() >= expected => {
                    frame.truncate(expected);
                    return Ok(frame);
                }
                // Unknown layout: take the message as the whole frame
                None if frame.len() >= 2 && !is_known_function(frame[1]) => return Ok(frame),
                _ => {}
            }
            if frame.len() > crate::MAX_RTU_FRAME_SIZE {
                return Err(ThermoError::frame("RTU frame too large"));
            }
        }
    }
}

#[async_trait]
impl<S> FrameTransport for WebSocketBridgeTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn transact(&mut self, request: &[u8], limit: Duration) -> ThermoResult<Vec<u8>> {
        let result = match timeout(limit, self.exchange(request)).await {
            Ok(result) => result,
            Err(_) => Err(ThermoError::timeout(
                "bridge response",
                limit.as_millis() as u64,
            )),
        };

        match result {
            Ok(frame) => {
                self.stats.responses_received += 1;
                self.stats.bytes_received += frame.len() as u64;
                if self.packet_logging {
                    log_packet("WS", "receive", &frame, frame.first().copied());
                }
                Ok(frame)
            }
            Err(e) => {
                self.stats.record_failure(&e);
                if matches!(e, ThermoError::Connection { .. }) {
                    self.socket = None;
                }
                Err(e)
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    async fn close(&mut self) -> ThermoResult<()> {
        if let Some(mut socket) = self.socket.take() {
            if let Err(e) = socket.close(None).await {
                warn!("Error closing bridge {}: {}", self.url, e);
            }
        }
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

/// Open the transport selected by `config`: the WebSocket bridge when a URL
/// is configured, the serial port otherwise
pub async fn open_transport(config: &AcquisitionConfig) -> ThermoResult<Box<dyn FrameTransport>> {
    match &config.bridge_url {
        Some(url) => {
            let mut transport = WebSocketBridgeTransport::connect(url).await?;
            transport.set_packet_logging(config.packet_logging);
            Ok(Box::new(transport))
        }
        None => {
            let mut transport = SerialTransport::open(&config.serial)?;
            transport.set_packet_logging(config.packet_logging);
            Ok(Box::new(transport))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_read_holding_registers_frame, build_read_holding_registers_response};
    use tokio_test::io::Builder;

    const BAUD: u32 = 115_200;

    #[test]
    fn test_frame_gap() {
        assert_eq!(frame_gap(9600), Duration::from_micros(1145 * 35 / 10));
        assert!(frame_gap(115_200) < Duration::from_millis(1));
    }

    #[tokio::test]
    async fn test_rtu_transact() {
        let request = build_read_holding_registers_frame(1, 0, 2).unwrap();
        let response = build_read_holding_registers_response(1, &[0x0190, 0xFE70]);
        let mock = Builder::new()
            .write(&request)
            .read(&response[..3])
            .read(&response[3..])
            .build();

        let mut transport = RtuStreamTransport::new(mock, "mock", BAUD);
        let frame = transport
            .transact(&request, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(frame, response);

        let stats = transport.get_stats();
        assert_eq!(stats.requests_sent, 1);
        assert_eq!(stats.responses_received, 1);
        assert_eq!(stats.bytes_received, response.len() as u64);
    }

    #[tokio::test]
    async fn test_rtu_exception_frame() {
        let request = build_read_holding_registers_frame(1, 0, 1).unwrap();
        let mut exception = vec![0x01, 0x83, 0x02];
        let crc = crate::protocol::compute_crc16(&exception);
        exception.extend_from_slice(&crc.to_le_bytes());

        let mock = Builder::new().write(&request).read(&exception).build();
        let mut transport = RtuStreamTransport::new(mock, "mock", BAUD);
        let frame = transport.transact(&request, Duration::from_secs(1)).await.unwrap();
        assert_eq!(frame.len(), 5);
    }

    #[tokio::test]
    async fn test_rtu_timeout() {
        let request = build_read_holding_registers_frame(1, 0, 1).unwrap();
        let mock = Builder::new()
            .write(&request)
            .wait(Duration::from_millis(200))
            .build();

        let mut transport = RtuStreamTransport::new(mock, "mock", BAUD);
        let result = transport.transact(&request, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(ThermoError::Timeout { .. })));
        assert_eq!(transport.get_stats().timeouts, 1);
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn test_rtu_closed_stream() {
        let request = build_read_holding_registers_frame(1, 0, 1).unwrap();
        let mock = Builder::new().write(&request).build();

        let mut transport = RtuStreamTransport::new(mock, "mock", BAUD);
        let result = transport.transact(&request, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ThermoError::Connection { .. })));
        assert!(!transport.is_connected());

        let result = transport.transact(&request, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ThermoError::Connection { .. })));
    }

    #[tokio::test]
    async fn test_websocket_bridge() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut socket = tokio_tungstenite::accept_async(tcp).await.unwrap();

            // First reply as binary, second as hex text split in two messages
            let request = socket.next().await.unwrap().unwrap();
            assert!(request.is_binary());
            let response = build_read_holding_registers_response(1, &[0x0190]);
            socket.send(Message::Binary(response.clone())).await.unwrap();

            socket.next().await.unwrap().unwrap();
            let text = hex::encode_upper(&response);
            socket.send(Message::Text(text[..4].to_string())).await.unwrap();
            socket.send(Message::Text(text[4..].to_string())).await.unwrap();
            response
        });

        let url = format!("ws://{}", address);
        let mut transport = WebSocketBridgeTransport::connect(&url).await.unwrap();
        let request = build_read_holding_registers_frame(1, 0, 1).unwrap();

        let first = transport.transact(&request, Duration::from_secs(2)).await.unwrap();
        let second = transport.transact(&request, Duration::from_secs(2)).await.unwrap();
        let expected = server.await.unwrap();
        assert_eq!(first, expected);
        assert_eq!(second, expected);
        assert_eq!(transport.get_stats().responses_received, 2);

        transport.close().await.unwrap();
        assert!(!transport.is_connected());
    }
}

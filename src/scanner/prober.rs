//! A single status exchange against one socket.
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use chrono::Utc;
use log::{debug, warn};
use thiserror::Error;
use tokio::{
    io::{self, AsyncRead, AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::{self, Instant},
};

use crate::config::ScanConfig;
use crate::protocol::{self, ProtocolError, MAX_PACKET_LEN, MAX_VARINT_LEN};
use crate::server::{ProbeOutcome, ServerRecord, StatusResponse};

/// Why an open port did not yield a server record.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid status JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no status response within {0:?}")]
    Timeout(Duration),
}

/// Something that can probe a socket.
///
/// [`Prober`] talks to real servers; the orchestrator only depends on this
/// trait.
pub trait Probe: Send + Sync + 'static {
    fn probe(
        &self,
        socket: SocketAddr,
        server_name: &str,
        config: &ScanConfig,
    ) -> impl Future<Output = ProbeOutcome> + Send;
}

/// Opens one connection per probe and performs the server-list-ping
/// handshake, status request and ping.
#[derive(Debug, Default, Clone, Copy)]
pub struct Prober;

impl Probe for Prober {
    /// Connection failures yield a closed outcome without an error. Anything
    /// going wrong after the connection is up yields an open, non-matching
    /// outcome carrying the error text.
    ///
    /// The stream is owned by this future, so it is closed on every exit
    /// path, including when the future is dropped.
    async fn probe(
        &self,
        socket: SocketAddr,
        server_name: &str,
        config: &ScanConfig,
    ) -> ProbeOutcome {
        let started = Instant::now();

        let mut stream = match self.connect(socket, config).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!("{socket} is closed: {e}");
                return ProbeOutcome::closed(socket.ip(), socket.port(), started.elapsed());
            }
        };

        let status = match time::timeout(
            config.timeout,
            request_status(&mut stream, socket.port(), server_name, config.protocol_version),
        )
        .await
        {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return mismatch(socket, &e, started),
            Err(_) => return mismatch(socket, &ProbeError::Timeout(config.timeout), started),
        };

        let ping = time::timeout(config.timeout, measure_ping(&mut stream))
            .await
            .ok()
            .flatten();

        if let Err(e) = stream.shutdown().await {
            debug!("Shutdown stream error {e}");
        }

        let record = ServerRecord::from_status(
            socket.ip().to_string(),
            socket.port(),
            status,
            ping,
            started.elapsed(),
        );
        ProbeOutcome::matched(socket.ip(), socket.port(), record, started.elapsed())
    }
}

impl Prober {
    /// Reports whether `socket` accepts a TCP connection within `timeout`.
    pub async fn port_open(&self, socket: SocketAddr, timeout: Duration) -> bool {
        match time::timeout(timeout, TcpStream::connect(socket)).await {
            Ok(Ok(mut stream)) => {
                if let Err(e) = stream.shutdown().await {
                    debug!("Shutdown stream error {e}");
                }
                true
            }
            _ => false,
        }
    }

    /// Connects to `socket`, trying up to `config.tries` times.
    async fn connect(&self, socket: SocketAddr, config: &ScanConfig) -> io::Result<TcpStream> {
        let tries = config.connect_tries();
        let mut last_err = None;

        for nr_try in 1..=tries {
            match time::timeout(config.timeout, TcpStream::connect(socket)).await {
                Ok(Ok(stream)) => {
                    debug!("Connected to {socket} after {nr_try} tries");
                    return Ok(stream);
                }
                Ok(Err(e)) => {
                    if e.to_string().to_lowercase().contains("too many open files") {
                        warn!("Too many open files. Please reduce the concurrency limit.");
                    }
                    last_err = Some(e);
                }
                Err(elapsed) => last_err = Some(io::Error::from(elapsed)),
            }
        }

        Err(last_err.unwrap_or_else(|| io::Error::other("no connection attempt made")))
    }
}

fn mismatch(socket: SocketAddr, error: &ProbeError, started: Instant) -> ProbeOutcome {
    debug!("{socket} is open but did not answer the status request: {error}");
    ProbeOutcome::mismatch(
        socket.ip(),
        socket.port(),
        error.to_string(),
        started.elapsed(),
    )
}

async fn request_status(
    stream: &mut TcpStream,
    port: u16,
    server_name: &str,
    protocol_version: u32,
) -> Result<StatusResponse, ProbeError> {
    let handshake = protocol::build_handshake_packet(server_name, port, protocol_version)?;
    stream.write_all(&handshake).await?;
    stream
        .write_all(&protocol::build_status_request_packet())
        .await?;

    let frame = read_frame(stream).await?;
    let json = protocol::parse_status_response(&frame)?;
    Ok(StatusResponse::from_json(&json)?)
}

/// Time from sending a ping until any bytes come back.
///
/// The echoed payload is not compared with the one sent.
async fn measure_ping(stream: &mut TcpStream) -> Option<Duration> {
    let packet = protocol::build_ping_packet(Utc::now().timestamp_millis());
    let started = Instant::now();

    if let Err(e) = stream.write_all(&packet).await {
        debug!("Could not send ping: {e}");
        return None;
    }

    let mut buf = [0u8; 1024];
    match stream.read(&mut buf).await {
        Ok(n) if n > 0 => Some(started.elapsed()),
        Ok(_) => {
            debug!("Connection closed before pong");
            None
        }
        Err(e) => {
            debug!("Could not read pong: {e}");
            None
        }
    }
}

/// Reads one length-prefixed packet, returning it with its prefix.
pub(crate) async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, ProbeError>
where
    R: AsyncRead + Unpin,
{
    let mut frame = Vec::with_capacity(MAX_VARINT_LEN);

    loop {
        let byte = match reader.read_u8().await {
            Ok(byte) => byte,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(ProtocolError::IncompleteResponse {
                    expected: frame.len() + 1,
                    received: frame.len(),
                }
                .into());
            }
            Err(e) => return Err(e.into()),
        };
        frame.push(byte);

        if byte & 0x80 == 0 || frame.len() == MAX_VARINT_LEN {
            break;
        }
    }

    let (length, prefix) = protocol::decode_varint(&frame, 0)?;
    let length = length as usize;
    if length > MAX_PACKET_LEN {
        return Err(ProtocolError::PacketTooLarge(length).into());
    }

    // Grows with the bytes that actually arrive, not with the declared length.
    let received = reader.take(length as u64).read_to_end(&mut frame).await?;
    if received < length {
        return Err(ProtocolError::IncompleteResponse {
            expected: length,
            received,
        }
        .into());
    }
    debug_assert_eq!(frame.len(), prefix + length);

    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_string, encode_varint};
    use tokio::net::TcpListener;

    fn config(timeout: Duration) -> ScanConfig {
        ScanConfig {
            timeout,
            delay: Duration::ZERO,
            ..ScanConfig::default()
        }
    }

    fn status_frame(packet_id: u8, json: &str) -> Vec<u8> {
        let mut payload = vec![packet_id];
        payload.extend(encode_string(json));
        let mut frame = encode_varint(payload.len() as u32);
        frame.extend(payload);
        frame
    }

    /// Accepts one connection, reads handshake and status request, then
    /// writes `reply`. Echoes the ping when `answer_ping` is set.
    async fn spawn_server(reply: Vec<u8>, answer_ping: bool) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_frame(&mut socket).await.unwrap();
            read_frame(&mut socket).await.unwrap();
            socket.write_all(&reply).await.unwrap();

            if answer_ping {
                if let Ok(ping) = read_frame(&mut socket).await {
                    let _ = socket.write_all(&ping).await;
                }
            }
        });

        addr
    }

    #[tokio::test]
    async fn probe_reads_server_status() {
        let json = r#"{"version":{"name":"1.8.9","protocol":47},"players":{"max":20,"online":3},"description":{"text":"Lobby"}}"#;
        let addr = spawn_server(status_frame(0x00, json), true).await;

        let outcome = Prober
            .probe(addr, "127.0.0.1", &config(Duration::from_secs(5)))
            .await;

        assert!(outcome.port_open);
        assert!(outcome.is_service_match);
        assert_eq!(outcome.error, None);
        let record = outcome.record.unwrap();
        assert_eq!(record.host, "127.0.0.1");
        assert_eq!(record.port, addr.port());
        assert_eq!(record.version_name.as_deref(), Some("1.8.9"));
        assert_eq!(record.protocol_version, Some(47));
        assert_eq!(record.online_players, Some(3));
        assert_eq!(record.description.as_deref(), Some("Lobby"));
        assert!(record.ping_millis.is_some());
    }

    #[tokio::test]
    async fn silent_ping_leaves_latency_empty() {
        let addr = spawn_server(status_frame(0x00, "{}"), false).await;

        let outcome = Prober
            .probe(addr, "127.0.0.1", &config(Duration::from_secs(5)))
            .await;

        assert!(outcome.is_service_match);
        assert_eq!(outcome.record.unwrap().ping_millis, None);
    }

    #[tokio::test]
    async fn closed_port_is_not_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let timeout = Duration::from_secs(2);
        let outcome = Prober.probe(addr, "127.0.0.1", &config(timeout)).await;

        assert!(!outcome.port_open);
        assert!(!outcome.is_service_match);
        assert_eq!(outcome.error, None);
        assert!(outcome.record.is_none());
        assert!(outcome.elapsed <= timeout + Duration::from_millis(500));
    }

    #[tokio::test]
    async fn wrong_packet_id_is_a_mismatch() {
        let addr = spawn_server(status_frame(0x01, "{}"), false).await;

        let outcome = Prober
            .probe(addr, "127.0.0.1", &config(Duration::from_secs(5)))
            .await;

        assert!(outcome.port_open);
        assert!(!outcome.is_service_match);
        assert!(outcome.error.unwrap().contains("unexpected packet id"));
    }

    #[tokio::test]
    async fn invalid_json_is_a_mismatch() {
        let addr = spawn_server(status_frame(0x00, "<html>"), false).await;

        let outcome = Prober
            .probe(addr, "127.0.0.1", &config(Duration::from_secs(5)))
            .await;

        assert!(!outcome.is_service_match);
        assert!(outcome.error.unwrap().contains("invalid status JSON"));
    }

    #[tokio::test]
    async fn early_close_is_an_incomplete_response() {
        let mut reply = encode_varint(100);
        reply.extend_from_slice(&[0x00, 0x05, b'{']);
        let addr = spawn_server(reply, false).await;

        let outcome = Prober
            .probe(addr, "127.0.0.1", &config(Duration::from_secs(5)))
            .await;

        assert!(outcome.port_open);
        assert!(!outcome.is_service_match);
        assert!(outcome.error.unwrap().contains("incomplete response"));
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let outcome = Prober
            .probe(addr, "127.0.0.1", &config(Duration::from_millis(200)))
            .await;
        server.abort();

        assert!(outcome.port_open);
        assert!(!outcome.is_service_match);
        assert!(outcome.error.unwrap().contains("no status response"));
        assert!(outcome.elapsed < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn handshake_carries_server_name() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_frame(&mut socket).await.unwrap()
        });

        let _ = Prober
            .probe(addr, "play.example.net", &config(Duration::from_millis(300)))
            .await;

        let handshake = server.await.unwrap();
        assert_eq!(
            handshake,
            protocol::build_handshake_packet("play.example.net", addr.port(), 47).unwrap()
        );
    }

    #[tokio::test]
    async fn port_open_detects_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(Prober.port_open(addr, Duration::from_secs(1)).await);

        drop(listener);
        assert!(!Prober.port_open(addr, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn read_frame_reads_exactly_one_packet() {
        let mut input: &[u8] = &[0x02, 0x00, 0x07, 0x01, 0xFF];
        let frame = read_frame(&mut input).await.unwrap();
        assert_eq!(frame, [0x02, 0x00, 0x07]);
        assert_eq!(input, [0x01, 0xFF]);
    }

    #[tokio::test]
    async fn read_frame_on_empty_stream() {
        let mut input: &[u8] = &[];
        assert!(matches!(
            read_frame(&mut input).await,
            Err(ProbeError::Protocol(ProtocolError::IncompleteResponse { .. }))
        ));
    }

    #[tokio::test]
    async fn read_frame_rejects_oversized_length() {
        let mut input: &[u8] = &[0xFF, 0xFF, 0xFF, 0x7F];
        assert!(matches!(
            read_frame(&mut input).await,
            Err(ProbeError::Protocol(ProtocolError::PacketTooLarge(_)))
        ));
    }

    #[tokio::test]
    async fn read_frame_with_large_declared_length_and_short_body() {
        let mut input = protocol::encode_varint(2_000_000);
        input.extend_from_slice(&[0x00, 0x05, b'{']);
        let mut input: &[u8] = &input;

        match read_frame(&mut input).await {
            Err(ProbeError::Protocol(ProtocolError::IncompleteResponse {
                expected,
                received,
            })) => {
                assert_eq!(expected, 2_000_000);
                assert_eq!(received, 3);
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_frame_rejects_endless_varint() {
        let mut input: &[u8] = &[0x80, 0x80, 0x80, 0x80, 0x80, 0x80];
        assert!(matches!(
            read_frame(&mut input).await,
            Err(ProbeError::Protocol(ProtocolError::MalformedVarint(_)))
        ));
    }
}

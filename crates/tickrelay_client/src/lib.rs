#![forbid(unsafe_code)]

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use bytes::BytesMut;
use tickrelay_protocol::{ClientMessage, Handshake, ProtocolError, TickPacket};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Default relay endpoint for local development.
pub const DEFAULT_SERVER_ENDPOINT: &str = "127.0.0.1:15000";

/// Client connection configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
	/// Remote relay host (DNS name or IP literal).
	pub server_host: String,

	/// Remote relay TCP port.
	pub server_port: u16,

	/// Resolved address override; skips DNS when set.
	pub server_addr: Option<SocketAddr>,

	/// Timeout for each connect attempt.
	pub connect_timeout: Duration,
}

impl ClientConfig {
	/// Parse a `host:port` endpoint into `(host, port)`.
	pub fn parse_endpoint(endpoint: &str) -> Result<(String, u16), ClientError> {
		let endpoint = endpoint.trim();
		let (host, port) = endpoint
			.rsplit_once(':')
			.ok_or_else(|| ClientError::Connect(format!("invalid endpoint (expected host:port): {endpoint}")))?;
		let port: u16 = port
			.parse()
			.map_err(|_| ClientError::Connect(format!("invalid port in endpoint: {endpoint}")))?;
		let host = host.trim_start_matches('[').trim_end_matches(']');
		if host.is_empty() {
			return Err(ClientError::Connect(format!("missing host in endpoint: {endpoint}")));
		}
		Ok((host.to_string(), port))
	}

	pub fn from_endpoint(endpoint: &str) -> Result<Self, ClientError> {
		let (host, port) = Self::parse_endpoint(endpoint)?;
		Ok(Self {
			server_host: host,
			server_port: port,
			server_addr: None,
			..Self::default()
		})
	}

	pub fn for_addr(addr: SocketAddr) -> Self {
		Self {
			server_host: addr.ip().to_string(),
			server_port: addr.port(),
			server_addr: Some(addr),
			..Self::default()
		}
	}
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			server_host: "127.0.0.1".to_string(),
			server_port: 15000,
			server_addr: None,
			connect_timeout: Duration::from_secs(10),
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
	/// Connection establishment failed.
	#[error("failed to connect: {0}")]
	Connect(String),

	#[error("io error: {0}")]
	Io(#[from] std::io::Error),

	/// The relay sent bytes that do not parse.
	#[error(transparent)]
	Protocol(#[from] ProtocolError),

	/// The relay closed the connection.
	#[error("connection closed by relay")]
	Closed,
}

/// One player's connection to the relay.
///
/// The first bytes the relay sends are the handshake; every later read
/// yields tick packets. [`recv_tick`](Self::recv_tick) consumes the
/// handshake on its own if it has not been read yet.
pub struct RelayClient {
	stream: TcpStream,
	buf: BytesMut,
	handshake: Option<Handshake>,
}

impl RelayClient {
	/// Connect using `cfg`, trying each resolved address in turn.
	pub async fn connect(cfg: ClientConfig) -> Result<Self, ClientError> {
		let candidates: Vec<SocketAddr> = if let Some(addr) = cfg.server_addr {
			vec![addr]
		} else if let Ok(ip) = cfg.server_host.parse::<IpAddr>() {
			vec![SocketAddr::new(ip, cfg.server_port)]
		} else {
			let hostport = format!("{}:{}", cfg.server_host, cfg.server_port);
			let addrs: Vec<SocketAddr> = hostport
				.to_socket_addrs()
				.map_err(|e| ClientError::Connect(format!("failed to resolve {hostport}: {e}")))?
				.collect();
			if addrs.is_empty() {
				return Err(ClientError::Connect(format!(
					"DNS resolution returned no addresses for {hostport}"
				)));
			}
			addrs
		};

		let mut last_err: Option<String> = None;
		for addr in candidates {
			match tokio::time::timeout(cfg.connect_timeout, TcpStream::connect(addr)).await {
				Ok(Ok(stream)) => {
					stream.set_nodelay(true)?;
					info!(remote = %addr, "connected");
					return Ok(Self {
						stream,
						buf: BytesMut::with_capacity(16 * 1024),
						handshake: None,
					});
				}
				Ok(Err(e)) => last_err = Some(format!("connect failed (addr={addr}): {e}")),
				Err(_) => {
					last_err = Some(format!("connect timeout after {:?} (addr={addr})", cfg.connect_timeout));
				}
			}
		}

		Err(ClientError::Connect(
			last_err.unwrap_or_else(|| "connect failed (no addresses attempted)".to_string()),
		))
	}

	pub async fn connect_addr(addr: SocketAddr) -> Result<Self, ClientError> {
		Self::connect(ClientConfig::for_addr(addr)).await
	}

	/// The handshake, once it has been received.
	pub fn handshake(&self) -> Option<Handshake> {
		self.handshake
	}

	pub async fn send(&mut self, msg: &ClientMessage) -> Result<(), ClientError> {
		let wire = msg.encode()?;
		self.send_raw(&wire).await
	}

	/// Write bytes as-is; for callers that assemble their own wire data.
	pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
		self.stream.write_all(bytes).await?;
		Ok(())
	}

	/// Wait for the handshake that precedes the first tick.
	pub async fn recv_handshake(&mut self) -> Result<Handshake, ClientError> {
		if let Some(hs) = self.handshake {
			return Ok(hs);
		}

		loop {
			if let Some(hs) = Handshake::try_decode(&mut self.buf)? {
				debug!(slot = hs.slot_index, client_count = hs.client_count, frame = hs.frame_id, "handshake");
				self.handshake = Some(hs);
				return Ok(hs);
			}
			self.fill().await?;
		}
	}

	/// Wait for the next tick packet.
	pub async fn recv_tick(&mut self) -> Result<TickPacket, ClientError> {
		self.recv_handshake().await?;

		loop {
			if let Some(packet) = TickPacket::try_decode(&mut self.buf)? {
				return Ok(packet);
			}
			self.fill().await?;
		}
	}

	/// Read until the relay closes the connection, discarding any data.
	pub async fn wait_closed(&mut self) -> Result<(), ClientError> {
		let mut tmp = [0u8; 8192];
		loop {
			if self.stream.read(&mut tmp).await? == 0 {
				return Ok(());
			}
		}
	}

	async fn fill(&mut self) -> Result<(), ClientError> {
		let mut tmp = [0u8; 8192];
		let n = self.stream.read(&mut tmp).await?;
		if n == 0 {
			return Err(ClientError::Closed);
		}
		self.buf.extend_from_slice(&tmp[..n]);
		Ok(())
	}
}

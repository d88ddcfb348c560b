#![forbid(unsafe_code)]

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context as _;
use tickrelay_protocol::ClientMessage;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, trace, warn};

use crate::server::admission::AdmissionController;
use crate::server::connection::{CloseReason, read_loop, write_loop};
use crate::server::listener::{accept_loop, bind_listener};
use crate::server::session::{ClientSlot, Session};
use crate::server::sync::Timing;
use crate::server::usage::{UsageLimiter, UsageSettings};

#[derive(Debug, Clone)]
pub struct RelaySettings {
	/// Bind to this address only; `None` listens dual-stack on all interfaces.
	pub bind_ip: Option<IpAddr>,
	pub port: u16,
	pub max_clients: usize,
	pub client_pool: u32,
	pub client_pool_recovery_per_sec: f64,
	pub usage: UsageSettings,
	/// Ticks per second.
	pub framerate: u32,
	/// Seconds of silence before a client is dropped.
	pub timeout_secs: u32,
	/// Empty slots announced before the first client joins.
	pub starting_slots: usize,
}

impl Default for RelaySettings {
	fn default() -> Self {
		Self {
			bind_ip: None,
			port: 15000,
			max_clients: 32,
			client_pool: 32,
			client_pool_recovery_per_sec: 0.2,
			usage: UsageSettings {
				pool: 4 * 1024 * 1024,
				recovery_per_sec: 20 * 1024,
				header_adj: 50,
				proc_adj: 50,
			},
			framerate: 15,
			timeout_secs: 5,
			starting_slots: 0,
		}
	}
}

impl RelaySettings {
	pub fn tick_period(&self) -> Duration {
		Duration::from_secs_f64(1.0 / f64::from(self.framerate.max(1)))
	}

	pub fn timeout_ticks(&self) -> u32 {
		self.framerate.saturating_mul(self.timeout_secs)
	}

	/// Replace values the relay cannot run with by their defaults.
	pub fn sanitize(&mut self) {
		let defaults = Self::default();

		// Slot index and client count are single bytes on the wire.
		if self.max_clients == 0 || self.max_clients > usize::from(u8::MAX) {
			warn!(
				max_clients = self.max_clients,
				default = defaults.max_clients,
				"relay config: max_clients out of range; using default"
			);
			self.max_clients = defaults.max_clients;
		}
		if self.framerate == 0 {
			warn!(default = defaults.framerate, "relay config: framerate must be > 0; using default");
			self.framerate = defaults.framerate;
		}
		if self.timeout_secs == 0 {
			warn!(default = defaults.timeout_secs, "relay config: timeout_secs must be > 0; using default");
			self.timeout_secs = defaults.timeout_secs;
		}
		if self.client_pool == 0 {
			warn!(default = defaults.client_pool, "relay config: client_pool must be > 0; using default");
			self.client_pool = defaults.client_pool;
		}
		if !self.client_pool_recovery_per_sec.is_finite() || self.client_pool_recovery_per_sec < 0.0 {
			warn!(
				default = defaults.client_pool_recovery_per_sec,
				"relay config: client_pool_recovery_per_sec invalid; using default"
			);
			self.client_pool_recovery_per_sec = defaults.client_pool_recovery_per_sec;
		}
		if self.usage.pool == 0 {
			warn!(default = defaults.usage.pool, "relay config: usage_pool must be > 0; using default");
			self.usage.pool = defaults.usage.pool;
		}
		if self.starting_slots > self.max_clients {
			warn!(
				starting_slots = self.starting_slots,
				max_clients = self.max_clients,
				"relay config: starting_slots exceeds max_clients; clamping"
			);
			self.starting_slots = self.max_clients;
		}
	}
}

/// Everything the dispatcher reacts to, in arrival order.
#[derive(Debug)]
pub enum RelayEvent {
	Accepted { stream: TcpStream, peer: SocketAddr },
	Message { conn_id: u64, msg: ClientMessage },
	Closed { conn_id: u64, reason: CloseReason },
}

/// Live counters published by the dispatcher for outside observers.
#[derive(Debug, Default)]
pub struct RelayStats {
	active_clients: AtomicUsize,
	session_frame: AtomicU32,
	ticks: AtomicU64,
	session_active: AtomicBool,
}

impl RelayStats {
	pub fn active_clients(&self) -> usize {
		self.active_clients.load(Ordering::Relaxed)
	}

	/// Next frame the active session will broadcast; 0 when idle.
	pub fn session_frame(&self) -> u32 {
		self.session_frame.load(Ordering::Relaxed)
	}

	pub fn ticks(&self) -> u64 {
		self.ticks.load(Ordering::Relaxed)
	}

	pub fn session_active(&self) -> bool {
		self.session_active.load(Ordering::Relaxed)
	}

	fn set_active_clients(&self, occupied: usize) {
		self.active_clients.store(occupied, Ordering::Relaxed);
		metrics::gauge!("tickrelay_active_clients").set(occupied as f64);
	}
}

/// Handle to a running relay. Dropping it stops the relay.
pub struct RelayHandle {
	local_addr: SocketAddr,
	stats: Arc<RelayStats>,
	shutdown: Option<oneshot::Sender<()>>,
	dispatcher: Option<JoinHandle<()>>,
	acceptor: JoinHandle<()>,
}

impl RelayHandle {
	pub fn local_addr(&self) -> SocketAddr {
		self.local_addr
	}

	pub fn stats(&self) -> Arc<RelayStats> {
		Arc::clone(&self.stats)
	}

	/// Close every client and wait for the dispatcher to finish.
	pub async fn shutdown(mut self) {
		if let Some(tx) = self.shutdown.take() {
			let _ = tx.send(());
		}
		if let Some(dispatcher) = self.dispatcher.take() {
			let _ = dispatcher.await;
		}
	}
}

impl Drop for RelayHandle {
	fn drop(&mut self) {
		self.acceptor.abort();
	}
}

/// Bind the listener and start the accept loop and the dispatcher.
///
/// Settings are sanitized first, so out-of-range values fall back to their
/// defaults just as they do when loaded from the config file.
pub async fn start_relay(mut settings: RelaySettings) -> anyhow::Result<RelayHandle> {
	settings.sanitize();
	let listener = bind_listener(settings.bind_ip, settings.port).context("bind relay listener")?;
	let local_addr = listener.local_addr().context("relay listener address")?;
	info!(%local_addr, framerate = settings.framerate, max_clients = settings.max_clients, "relay listening");

	let (events_tx, events_rx) = mpsc::unbounded_channel();
	let (shutdown_tx, shutdown_rx) = oneshot::channel();

	let stats = Arc::new(RelayStats::default());
	let acceptor = tokio::spawn(accept_loop(listener, events_tx.clone()));
	let relay = Relay::new(settings, events_tx, Arc::clone(&stats));
	let dispatcher = tokio::spawn(relay.run(events_rx, shutdown_rx));

	Ok(RelayHandle {
		local_addr,
		stats,
		shutdown: Some(shutdown_tx),
		dispatcher: Some(dispatcher),
		acceptor,
	})
}

struct ActiveSession {
	session: Session,
	next_tick: Instant,
}

/// Single owner of the admission pool and the active session.
///
/// Socket tasks only report events; every state change happens here, so
/// a tick never interleaves with slot or queue updates.
struct Relay {
	settings: RelaySettings,
	admission: AdmissionController,
	active: Option<ActiveSession>,
	events_tx: mpsc::UnboundedSender<RelayEvent>,
	stats: Arc<RelayStats>,
	next_conn_id: u64,
}

impl Relay {
	fn new(settings: RelaySettings, events_tx: mpsc::UnboundedSender<RelayEvent>, stats: Arc<RelayStats>) -> Self {
		let admission = AdmissionController::new(
			settings.client_pool,
			settings.client_pool_recovery_per_sec,
			std::time::Instant::now(),
		);
		Self {
			settings,
			admission,
			active: None,
			events_tx,
			stats,
			next_conn_id: 1,
		}
	}

	async fn run(mut self, mut events: mpsc::UnboundedReceiver<RelayEvent>, mut shutdown: oneshot::Receiver<()>) {
		loop {
			let deadline = self.active.as_ref().map(|a| a.next_tick);

			tokio::select! {
				biased;

				_ = &mut shutdown => break,

				event = events.recv() => match event {
					Some(event) => self.handle(event),
					None => break,
				},

				_ = wait_for_tick(deadline) => {
					// Anything already reported belongs to this tick.
					while let Ok(event) = events.try_recv() {
						self.handle(event);
					}
					self.tick();
				}
			}
		}

		self.end_session("relay shutting down");
	}

	fn handle(&mut self, event: RelayEvent) {
		match event {
			RelayEvent::Accepted { stream, peer } => self.on_accepted(stream, peer),
			RelayEvent::Message { conn_id, msg } => self.on_message(conn_id, msg),
			RelayEvent::Closed { conn_id, reason } => self.release(conn_id, &reason),
		}
	}

	fn on_accepted(&mut self, stream: TcpStream, peer: SocketAddr) {
		let conn_id = self.next_conn_id;
		self.next_conn_id += 1;
		metrics::counter!("tickrelay_connections_total").increment(1);

		if let Err(e) = self.admission.admit(std::time::Instant::now()) {
			metrics::counter!("tickrelay_admission_rejected_total", "reason" => "pool").increment(1);
			warn!(conn_id, %peer, error = %e, "rejected connection");
			return;
		}

		let starting_slots = self.settings.starting_slots;
		let first_tick = Instant::now() + self.settings.tick_period();
		let stats = &self.stats;
		let active = self.active.get_or_insert_with(|| {
			info!(starting_slots, "session started");
			stats.session_active.store(true, Ordering::Relaxed);
			stats.session_frame.store(0, Ordering::Relaxed);
			ActiveSession {
				session: Session::new(starting_slots),
				next_tick: first_tick,
			}
		});

		let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
		let slot = match active
			.session
			.insert(ClientSlot::new(conn_id, outbound_tx), self.settings.max_clients)
		{
			Ok(slot) => slot,
			Err(e) => {
				metrics::counter!("tickrelay_admission_rejected_total", "reason" => "full").increment(1);
				warn!(conn_id, %peer, error = %e, "rejected connection");
				if active.session.occupied() == 0 {
					self.end_session("no clients joined");
				}
				return;
			}
		};

		let (read_half, write_half) = stream.into_split();
		tokio::spawn(write_loop(conn_id, write_half, outbound_rx));
		let reader = tokio::spawn(read_loop(
			conn_id,
			slot,
			read_half,
			UsageLimiter::new(self.settings.usage, std::time::Instant::now()),
			self.events_tx.clone(),
		));
		if let Some(client) = active.session.client_mut(slot) {
			client.attach_reader(reader.abort_handle());
		}

		let occupied = active.session.occupied();
		self.stats.set_active_clients(occupied);
		info!(conn_id, %peer, slot, occupied, "client joined");
	}

	fn on_message(&mut self, conn_id: u64, msg: ClientMessage) {
		let Some(active) = self.active.as_mut() else {
			return;
		};

		match active.session.submit(conn_id, msg) {
			Ok(Some((slot, submitted))) => match submitted.timing {
				Timing::OnTime => {}
				Timing::Late { by } => {
					debug!(conn_id, slot, by, target_frame = submitted.target_frame, "late message moved up");
				}
				Timing::Early { by } => {
					debug!(conn_id, slot, by, target_frame = submitted.target_frame, "early message clamped");
				}
			},
			Ok(None) => {}
			Err(e) => {
				metrics::counter!("tickrelay_flood_kicks_total").increment(1);
				warn!(conn_id, error = %e, "closing client for queueing too many commands");
				self.release(conn_id, &CloseReason::Sync(e));
			}
		}
	}

	/// Free the slot held by `conn_id`; ends the session once nobody is left.
	fn release(&mut self, conn_id: u64, reason: &CloseReason) {
		let Some(active) = self.active.as_mut() else {
			return;
		};
		let Some(slot) = active.session.remove(conn_id) else {
			return;
		};

		let occupied = active.session.occupied();
		self.stats.set_active_clients(occupied);
		info!(conn_id, slot, occupied, reason = %reason, "client left");

		if occupied == 0 {
			self.end_session("all clients disconnected");
		}
	}

	fn tick(&mut self) {
		let timeout_ticks = self.settings.timeout_ticks();
		let period = self.settings.tick_period();
		let Some(active) = self.active.as_mut() else {
			return;
		};

		let outcome = active.session.tick(timeout_ticks);
		metrics::counter!("tickrelay_ticks_total").increment(1);
		self.stats.ticks.fetch_add(1, Ordering::Relaxed);
		self.stats.session_frame.store(active.session.frame(), Ordering::Relaxed);
		trace!(
			frame = outcome.frame,
			client_count = outcome.client_count,
			delivered = outcome.delivered,
			packet_len = outcome.packet_len,
			"tick"
		);

		for ev in &outcome.evicted {
			metrics::counter!("tickrelay_timeouts_total").increment(1);
			warn!(
				conn_id = ev.conn_id,
				slot = ev.slot,
				missed_ticks = ev.missed_ticks,
				"closed client for not completing any messages"
			);
		}

		let occupied = active.session.occupied();
		if !outcome.evicted.is_empty() {
			self.stats.set_active_clients(occupied);
		}
		if occupied == 0 {
			self.end_session("no clients left");
			return;
		}

		let now = Instant::now();
		let next = active.next_tick + period;
		active.next_tick = if next <= now {
			metrics::counter!("tickrelay_missed_ticks_total").increment(1);
			warn!(
				frame = outcome.frame,
				behind_ms = now.duration_since(next).as_millis() as u64,
				"missed a tick"
			);
			now
		} else {
			next
		};
	}

	fn end_session(&mut self, reason: &'static str) {
		let Some(mut active) = self.active.take() else {
			return;
		};

		active.session.close_all();
		self.stats.set_active_clients(0);
		self.stats.session_active.store(false, Ordering::Relaxed);
		self.stats.session_frame.store(0, Ordering::Relaxed);
		info!(frame = active.session.frame(), reason, "session ended");
	}
}

async fn wait_for_tick(deadline: Option<Instant>) {
	match deadline {
		Some(at) => sleep_until(at).await,
		None => std::future::pending().await,
	}
}

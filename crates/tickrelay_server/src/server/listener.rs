#![forbid(unsafe_code)]

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::server::relay::RelayEvent;

const LISTEN_BACKLOG: i32 = 1024;

/// Bind the relay's TCP listener.
///
/// Without an explicit address this listens on `[::]` with `IPV6_V6ONLY`
/// cleared, so IPv4 peers arrive as mapped addresses. Hosts without IPv6
/// fall back to `0.0.0.0`. Must be called inside a tokio runtime.
pub fn bind_listener(bind_ip: Option<IpAddr>, port: u16) -> io::Result<TcpListener> {
	if let Some(ip) = bind_ip {
		return bind(SocketAddr::new(ip, port));
	}

	match bind(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port)) {
		Ok(listener) => Ok(listener),
		Err(e) => {
			warn!(error = %e, port, "ipv6 bind failed; falling back to ipv4 only");
			bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
		}
	}
}

fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
	let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
	if addr.is_ipv6() && addr.ip().is_unspecified() {
		socket.set_only_v6(false)?;
	}
	socket.set_reuse_address(true)?;
	socket.bind(&addr.into())?;
	socket.listen(LISTEN_BACKLOG)?;
	socket.set_nonblocking(true)?;
	TcpListener::from_std(socket.into())
}

pub(crate) async fn accept_loop(listener: TcpListener, events: mpsc::UnboundedSender<RelayEvent>) {
	loop {
		match listener.accept().await {
			Ok((stream, peer)) => {
				if let Err(e) = stream.set_nodelay(true) {
					debug!(%peer, error = %e, "failed to disable nagle");
				}
				if events.send(RelayEvent::Accepted { stream, peer }).is_err() {
					return;
				}
			}
			Err(e) => {
				warn!(error = %e, "accept failed");
				tokio::time::sleep(Duration::from_millis(50)).await;
			}
		}
	}
}

//! Tokio socket driver for the sans-IO endpoints.
//!
//! Every protocol state machine in this crate exposes the same four
//! entry points; [`Endpoint`] names them and [`UdpDriver`] runs one
//! endpoint over one UDP socket: receive, dispatch, flush, sleep until
//! the next deadline.  Sends are best-effort: a full socket surfaces as
//! `WouldBlock` and the driver re-arms on writable.

use parking_lot::Mutex;
use tokio::net::UdpSocket;

use std::{io, net::SocketAddr, sync::Arc, time::Instant};

use crate::{
    Transmit,
    discovery::StunDiscovery,
    requester::RequesterManager,
    rudp::{CredentialProvider, RudpListener},
    turn::TurnClient,
};

/// The sans-IO surface a driver needs.
pub trait Endpoint: Send {
    /// returns true when the packet belonged to this endpoint.
    fn handle_input(&mut self, from: SocketAddr, bytes: &[u8], now: Instant) -> bool;
    fn handle_timeout(&mut self, now: Instant);
    fn poll_transmit(&mut self) -> Option<Transmit>;
    fn poll_timeout(&self) -> Option<Instant>;
}

impl Endpoint for TurnClient {
    fn handle_input(&mut self, from: SocketAddr, bytes: &[u8], now: Instant) -> bool {
        TurnClient::handle_input(self, from, bytes, now)
    }

    fn handle_timeout(&mut self, now: Instant) {
        TurnClient::handle_timeout(self, now)
    }

    fn poll_transmit(&mut self) -> Option<Transmit> {
        TurnClient::poll_transmit(self)
    }

    fn poll_timeout(&self) -> Option<Instant> {
        TurnClient::poll_timeout(self)
    }
}

impl<T: CredentialProvider + Send> Endpoint for RudpListener<T> {
    fn handle_input(&mut self, from: SocketAddr, bytes: &[u8], now: Instant) -> bool {
        RudpListener::handle_input(self, from, bytes, now)
    }

    fn handle_timeout(&mut self, now: Instant) {
        RudpListener::handle_timeout(self, now)
    }

    fn poll_transmit(&mut self) -> Option<Transmit> {
        RudpListener::poll_transmit(self)
    }

    fn poll_timeout(&self) -> Option<Instant> {
        RudpListener::poll_timeout(self)
    }
}

impl Endpoint for StunDiscovery {
    fn handle_input(&mut self, from: SocketAddr, bytes: &[u8], now: Instant) -> bool {
        // discovery receives through the process-wide requester
        // registry.
        RequesterManager::global().handle_packet(from, bytes, now)
    }

    fn handle_timeout(&mut self, now: Instant) {
        StunDiscovery::handle_timeout(self, now)
    }

    fn poll_transmit(&mut self) -> Option<Transmit> {
        StunDiscovery::poll_transmit(self)
    }

    fn poll_timeout(&self) -> Option<Instant> {
        StunDiscovery::poll_timeout(self)
    }
}

pub struct UdpDriver<E> {
    socket: UdpSocket,
    endpoint: Arc<Mutex<E>>,
}

impl<E: Endpoint> UdpDriver<E> {
    pub fn new(socket: UdpSocket, endpoint: Arc<Mutex<E>>) -> Self {
        Self { socket, endpoint }
    }

    /// shared handle for the application side of the endpoint.
    pub fn endpoint(&self) -> Arc<Mutex<E>> {
        self.endpoint.clone()
    }

    /// Drive the endpoint until the task is dropped or the socket
    /// fails.
    pub async fn run(self) -> io::Result<()> {
        let mut buf = vec![0u8; 2048];

        loop {
            self.flush().await?;

            let deadline = { self.endpoint.lock().poll_timeout() };
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    let (size, from) = received?;
                    let now = Instant::now();
                    if !self.endpoint.lock().handle_input(from, &buf[..size], now) {
                        log::trace!("driver: unclaimed packet from {from}");
                    }
                }
                _ = sleep_until(deadline) => {
                    self.endpoint.lock().handle_timeout(Instant::now());
                }
            }
        }
    }

    async fn flush(&self) -> io::Result<()> {
        loop {
            // never hold the endpoint lock across an await point.
            let Some(transmit) = ({ self.endpoint.lock().poll_transmit() }) else {
                return Ok(());
            };

            loop {
                match self
                    .socket
                    .try_send_to(&transmit.payload, transmit.destination)
                {
                    Ok(_) => break,
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        self.socket.writable().await?;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

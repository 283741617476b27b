//! A [`Flow`] is the proxy's per-client session object: one client
//! endpoint bound to one upstream socket, pumping payloads both ways
//! through the [`crate::mutator`].

use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use raknet_wire::AddressTemplate;
use tokio::{net::UdpSocket, sync::mpsc};

use crate::mutator;

/// Bound on the client->server inbound queue. A larger bound absorbs a
/// short burst before the dispatcher has to apply backpressure.
pub const INBOUND_QUEUE_CAPACITY: usize = 64;

/// How long the dispatcher waits for room in a flow's inbound queue
/// before dropping the datagram instead of stalling every other flow.
pub const INBOUND_SEND_TIMEOUT: Duration = Duration::from_millis(50);

/// Maximum RakNet/UDP datagram size this proxy handles.
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// A live association between one client endpoint and the upstream
/// server.
pub struct Flow {
    /// External endpoint of the client, as observed on the listen socket.
    pub client_endpoint: SocketAddr,
    /// Address of the upstream server this flow was dialed to.
    pub server_addr: SocketAddr,
    /// Upstream socket, connected to the server. Exclusively owned by
    /// this flow; no other flow reads or writes it.
    upstream_socket: UdpSocket,
    /// Listen socket, shared read/write across all flows. Owned by the
    /// dispatcher; the flow only ever writes to it.
    listen_socket: Arc<UdpSocket>,

    /// Address template of the client endpoint, substituted into
    /// server->client control packets.
    client_template: AddressTemplate,
    /// Address template of the upstream server, substituted into
    /// client->server control packets.
    server_template: AddressTemplate,
    /// Local endpoint of `upstream_socket` - what the server sees as
    /// the client. Precomputed alongside the other templates; not read
    /// by the mutator, whose rewrite targets are the real client/server
    /// endpoints rather than the proxy's own.
    #[allow(dead_code)]
    proxy_as_client_template: AddressTemplate,
    /// The proxy's public listen endpoint - what the client perceives
    /// as the server. Same note as above.
    #[allow(dead_code)]
    proxy_as_server_template: AddressTemplate,

    inbound_tx: mpsc::Sender<Vec<u8>>,
    close_tx: mpsc::Sender<()>,
    last_activity_millis: AtomicU64,
}

/// The receiving halves of a [`Flow`]'s channels, handed to its event
/// loop. Kept separate from `Flow` itself since a `Receiver` can't be
/// shared the way the `Arc<Flow>` stored in the dispatcher's table is.
pub struct FlowChannels {
    pub inbound_rx: mpsc::Receiver<Vec<u8>>,
    pub close_rx: mpsc::Receiver<()>,
}

impl Flow {
    /// Dials a connected UDP socket to the server and builds a new flow.
    /// Dial failure is the only terminal error in flow creation; the
    /// caller is expected to drop the triggering datagram and continue
    /// serving other flows.
    pub async fn connect(
        client_endpoint: SocketAddr,
        server_addr: SocketAddr,
        proxy_bind_addr: &str,
        listen_socket: Arc<UdpSocket>,
        proxy_as_server_template: AddressTemplate,
    ) -> io::Result<(Arc<Flow>, FlowChannels)> {
        let upstream_socket = UdpSocket::bind(proxy_bind_addr).await?;
        upstream_socket.connect(server_addr).await?;
        let proxy_as_client_addr = upstream_socket.local_addr()?;

        let client_template = AddressTemplate::from_socket_addr(client_endpoint)
            .unwrap_or_else(|| AddressTemplate::encode(std::net::Ipv4Addr::UNSPECIFIED, 0));
        let server_template = AddressTemplate::from_socket_addr(server_addr)
            .unwrap_or_else(|| AddressTemplate::encode(std::net::Ipv4Addr::UNSPECIFIED, 0));
        let proxy_as_client_template = AddressTemplate::from_socket_addr(proxy_as_client_addr)
            .unwrap_or_else(|| AddressTemplate::encode(std::net::Ipv4Addr::UNSPECIFIED, 0));

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        let (close_tx, close_rx) = mpsc::channel(1);

        let flow = Arc::new(Flow {
            client_endpoint,
            server_addr,
            upstream_socket,
            listen_socket,
            client_template,
            server_template,
            proxy_as_client_template,
            proxy_as_server_template,
            inbound_tx,
            close_tx,
            last_activity_millis: AtomicU64::new(now_millis()),
        });
        Ok((flow, FlowChannels { inbound_rx, close_rx }))
    }

    /// Enqueues a client->server payload, dropping it (and logging at
    /// debug level) if the queue stays full past
    /// [`INBOUND_SEND_TIMEOUT`]. Never blocks the dispatcher for longer
    /// than that bound.
    pub async fn enqueue_from_client(&self, payload: Vec<u8>) {
        match tokio::time::timeout(INBOUND_SEND_TIMEOUT, self.inbound_tx.send(payload)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                log::debug!(
                    "{} inbound queue closed, flow is shutting down",
                    self.debug_prefix()
                );
            }
            Err(_) => {
                log::debug!(
                    "{} inbound queue full, dropping datagram",
                    self.debug_prefix()
                );
            }
        }
    }

    /// Requests the flow's event loop to stop. Idempotent: sending to a
    /// closed channel is simply ignored.
    pub fn request_close(&self) {
        let _ = self.close_tx.try_send(());
    }

    /// Whether the flow has seen no traffic in either direction for
    /// longer than `idle_timeout`.
    pub fn is_idle(&self, idle_timeout: Duration) -> bool {
        let last = self.last_activity_millis.load(Ordering::Relaxed);
        now_millis().saturating_sub(last) >= idle_timeout.as_millis() as u64
    }

    fn touch(&self) {
        self.last_activity_millis.store(now_millis(), Ordering::Relaxed);
    }

    fn debug_prefix(&self) -> String {
        format!("[client {} <-> server {}]", self.client_endpoint, self.server_addr)
    }

    /// Runs the flow's event loop until closed. Multiplexes the two
    /// directions - draining `inbound_rx` and forwarding to the server,
    /// and reading the upstream socket directly and forwarding to the
    /// client - onto a single task via `select!`. Each direction stays
    /// strictly FIFO since it is driven by exactly one consumer.
    pub async fn run_event_loop(self: Arc<Self>, mut channels: FlowChannels) {
        let mut upstream_buf = [0u8; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                _ = channels.close_rx.recv() => {
                    log::debug!("{} closing", self.debug_prefix());
                    break;
                }
                maybe_payload = channels.inbound_rx.recv() => {
                    match maybe_payload {
                        Some(payload) => self.handle_client_payload(payload).await,
                        None => break,
                    }
                }
                res = self.upstream_socket.recv(&mut upstream_buf) => {
                    match res {
                        Ok(len) => self.handle_server_payload(&upstream_buf[..len]).await,
                        Err(err) => {
                            log::debug!("{} error reading from upstream: {:?}", self.debug_prefix(), err);
                        }
                    }
                }
            }
        }
    }

    /// C-reader: applies the client-side mutation and writes to the
    /// upstream socket.
    async fn handle_client_payload(&self, mut payload: Vec<u8>) {
        self.touch();
        if mutator::mutate_client_to_server(&mut payload, &self.server_template) == mutator::Outcome::Drop {
            return;
        }
        if let Err(err) = self.upstream_socket.send(&payload).await {
            log::debug!("{} error writing to upstream: {:?}", self.debug_prefix(), err);
        }
    }

    /// S-reader: applies the server-side mutation and writes back to
    /// the listen socket, addressed to the client.
    async fn handle_server_payload(&self, payload: &[u8]) {
        self.touch();
        let mut payload = payload.to_vec();
        if mutator::mutate_server_to_client(&mut payload, &self.client_template) == mutator::Outcome::Drop {
            return;
        }
        if let Err(err) = self.listen_socket.send_to(&payload, self.client_endpoint).await {
            log::debug!("{} error writing to client: {:?}", self.debug_prefix(), err);
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn idle_flow_is_detected_after_timeout() {
        let listen_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let server_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server_socket.local_addr().unwrap();
        let proxy_as_server =
            AddressTemplate::from_socket_addr(listen_socket.local_addr().unwrap()).unwrap();

        let (flow, _channels) = Flow::connect(
            "127.0.0.1:55000".parse().unwrap(),
            server_addr,
            "127.0.0.1:0",
            listen_socket,
            proxy_as_server,
        )
        .await
        .unwrap();

        assert!(!flow.is_idle(Duration::from_secs(60)));
        assert!(flow.is_idle(Duration::from_millis(0)));
    }
}

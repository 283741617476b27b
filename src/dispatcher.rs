//! Owns the listening UDP socket and demultiplexes inbound client
//! datagrams to per-client [`Flow`]s, creating them lazily.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use raknet_wire::AddressTemplate;
use tokio::{net::UdpSocket, sync::RwLock};

use crate::flow::{Flow, MAX_DATAGRAM_SIZE};

/// Address flows dial their upstream socket from. `0:0` lets the OS pick
/// an ephemeral port.
const FLOW_BIND_ADDR: &str = "0.0.0.0:0";

pub struct Dispatcher {
    /// Listening socket, shared read/write across all flows.
    listen_socket: Arc<UdpSocket>,
    /// Active flows, keyed by the client's full (IP, port) endpoint -
    /// never by port alone, since two clients behind the same NAT can
    /// share a port number over time but never the same full endpoint.
    flows: RwLock<HashMap<SocketAddr, Arc<Flow>>>,

    server_addr: SocketAddr,
    proxy_as_server_template: AddressTemplate,
    idle_timeout: Duration,
    gc_interval: Duration,
}

impl Dispatcher {
    /// Binds the listening socket. The dispatcher lives for the process
    /// lifetime once bound.
    pub async fn bind(
        listen_addr: SocketAddr,
        server_addr: SocketAddr,
        proxy_as_server_template: AddressTemplate,
        idle_timeout: Duration,
        gc_interval: Duration,
    ) -> std::io::Result<Arc<Dispatcher>> {
        let listen_socket = Arc::new(UdpSocket::bind(listen_addr).await?);
        Ok(Arc::new(Dispatcher {
            listen_socket,
            flows: RwLock::new(HashMap::new()),
            server_addr,
            proxy_as_server_template,
            idle_timeout,
            gc_interval,
        }))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listen_socket.local_addr()
    }

    /// Runs the dispatch loop. Returns only on a fatal listen-socket
    /// error - everything else (dial failures, short packets, per-flow
    /// I/O errors) is handled locally and logged.
    ///
    /// A single task drives this loop: looking up (or creating) a flow
    /// and enqueuing the datagram both happen inline, never in a
    /// spawned task, so two datagrams from the same client are always
    /// enqueued in the order they were received. Only a flow's own
    /// event loop runs as a separate task.
    pub async fn run(self: Arc<Self>) -> std::io::Result<()> {
        log::info!(
            "Listening on {}, proxying to {}",
            self.listen_socket.local_addr()?,
            self.server_addr
        );
        tokio::spawn(self.clone().run_idle_gc());

        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, client_endpoint) = self.listen_socket.recv_from(&mut buf).await?;
            let payload = buf[..len].to_vec();
            self.handle_datagram(client_endpoint, payload).await;
        }
    }

    async fn handle_datagram(self: &Arc<Self>, client_endpoint: SocketAddr, payload: Vec<u8>) {
        let existing = {
            let flows = self.flows.read().await;
            flows.get(&client_endpoint).cloned()
        };
        let flow = match existing {
            Some(flow) => flow,
            None => match self.create_flow(client_endpoint).await {
                Ok(flow) => flow,
                Err(err) => {
                    log::debug!(
                        "[{}] unable to dial upstream {}: {:?}",
                        client_endpoint,
                        self.server_addr,
                        err
                    );
                    return;
                }
            },
        };
        flow.enqueue_from_client(payload).await;
    }

    /// Creates and inserts a new flow for `client_endpoint`, spawning
    /// its event loop. The caller is responsible for not racing this
    /// with another creation for the same endpoint; the write lock held
    /// for the whole insert makes that safe.
    async fn create_flow(self: &Arc<Self>, client_endpoint: SocketAddr) -> std::io::Result<Arc<Flow>> {
        let mut flows = self.flows.write().await;
        if let Some(flow) = flows.get(&client_endpoint) {
            return Ok(flow.clone());
        }
        let (flow, channels) = Flow::connect(
            client_endpoint,
            self.server_addr,
            FLOW_BIND_ADDR,
            self.listen_socket.clone(),
            self.proxy_as_server_template,
        )
        .await?;
        flows.insert(client_endpoint, flow.clone());
        log::debug!(
            "[{}] flow created, {} total",
            client_endpoint,
            flows.len()
        );

        let dispatcher = self.clone();
        let flow_for_task = flow.clone();
        tokio::spawn(async move {
            flow_for_task.clone().run_event_loop(channels).await;
            let mut flows = dispatcher.flows.write().await;
            if let Some(current) = flows.get(&client_endpoint) {
                if Arc::ptr_eq(current, &flow_for_task) {
                    flows.remove(&client_endpoint);
                }
            }
            log::debug!("[{}] flow closed, {} total", client_endpoint, flows.len());
        });
        Ok(flow)
    }

    /// Periodically sweeps the flow table for flows idle past
    /// `idle_timeout` and asks them to close. Without this, a client
    /// that disappears without a clean disconnect would leak its flow
    /// and upstream socket for the life of the process.
    async fn run_idle_gc(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.gc_interval);
        loop {
            ticker.tick().await;
            let idle: Vec<SocketAddr> = {
                let flows = self.flows.read().await;
                flows
                    .iter()
                    .filter(|(_, flow)| flow.is_idle(self.idle_timeout))
                    .map(|(addr, _)| *addr)
                    .collect()
            };
            for addr in idle {
                let flow = {
                    let flows = self.flows.read().await;
                    flows.get(&addr).cloned()
                };
                if let Some(flow) = flow {
                    log::debug!("[{}] idle for >= {:?}, closing", addr, self.idle_timeout);
                    flow.request_close();
                }
            }
        }
    }

    /// Number of active flows. Used by tests and could back a status
    /// command in the future.
    pub async fn flow_count(&self) -> usize {
        self.flows.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    async fn spawn_echo_server() -> (Arc<UdpSocket>, SocketAddr) {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        let echo = socket.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 65535];
            loop {
                let (len, from) = match echo.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(_) => return,
                };
                let _ = echo.send_to(&buf[..len], from).await;
            }
        });
        (socket, addr)
    }

    #[tokio::test]
    async fn two_clients_get_two_distinct_flows() {
        let (_server_socket, server_addr) = spawn_echo_server().await;
        let proxy_template = AddressTemplate::encode(Ipv4Addr::new(10, 0, 0, 1), 19132);
        let dispatcher = Dispatcher::bind(
            "127.0.0.1:0".parse().unwrap(),
            server_addr,
            proxy_template,
            Duration::from_secs(60),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        let listen_addr = dispatcher.local_addr().unwrap();

        let client_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let dispatcher_run = dispatcher.clone();
        tokio::spawn(async move {
            let _ = dispatcher_run.run().await;
        });

        client_a.send_to(&[0x84, 1], listen_addr).await.unwrap();
        client_b.send_to(&[0x84, 2], listen_addr).await.unwrap();

        let mut buf = [0u8; 16];
        let (len, from) = tokio::time::timeout(Duration::from_secs(2), client_a.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], &[0x84, 1]);
        assert_eq!(from, listen_addr);

        let (len, _from) = tokio::time::timeout(Duration::from_secs(2), client_b.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], &[0x84, 2]);

        // give the dispatcher a moment to have registered both flows
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dispatcher.flow_count().await, 2);
    }

    #[tokio::test]
    async fn datagrams_are_delivered_in_order_per_direction() {
        let (_server_socket, server_addr) = spawn_echo_server().await;
        let proxy_template = AddressTemplate::encode(Ipv4Addr::new(10, 0, 0, 1), 19132);
        let dispatcher = Dispatcher::bind(
            "127.0.0.1:0".parse().unwrap(),
            server_addr,
            proxy_template,
            Duration::from_secs(60),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        let listen_addr = dispatcher.local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let dispatcher_run = dispatcher.clone();
        tokio::spawn(async move {
            let _ = dispatcher_run.run().await;
        });

        const COUNT: u16 = 1000;
        for i in 0..COUNT {
            let [hi, lo] = i.to_be_bytes();
            client.send_to(&[0x84, hi, lo], listen_addr).await.unwrap();
        }

        let mut buf = [0u8; 16];
        for i in 0..COUNT {
            let (len, _from) =
                tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
                    .await
                    .unwrap()
                    .unwrap();
            let [hi, lo] = i.to_be_bytes();
            assert_eq!(&buf[..len], &[0x84, hi, lo], "datagram {i} out of order");
        }
    }
}

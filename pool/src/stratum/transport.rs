/// Stratum transport - TCP accept loop and newline-delimited JSON framing
///
/// Handles:
/// - Listener setup (SO_REUSEADDR)
/// - One reader task per connection, started on `accept`
/// - Bounded-time writes, optionally tolerant of gone or stalled peers
/// - Exactly one `Closed` event per connection, whatever ended it

use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use super::connection::Connection;
use crate::error::{PoolError, Result};
use crate::jobs::next_connection_id;
use crate::metrics::prometheus as metrics;

pub const WRITE_TIMEOUT: Duration = Duration::from_secs(2);
pub const MAX_LINE_LENGTH: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected { connection_id: String, peer_addr: SocketAddr },
    /// A line that parsed as JSON
    Message { connection_id: String, message: Value },
    /// A line that did not parse, or exceeded the line limit
    Raw { connection_id: String, line: String },
    Closed { connection_id: String },
}

impl TransportEvent {
    pub fn connection_id(&self) -> &str {
        match self {
            Self::Connected { connection_id, .. }
            | Self::Message { connection_id, .. }
            | Self::Raw { connection_id, .. }
            | Self::Closed { connection_id } => connection_id,
        }
    }
}

pub struct Transport {
    local_addr: SocketAddr,
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    write_timeout: Duration,
    cancel: CancellationToken,
}

impl Transport {
    /// Bind and start accepting. Connections are reported through the
    /// returned receiver.
    pub async fn start(
        bind_ip: IpAddr,
        port: u16,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>)> {
        Self::start_with_write_timeout(bind_ip, port, WRITE_TIMEOUT).await
    }

    pub async fn start_with_write_timeout(
        bind_ip: IpAddr,
        port: u16,
        write_timeout: Duration,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>)> {
        let addr = SocketAddr::new(bind_ip, port);
        let listener = bind(addr).map_err(|source| PoolError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        let local_addr = listener.local_addr()?;

        tracing::info!("Stratum server listening on {} (SO_REUSEADDR)", local_addr);

        let (events, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            local_addr,
            connections: RwLock::new(HashMap::new()),
            events,
            write_timeout,
            cancel: CancellationToken::new(),
        });

        let server = Arc::clone(&transport);
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = server.cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };

                match accepted {
                    Ok((socket, peer_addr)) => server.register(socket, peer_addr).await,
                    Err(e) => tracing::error!("Failed to accept connection: {}", e),
                }
            }
            tracing::info!("Stratum listener on {} stopped", server.local_addr);
        });

        Ok((transport, rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn register(self: &Arc<Self>, socket: TcpStream, peer_addr: SocketAddr) {
        let _ = socket.set_nodelay(true);
        let connection_id = next_connection_id();
        let (reader, writer) = socket.into_split();
        let (connection, resumed) = Connection::new(connection_id.clone(), peer_addr, writer);
        let connection = Arc::new(connection);
        let cancel = connection.cancel_token();

        self.connections
            .write()
            .await
            .insert(connection_id.clone(), Arc::clone(&connection));
        metrics::inc_connections();

        tracing::debug!("New connection from {}: {}", peer_addr, connection_id);

        let _ = self.events.send(TransportEvent::Connected {
            connection_id: connection_id.clone(),
            peer_addr,
        });

        let transport = Arc::clone(self);
        tokio::spawn(async move {
            let started = tokio::select! {
                _ = cancel.cancelled() => false,
                r = resumed => r.is_ok(),
            };

            if started {
                let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
                loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => break,
                        next = lines.next() => next,
                    };

                    match next {
                        Some(Ok(line)) => {
                            let line = line.trim();
                            if line.is_empty() {
                                continue;
                            }
                            tracing::trace!("Received from {}: {}", connection_id, line);
                            let event = match serde_json::from_str::<Value>(line) {
                                Ok(message) => TransportEvent::Message {
                                    connection_id: connection_id.clone(),
                                    message,
                                },
                                Err(_) => TransportEvent::Raw {
                                    connection_id: connection_id.clone(),
                                    line: line.to_string(),
                                },
                            };
                            let _ = transport.events.send(event);
                        }
                        Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                            let _ = transport.events.send(TransportEvent::Raw {
                                connection_id: connection_id.clone(),
                                line: String::new(),
                            });
                        }
                        Some(Err(LinesCodecError::Io(e))) => {
                            tracing::debug!("Read error from {}: {}", connection_id, e);
                            break;
                        }
                        None => break,
                    }
                }
            }

            transport.teardown(&connection_id).await;
            let _ = transport.events.send(TransportEvent::Closed { connection_id });
        });
    }

    async fn teardown(&self, connection_id: &str) {
        let removed = self.connections.write().await.remove(connection_id);
        if let Some(connection) = removed {
            connection.close().await;
        }
        metrics::dec_connections();
    }

    /// Resume reading on a paused connection.
    pub async fn accept(&self, connection_id: &str) -> bool {
        match self.connections.read().await.get(connection_id) {
            Some(connection) => {
                connection.resume();
                true
            }
            None => false,
        }
    }

    /// Serialize `message` as one JSON line and write it.
    ///
    /// A missing connection or a write that does not finish within the
    /// write timeout is a no-op when `tolerant`, and a `Write` error
    /// otherwise.
    pub async fn write<T: Serialize>(&self, connection_id: &str, message: &T, tolerant: bool) -> Result<()> {
        let connection = self.connections.read().await.get(connection_id).cloned();
        let Some(connection) = connection else {
            return if tolerant {
                Ok(())
            } else {
                Err(PoolError::Write(connection_id.to_string()))
            };
        };

        let mut payload = serde_json::to_string(message)?;
        tracing::debug!("Sending to {}: {}", connection_id, payload);
        payload.push('\n');

        match tokio::time::timeout(self.write_timeout, connection.send(payload.as_bytes())).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                tracing::debug!("Write to {} failed: {}", connection_id, e);
                if tolerant {
                    Ok(())
                } else {
                    Err(PoolError::Write(connection_id.to_string()))
                }
            }
            Err(_) => {
                tracing::debug!("Write to {} timed out", connection_id);
                if tolerant {
                    Ok(())
                } else {
                    Err(PoolError::Write(connection_id.to_string()))
                }
            }
        }
    }

    /// Close and forget a connection. Returns false if it was already gone.
    pub async fn hangup(&self, connection_id: &str) -> bool {
        let removed = self.connections.write().await.remove(connection_id);
        match removed {
            Some(connection) => {
                tracing::debug!("Hanging up {} ({})", connection_id, connection.peer_addr);
                connection.close().await;
                true
            }
            None => false,
        }
    }

    pub async fn connected(&self, connection_id: &str) -> bool {
        self.connections.read().await.contains_key(connection_id)
    }

    /// Stop accepting and close every connection.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let all: Vec<Arc<Connection>> = self.connections.read().await.values().cloned().collect();
        for connection in all {
            connection.close().await;
        }
    }
}

fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&socket2::SockAddr::from(addr))?;
    socket.listen(1024)?;
    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    async fn started() -> (Arc<Transport>, mpsc::UnboundedReceiver<TransportEvent>) {
        Transport::start("127.0.0.1".parse().unwrap(), 0).await.unwrap()
    }

    #[tokio::test]
    async fn bind_conflict_is_a_bind_error() {
        let (t, _rx) = started().await;
        let taken = t.local_addr().port();
        assert_ne!(taken, 0);
        let err = Transport::start("127.0.0.1".parse().unwrap(), taken).await;
        assert!(matches!(err, Err(PoolError::Bind { .. })));
    }

    #[tokio::test]
    async fn paused_until_accepted_then_frames_lines() {
        let (t, mut rx) = started().await;
        let mut client = TcpStream::connect(t.local_addr()).await.unwrap();

        let id = match next_event(&mut rx).await {
            TransportEvent::Connected { connection_id, .. } => connection_id,
            other => panic!("unexpected {:?}", other),
        };

        client.write_all(b"{\"a\":1}\nnot json\n\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        assert!(t.accept(&id).await);
        match next_event(&mut rx).await {
            TransportEvent::Message { message, .. } => assert_eq!(message, json!({"a": 1})),
            other => panic!("unexpected {:?}", other),
        }
        match next_event(&mut rx).await {
            TransportEvent::Raw { line, .. } => assert_eq!(line, "not json"),
            other => panic!("unexpected {:?}", other),
        }

        drop(client);
        assert!(matches!(next_event(&mut rx).await, TransportEvent::Closed { .. }));
        assert!(!t.connected(&id).await);
        assert!(!t.accept(&id).await);
    }

    #[tokio::test]
    async fn write_and_hangup() {
        let (t, mut rx) = started().await;
        let client = TcpStream::connect(t.local_addr()).await.unwrap();
        let id = next_event(&mut rx).await.connection_id().to_string();
        t.accept(&id).await;

        t.write(&id, &json!({"hello": "world"}), false).await.unwrap();
        let mut reader = BufReader::new(client);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "{\"hello\":\"world\"}\n");

        assert!(t.hangup(&id).await);
        assert!(!t.hangup(&id).await);
        assert!(matches!(next_event(&mut rx).await, TransportEvent::Closed { .. }));
        // exactly one close
        assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv()).await.is_err());

        assert!(t.write(&id, &json!({}), true).await.is_ok());
        assert!(matches!(t.write(&id, &json!({}), false).await, Err(PoolError::Write(_))));
    }

    #[tokio::test]
    async fn stalled_peer_times_out_writes() {
        let (t, mut rx) = Transport::start_with_write_timeout("127.0.0.1".parse().unwrap(), 0, Duration::from_millis(100))
            .await
            .unwrap();
        // never reads, so the socket buffers fill up
        let _client = TcpStream::connect(t.local_addr()).await.unwrap();
        let id = next_event(&mut rx).await.connection_id().to_string();
        t.accept(&id).await;

        let chunk = json!({ "fill": "x".repeat(1 << 20) });
        let mut stalled = false;
        for _ in 0..256 {
            if matches!(t.write(&id, &chunk, false).await, Err(PoolError::Write(_))) {
                stalled = true;
                break;
            }
        }
        assert!(stalled);

        assert!(t.write(&id, &chunk, true).await.is_ok());
        assert!(t.connected(&id).await);
    }
}

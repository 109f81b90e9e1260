use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use health::HealthHandle;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::shutdown::ShutdownRx;

use super::{frame, InputShared};

/// Stream ingest, shared by UNIX-stream and local-TCP inputs. Each
/// accepted connection gets its own task that reassembles length-prefixed
/// frames; a connection closes on EOF, malformed framing, or shutdown.
pub enum StreamListener {
    Unix { listener: UnixListener, path: PathBuf },
    Tcp(TcpListener),
}

impl StreamListener {
    pub fn bind_unix(path: &Path) -> anyhow::Result<StreamListener> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))?;
        info!(path = %path.display(), "stream input listening");
        Ok(StreamListener::Unix {
            listener,
            path: path.to_owned(),
        })
    }

    pub async fn bind_tcp(port: u16) -> anyhow::Result<StreamListener> {
        // Local clients only; Dory is not a network-facing ingest.
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        info!(port, "tcp input listening");
        Ok(StreamListener::Tcp(listener))
    }

    async fn accept(&self) -> std::io::Result<StreamConn> {
        match self {
            StreamListener::Unix { listener, .. } => {
                listener.accept().await.map(|(s, _)| StreamConn::Unix(s))
            }
            StreamListener::Tcp(listener) => {
                listener.accept().await.map(|(s, _)| StreamConn::Tcp(s))
            }
        }
    }
}

enum StreamConn {
    Unix(UnixStream),
    Tcp(TcpStream),
}

pub struct StreamInputAgent {
    listener: StreamListener,
    shared: InputShared,
    health: HealthHandle,
}

impl StreamInputAgent {
    pub fn new(
        listener: StreamListener,
        shared: InputShared,
        health: HealthHandle,
    ) -> StreamInputAgent {
        StreamInputAgent {
            listener,
            shared,
            health,
        }
    }

    pub async fn run(self, mut shutdown: ShutdownRx) {
        let mut conns = JoinSet::new();
        let mut health_tick = tokio::time::interval(Duration::from_secs(15));

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if shutdown.borrow().is_requested() {
                        break;
                    }
                }
                _ = health_tick.tick() => self.health.report_healthy(),
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => {
                        metrics::counter!("dory_input_connections_total").increment(1);
                        let shared = self.shared.clone();
                        let shutdown = shutdown.clone();
                        conns.spawn(async move {
                            match conn {
                                StreamConn::Unix(stream) => {
                                    read_frames(stream, shared, shutdown).await
                                }
                                StreamConn::Tcp(stream) => {
                                    read_frames(stream, shared, shutdown).await
                                }
                            }
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(_) = conns.join_next(), if !conns.is_empty() => {}
            }
        }

        conns.shutdown().await;
        if let StreamListener::Unix { path, .. } = &self.listener {
            drop(std::fs::remove_file(path));
        }
        info!("stream input stopped");
    }
}

/// Reads frames off one connection until EOF, a framing error, or
/// shutdown.
async fn read_frames<S: AsyncRead + Unpin>(
    mut stream: S,
    shared: InputShared,
    mut shutdown: ShutdownRx,
) {
    let mut buf: Vec<u8> = Vec::new();

    loop {
        let mut head = [0u8; 4];
        tokio::select! {
            _ = shutdown.changed() => {
                if shutdown.borrow().is_requested() {
                    return;
                }
                continue;
            }
            read = stream.read_exact(&mut head) => {
                if read.is_err() {
                    // EOF between frames is a clean close.
                    return;
                }
            }
        }

        let size = match frame::declared_size(&head) {
            Ok(size) => size,
            Err(err) => {
                debug!(error = %err, "bad frame size on stream; closing");
                shared
                    .anomaly
                    .discard_frame(crate::anomaly::DiscardKind::Malformed, &head);
                return;
            }
        };
        if size > shared.max_msg_size {
            shared.discard_too_long(&head);
            return;
        }

        buf.resize(size, 0);
        buf[..4].copy_from_slice(&head);
        tokio::select! {
            _ = shutdown.changed() => {
                if shutdown.borrow().is_requested() {
                    return;
                }
            }
            read = stream.read_exact(&mut buf[4..]) => {
                if read.is_err() {
                    // EOF mid-frame: the client died with a partial write.
                    shared
                        .anomaly
                        .discard_frame(crate::anomaly::DiscardKind::Malformed, &buf[..4]);
                    return;
                }
            }
        }

        if !shared.process_frame(&buf).await {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use health::HealthRegistry;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    use super::*;
    use crate::anomaly::{AnomalyTracker, DiscardKind};
    use crate::msg::{Msg, MsgState, Routing};
    use crate::pool::Pool;
    use crate::shutdown;

    fn fixture() -> (InputShared, mpsc::Receiver<Msg>, Arc<AnomalyTracker>) {
        let (router_tx, router_rx) = mpsc::channel(16);
        let anomaly = Arc::new(AnomalyTracker::new());
        let shared = InputShared {
            pool: Pool::new(64, 32).unwrap(),
            anomaly: anomaly.clone(),
            router_tx,
            max_msg_size: 4096,
        };
        (shared, router_rx, anomaly)
    }

    async fn spawn_tcp_agent(
        shared: InputShared,
    ) -> (u16, tokio::task::JoinHandle<()>, shutdown::ShutdownTx) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let health = HealthRegistry::new("test").register("stream", Duration::from_secs(60));
        let agent = StreamInputAgent::new(StreamListener::Tcp(listener), shared, health);
        let (shutdown_tx, shutdown_rx) = shutdown::channel();
        let task = tokio::spawn(agent.run(shutdown_rx));
        (port, task, shutdown_tx)
    }

    #[tokio::test]
    async fn frames_flow_from_tcp_to_router() {
        let (shared, mut router_rx, _anomaly) = fixture();
        let (port, task, shutdown_tx) = spawn_tcp_agent(shared).await;

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        for value in [&b"one"[..], b"two"] {
            let data = frame::test_support::encode(Routing::AnyPartition, 1, "t", b"", value);
            client.write_all(&data).await.unwrap();
        }

        for expected in ["one", "two"] {
            let mut msg = router_rx.recv().await.unwrap();
            let value: Vec<u8> = msg.value_chunks().flatten().copied().collect();
            assert_eq!(value, expected.as_bytes());
            msg.set_state(MsgState::Processed);
        }

        shutdown_tx.send(shutdown::ShutdownSignal::Fast).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn malformed_stream_is_closed() {
        let (shared, _router_rx, anomaly) = fixture();
        let (port, task, shutdown_tx) = spawn_tcp_agent(shared).await;

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        // Negative frame size.
        client.write_all(&(-5i32).to_be_bytes()).await.unwrap();

        let mut eof = [0u8; 1];
        // The agent closes the connection on the framing error.
        assert_eq!(client.read(&mut eof).await.unwrap(), 0);
        assert_eq!(anomaly.total(DiscardKind::Malformed), 1);

        shutdown_tx.send(shutdown::ShutdownSignal::Fast).unwrap();
        task.await.unwrap();
    }
}

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use health::HealthHandle;
use tokio::net::UnixDatagram;
use tracing::{error, info};

use crate::shutdown::ShutdownRx;

use super::InputShared;

/// Usual Linux ceiling for one UNIX datagram, the cap applied when large
/// datagrams are allowed.
const LARGE_DATAGRAM_CAP: usize = 212_992;

/// UNIX-datagram ingest: one task, one socket, one message per datagram.
/// Datagram boundaries give the framing for free; a datagram longer than
/// the accepted maximum is a TooLong discard, and anything shorter than
/// its own size field is malformed.
pub struct DatagramInputAgent {
    socket: UnixDatagram,
    path: PathBuf,
    shared: InputShared,
    max_datagram_size: usize,
    health: HealthHandle,
}

impl DatagramInputAgent {
    pub fn bind(
        path: &Path,
        shared: InputShared,
        allow_large_datagrams: bool,
        health: HealthHandle,
    ) -> anyhow::Result<DatagramInputAgent> {
        // A stale socket file from a previous run would fail the bind.
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let socket = UnixDatagram::bind(path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))?;
        info!(path = %path.display(), "datagram input listening");

        let max_datagram_size = if allow_large_datagrams {
            shared.max_msg_size.max(LARGE_DATAGRAM_CAP)
        } else {
            shared.max_msg_size
        };
        Ok(DatagramInputAgent {
            socket,
            path: path.to_owned(),
            shared,
            max_datagram_size,
            health,
        })
    }

    pub async fn run(self, mut shutdown: ShutdownRx) {
        let max = self.max_datagram_size;
        // One extra byte so an oversized datagram is detectable rather
        // than silently truncated by the kernel.
        let mut buf = vec![0u8; max + 1];
        let mut health_tick = tokio::time::interval(Duration::from_secs(15));

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if shutdown.borrow().is_requested() {
                        break;
                    }
                }
                _ = health_tick.tick() => self.health.report_healthy(),
                received = self.socket.recv(&mut buf) => match received {
                    Ok(len) if len > max => {
                        self.shared.discard_too_long(&buf[..len.min(64)]);
                    }
                    Ok(len) => {
                        _ = self.shared.process_frame(&buf[..len]).await;
                    }
                    Err(err) => {
                        error!(error = %err, "datagram receive failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        drop(std::fs::remove_file(&self.path));
        info!("datagram input stopped");
    }
}

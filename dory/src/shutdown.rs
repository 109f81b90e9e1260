use tokio::sync::watch;
use tokio::time::Instant;

/// Process-wide shutdown state, fanned out through a watch channel so
/// every loop can include it in its select. Slow shutdown lets in-flight
/// messages drain until the deadline; fast shutdown drops them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Running,
    Slow { deadline: Instant },
    Fast,
}

impl ShutdownSignal {
    pub fn is_requested(&self) -> bool {
        !matches!(self, ShutdownSignal::Running)
    }

    pub fn is_fast(&self) -> bool {
        matches!(self, ShutdownSignal::Fast)
    }
}

pub type ShutdownRx = watch::Receiver<ShutdownSignal>;
pub type ShutdownTx = watch::Sender<ShutdownSignal>;

pub fn channel() -> (ShutdownTx, ShutdownRx) {
    watch::channel(ShutdownSignal::Running)
}

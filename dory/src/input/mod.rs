use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use crate::anomaly::{AnomalyTracker, DiscardKind, SAMPLE_PREFIX_BYTES};
use crate::msg::Msg;
use crate::pool::Pool;

pub mod frame;

mod datagram;
mod stream;

pub use datagram::DatagramInputAgent;
pub use stream::{StreamInputAgent, StreamListener};

/// Everything an input agent needs to turn bytes into routed work:
/// the pool for bodies, the tracker for everything that goes wrong, and
/// the router's queue.
#[derive(Clone)]
pub struct InputShared {
    pub pool: Arc<Pool>,
    pub anomaly: Arc<AnomalyTracker>,
    pub router_tx: mpsc::Sender<Msg>,
    /// Largest accepted frame, size field included.
    pub max_msg_size: usize,
}

impl InputShared {
    /// Decodes one complete frame, builds the message, and hands it to
    /// the router. Returns false when the frame was malformed and a
    /// stream carrying it cannot be trusted any further.
    pub(crate) async fn process_frame(&self, data: &[u8]) -> bool {
        let frame = match frame::decode(data) {
            Ok(frame) => frame,
            Err(err) => {
                let kind = match err {
                    frame::InputError::UnsupportedApiKey(_) => DiscardKind::UnsupportedApiKey,
                    frame::InputError::UnsupportedApiVersion { .. } => {
                        DiscardKind::UnsupportedApiVersion
                    }
                    _ => DiscardKind::Malformed,
                };
                warn!(error = %err, "discarding bad input frame");
                self.anomaly.discard_frame(kind, data);
                return false;
            }
        };

        let msg = match Msg::new(
            frame.routing,
            frame.timestamp,
            frame.topic,
            frame.key,
            frame.value,
            false,
            &self.pool,
        ) {
            Ok(msg) => msg,
            Err(_) => {
                // Pool exhaustion is backpressure, not an input error:
                // count the discard and keep reading from clients.
                self.anomaly.discard_no_mem(
                    frame.topic,
                    frame.timestamp,
                    &frame.value[..frame.value.len().min(SAMPLE_PREFIX_BYTES)],
                );
                return true;
            }
        };

        metrics::counter!("dory_input_msgs_total").increment(1);
        if let Err(send_error) = self.router_tx.send(msg).await {
            // The router is gone; the process is coming down.
            self.anomaly
                .discard_msg(send_error.0, DiscardKind::ShutdownDiscard);
        }
        true
    }

    pub(crate) fn discard_too_long(&self, frame_prefix: &[u8]) {
        self.anomaly.discard_frame(DiscardKind::TooLong, frame_prefix);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{MsgState, Routing};

    fn shared(pool_blocks: usize) -> (InputShared, mpsc::Receiver<Msg>) {
        let (router_tx, router_rx) = mpsc::channel(16);
        (
            InputShared {
                pool: Pool::new(64, pool_blocks).unwrap(),
                anomaly: Arc::new(AnomalyTracker::new()),
                router_tx,
                max_msg_size: 16 * 1024,
            },
            router_rx,
        )
    }

    #[tokio::test]
    async fn good_frame_reaches_the_router() {
        let (shared, mut router_rx) = shared(8);
        let data = frame::test_support::encode(Routing::AnyPartition, 42, "t", b"", b"payload");

        assert!(shared.process_frame(&data).await);
        let mut msg = router_rx.recv().await.unwrap();
        assert_eq!(msg.topic(), "t");
        assert_eq!(msg.timestamp(), 42);
        msg.set_state(MsgState::Processed);
    }

    #[tokio::test]
    async fn malformed_frame_counts_and_closes() {
        let (shared, _router_rx) = shared(8);
        assert!(!shared.process_frame(b"\x00\x00\x00\x02xx").await);
        assert_eq!(shared.anomaly.total(DiscardKind::Malformed), 1);
    }

    #[tokio::test]
    async fn unsupported_api_key_is_its_own_kind() {
        let (shared, _router_rx) = shared(8);
        let mut data =
            frame::test_support::encode(Routing::AnyPartition, 0, "t", b"", b"v");
        data[4..6].copy_from_slice(&999i16.to_be_bytes());

        assert!(!shared.process_frame(&data).await);
        assert_eq!(shared.anomaly.total(DiscardKind::UnsupportedApiKey), 1);
    }

    #[tokio::test]
    async fn pool_exhaustion_discards_but_keeps_the_stream() {
        // S4: pool of 2 x 64-byte blocks, three 50-byte messages.
        let (shared, mut router_rx) = shared(2);
        for _ in 0..3 {
            let data = frame::test_support::encode(
                Routing::AnyPartition,
                7,
                "events",
                b"",
                &[b'x'; 50],
            );
            assert!(shared.process_frame(&data).await);
        }

        assert_eq!(shared.anomaly.total(DiscardKind::NoMem), 1);
        let snapshot = shared.anomaly.snapshot();
        assert_eq!(snapshot.discards_by_topic.get("events"), Some(&1));

        for _ in 0..2 {
            let mut msg = router_rx.recv().await.unwrap();
            msg.set_state(MsgState::Processed);
        }
    }
}

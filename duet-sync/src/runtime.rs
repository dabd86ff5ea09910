//! Wall-clock driver for a [`CollabSession`].
//!
//! The session itself is synchronous and runs on virtual time. [`drive`]
//! maps tokio's clock onto it: inbound transport messages arrive over an
//! `mpsc` channel, the loop sleeps until the next timer is due, and local
//! operations are forwarded to the outbound channel after every step.

use std::time::Duration;

use duet_core::SceneHost;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

use crate::operation::ChangeOperation;
use crate::session::{CollabSession, WireMessage};

/// Idle wake-up interval when no timer is scheduled.
const IDLE_TICK: Duration = Duration::from_secs(60);

/// Run `session` until the inbound channel closes, then hand it back.
///
/// The periodic audit is started on entry. Messages that fail to parse are
/// logged and skipped. If the outbound receiver is dropped, local operations
/// are discarded with a warning and the loop keeps running.
pub async fn drive<H: SceneHost>(
    mut session: CollabSession<H>,
    mut inbound: mpsc::Receiver<WireMessage>,
    outbound: mpsc::Sender<ChangeOperation>,
) -> CollabSession<H> {
    let origin = Instant::now();
    let base = session.now();
    #[allow(clippy::cast_possible_truncation)]
    let elapsed = move || base + origin.elapsed().as_millis() as u64;

    session.start();
    tracing::debug!(base, "session driver started");

    loop {
        let wake_at = session
            .next_due()
            .map_or_else(|| Instant::now() + IDLE_TICK, |due| origin + Duration::from_millis(due.saturating_sub(base)));

        tokio::select! {
            message = inbound.recv() => {
                let Some(message) = message else { break };
                session.advance_to(elapsed());
                if let Err(e) = session.receive(message) {
                    tracing::warn!(error = %e, "inbound message rejected");
                }
            }
            () = sleep_until(wake_at) => {
                session.advance_to(elapsed());
            }
        }

        for op in session.take_outbound() {
            if let Err(e) = outbound.send(op).await {
                tracing::warn!(op = %e.0.kind, element_id = %e.0.element_id, "outbound channel closed, operation dropped");
            }
        }
    }

    tracing::debug!(now = session.now(), "session driver stopped");
    session
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{ChangePayload, VisualChange};
    use crate::SyncConfig;
    use duet_core::{Bounds, Element, MemoryHost};

    #[tokio::test(start_paused = true)]
    async fn test_driver_applies_inbound_and_stops_on_close() {
        let mut host = MemoryHost::new();
        host.seed(Element::shape("Task_1", Bounds::new(100.0, 100.0, 100.0, 80.0)))
            .expect("seed");
        let session = CollabSession::new(host, SyncConfig::default());
        let (in_tx, in_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);

        let feeder = async move {
            let op = ChangeOperation::update("Task_1", ChangePayload::visual(VisualChange::position(300.0, 200.0)));
            in_tx.send(WireMessage::Apply(vec![op])).await.expect("driver alive");
            tokio::time::sleep(Duration::from_millis(500)).await;
        };
        let (session, ()) = tokio::join!(drive(session, in_rx, out_tx), feeder);

        let bounds = session.host().get_element(&"Task_1".into()).expect("task").bounds;
        assert_eq!((bounds.x, bounds.y), (300.0, 200.0));
        assert!(out_rx.try_recv().is_err());
        assert!(session.now() >= 100);
    }
}

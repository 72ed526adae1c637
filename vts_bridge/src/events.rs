//! Forwards a session's pushed events into the supervisor, tagged with the
//! generation of the connection they belong to.

use crate::supervisor::Internal;
use crate::transport::SessionEvent;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

pub(crate) struct EventListener;

impl EventListener {
    /// Stops after the first disconnect, so each physical drop is reported once.
    pub(crate) fn spawn(
        generation: u64,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
        internal: mpsc::UnboundedSender<Internal>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    SessionEvent::Error { id, message } => {
                        if internal
                            .send(Internal::TransportError { generation, id, message })
                            .is_err()
                        {
                            return;
                        }
                    }
                    SessionEvent::Disconnected { reason } => {
                        let _ = internal.send(Internal::Disconnected { generation, reason });
                        return;
                    }
                }
            }
            debug!(generation, "session event stream ended");
            let _ = internal.send(Internal::Disconnected {
                generation,
                reason: "event stream ended".to_string(),
            });
        })
    }
}

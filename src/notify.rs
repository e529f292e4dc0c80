//! Status events and their fan-out.
//!
//! Components emit [`Event`]s through a [`NotificationDispatcher`], which
//! never blocks and never fails the caller. A background task forwards each
//! event to every registered [`Notifier`].

use chrono::{DateTime, Utc};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchCounts {
    pub total: usize,
    pub placed: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    SchedulerStarted {
        next_fire: DateTime<Utc>,
    },
    TokenAcquired {
        user_id: String,
    },
    TokenAcquisitionFailed {
        reason: String,
    },
    OrderPlaced {
        symbol: String,
        broker_order_id: String,
    },
    OrderFailed {
        symbol: String,
        reason: String,
    },
    BatchCompleted {
        counts: BatchCounts,
    },
}

/// A delivery channel for events. Implementations must return quickly and
/// spawn their own task for slow I/O.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &Event);
}

/// Writes every event to the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &Event) {
        match event {
            Event::SchedulerStarted { next_fire } => {
                info!(next_fire = %next_fire, "Scheduler started");
            }
            Event::TokenAcquired { user_id } => {
                info!(user_id = %user_id, "Access token acquired");
            }
            Event::TokenAcquisitionFailed { reason } => {
                warn!(reason = %reason, "Access token acquisition failed");
            }
            Event::OrderPlaced {
                symbol,
                broker_order_id,
            } => {
                info!(symbol = %symbol, broker_order_id = %broker_order_id, "Order placed");
            }
            Event::OrderFailed { symbol, reason } => {
                warn!(symbol = %symbol, reason = %reason, "Order failed");
            }
            Event::BatchCompleted { counts } => {
                info!(
                    total = counts.total,
                    placed = counts.placed,
                    failed = counts.failed,
                    skipped = counts.skipped,
                    "Batch completed"
                );
            }
        }
    }
}

/// Cheap to clone handle for emitting events.
#[derive(Debug, Clone)]
pub struct NotificationDispatcher {
    sender: mpsc::UnboundedSender<Event>,
}

impl NotificationDispatcher {
    /// Starts the fan-out task. The task ends once every dispatcher clone has
    /// been dropped and the queue is drained.
    pub fn spawn(notifiers: Vec<Arc<dyn Notifier>>) -> (Self, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Event>();

        let handle = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                for notifier in &notifiers {
                    let delivered =
                        panic::catch_unwind(AssertUnwindSafe(|| notifier.notify(&event)));
                    if delivered.is_err() {
                        warn!(?event, "Notifier panicked, continuing with the rest");
                    }
                }
            }
            debug!("Notification dispatcher stopped");
        });

        (Self { sender }, handle)
    }

    /// Dispatcher whose events land in the returned receiver.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn emit(&self, event: Event) {
        if let Err(error) = self.sender.send(event) {
            warn!(event = ?error.0, "Dropping event, dispatcher is closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        events: Mutex<Vec<Event>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, event: &Event) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    #[tokio::test]
    async fn test_events_fan_out_in_order() {
        let first = Arc::new(RecordingNotifier::default());
        let second = Arc::new(RecordingNotifier::default());
        let (dispatcher, handle) = NotificationDispatcher::spawn(vec![
            first.clone(),
            second.clone(),
            Arc::new(LogNotifier),
        ]);

        dispatcher.emit(Event::TokenAcquired {
            user_id: "AB1234".to_string(),
        });
        dispatcher.emit(Event::BatchCompleted {
            counts: BatchCounts {
                total: 1,
                placed: 1,
                failed: 0,
                skipped: 0,
            },
        });
        drop(dispatcher);
        handle.await.unwrap();

        for notifier in [first, second] {
            let events = notifier.events.lock().unwrap();
            assert_eq!(events.len(), 2);
            assert!(matches!(events[0], Event::TokenAcquired { .. }));
            assert!(matches!(events[1], Event::BatchCompleted { .. }));
        }
    }

    struct PanickingNotifier;

    impl Notifier for PanickingNotifier {
        fn notify(&self, _event: &Event) {
            panic!("notifier backend unavailable");
        }
    }

    #[tokio::test]
    async fn test_panicking_notifier_does_not_stop_fan_out() {
        let recording = Arc::new(RecordingNotifier::default());
        let (dispatcher, handle) =
            NotificationDispatcher::spawn(vec![Arc::new(PanickingNotifier), recording.clone()]);

        dispatcher.emit(Event::TokenAcquired {
            user_id: "AB1234".to_string(),
        });
        dispatcher.emit(Event::OrderFailed {
            symbol: "NSE:INFY".to_string(),
            reason: "rejected".to_string(),
        });
        drop(dispatcher);
        handle.await.unwrap();

        let events = recording.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], Event::OrderFailed { .. }));
    }

    #[test]
    fn test_emit_after_receiver_dropped_does_not_panic() {
        let (dispatcher, receiver) = NotificationDispatcher::channel();
        drop(receiver);

        dispatcher.emit(Event::TokenAcquisitionFailed {
            reason: "nobody listening".to_string(),
        });
    }

    #[test]
    fn test_channel_receives_events() {
        let (dispatcher, mut receiver) = NotificationDispatcher::channel();
        dispatcher.emit(Event::OrderFailed {
            symbol: "NSE:INFY".to_string(),
            reason: "rejected".to_string(),
        });

        assert_eq!(
            receiver.try_recv().unwrap(),
            Event::OrderFailed {
                symbol: "NSE:INFY".to_string(),
                reason: "rejected".to_string(),
            }
        );
    }
}

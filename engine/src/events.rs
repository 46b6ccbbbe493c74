//! Per-lifecycle event channel.
//!
//! Events are queued by the code performing a transition while it still holds
//! the state lock, then delivered in queue order by whichever caller drains
//! first. A listener may call back into the lifecycle that emitted the event:
//! nested events are queued and delivered after the current listener returns.

use std::collections::VecDeque;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;

use toolcall_types::{LifecycleStatus, ToolCallIdentity};

/// Capacity of the broadcast side channel used by async consumers.
pub const EVENT_STREAM_CAPACITY: usize = 64;

/// Emitted on every lifecycle transition, tagged with the new variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub identity: ToolCallIdentity,
    pub status: LifecycleStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<E> = Arc<dyn Fn(&E) -> ControlFlow<()> + Send + Sync>;

struct Pending<E> {
    events: VecDeque<E>,
    draining: bool,
}

pub struct EventChannel<E> {
    listeners: Mutex<Vec<(ListenerId, Listener<E>)>>,
    next_id: AtomicU64,
    pending: Mutex<Pending<E>>,
    stream: broadcast::Sender<E>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<E: Clone + Send + 'static> EventChannel<E> {
    #[must_use]
    pub fn new() -> Self {
        let (stream, _) = broadcast::channel(EVENT_STREAM_CAPACITY);
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            pending: Mutex::new(Pending {
                events: VecDeque::new(),
                draining: false,
            }),
            stream,
        }
    }

    /// Register a synchronous listener for every event.
    ///
    /// Returning `ControlFlow::Break(())` unsubscribes the listener.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&E) -> ControlFlow<()> + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.listeners).push((id, Arc::new(listener)));
        id
    }

    /// Returns `false` if the listener was already gone.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.listeners);
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    /// Receiver for async consumers. Lagging receivers lose the oldest events.
    #[must_use]
    pub fn subscribe_stream(&self) -> broadcast::Receiver<E> {
        self.stream.subscribe()
    }

    /// Queue an event without delivering it.
    pub(crate) fn enqueue(&self, event: E) {
        lock(&self.pending).events.push_back(event);
    }

    /// Deliver queued events unless another caller is already draining.
    pub(crate) fn flush(&self) {
        {
            let mut pending = lock(&self.pending);
            if pending.draining {
                return;
            }
            pending.draining = true;
        }
        let mut guard = DrainGuard {
            pending: &self.pending,
            finished: false,
        };

        loop {
            let event = {
                let mut pending = lock(&self.pending);
                match pending.events.pop_front() {
                    Some(event) => event,
                    None => {
                        // Cleared under the lock so a concurrent enqueue
                        // either sees the drain or starts its own.
                        pending.draining = false;
                        guard.finished = true;
                        return;
                    }
                }
            };
            self.deliver(&event);
        }
    }

    fn deliver(&self, event: &E) {
        let snapshot: Vec<(ListenerId, Listener<E>)> = lock(&self.listeners).clone();
        for (id, listener) in snapshot {
            if listener(event).is_break() {
                self.unsubscribe(id);
            }
        }
        // No receivers is fine.
        let _ = self.stream.send(event.clone());
    }
}

/// Releases the drain if a listener unwinds out of `flush`.
struct DrainGuard<'a, E> {
    pending: &'a Mutex<Pending<E>>,
    finished: bool,
}

impl<E> Drop for DrainGuard<'_, E> {
    fn drop(&mut self) {
        if !self.finished {
            lock(self.pending).draining = false;
        }
    }
}

impl<E: Clone + Send + 'static> Default for EventChannel<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for EventChannel<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventChannel")
            .field("listeners", &lock(&self.listeners).len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{self, AssertUnwindSafe};

    use super::*;

    fn emit(channel: &EventChannel<u32>, event: u32) {
        channel.enqueue(event);
        channel.flush();
    }

    #[test]
    fn delivers_in_order_to_all_listeners() {
        let channel = EventChannel::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b"] {
            let seen = Arc::clone(&seen);
            channel.subscribe(move |event: &u32| {
                seen.lock().unwrap().push(format!("{tag}{event}"));
                ControlFlow::Continue(())
            });
        }

        emit(&channel, 1);
        emit(&channel, 2);

        assert_eq!(*seen.lock().unwrap(), vec!["a1", "b1", "a2", "b2"]);
    }

    #[test]
    fn break_unsubscribes_listener() {
        let channel = EventChannel::new();
        let count = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&count);
        channel.subscribe(move |event: &u32| {
            counter.fetch_add(1, Ordering::SeqCst);
            if *event == 2 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });

        emit(&channel, 1);
        emit(&channel, 2);
        emit(&channel, 3);

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(channel.listener_count(), 0);
    }

    #[test]
    fn nested_events_are_delivered_after_current_one() {
        let channel = Arc::new(EventChannel::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let reentrant = Arc::clone(&channel);
        let log = Arc::clone(&seen);
        channel.subscribe(move |event: &u32| {
            log.lock().unwrap().push(format!("start{event}"));
            if *event == 1 {
                reentrant.enqueue(2);
                reentrant.flush();
            }
            log.lock().unwrap().push(format!("end{event}"));
            ControlFlow::Continue(())
        });

        emit(&channel, 1);

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["start1", "end1", "start2", "end2"]
        );
    }

    #[test]
    fn panicking_listener_does_not_stall_later_events() {
        let channel = EventChannel::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        channel.subscribe(move |event: &u32| {
            assert_ne!(*event, 1, "listener failed");
            sink.lock().unwrap().push(*event);
            ControlFlow::Continue(())
        });

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| emit(&channel, 1)));
        assert!(outcome.is_err());

        emit(&channel, 2);

        assert_eq!(*seen.lock().unwrap(), vec![2]);
    }

    #[test]
    fn unsubscribe_reports_missing_listener() {
        let channel = EventChannel::<u32>::new();
        let id = channel.subscribe(|_| ControlFlow::Continue(()));
        assert!(channel.unsubscribe(id));
        assert!(!channel.unsubscribe(id));
    }

    #[tokio::test]
    async fn stream_receives_events() {
        let channel = EventChannel::new();
        let mut rx = channel.subscribe_stream();

        emit(&channel, 7);

        assert_eq!(rx.recv().await.unwrap(), 7);
    }
}

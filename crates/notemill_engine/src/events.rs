//! In-process publish/subscribe for progress events.
//!
//! Subscribers get a bounded ring buffer each: a subscriber that cannot keep
//! up loses its oldest events, never the publisher's time. Publishing takes
//! the subscriber mutex for a push and nothing more.

use notemill_protocol::ProgressEvent;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

const DEFAULT_BUFFER: usize = 1024;

struct Channel {
    queue: Mutex<VecDeque<ProgressEvent>>,
    ready: Condvar,
    capacity: usize,
}

pub struct ProgressBus {
    subscribers: Mutex<HashMap<u64, Arc<Channel>>>,
    next_id: Mutex<u64>,
}

/// A subscriber handle. Dropping it without unsubscribing leaves a dead
/// buffer behind until the bus itself is dropped, so hold onto the id.
pub struct Subscription {
    pub id: u64,
    channel: Arc<Channel>,
}

impl Subscription {
    /// Drain everything buffered so far without blocking.
    pub fn try_drain(&self) -> Vec<ProgressEvent> {
        let mut queue = match self.channel.queue.lock() {
            Ok(queue) => queue,
            Err(_) => return Vec::new(),
        };
        queue.drain(..).collect()
    }

    /// Wait up to `timeout` for the next event.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ProgressEvent> {
        let mut queue = self.channel.queue.lock().ok()?;
        if let Some(event) = queue.pop_front() {
            return Some(event);
        }
        let (mut queue, _) = self.channel.ready.wait_timeout(queue, timeout).ok()?;
        queue.pop_front()
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: Mutex::new(0),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        self.subscribe_with_capacity(DEFAULT_BUFFER)
    }

    pub fn subscribe_with_capacity(&self, capacity: usize) -> Subscription {
        let channel = Arc::new(Channel {
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            capacity: capacity.max(1),
        });
        let id = {
            let mut next = self.next_id.lock().expect("bus id lock poisoned");
            *next += 1;
            *next
        };
        self.subscribers
            .lock()
            .expect("bus lock poisoned")
            .insert(id, Arc::clone(&channel));
        Subscription { id, channel }
    }

    pub fn unsubscribe(&self, id: u64) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.remove(&id);
        }
    }

    /// Fan the event out to every subscriber. Full buffers drop their oldest
    /// event first.
    pub fn publish(&self, event: ProgressEvent) {
        let channels: Vec<Arc<Channel>> = match self.subscribers.lock() {
            Ok(subscribers) => subscribers.values().cloned().collect(),
            Err(_) => return,
        };
        for channel in channels {
            if let Ok(mut queue) = channel.queue.lock() {
                if queue.len() >= channel.capacity {
                    queue.pop_front();
                }
                queue.push_back(event.clone());
                channel.ready.notify_one();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn started(n: u64) -> ProgressEvent {
        ProgressEvent::BatchStarted { total_files: n }
    }

    #[test]
    fn test_publish_reaches_all_subscribers() {
        let bus = ProgressBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();
        bus.publish(started(5));
        assert_eq!(a.try_drain(), vec![started(5)]);
        assert_eq!(b.try_drain(), vec![started(5)]);
    }

    #[test]
    fn test_slow_subscriber_drops_oldest() {
        let bus = ProgressBus::new();
        let sub = bus.subscribe_with_capacity(2);
        bus.publish(started(1));
        bus.publish(started(2));
        bus.publish(started(3));
        assert_eq!(sub.try_drain(), vec![started(2), started(3)]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = ProgressBus::new();
        let sub = bus.subscribe();
        bus.unsubscribe(sub.id);
        bus.publish(started(1));
        assert!(sub.try_drain().is_empty());
    }

    #[test]
    fn test_recv_timeout_wakes_on_publish() {
        let bus = Arc::new(ProgressBus::new());
        let sub = bus.subscribe();
        let bus2 = Arc::clone(&bus);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            bus2.publish(ProgressEvent::BatchCancelled);
        });
        let event = sub.recv_timeout(Duration::from_secs(5));
        assert_eq!(event, Some(ProgressEvent::BatchCancelled));
        handle.join().unwrap();
    }

    #[test]
    fn test_recv_timeout_expires_quietly() {
        let bus = ProgressBus::new();
        let sub = bus.subscribe();
        assert_eq!(sub.recv_timeout(Duration::from_millis(20)), None);
    }

    #[test]
    fn test_per_subscriber_event_order_is_preserved() {
        let bus = ProgressBus::new();
        let sub = bus.subscribe();
        let path = PathBuf::from("/notes/a.txt");
        bus.publish(ProgressEvent::JobStarted {
            path: path.clone(),
            attempt: 1,
        });
        bus.publish(ProgressEvent::JobCompleted {
            path: path.clone(),
            concepts: 2,
            seconds: 0.5,
        });
        let events = sub.try_drain();
        assert!(matches!(events[0], ProgressEvent::JobStarted { .. }));
        assert!(matches!(events[1], ProgressEvent::JobCompleted { .. }));
    }
}

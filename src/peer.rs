use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::messages::Message;
use crate::ID;

struct Shared {
    queue: Mutex<VecDeque<Message>>,
    capacity: usize,
    not_empty: Notify,
    not_full: Notify,
    closed_notify: Notify,
    closed: AtomicBool,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.not_empty.notify_waiters();
            self.not_full.notify_waiters();
            self.closed_notify.notify_waiters();
        }
    }
}

/// The realm-side handle used to deliver outbound messages to an attached
/// peer. Cloned freely: the broker, the dealer and the realm's session
/// table each keep a copy addressed at the same queue.
///
/// EVENT delivery to a saturated queue drops the oldest queued EVENT;
/// every other message blocks the sender until queue space frees up,
/// per spec.md §5's backpressure rule.
#[derive(Clone)]
pub struct PeerHandle {
    id: ID,
    shared: Arc<Shared>,
}

/// The transport-side handle a caller holds for an attached session: pull
/// outbound messages off it to write to the wire, push inbound ones in
/// from wherever they were decoded.
pub struct PeerLink {
    id: ID,
    shared: Arc<Shared>,
}

impl PeerLink {
    /// Builds a connected `(PeerLink, PeerHandle)` pair for a freshly
    /// assigned session id, with room for `capacity` queued messages
    /// before EVENT backpressure kicks in.
    pub fn pair(id: ID, capacity: usize) -> (PeerLink, PeerHandle) {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity: capacity.max(1),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            closed_notify: Notify::new(),
            closed: AtomicBool::new(false),
        });
        (
            PeerLink {
                id,
                shared: shared.clone(),
            },
            PeerHandle { id, shared },
        )
    }

    #[inline]
    pub fn id(&self) -> ID {
        self.id
    }

    /// Waits for and returns the next message queued for the wire. Returns
    /// `None` once the link has been closed and the queue has drained.
    pub async fn recv(&self) -> Option<Message> {
        loop {
            {
                let mut queue = self.shared.queue.lock().unwrap();
                if let Some(message) = queue.pop_front() {
                    drop(queue);
                    self.shared.not_full.notify_one();
                    return Some(message);
                }
                if self.shared.is_closed() {
                    return None;
                }
            }
            self.shared.not_empty.notified().await;
        }
    }

    /// Resolves once the link is closed, so a realm can tear a session
    /// down without polling for a dead peer.
    pub async fn closed(&self) {
        if self.shared.is_closed() {
            return;
        }
        self.shared.closed_notify.notified().await;
    }

    /// Marks the link closed; queued-but-undelivered messages are dropped
    /// and any blocked sender wakes up and sees the queue as unusable.
    pub fn close(&self) {
        self.shared.close();
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl PeerHandle {
    #[inline]
    pub fn id(&self) -> ID {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Queues `message` for delivery to this peer, applying spec.md §5's
    /// backpressure policy. Returns `Err(message)` if the link is already
    /// closed.
    pub async fn send(&self, message: Message) -> Result<(), Message> {
        if message.is_reliable() {
            self.send_reliable(message).await
        } else {
            self.send_droppable(message)
        }
    }

    async fn send_reliable(&self, message: Message) -> Result<(), Message> {
        loop {
            {
                let mut queue = self.shared.queue.lock().unwrap();
                if self.shared.is_closed() {
                    return Err(message);
                }
                if queue.len() < self.shared.capacity {
                    queue.push_back(message);
                    drop(queue);
                    self.shared.not_empty.notify_one();
                    return Ok(());
                }
            }
            self.shared.not_full.notified().await;
        }
    }

    fn send_droppable(&self, message: Message) -> Result<(), Message> {
        let mut queue = self.shared.queue.lock().unwrap();
        if self.shared.is_closed() {
            return Err(message);
        }
        if queue.len() >= self.shared.capacity {
            queue.pop_front();
        }
        queue.push_back(message);
        drop(queue);
        self.shared.not_empty.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::messages::Message;
    use std::collections::HashMap;

    fn event(n: u64) -> Message {
        Message::Event(1, n, HashMap::new(), None, None)
    }

    #[tokio::test]
    async fn drops_oldest_event_on_a_full_queue() {
        let (link, handle) = PeerLink::pair(1, 2);
        handle.send(event(1)).await.unwrap();
        handle.send(event(2)).await.unwrap();
        handle.send(event(3)).await.unwrap();
        assert_eq!(link.recv().await, Some(event(2)));
        assert_eq!(link.recv().await, Some(event(3)));
    }

    #[tokio::test]
    async fn closing_wakes_a_blocked_recv() {
        let (link, handle) = PeerLink::pair(1, 4);
        drop(handle);
        assert_eq!(link.recv().await, None);
    }

    #[tokio::test]
    async fn send_after_close_is_rejected() {
        let (link, handle) = PeerLink::pair(1, 4);
        link.close();
        assert!(handle.send(event(1)).await.is_err());
    }
}

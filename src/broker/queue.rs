//! Minimal in-memory queues.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;

use crate::{
    protocol::{BasicPublish, ContentHeader, FieldTable, QueueDeclare},
    session::ConnectionId,
};

/// A published message as routed to queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: u64,
    pub publish: BasicPublish,
    pub header: ContentHeader,
    pub body: Bytes,
}

/// Named, bounded message buffer.
///
/// Once `capacity` messages are held, further deliveries are refused.
/// Exclusive queues belong to the connection that declared them and are
/// deleted with it.
#[derive(Debug)]
pub struct Queue {
    name: String,
    durable: bool,
    exclusive: bool,
    auto_delete: bool,
    arguments: FieldTable,
    owner: Option<ConnectionId>,
    capacity: usize,
    messages: Mutex<VecDeque<Arc<Message>>>,
}

impl Queue {
    pub(crate) fn from_declare(
        name: String,
        method: &QueueDeclare,
        connection: ConnectionId,
        capacity: usize,
    ) -> Self {
        Self {
            name,
            durable: method.durable,
            exclusive: method.exclusive,
            auto_delete: method.auto_delete,
            arguments: method.arguments.clone(),
            owner: method.exclusive.then_some(connection),
            capacity,
            messages: Mutex::new(VecDeque::new()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str { &self.name }

    #[must_use]
    pub fn is_durable(&self) -> bool { self.durable }

    #[must_use]
    pub fn is_exclusive(&self) -> bool { self.exclusive }

    #[must_use]
    pub fn is_auto_delete(&self) -> bool { self.auto_delete }

    /// Owning connection of an exclusive queue.
    #[must_use]
    pub fn owner(&self) -> Option<ConnectionId> { self.owner }

    /// Whether `connection` may use this queue.
    #[must_use]
    pub fn accessible_by(&self, connection: ConnectionId) -> bool {
        self.owner.is_none_or(|owner| owner == connection)
    }

    /// Whether a redeclaration matches this queue's properties.
    #[must_use]
    pub fn is_equivalent(&self, method: &QueueDeclare) -> bool {
        self.durable == method.durable
            && self.exclusive == method.exclusive
            && self.auto_delete == method.auto_delete
            && self.arguments == method.arguments
    }

    fn messages(&self) -> MutexGuard<'_, VecDeque<Arc<Message>>> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn capacity(&self) -> usize { self.capacity }

    /// Append `message` unless the queue is full. Returns whether it was
    /// accepted.
    pub fn enqueue(&self, message: Arc<Message>) -> bool {
        let mut messages = self.messages();
        if messages.len() >= self.capacity {
            return false;
        }
        messages.push_back(message);
        true
    }

    /// Take the oldest message.
    pub fn dequeue(&self) -> Option<Arc<Message>> { self.messages().pop_front() }

    #[must_use]
    pub fn len(&self) -> usize { self.messages().len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.messages().is_empty() }

    #[must_use]
    pub fn message_count(&self) -> u32 { u32::try_from(self.len()).unwrap_or(u32::MAX) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_queue_is_owned_by_declarer() {
        let declare = QueueDeclare {
            exclusive: true,
            ..QueueDeclare::default()
        };
        let queue = Queue::from_declare("q".into(), &declare, ConnectionId::new(3), 8);
        assert_eq!(queue.owner(), Some(ConnectionId::new(3)));
        assert!(queue.accessible_by(ConnectionId::new(3)));
        assert!(!queue.accessible_by(ConnectionId::new(4)));
    }

    fn message(id: u64) -> Arc<Message> {
        Arc::new(Message {
            id,
            publish: BasicPublish::default(),
            header: ContentHeader::new(60, 0),
            body: Bytes::new(),
        })
    }

    fn queue(capacity: usize) -> Queue {
        Queue::from_declare("q".into(), &QueueDeclare::default(), ConnectionId::new(1), capacity)
    }

    #[test]
    fn messages_leave_in_arrival_order() {
        let queue = queue(8);
        for id in 1..=3 {
            assert!(queue.enqueue(message(id)));
        }
        assert_eq!(queue.message_count(), 3);
        let ids: Vec<u64> = std::iter::from_fn(|| queue.dequeue()).map(|m| m.id).collect();
        assert_eq!(ids, [1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn full_queue_refuses_new_messages() {
        let queue = queue(2);
        assert!(queue.enqueue(message(1)));
        assert!(queue.enqueue(message(2)));
        assert!(!queue.enqueue(message(3)));
        assert_eq!(queue.len(), 2);

        queue.dequeue();
        assert!(queue.enqueue(message(4)));
        let ids: Vec<u64> = std::iter::from_fn(|| queue.dequeue()).map(|m| m.id).collect();
        assert_eq!(ids, [2, 4]);
    }
}

//! Thread-safe FIFO queue mutated by the state machine.
//!
//! Apply (writer) and snapshot capture (reader) run on different threads, so
//! every access goes through one reader/writer lock.

use std::collections::VecDeque;
use std::fmt;

use parking_lot::RwLock;

use crate::message::Message;

pub struct Queue<T> {
    messages: RwLock<VecDeque<Message<T>>>,
}

impl<T> Queue<T> {
    pub fn new() -> Self {
        Self {
            messages: RwLock::new(VecDeque::new()),
        }
    }

    /// Appends a message to the tail.
    pub fn enqueue(&self, message: Message<T>) {
        self.messages.write().push_back(message);
    }

    /// Removes and returns the oldest message, or `None` when empty.
    pub fn dequeue(&self) -> Option<Message<T>> {
        self.messages.write().pop_front()
    }

    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.read().is_empty()
    }

    /// Swaps in the contents of `other` in one step.
    pub fn replace(&self, other: Queue<T>) {
        let incoming = other.messages.into_inner();
        *self.messages.write() = incoming;
    }

    /// Runs `f` against the messages while holding the read lock.
    pub(crate) fn with_messages<R>(&self, f: impl FnOnce(&VecDeque<Message<T>>) -> R) -> R {
        f(&self.messages.read())
    }
}

impl<T: Clone> Queue<T> {
    /// Returns an independent queue with the same messages, taken under the
    /// read lock so it reflects a single instant.
    pub fn copy(&self) -> Queue<T> {
        let messages = self.messages.read().clone();
        Queue {
            messages: RwLock::new(messages),
        }
    }

    /// Messages in FIFO order.
    pub fn messages(&self) -> Vec<Message<T>> {
        self.messages.read().iter().cloned().collect()
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FromIterator<Message<T>> for Queue<T> {
    fn from_iter<I: IntoIterator<Item = Message<T>>>(iter: I) -> Self {
        Queue {
            messages: RwLock::new(iter.into_iter().collect()),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("messages", &*self.messages.read())
            .finish()
    }
}

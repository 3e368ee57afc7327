//! Commands that flow through the replicated log.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operation {
    Send = 0,
    Receive = 1,
}

impl TryFrom<u8> for Operation {
    type Error = Error;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Operation::Send),
            1 => Ok(Operation::Receive),
            other => Err(Error::UnknownOperation(other)),
        }
    }
}

/// The unit of replication: every queue mutation is one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<T> {
    Send(Message<T>),
    Receive,
}

/// On-log layout. Kept separate from [`Command`] so the tag is checked
/// explicitly and an unknown tag is reported as such.
#[derive(Serialize, Deserialize)]
struct Frame<M> {
    operation: u8,
    message: Option<M>,
}

impl<T> Command<T> {
    pub fn operation(&self) -> Operation {
        match self {
            Command::Send(_) => Operation::Send,
            Command::Receive => Operation::Receive,
        }
    }
}

impl<T: Serialize + DeserializeOwned> Command<T> {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let frame = Frame {
            operation: self.operation() as u8,
            message: match self {
                Command::Send(message) => Some(message),
                Command::Receive => None,
            },
        };
        Ok(bincode::serialize(&frame)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let frame: Frame<Message<T>> = bincode::deserialize(bytes)?;
        match (Operation::try_from(frame.operation)?, frame.message) {
            (Operation::Send, Some(message)) => Ok(Command::Send(message)),
            (Operation::Send, None) => Err(Error::Decode("send command without a message".into())),
            (Operation::Receive, _) => Ok(Command::Receive),
        }
    }
}

/// What applying one command produced.
///
/// Only the node that proposed the entry hands this to a caller; the other
/// replicas drop it.
#[derive(Debug)]
pub enum ApplyOutcome<T> {
    /// Applied with nothing to return: a send, or a receive on an empty queue.
    None,
    Message(Message<T>),
    /// The entry could not be applied. Later entries are unaffected.
    Error(Error),
}

//! Process-local message channels with port-like send and receive rights.
//!
//! The engine talks to the broker over "message channels": rights-based
//! endpoints with a bounded receive queue and blocking, timed, and polling
//! receive modes. This module is the process-local implementation of that
//! model and the seam where a kernel-backed transport would slot in.
//!
//! # Rights Model
//!
//! - [`channel`] allocates a queue and returns both capabilities for it.
//! - [`SendRight`] is the send capability. It is `Clone`: copying a send
//!   right is how a capability is handed to another holder.
//! - [`RecvRight`] is the receive capability and is deliberately not
//!   `Clone`: exactly one holder may drain a channel.
//! - A [`Message`] can carry a reply send right alongside its bytes, which
//!   is how a requester hands the responder somewhere to answer.
//!
//! Dropping the receive right tears the channel down; senders then observe
//! [`Error::SendFailed`]. Dropping every send right while a receiver waits
//! surfaces [`Error::ReceiveFailed`].
//!
//! Rights are `Send`, so a service can run on another thread; the client
//! engine itself stays on one thread (see [`crate::client`]).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::trace;

use crate::error::Error;

/// Receive-queue bound for event channels (the "large" queue limit).
pub const EVENT_QUEUE_LIMIT: usize = 1024;

/// Receive-queue bound for single-use reply channels.
pub(crate) const REPLY_QUEUE_LIMIT: usize = 1;

/// Process-wide channel id counter. Ids are generated, never derived from
/// addresses, so they stay stable for logging and wire headers.
static NEXT_CHANNEL_ID: AtomicU32 = AtomicU32::new(1);

/// Stable identifier assigned to a channel at allocation time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChannelId(u32);

impl ChannelId {
    fn next() -> Self {
        ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value, as stamped into wire headers.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

/// How long a receive operation is willing to wait.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Wait {
    /// Take what is already queued or give up immediately.
    #[default]
    Poll,
    /// Wait up to the given duration.
    Timeout(Duration),
    /// Block until a message arrives.
    Forever,
}

impl Wait {
    /// Map an optional millisecond timeout to a wait mode: absent blocks
    /// forever, zero polls, anything else waits that long.
    pub fn from_millis(timeout_ms: Option<u64>) -> Self {
        match timeout_ms {
            None => Wait::Forever,
            Some(0) => Wait::Poll,
            Some(ms) => Wait::Timeout(Duration::from_millis(ms)),
        }
    }
}

/// One message in flight: framed bytes plus an optional reply send right.
#[derive(Debug)]
pub struct Message {
    /// The framed wire image (see [`crate::frame`]).
    pub bytes: Vec<u8>,
    /// Send right the responder should answer on, if the sender wants one.
    pub reply: Option<SendRight>,
}

/// Send capability for a channel. Cloning copies the capability.
#[derive(Clone, Debug)]
pub struct SendRight {
    id: ChannelId,
    tx: SyncSender<Message>,
}

impl SendRight {
    /// Id of the channel this right sends into.
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Enqueue a message, applying backpressure when the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SendFailed`] when the receive right has been
    /// dropped (the peer is gone).
    pub fn send(&self, message: Message) -> Result<(), Error> {
        trace!(channel = self.id.as_u32(), len = message.bytes.len(), "send");
        self.tx
            .send(message)
            .map_err(|_| Error::SendFailed("peer closed the channel".to_string()))
    }
}

/// Exclusive receive capability for a channel.
#[derive(Debug)]
pub struct RecvRight {
    id: ChannelId,
    rx: Receiver<Message>,
}

impl RecvRight {
    /// Id of the channel this right drains.
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Block until a message arrives.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReceiveFailed`] when every send right is gone, so
    /// no message can ever arrive.
    pub fn recv(&self) -> Result<Message, Error> {
        self.rx
            .recv()
            .map_err(|_| Error::ReceiveFailed("channel torn down while waiting".to_string()))
    }

    /// Receive with the given wait mode.
    ///
    /// `Ok(None)` means nothing was available within the wait: an empty
    /// queue under [`Wait::Poll`], or an elapsed [`Wait::Timeout`]. That is
    /// not an error.
    pub fn receive(&self, wait: Wait) -> Result<Option<Message>, Error> {
        match wait {
            Wait::Forever => self.recv().map(Some),
            Wait::Poll => match self.rx.try_recv() {
                Ok(message) => Ok(Some(message)),
                Err(TryRecvError::Empty) => Ok(None),
                Err(TryRecvError::Disconnected) => Err(Error::ReceiveFailed(
                    "channel torn down while polling".to_string(),
                )),
            },
            Wait::Timeout(duration) => match self.rx.recv_timeout(duration) {
                Ok(message) => Ok(Some(message)),
                Err(RecvTimeoutError::Timeout) => Ok(None),
                Err(RecvTimeoutError::Disconnected) => Err(Error::ReceiveFailed(
                    "channel torn down while waiting".to_string(),
                )),
            },
        }
    }
}

/// Allocate a message channel with the given receive-queue bound and return
/// both capabilities for it.
pub fn channel(queue_limit: usize) -> (SendRight, RecvRight) {
    let id = ChannelId::next();
    let (tx, rx) = mpsc::sync_channel(queue_limit);
    (SendRight { id, tx }, RecvRight { id, rx })
}

/// Name-based endpoint registry well-known services are resolved through.
///
/// The broker registers its request channel's send right under a fixed name;
/// clients look that name up at connect time and receive their own copy of
/// the right. The handle is cheap to clone and every clone sees the same
/// table, so a test can hand one half to a broker thread and keep the other.
#[derive(Clone, Debug, Default)]
pub struct ServiceDirectory {
    inner: Arc<Mutex<HashMap<String, SendRight>>>,
}

impl ServiceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, SendRight>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register (or replace) the endpoint for a service name.
    pub fn register(&self, name: impl Into<String>, right: SendRight) {
        let name = name.into();
        trace!(service = %name, channel = right.id().as_u32(), "service registered");
        self.table().insert(name, right);
    }

    /// Remove a service registration. Returns whether the name was present.
    pub fn unregister(&self, name: &str) -> bool {
        self.table().remove(name).is_some()
    }

    /// Resolve a service name to a copy of its send right.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LookupFailed`] when no endpoint is registered under
    /// `name`.
    pub fn look_up(&self, name: &str) -> Result<SendRight, Error> {
        self.table()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::LookupFailed(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(text: &str) -> Message {
        Message {
            bytes: text.as_bytes().to_vec(),
            reply: None,
        }
    }

    #[test]
    fn test_send_recv_roundtrip() {
        let (tx, rx) = channel(4);
        tx.send(message("hello")).expect("send failed");
        let received = rx.recv().expect("recv failed");
        assert_eq!(received.bytes, b"hello");
        assert!(received.reply.is_none());
    }

    #[test]
    fn test_poll_empty_returns_none() {
        let (_tx, rx) = channel(4);
        let received = rx.receive(Wait::Poll).expect("poll failed");
        assert!(received.is_none());
    }

    #[test]
    fn test_timeout_elapses_returns_none() {
        let (_tx, rx) = channel(4);
        let received = rx
            .receive(Wait::Timeout(Duration::from_millis(10)))
            .expect("timed receive failed");
        assert!(received.is_none());
    }

    #[test]
    fn test_recv_after_all_senders_dropped_is_receive_failed() {
        let (tx, rx) = channel(4);
        drop(tx);
        let err = rx.recv().unwrap_err();
        assert!(matches!(err, Error::ReceiveFailed(_)));
    }

    #[test]
    fn test_send_after_receiver_dropped_is_send_failed() {
        let (tx, rx) = channel(4);
        drop(rx);
        let err = tx.send(message("x")).unwrap_err();
        assert!(matches!(err, Error::SendFailed(_)));
    }

    #[test]
    fn test_cloned_send_right_still_delivers() {
        let (tx, rx) = channel(4);
        let copy = tx.clone();
        assert_eq!(copy.id(), tx.id());
        copy.send(message("via copy")).expect("send failed");
        assert_eq!(rx.recv().expect("recv failed").bytes, b"via copy");
    }

    #[test]
    fn test_reply_right_travels_with_message() {
        let (tx, rx) = channel(4);
        let (reply_tx, reply_rx) = channel(1);
        tx.send(Message {
            bytes: b"ask".to_vec(),
            reply: Some(reply_tx),
        })
        .expect("send failed");

        let request = rx.recv().expect("recv failed");
        let reply_to = request.reply.expect("reply right missing");
        reply_to.send(message("answer")).expect("reply failed");

        assert_eq!(reply_rx.recv().expect("recv failed").bytes, b"answer");
    }

    #[test]
    fn test_queue_holds_messages_up_to_bound() {
        let (tx, rx) = channel(3);
        for i in 0..3 {
            tx.send(message(&format!("m{i}"))).expect("send failed");
        }
        for i in 0..3 {
            assert_eq!(rx.recv().expect("recv failed").bytes, format!("m{i}").as_bytes());
        }
    }

    #[test]
    fn test_wait_from_millis_mapping() {
        assert_eq!(Wait::from_millis(None), Wait::Forever);
        assert_eq!(Wait::from_millis(Some(0)), Wait::Poll);
        assert_eq!(
            Wait::from_millis(Some(250)),
            Wait::Timeout(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_directory_register_look_up_unregister() {
        let directory = ServiceDirectory::new();
        let (tx, rx) = channel(4);
        directory.register("test.service", tx);

        let resolved = directory.look_up("test.service").expect("lookup failed");
        resolved.send(message("ping")).expect("send failed");
        assert_eq!(rx.recv().expect("recv failed").bytes, b"ping");

        assert!(directory.unregister("test.service"));
        assert!(!directory.unregister("test.service"));
        let err = directory.look_up("test.service").unwrap_err();
        assert!(matches!(err, Error::LookupFailed(_)));
    }

    #[test]
    fn test_directory_reregister_replaces_endpoint() {
        let directory = ServiceDirectory::new();
        let (old_tx, old_rx) = channel(4);
        let (new_tx, new_rx) = channel(4);
        directory.register("svc", old_tx);
        directory.register("svc", new_tx);
        drop(old_rx);

        let resolved = directory.look_up("svc").expect("lookup failed");
        resolved.send(message("fresh")).expect("send failed");
        assert_eq!(new_rx.recv().expect("recv failed").bytes, b"fresh");
    }
}

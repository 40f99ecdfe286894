//! Client engine for the Causeway broker.
//!
//! This module ties the transport, codec, registry, and scheduler together:
//!
//! ```text
//!                      ┌─────────────────────────────┐
//!   call / send ─────► │ request channel (send right)│ ─────► broker
//!                      └─────────────────────────────┘
//!                      ┌─────────────────────────────┐
//!   replies, events ◄─ │ event channel (recv right)  │ ◄───── broker
//!                      └──────────────┬──────────────┘
//!                                     │ pump / receive_event
//!                      ┌──────────────▼──────────────┐
//!                      │ subscription registry       │
//!                      │ (ordered filter + callback) │
//!                      └─────────────────────────────┘
//! ```
//!
//! Awaited requests allocate a single-use reply channel per call and block
//! until the broker answers on it. Administrative requests (subscribe,
//! unsubscribe) instead attach the event channel's send right and read
//! their reply as the next message on the event channel, which is also
//! where the broker pushes events from then on.
//!
//! The engine is single-threaded cooperative: callbacks, the pump, and all
//! client calls run on the host's one thread, and [`Client`] is neither
//! `Send` nor `Sync`. Clones of a `Client` are handles to the same client;
//! the last one dropped tears everything down.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, trace, warn};

use crate::channel::{
    self, Message, RecvRight, SendRight, ServiceDirectory, Wait, EVENT_QUEUE_LIMIT,
    REPLY_QUEUE_LIMIT,
};
use crate::envelope::EventEnvelope;
use crate::error::Error;
use crate::frame;
use crate::pump::{PumpScheduler, PumpTask, PumpToken, PUMP_INTERVAL};
use crate::registry::{CallbackResult, SubscriptionRegistry};

/// Well-known name the broker registers under.
pub const DEFAULT_SERVICE_NAME: &str = "io.causeway.broker";

/// Environment variable overriding the service name.
const SERVICE_ENV: &str = "CAUSEWAY_SERVICE";

const NO_REQUEST_CHANNEL: &str = "no request channel (connect first)";
const NO_EVENT_CHANNEL: &str = "no event channel (subscribe first)";
const EMPTY_EVENT_LIST: &str = "event list cannot be empty";

/// Administrative command bodies. Externally tagged so they serialize to
/// the broker's wire shape: `{"subscribe":{"event":NAME}}`.
#[derive(Serialize)]
#[serde(rename_all = "lowercase")]
enum AdminRequest<'a> {
    Subscribe { event: &'a str },
    Unsubscribe { event: &'a str },
}

/// Process-wide client id counter.
static NEXT_CLIENT_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

/// Resolve the service name to connect to.
///
/// Honors the `CAUSEWAY_SERVICE` environment variable, falling back to
/// [`DEFAULT_SERVICE_NAME`].
pub fn default_service_name() -> String {
    std::env::var(SERVICE_ENV).unwrap_or_else(|_| DEFAULT_SERVICE_NAME.to_string())
}

/// Stable generated identifier for one client, used in log fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    fn next() -> Self {
        ClientId(NEXT_CLIENT_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

struct ClientState {
    id: ClientId,
    directory: ServiceDirectory,
    service: String,
    scheduler: Rc<dyn PumpScheduler>,
    /// Send right to the broker's request channel. `None` once disconnected.
    request: Option<SendRight>,
    /// Our own send right to the event channel, attached to administrative
    /// requests so the broker can answer (and later push events) there.
    event_tx: Option<SendRight>,
    /// Receive side of the event channel. Shared so receive operations can
    /// run without holding the state borrow.
    event_rx: Option<Rc<RecvRight>>,
    registry: SubscriptionRegistry,
    pump_token: Option<PumpToken>,
}

impl ClientState {
    /// Allocate the event channel on first use and hand back both ends.
    fn ensure_event_channel(&mut self) -> (SendRight, Rc<RecvRight>) {
        match (&self.event_tx, &self.event_rx) {
            (Some(tx), Some(rx)) => (tx.clone(), Rc::clone(rx)),
            _ => {
                let (tx, rx) = channel::channel(EVENT_QUEUE_LIMIT);
                debug!(
                    client = self.id.as_u64(),
                    channel = rx.id().as_u32(),
                    "event channel allocated"
                );
                let rx = Rc::new(rx);
                self.event_tx = Some(tx.clone());
                self.event_rx = Some(Rc::clone(&rx));
                (tx, rx)
            }
        }
    }
}

impl Drop for ClientState {
    fn drop(&mut self) {
        if let Some(token) = self.pump_token.take() {
            self.scheduler.cancel(token);
        }
        self.registry.clear();
        trace!(client = self.id.as_u64(), "client state released");
        // Both channel rights are released as the fields drop.
    }
}

/// Handle to one broker connection.
///
/// A `Client` is a cheap clonable handle; clones share one connection, one
/// subscription registry, and one auto-pump. Dropping the last handle
/// cancels the pump, releases both channels, and drops every callback.
///
/// # Connection Lifecycle
///
/// - [`Client::connect`] / [`Client::connect_to`] - resolve the broker and
///   establish the request channel
/// - [`Client::connect_with_retry`] - same, with exponential backoff
/// - [`Client::reconnect`] - tear down, re-resolve, replay subscriptions
/// - [`Client::disconnect`] - release channels and stop the pump
///
/// # Example
///
/// ```ignore
/// use causeway_client::client::Client;
/// use causeway_client::pump::RunLoop;
/// use serde_json::json;
/// use std::rc::Rc;
///
/// let scheduler = Rc::new(RunLoop::new());
/// let client = Client::connect(&directory, scheduler.clone())?;
///
/// let windows = client.call(&json!({"query": "windows"}))?;
///
/// client.subscribe_with(&["window_moved"], |event| {
///     println!("moved: {:?}", event.decoded);
///     Ok(())
/// })?;
///
/// loop {
///     scheduler.run_pending();
///     // ... the host's own work ...
/// }
/// ```
#[derive(Clone)]
pub struct Client {
    state: Rc<RefCell<ClientState>>,
}

impl Client {
    /// Connect to the broker under [`default_service_name`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::LookupFailed`] when the broker has not registered
    /// itself with the directory.
    pub fn connect(
        directory: &ServiceDirectory,
        scheduler: Rc<dyn PumpScheduler>,
    ) -> Result<Self, Error> {
        Self::connect_to(directory, &default_service_name(), scheduler)
    }

    /// Connect to a broker registered under an explicit service name.
    ///
    /// The connection is one directory lookup; the event channel is not
    /// allocated until the first subscription needs it.
    pub fn connect_to(
        directory: &ServiceDirectory,
        service: &str,
        scheduler: Rc<dyn PumpScheduler>,
    ) -> Result<Self, Error> {
        let request = directory.look_up(service)?;
        let id = ClientId::next();
        debug!(client = id.as_u64(), service, "connected");
        Ok(Client {
            state: Rc::new(RefCell::new(ClientState {
                id,
                directory: directory.clone(),
                service: service.to_string(),
                scheduler,
                request: Some(request),
                event_tx: None,
                event_rx: None,
                registry: SubscriptionRegistry::default(),
                pump_token: None,
            })),
        })
    }

    /// Connect with automatic retry and exponential backoff.
    ///
    /// Useful at host startup when the broker may still be registering.
    /// Retries with delays of 100ms, 200ms, 400ms, etc. `max_attempts` is
    /// clamped to at least one attempt.
    ///
    /// # Errors
    ///
    /// Returns the last lookup error if all attempts fail.
    pub fn connect_with_retry(
        directory: &ServiceDirectory,
        service: &str,
        scheduler: Rc<dyn PumpScheduler>,
        max_attempts: u32,
    ) -> Result<Self, Error> {
        let attempts = max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match Self::connect_to(directory, service, Rc::clone(&scheduler)) {
                Ok(client) => return Ok(client),
                Err(e) => {
                    last_error = Some(e);
                    if attempt < attempts {
                        // Exponential backoff: 100ms, 200ms, 400ms, ...
                        let delay = Duration::from_millis(100 * (1 << (attempt - 1)));
                        thread::sleep(delay);
                    }
                }
            }
        }

        Err(last_error.expect("at least one attempt always runs"))
    }

    pub fn id(&self) -> ClientId {
        self.state.borrow().id
    }

    /// Whether the client currently holds a request channel.
    pub fn is_connected(&self) -> bool {
        self.state.borrow().request.is_some()
    }

    /// The service name this client resolves on connect and reconnect.
    pub fn service_name(&self) -> String {
        self.state.borrow().service.clone()
    }

    /// Number of local subscription entries.
    pub fn subscription_count(&self) -> usize {
        self.state.borrow().registry.len()
    }

    /// Whether the auto-pump is currently armed.
    pub fn pump_armed(&self) -> bool {
        self.state.borrow().pump_token.is_some()
    }

    // ========== Request/reply engine ==========

    /// Send a request and block, with no timeout, until the broker replies.
    ///
    /// A single-use reply channel is allocated per call; its send right
    /// rides along with the request and the reply is awaited on it. The
    /// channel is released on every exit path.
    ///
    /// # Errors
    ///
    /// - [`Error::Disconnected`] when there is no request channel; nothing
    ///   is sent in that case.
    /// - [`Error::SendFailed`] / [`Error::ReceiveFailed`] when the broker
    ///   went away mid-request.
    /// - [`Error::Protocol`] when the reply is not a valid frame or not
    ///   valid JSON.
    pub fn call(&self, payload: &Value) -> Result<Value, Error> {
        let (request, id) = {
            let state = self.state.borrow();
            (
                state
                    .request
                    .clone()
                    .ok_or(Error::Disconnected(NO_REQUEST_CHANNEL))?,
                state.id,
            )
        };
        let text = serde_json::to_string(payload)
            .map_err(|e| Error::Protocol(format!("failed to serialize request: {}", e)))?;

        let (reply_tx, reply_rx) = channel::channel(REPLY_QUEUE_LIMIT);
        let bytes = frame::encode(
            &text,
            request.id(),
            Some(reply_rx.id()),
            frame::MSG_ID_REQUEST,
        )?;
        trace!(client = id.as_u64(), len = bytes.len(), "request sent, awaiting reply");
        request.send(Message {
            bytes,
            reply: Some(reply_tx),
        })?;

        let reply = reply_rx.recv()?;
        decode_json_payload(&reply.bytes, "reply")
    }

    /// Send a request without waiting for any reply.
    ///
    /// No reply right is attached; success means the request was enqueued,
    /// not that the broker processed it.
    pub fn send(&self, payload: &Value) -> Result<(), Error> {
        let request = {
            let state = self.state.borrow();
            state
                .request
                .clone()
                .ok_or(Error::Disconnected(NO_REQUEST_CHANNEL))?
        };
        let text = serde_json::to_string(payload)
            .map_err(|e| Error::Protocol(format!("failed to serialize request: {}", e)))?;
        let bytes = frame::encode(&text, request.id(), None, frame::MSG_ID_REQUEST)?;
        request.send(Message { bytes, reply: None })
    }

    /// Administrative request sent over the event channel: the event
    /// channel's send right rides along as the reply right, and the reply
    /// is read as the next message on the event channel.
    fn admin_call(&self, body: &AdminRequest<'_>) -> Result<Value, Error> {
        let (request, event_tx, event_rx, id) = {
            let mut state = self.state.borrow_mut();
            let request = state
                .request
                .clone()
                .ok_or(Error::Disconnected(NO_REQUEST_CHANNEL))?;
            let (event_tx, event_rx) = state.ensure_event_channel();
            (request, event_tx, event_rx, state.id)
        };
        let text = serde_json::to_string(body)
            .map_err(|e| Error::Protocol(format!("failed to serialize request: {}", e)))?;
        let bytes = frame::encode(
            &text,
            request.id(),
            Some(event_rx.id()),
            event_rx.id().as_u32(),
        )?;
        trace!(client = id.as_u64(), len = bytes.len(), "administrative request");
        request.send(Message {
            bytes,
            reply: Some(event_tx),
        })?;

        let reply = event_rx.recv()?;
        decode_json_payload(&reply.bytes, "reply")
    }

    // ========== Subscriptions ==========

    /// Register interest in the given event names with the broker, without
    /// installing a local callback.
    ///
    /// Each name is a separate administrative request; the first failure
    /// aborts the rest and is returned. An empty list is rejected with
    /// [`Error::InvalidArgument`] before anything is sent. Use this with
    /// [`Client::pump`] or [`Client::receive_event`] when the host drains
    /// events itself.
    pub fn subscribe(&self, events: &[&str]) -> Result<(), Error> {
        if events.is_empty() {
            return Err(Error::InvalidArgument(EMPTY_EVENT_LIST));
        }
        for event in events {
            self.subscribe_one(event)?;
        }
        Ok(())
    }

    /// Register interest in one event name and return the broker's reply.
    pub fn subscribe_one(&self, event: &str) -> Result<Value, Error> {
        debug!(client = self.id().as_u64(), event, "subscribing");
        self.admin_call(&AdminRequest::Subscribe { event })
    }

    /// Subscribe to the given event names and install `callback` for them.
    ///
    /// The broker is told about every name first (first failure aborts,
    /// and an empty list is rejected outright); only on success is one
    /// registry entry appended covering all of them, and the auto-pump
    /// armed if it was not already. The literal `"*"` subscribes to
    /// everything, including events with no type.
    ///
    /// The callback runs on the host thread and may re-enter the client.
    /// Returning an `Err` from it stops that event's dispatch pass and
    /// surfaces as [`Error::CallbackFailed`] (logged and retried on the
    /// next tick when the auto-pump is driving).
    pub fn subscribe_with<F>(&self, events: &[&str], callback: F) -> Result<(), Error>
    where
        F: Fn(&EventEnvelope) -> CallbackResult + 'static,
    {
        self.subscribe(events)?;
        {
            let mut state = self.state.borrow_mut();
            state.registry.append(events, Rc::new(callback));
        }
        self.arm_pump()
    }

    /// Withdraw interest in one event name and return the broker's reply.
    ///
    /// Only the broker-side registration is withdrawn: any local entry that
    /// names this event stays installed, keeps owning its callback, and
    /// still dispatches if matching events reach the client (for example
    /// through a wildcard registration or until the broker stops pushing).
    ///
    /// # Errors
    ///
    /// [`Error::Disconnected`] when the client has no request channel or no
    /// event channel yet.
    pub fn unsubscribe(&self, event: &str) -> Result<Value, Error> {
        {
            let state = self.state.borrow();
            if state.request.is_none() {
                return Err(Error::Disconnected(NO_REQUEST_CHANNEL));
            }
            if state.event_rx.is_none() {
                return Err(Error::Disconnected(NO_EVENT_CHANNEL));
            }
        }
        debug!(client = self.id().as_u64(), event, "unsubscribing");
        self.admin_call(&AdminRequest::Unsubscribe { event })
    }

    // ========== Event intake ==========

    /// Receive one event directly, bypassing the subscription registry.
    ///
    /// `Ok(None)` means nothing arrived within the wait; that is not an
    /// error. The payload must parse as JSON.
    ///
    /// # Errors
    ///
    /// [`Error::Disconnected`] when no event channel exists yet (subscribe
    /// first), [`Error::Protocol`] on undecodable frames or payloads.
    pub fn receive_event(&self, wait: Wait) -> Result<Option<Value>, Error> {
        let event_rx = {
            let state = self.state.borrow();
            match &state.event_rx {
                Some(rx) => Rc::clone(rx),
                None => return Err(Error::Disconnected(NO_EVENT_CHANNEL)),
            }
        };
        let Some(message) = event_rx.receive(wait)? else {
            return Ok(None);
        };
        decode_json_payload(&message.bytes, "event").map(Some)
    }

    /// Receive at most one event and dispatch it through the registry.
    ///
    /// Returns the number of callbacks invoked: 0 when nothing was queued
    /// within the wait, when no event channel exists yet, or when the event
    /// matched no entry. An event whose payload is not valid JSON is still
    /// dispatched to wildcard entries with only its raw bytes.
    ///
    /// # Errors
    ///
    /// [`Error::CallbackFailed`] when a callback errors (later entries in
    /// that pass are not invoked), [`Error::ReceiveFailed`] /
    /// [`Error::Protocol`] on transport or frame trouble. The event is
    /// consumed in every case.
    pub fn pump(&self, wait: Wait) -> Result<usize, Error> {
        Ok(pump_once(&self.state, wait)?.unwrap_or(0))
    }

    fn arm_pump(&self) -> Result<(), Error> {
        let (scheduler, id) = {
            let state = self.state.borrow();
            if state.pump_token.is_some() {
                return Ok(());
            }
            (Rc::clone(&state.scheduler), state.id)
        };

        let weak = Rc::downgrade(&self.state);
        let task: PumpTask = Box::new(move || {
            if let Some(state) = weak.upgrade() {
                auto_pump_tick(&state);
            }
        });

        let token = scheduler.schedule(PUMP_INTERVAL, task)?;
        self.state.borrow_mut().pump_token = Some(token);
        debug!(
            client = id.as_u64(),
            token = token.into_raw(),
            "auto-pump armed"
        );
        Ok(())
    }

    // ========== Connection lifecycle ==========

    /// Tear the connection down, re-resolve the service, and replay every
    /// registered subscription.
    ///
    /// The event channel is re-allocated unconditionally, and each event
    /// name of each registry entry (the wildcard included, literally) is
    /// re-announced to the broker in entry order. The first replay failure
    /// is returned as-is: the client stays connected, already-replayed
    /// names stay registered, and nothing is rolled back, so broker-side
    /// state may be partial. The auto-pump, if armed, keeps running and
    /// picks up the fresh channel on its next tick.
    pub fn reconnect(&self) -> Result<(), Error> {
        let (directory, service, id) = {
            let mut state = self.state.borrow_mut();
            state.event_tx = None;
            state.event_rx = None;
            state.request = None;
            (state.directory.clone(), state.service.clone(), state.id)
        };

        let request = directory.look_up(&service)?;
        let replay = {
            let mut state = self.state.borrow_mut();
            state.request = Some(request);
            state.ensure_event_channel();
            state.registry.replay_names()
        };
        debug!(
            client = id.as_u64(),
            service = %service,
            replayed = replay.len(),
            "reconnected, replaying subscriptions"
        );

        for event in &replay {
            self.subscribe_one(event)?;
        }
        Ok(())
    }

    /// Release both channels and stop the auto-pump. Idempotent.
    ///
    /// The subscription registry is left intact: a later [`Client::reconnect`]
    /// replays it, and only dropping the last handle clears it.
    pub fn disconnect(&self) {
        let (token, scheduler, id, was_connected) = {
            let mut state = self.state.borrow_mut();
            let token = state.pump_token.take();
            state.event_tx = None;
            state.event_rx = None;
            let was_connected = state.request.take().is_some();
            (token, Rc::clone(&state.scheduler), state.id, was_connected)
        };
        if let Some(token) = token {
            scheduler.cancel(token);
        }
        if was_connected {
            debug!(client = id.as_u64(), "disconnected");
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Client")
            .field("id", &state.id)
            .field("service", &state.service)
            .field("connected", &state.request.is_some())
            .field("subscriptions", &state.registry.len())
            .finish()
    }
}

/// Decode a frame and parse its payload as JSON.
fn decode_json_payload(bytes: &[u8], what: &str) -> Result<Value, Error> {
    let decoded = frame::decode(bytes)?;
    serde_json::from_slice(decoded.payload)
        .map_err(|e| Error::Protocol(format!("failed to parse {} JSON: {}", what, e)))
}

/// Receive at most one event and dispatch it. `Ok(None)` means nothing was
/// ready (or no event channel exists); `Ok(Some(n))` means one event was
/// dispatched to `n` callbacks.
fn pump_once(state: &Rc<RefCell<ClientState>>, wait: Wait) -> Result<Option<usize>, Error> {
    let event_rx = {
        let guard = state.borrow();
        match &guard.event_rx {
            Some(rx) => Rc::clone(rx),
            None => return Ok(None),
        }
    };

    let Some(message) = event_rx.receive(wait)? else {
        return Ok(None);
    };
    let decoded = frame::decode(&message.bytes)?;
    let envelope = EventEnvelope::from_payload(decoded.payload.to_vec());
    trace!(
        event = envelope.event_type.as_deref().unwrap_or("<untyped>"),
        "event received"
    );

    // Snapshot before invoking: callbacks may re-enter the client and
    // append entries, which must not affect this pass.
    let callbacks = state
        .borrow()
        .registry
        .matching(envelope.event_type.as_deref());

    let mut dispatched = 0;
    for callback in callbacks {
        callback(&envelope).map_err(|e| Error::CallbackFailed(format!("{:#}", e)))?;
        dispatched += 1;
    }
    Ok(Some(dispatched))
}

/// One auto-pump firing: drain the event channel without blocking until
/// nothing is ready. Errors are logged and left for the next tick.
fn auto_pump_tick(state: &Rc<RefCell<ClientState>>) {
    loop {
        match pump_once(state, Wait::Poll) {
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(e) => {
                let id = state.borrow().id;
                match e {
                    Error::CallbackFailed(_) => warn!(client = id.as_u64(), "auto-pump: {}", e),
                    _ => error!(client = id.as_u64(), "auto-pump: {}", e),
                }
                break;
            }
        }
    }
}

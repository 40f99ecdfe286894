//! Causeway Client Library
//!
//! This library provides the client half of the Causeway message bus:
//!
//! - `client` - connection handle, request/reply, subscriptions, pumping
//! - `channel` - message channels, transfer rights, and the service directory
//! - `frame` - wire codec for framed JSON payloads
//! - `envelope` - decoded event handed to callbacks
//! - `registry` - event filters and callback bookkeeping
//! - `pump` - scheduler seam and the shipped run loop
//! - `error` - error type shared by every operation
//!
//! # Client Module
//!
//! The `client` module is the recommended way to talk to the broker:
//!
//! ```ignore
//! use causeway_client::client::Client;
//! use causeway_client::pump::RunLoop;
//! use std::rc::Rc;
//!
//! let scheduler = Rc::new(RunLoop::new());
//! let client = Client::connect(&directory, scheduler.clone())?;
//! let reply = client.call(&serde_json::json!({"query": "displays"}))?;
//!
//! client.subscribe_with(&["window_moved"], |event| {
//!     println!("{:?}", event.decoded);
//!     Ok(())
//! })?;
//! loop {
//!     scheduler.run_pending();
//! }
//! ```

pub mod channel;
pub mod client;
pub mod envelope;
pub mod error;
pub mod frame;
pub mod pump;
pub mod registry;

//! Trellis: the session distribution core of a browser-automation grid.
//!
//! Clients ask for browser sessions; nodes host a bounded pool of slots that
//! can run them. Everything in between is this crate: a new-session queue
//! with retry-to-head semantics, a distributor holding the authoritative
//! grid model and running the scheduling loop, a session map binding session
//! IDs to node URIs for command routing, and the event bus and authenticated
//! HTTP surface tying the roles together.
//!
//! # Key Components
//!
//! - [`queue::LocalSessionQueue`]: FIFO of pending requests; `add` blocks
//!   the caller until a scheduler matches the request or it times out
//! - [`distributor::LocalDistributor`]: the single writer over grid state,
//!   pairing queued requests with free slots through a pluggable
//!   [`distributor::selector::SlotSelector`]
//! - [`node::LocalNode`]: a slot pool in front of black-box session
//!   factories; [`node::remote::RemoteNode`] is the same surface over HTTP
//! - [`sessionmap::LocalSessionMap`]: session ID → node URI bindings
//! - [`events::LocalEventBus`]: lossy, ordered pub/sub between components
//!
//! # Architecture
//!
//! A session request flows queue → distributor → node → session map: the
//! queue announces the request on the bus, the distributor's scheduling tick
//! claims it, reserves a slot in the grid model, asks the owning node to
//! create the session, records the binding, and fires the terminal event
//! that completes the client's blocked `add` call. Every mutation of grid
//! state happens under one fair write lock held for the duration of a
//! scheduling tick.

pub mod capabilities;
pub mod config;
pub mod distributor;
pub mod error;
pub mod events;
pub mod node;
pub mod queue;
pub mod server;
pub mod session;
pub mod sessionmap;
pub mod testing;

pub use capabilities::Capabilities;
pub use config::GridConfig;
pub use distributor::{DistributorStatus, LocalDistributor};
pub use error::{GridError, Result};
pub use events::{EventBus, GridEvent, LocalEventBus};
pub use node::{Availability, LocalNode, Node, NodeStatus};
pub use queue::{LocalSessionQueue, SessionQueue};
pub use server::Secret;
pub use session::{
    CreateSessionRequest, CreateSessionResponse, Dialect, NewSessionOutcome, NodeId, RequestId,
    Session, SessionId, SessionRequest,
};
pub use sessionmap::{LocalSessionMap, SessionMap};

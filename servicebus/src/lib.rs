//! TRv1 Service Bus
//!
//! Client layer for exchanging one-way messages and synchronous RPC calls
//! between server nodes over a shared AMQP broker.  It handles:
//!
//! - **Failover routing** across an ordered list of broker hosts, either
//!   first-host (`Simple`) or first host through which the target node
//!   answers `PING` (`Smart`).
//! - **Correlated RPC** over per-call exclusive reply queues, with a single
//!   countdown timeout armed at send time.
//! - **Service dispatch**: one worker thread and bounded queue per
//!   registered service, foreground (serialized) or background (one thread
//!   per job).
//! - **Liveness**: a watchdog per receiver that probes the broker host and
//!   tears down a link whose peer has gone silent; host loops reconnect
//!   after a fixed backoff.
//! - **Wire format**: XML envelopes with a JSON params payload, stamped
//!   with a SHA-1 token over the shared secret and the local date.
//!
//! ## Architecture
//!
//! ```text
//!  ServiceBus::run ── one host loop thread per broker host
//!        │
//!        ├─ MessageBusReceiver ── ConnectionDriver ── BrokerChannel
//!        │        │  decode, token check, classify
//!        │        ▼
//!        │   ServiceRunner (per service) ── handler(Request, RpcResponse)
//!        │                                         │ replies via outbox
//!        └─ PingWatcher ── flips LinkState on probe failure
//!
//!  Sender::call ── FailoverRouter ── Caller ── ConnectionDriver
//! ```
//!
//! ## Crate modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`broker`]     | Broker abstraction, AMQP and in-memory implementations |
//! | [`caller`]     | Host-bound publish and correlated call |
//! | [`config`]     | `Configuration`, defaults and factories |
//! | [`connection`] | Connection lifecycle and link liveness |
//! | [`message`]    | Envelope codec and target addressing |
//! | [`receiver`]   | Delivery classification and dispatch |
//! | [`router`]     | Simple and Smart host selection |
//! | [`runner`]     | Per-service worker threads |
//! | [`sender`]     | Application-facing send/call/ping |
//! | [`service`]    | Service registry and host loops |
//! | [`token`]      | Date-window tokens |
//! | [`watcher`]    | Liveness watchdog |
//! | [`error`]      | Crate-wide error enum |

pub mod broker;
pub mod caller;
pub mod config;
pub mod connection;
pub mod error;
pub mod message;
pub mod probe;
pub mod receiver;
pub mod registry;
pub mod request;
pub mod router;
pub mod runner;
pub mod sender;
pub mod service;
pub mod signal;
pub mod token;
pub mod watcher;

pub use {
    config::Configuration,
    error::{Result, ServiceBusError},
    message::{Event, RpcReply, Target},
    request::{Request, RpcResponse},
    router::RoutingStrategy,
    sender::Sender,
    service::{
        ConcurrencyPolicy, Handler, MessageService, RpcService, ServiceBus, ServiceBusHandle,
    },
};

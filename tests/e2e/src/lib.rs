//! TRv1 Service Bus End-to-End Test Suite
//!
//! Runs whole nodes (service registry, host loops, watchdogs) and clients
//! against in-memory brokers, with broker outages and probe verdicts under
//! test control.
//!
//! Each test file can be run independently:
//!
//! ```bash
//! cargo test -p trv1-servicebus-e2e-tests --test rpc_roundtrip -- --nocapture
//! cargo test -p trv1-servicebus-e2e-tests --test failover -- --nocapture
//! cargo test -p trv1-servicebus-e2e-tests --test liveness -- --nocapture
//! cargo test -p trv1-servicebus-e2e-tests --test dispatch_ordering -- --nocapture
//! ```

pub mod helpers;

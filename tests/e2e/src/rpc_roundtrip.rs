//! E2E Test: RPC and one-way round trips through a running node
//!
//! - `math.add` answers `5` for `{a: 2, b: 3}`
//! - Unknown services and bad tokens are answered, not left to time out
//! - One-way messages reach their handler
//! - A handler can call another service through its request's sender
//! - A slow handler surfaces as a client-side timeout

use {
    assert_matches::assert_matches,
    crossbeam_channel::unbounded,
    serde_json::json,
    std::{thread, time::Duration},
    trv1_servicebus::{
        Request, RoutingStrategy, RpcResponse, ServiceBus, ServiceBusError,
    },
    trv1_servicebus_e2e_tests::helpers::*,
};

const HOSTS: &[&str] = &["mq1"];

// ─────────────────────────────────────────────────────────────────────────────
// Test: registered RPC service answers
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_math_add_round_trip() {
    init_logging();
    let cluster = Cluster::new(HOSTS);
    let mut bus = ServiceBus::new(cluster.node_config(HOSTS));
    add_math_service(&mut bus);
    let handle = cluster.start(bus, HOSTS);

    let mut client = cluster.client(HOSTS);
    assert_eq!(call_add(&mut client).unwrap(), "5");

    let reply = client
        .call("NODE1.math.add", &json!({"a": -7, "b": 10}), CALL_TIMEOUT)
        .unwrap();
    assert_eq!(reply.json::<i64>().unwrap(), 3);

    client.close();
    handle.shutdown();
    handle.join();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test: error responses instead of timeouts
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_missing_service_is_reported() {
    init_logging();
    let cluster = Cluster::new(HOSTS);
    let mut bus = ServiceBus::new(cluster.node_config(HOSTS));
    add_math_service(&mut bus);
    let handle = cluster.start(bus, HOSTS);

    let mut client = cluster.client(HOSTS);
    let reply = client
        .call("NODE1.math.sub", &json!({"a": 2, "b": 3}), CALL_TIMEOUT)
        .unwrap();
    assert!(reply.message.contains("Cannot Find RPC Service: math.sub"));

    client.close();
    handle.shutdown();
    handle.join();
}

#[test]
fn test_bad_token_is_rejected() {
    init_logging();
    let cluster = Cluster::new(HOSTS);
    let mut bus = ServiceBus::new(cluster.node_config(HOSTS));
    add_math_service(&mut bus);
    let handle = cluster.start(bus, HOSTS);

    let mut intruder = cluster.client_with(HOSTS, "wrong-secret", RoutingStrategy::Smart);
    assert_eq!(call_add(&mut intruder).unwrap(), "Token not valid!");

    intruder.close();
    handle.shutdown();
    handle.join();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test: one-way delivery
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_one_way_message_reaches_handler() {
    init_logging();
    let cluster = Cluster::new(HOSTS);
    let (seen_tx, seen) = unbounded();
    let mut bus = ServiceBus::new(cluster.node_config(HOSTS));
    bus.add_message_service("util", "print", move || {
        let seen_tx = seen_tx.clone();
        move |request: &mut Request| -> anyhow::Result<()> {
            seen_tx.send(request.params().clone())?;
            Ok(())
        }
    });
    let handle = cluster.start(bus, HOSTS);

    let mut client = cluster.client(HOSTS);
    client.send("NODE1.util.print", "Hello World!").unwrap();
    assert_eq!(seen.recv_timeout(WAIT).unwrap(), json!("Hello World!"));

    // one-way messages to unknown services vanish without a reply
    client.send("NODE1.util.missing", &json!({})).unwrap();

    client.close();
    handle.shutdown();
    handle.join();
    assert!(seen.try_recv().is_err());
}

// ─────────────────────────────────────────────────────────────────────────────
// Test: handler-initiated calls
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_nested_call_from_handler() {
    init_logging();
    let cluster = Cluster::new(HOSTS);
    let mut bus = ServiceBus::new(cluster.node_config(HOSTS));
    add_math_service(&mut bus);
    bus.add_rpc_service("math", "double_add", || {
        |request: &mut Request, response: RpcResponse| -> anyhow::Result<()> {
            let params = request.params().clone();
            let sum = request
                .sender()
                .call("NODE1.math.add", &params, CALL_TIMEOUT)?
                .json::<i64>()?;
            response.send(sum.saturating_mul(2))?;
            Ok(())
        }
    });
    let handle = cluster.start(bus, HOSTS);

    let mut client = cluster.client(HOSTS);
    let reply = client
        .call("NODE1.math.double_add", &json!({"a": 2, "b": 3}), CALL_TIMEOUT)
        .unwrap();
    assert_eq!(reply.message, "10");

    client.close();
    handle.shutdown();
    handle.join();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test: timeouts
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_slow_handler_times_out() {
    init_logging();
    let cluster = Cluster::new(HOSTS);
    let mut bus = ServiceBus::new(cluster.node_config(HOSTS));
    bus.add_rpc_service("slow", "echo", || {
        |request: &mut Request, response: RpcResponse| -> anyhow::Result<()> {
            thread::sleep(Duration::from_millis(400));
            response.send(request.params())?;
            Ok(())
        }
    });
    let handle = cluster.start(bus, HOSTS);

    let mut client = cluster.client(HOSTS);
    let timeout = Duration::from_millis(100);
    assert_matches!(
        client.call("NODE1.slow.echo", &json!("late"), timeout),
        Err(ServiceBusError::Timeout(t)) if t == timeout
    );

    // the late reply is not mistaken for the next call's answer
    let reply = client
        .call("NODE1.slow.echo", &json!("on time"), CALL_TIMEOUT)
        .unwrap();
    assert_eq!(reply.json::<String>().unwrap(), "on time");

    client.close();
    handle.shutdown();
    handle.join();
    let broker = cluster.broker("mq1");
    assert_eq!(broker.queue_names(), vec![NODE.to_string()]);
}

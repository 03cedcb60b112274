//! E2E Test: watchdog, outages and shutdown
//!
//! - A failed reachability probe tears the link down and the host loop
//!   reconnects once the probe recovers
//! - A broker outage ends the consume loop; service resumes when the
//!   broker returns
//! - Forced teardown through the connection registry
//! - Shutdown interrupts the reconnect backoff

use {
    assert_matches::assert_matches,
    std::time::{Duration, Instant},
    trv1_servicebus::{RoutingStrategy, ServiceBus, ServiceBusError},
    trv1_servicebus_e2e_tests::helpers::*,
};

const HOSTS: &[&str] = &["mq1"];

// ─────────────────────────────────────────────────────────────────────────────
// Test: watchdog verdict
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_watchdog_flip_and_reconnect() {
    init_logging();
    let cluster = Cluster::new(HOSTS);
    let mut bus = ServiceBus::new(cluster.node_config(HOSTS));
    add_math_service(&mut bus);
    let handle = cluster.start(bus, HOSTS);

    cluster.probe.set_alive(false);
    assert!(
        wait_for(|| handle.connection_count() == 0),
        "watchdog never tore the link down"
    );

    cluster.probe.set_alive(true);
    assert!(wait_for(|| handle.connection_count() == 1));

    let mut client = cluster.client(HOSTS);
    assert_eq!(call_add(&mut client).unwrap(), "5");

    client.close();
    handle.shutdown();
    handle.join();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test: broker outage
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_broker_outage_recovery() {
    init_logging();
    let cluster = Cluster::new(HOSTS);
    let broker = cluster.broker("mq1");
    let mut bus = ServiceBus::new(cluster.node_config(HOSTS));
    add_math_service(&mut bus);
    let handle = cluster.start(bus, HOSTS);

    broker.set_online(false);
    assert!(wait_for(|| handle.connection_count() == 0));

    let mut client = cluster.client_with(HOSTS, SECRET, RoutingStrategy::Simple);
    assert_matches!(call_add(&mut client), Err(ServiceBusError::Connection(_)));

    broker.set_online(true);
    assert!(wait_for(|| handle.connection_count() == 1));
    assert!(broker.queue_exists(NODE));

    let mut client = cluster.client(HOSTS);
    assert_eq!(call_add(&mut client).unwrap(), "5");

    client.close();
    handle.shutdown();
    handle.join();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test: forced teardown
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_force_close_connections() {
    init_logging();
    let cluster = Cluster::new(&["mq1", "mq2"]);
    let mut bus = ServiceBus::new(cluster.node_config(&["mq1", "mq2"]));
    add_math_service(&mut bus);
    let handle = cluster.start(bus, &["mq1", "mq2"]);

    assert_eq!(handle.force_close_connections(), 2);
    assert!(wait_for(|| handle.connection_count() == 2));

    let mut client = cluster.client(&["mq2"]);
    assert_eq!(call_add(&mut client).unwrap(), "5");

    client.close();
    handle.shutdown();
    handle.join();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test: shutdown
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_shutdown_interrupts_backoff() {
    init_logging();
    let cluster = Cluster::new(HOSTS);
    let mut config = cluster.node_config(HOSTS);
    config.reconnect_delay_ms = 60_000;
    let mut bus = ServiceBus::new(config);
    add_math_service(&mut bus);
    let handle = cluster.start(bus, HOSTS);

    cluster.broker("mq1").set_online(false);
    assert!(wait_for(|| handle.connection_count() == 0));

    let started = Instant::now();
    handle.shutdown();
    handle.join();
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_shutdown_while_serving() {
    init_logging();
    let cluster = Cluster::new(HOSTS);
    let mut bus = ServiceBus::new(cluster.node_config(HOSTS));
    add_math_service(&mut bus);
    let handle = cluster.start(bus, HOSTS);

    handle.shutdown();
    assert!(handle.is_shutdown());
    handle.join();
    assert_eq!(cluster.broker("mq1").connection_count(), 0);
}

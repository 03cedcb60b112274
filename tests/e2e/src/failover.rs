//! E2E Test: host selection across several brokers
//!
//! - Smart routing finds the host through which the node answers
//! - One sender keeps a separate route per target node
//! - Smart routing falls back to the first host when nobody answers
//! - Simple routing gives up when the first host is down
//! - `ping_all` counts answering hosts

use {
    assert_matches::assert_matches,
    std::{sync::Arc, time::Duration},
    trv1_servicebus::{
        router::FailoverRouter, RoutingStrategy, ServiceBus, ServiceBusError,
    },
    trv1_servicebus_e2e_tests::helpers::*,
};

const ALL_HOSTS: &[&str] = &["mq1", "mq2"];

// ─────────────────────────────────────────────────────────────────────────────
// Test: Smart routing
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_smart_routes_to_answering_host() {
    init_logging();
    let cluster = Cluster::new(ALL_HOSTS);
    let mut bus = ServiceBus::new(cluster.node_config(&["mq2"]));
    add_math_service(&mut bus);
    let handle = cluster.start(bus, &["mq2"]);

    let mut client = cluster.client(ALL_HOSTS);
    assert_eq!(call_add(&mut client).unwrap(), "5");
    assert!(!cluster.broker("mq1").queue_exists(NODE));

    client.close();
    handle.shutdown();
    handle.join();
}

#[test]
fn test_smart_skips_dead_first_host() {
    init_logging();
    let cluster = Cluster::new(ALL_HOSTS);
    let mut bus = ServiceBus::new(cluster.node_config(&["mq2"]));
    add_math_service(&mut bus);
    let handle = cluster.start(bus, &["mq2"]);
    cluster.broker("mq1").set_online(false);

    let mut client = cluster.client(ALL_HOSTS);
    assert_eq!(call_add(&mut client).unwrap(), "5");

    client.close();
    handle.shutdown();
    handle.join();
}

#[test]
fn test_smart_falls_back_to_first_host() {
    init_logging();
    let cluster = Cluster::new(ALL_HOSTS);
    let config = Arc::new(cluster.node_config(ALL_HOSTS));

    let caller = FailoverRouter::new(&config, RoutingStrategy::Smart, false)
        .select("NOBODY")
        .unwrap();
    assert_eq!(caller.host(), "mq1");
    assert!(!caller.is_connected());

    let caller = FailoverRouter::new(&config, RoutingStrategy::Smart, true)
        .select("NOBODY")
        .unwrap();
    assert_eq!(caller.host(), "mq2");
}

#[test]
fn test_smart_routes_each_node_separately() {
    init_logging();
    let cluster = Cluster::new(ALL_HOSTS);
    let mut node1 = ServiceBus::new(cluster.node_config(&["mq2"]));
    add_math_service(&mut node1);
    let node1 = cluster.start(node1, &["mq2"]);
    let mut node2 = ServiceBus::new(cluster.named_node_config(NODE2, &["mq1"]));
    add_math_service(&mut node2);
    let node2 = cluster.start_node(node2, NODE2, &["mq1"]);

    // one sender, two nodes reachable through different hosts
    let mut client = cluster.client(ALL_HOSTS);
    assert_eq!(call_add_on(&mut client, NODE2).unwrap(), "5");
    assert_eq!(call_add_on(&mut client, NODE).unwrap(), "5");
    assert_eq!(call_add_on(&mut client, NODE2).unwrap(), "5");
    assert!(client.ping(NODE, Duration::from_millis(300)).unwrap());

    client.close();
    for handle in [node1, node2] {
        handle.shutdown();
        handle.join();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test: Simple routing
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_simple_gives_up_on_dead_first_host() {
    init_logging();
    let cluster = Cluster::new(ALL_HOSTS);
    let mut bus = ServiceBus::new(cluster.node_config(&["mq2"]));
    add_math_service(&mut bus);
    let handle = cluster.start(bus, &["mq2"]);
    cluster.broker("mq1").set_online(false);

    let mut client = cluster.client_with(ALL_HOSTS, SECRET, RoutingStrategy::Simple);
    assert_matches!(
        call_add(&mut client),
        Err(ServiceBusError::Connection(msg)) if msg == "Cannot Connect to Message Queue"
    );

    cluster.broker("mq1").set_online(true);
    let mut client = cluster.client_with(&["mq2"], SECRET, RoutingStrategy::Simple);
    assert_eq!(call_add(&mut client).unwrap(), "5");

    client.close();
    handle.shutdown();
    handle.join();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test: liveness pings
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_ping_and_ping_all() {
    init_logging();
    let cluster = Cluster::new(&["mq1", "mq2", "mq3"]);
    let mut bus = ServiceBus::new(cluster.node_config(ALL_HOSTS));
    add_math_service(&mut bus);
    let handle = cluster.start(bus, ALL_HOSTS);

    let mut client = cluster.client(&["mq1", "mq2", "mq3"]);
    let timeout = Duration::from_millis(300);
    assert_eq!(client.ping_all(NODE, timeout), (2, 3));
    assert!(client.ping(NODE, timeout).unwrap());
    assert!(!client.ping("NOBODY", Duration::from_millis(50)).unwrap());

    client.close();
    handle.shutdown();
    handle.join();
}

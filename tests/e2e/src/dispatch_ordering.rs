//! E2E Test: per-service concurrency policy
//!
//! - Foreground services handle messages one at a time, in arrival order
//! - Background services overlap jobs
//! - Shutdown waits for background jobs already running

use {
    crossbeam_channel::unbounded,
    serde_json::json,
    std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
        time::Duration,
    },
    trv1_servicebus::{ConcurrencyPolicy, Handler, Request, ServiceBus},
    trv1_servicebus_e2e_tests::helpers::*,
};

const HOSTS: &[&str] = &["mq1"];

/// Tracks how many jobs run at once.
#[derive(Default)]
struct Gauge {
    running: AtomicUsize,
    peak: AtomicUsize,
    started: AtomicUsize,
    finished: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

fn gauged_service(gauge: &Arc<Gauge>, work: Duration) -> Handler {
    let gauge = Arc::clone(gauge);
    Handler::one_way(move || {
        let gauge = Arc::clone(&gauge);
        move |_: &mut Request| -> anyhow::Result<()> {
            gauge.enter();
            thread::sleep(work);
            gauge.exit();
            Ok(())
        }
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Test: foreground ordering
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_foreground_preserves_order() {
    init_logging();
    let cluster = Cluster::new(HOSTS);
    let (seen_tx, seen) = unbounded();
    let mut bus = ServiceBus::new(cluster.node_config(HOSTS));
    bus.add_message_service("log", "append", move || {
        let seen_tx = seen_tx.clone();
        move |request: &mut Request| -> anyhow::Result<()> {
            let n = request.params()["n"].as_u64().unwrap_or_default();
            // later messages are faster, so only serial handling keeps order
            thread::sleep(Duration::from_millis(10u64.saturating_sub(n.saturating_mul(2))));
            seen_tx.send(n)?;
            Ok(())
        }
    });
    let handle = cluster.start(bus, HOSTS);

    let mut client = cluster.client(HOSTS);
    for n in 0..5u64 {
        client.send("NODE1.log.append", &json!({ "n": n })).unwrap();
    }
    let order: Vec<u64> = (0..5).map(|_| seen.recv_timeout(WAIT).unwrap()).collect();
    assert_eq!(order, vec![0, 1, 2, 3, 4]);

    client.close();
    handle.shutdown();
    handle.join();
}

#[test]
fn test_foreground_never_overlaps() {
    init_logging();
    let cluster = Cluster::new(HOSTS);
    let gauge = Arc::new(Gauge::default());
    let mut bus = ServiceBus::new(cluster.node_config(HOSTS));
    bus.register(
        "jobs",
        "serial",
        gauged_service(&gauge, Duration::from_millis(30)),
        ConcurrencyPolicy::Foreground,
    );
    let handle = cluster.start(bus, HOSTS);

    let mut client = cluster.client(HOSTS);
    for _ in 0..3 {
        client.send("NODE1.jobs.serial", &json!({})).unwrap();
    }
    assert!(wait_for(|| gauge.finished.load(Ordering::SeqCst) == 3));
    assert_eq!(gauge.peak.load(Ordering::SeqCst), 1);

    client.close();
    handle.shutdown();
    handle.join();
}

// ─────────────────────────────────────────────────────────────────────────────
// Test: background concurrency and drain
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_background_overlaps_and_drains_on_shutdown() {
    init_logging();
    let cluster = Cluster::new(HOSTS);
    let gauge = Arc::new(Gauge::default());
    let mut bus = ServiceBus::new(cluster.node_config(HOSTS));
    bus.register(
        "jobs",
        "parallel",
        gauged_service(&gauge, Duration::from_millis(300)),
        ConcurrencyPolicy::Background,
    );
    let handle = cluster.start(bus, HOSTS);

    let mut client = cluster.client(HOSTS);
    for _ in 0..4 {
        client.send("NODE1.jobs.parallel", &json!({})).unwrap();
    }
    assert!(wait_for(|| gauge.started.load(Ordering::SeqCst) == 4));
    assert!(gauge.peak.load(Ordering::SeqCst) >= 2);

    client.close();
    handle.shutdown();
    handle.join();
    assert_eq!(gauge.finished.load(Ordering::SeqCst), 4);
}

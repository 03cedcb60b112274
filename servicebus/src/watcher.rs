//! Liveness watchdog for one receiver's broker link.
//!
//! A [`PingWatcher`] wakes every jiffy and, once per probe interval, asks its
//! [`ReachabilityProbe`] whether the broker host is still there.  When the
//! probe fails on every attempt the link is marked down, which ends the
//! receiver's consume loop on its next tick, and the watcher exits.  A link
//! that is already down, or a stop request, also ends the watcher without
//! another probe.
//!
//! ```ignore
//! let watcher = PingWatcher::start(receiver.link(), probe, WatcherConfig::default());
//! receiver.start_receive(&runners, &shutdown);
//! watcher.stop();
//! watcher.join();
//! ```

use {
    crate::{
        config::WatcherConfig,
        connection::LinkState,
        probe::{probe_with_retries, ReachabilityProbe},
        signal::StopSignal,
    },
    log::{debug, info, warn},
    std::{
        sync::Arc,
        thread::{Builder, JoinHandle},
        time::Instant,
    },
};

pub struct PingWatcher {
    stop: StopSignal,
    thread: Option<JoinHandle<()>>,
}

impl PingWatcher {
    /// Spawn the watchdog thread for `link`.
    pub fn start(
        link: Arc<LinkState>,
        probe: Arc<dyn ReachabilityProbe>,
        config: WatcherConfig,
    ) -> Self {
        let stop = StopSignal::new();
        let thread_stop = stop.clone();
        info!(
            "starting watchdog for {} (probe every {:?})",
            link.host(),
            config.probe_interval()
        );
        let thread = Builder::new()
            .name("trv1PingWatch".to_string())
            .spawn(move || Self::run_loop(&link, probe.as_ref(), &config, &thread_stop))
            .expect("failed to spawn watchdog thread");
        Self {
            stop,
            thread: Some(thread),
        }
    }

    fn run_loop(
        link: &LinkState,
        probe: &dyn ReachabilityProbe,
        config: &WatcherConfig,
        stop: &StopSignal,
    ) {
        let mut last_probe: Option<Instant> = None;

        loop {
            if stop.is_triggered() {
                debug!("watchdog for {} stopped", link.host());
                return;
            }
            if !link.is_connected() {
                debug!("link to {} already down, watchdog exiting", link.host());
                return;
            }

            let due = last_probe.map_or(true, |at| at.elapsed() >= config.probe_interval());
            if due {
                last_probe = Some(Instant::now());
                let alive = probe_with_retries(
                    probe,
                    link.host(),
                    config.probe_attempts,
                    config.probe_pause(),
                    stop.wake_receiver(),
                );
                if !alive && !stop.is_triggered() {
                    if link.mark_disconnected() {
                        warn!("{} unreachable, marking link down", link.host());
                    }
                    return;
                }
            }

            stop.wait(config.jiffy());
        }
    }

    /// Ask the watchdog to exit.  Wakes it immediately.
    pub fn stop(&self) {
        self.stop.trigger();
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }

    /// Wait for the watchdog thread to exit.
    pub fn join(mut self) {
        self.join_thread();
    }

    fn join_thread(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("watchdog thread panicked");
            }
        }
    }
}

impl Drop for PingWatcher {
    fn drop(&mut self) {
        self.stop.trigger();
        self.join_thread();
    }
}

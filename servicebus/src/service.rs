//! Service registry and the per-host server loops.

use {
    crate::{
        config::Configuration,
        error::{Result, ServiceBusError},
        message::service_key,
        receiver::{MessageBusReceiver, ReceiveOutcome},
        registry::ConnectionRegistry,
        request::{Request, RpcResponse},
        runner::RunnerSet,
        signal::StopSignal,
        watcher::PingWatcher,
    },
    log::{error, info, warn},
    std::{
        collections::HashMap,
        fmt,
        sync::Arc,
        thread::{Builder, JoinHandle},
    },
};

// ── Handler traits ──────────────────────────────────────────────────────────

/// Handles one-way messages.
pub trait MessageService {
    fn on_message(&mut self, request: &mut Request) -> anyhow::Result<()>;
}

/// Handles RPC calls.  The reply goes out through `response`; dropping it
/// unanswered leaves the caller to time out.
pub trait RpcService {
    fn on_call(&mut self, request: &mut Request, response: RpcResponse) -> anyhow::Result<()>;
}

impl<F> MessageService for F
where
    F: FnMut(&mut Request) -> anyhow::Result<()>,
{
    fn on_message(&mut self, request: &mut Request) -> anyhow::Result<()> {
        self(request)
    }
}

impl<F> RpcService for F
where
    F: FnMut(&mut Request, RpcResponse) -> anyhow::Result<()>,
{
    fn on_call(&mut self, request: &mut Request, response: RpcResponse) -> anyhow::Result<()> {
        self(request, response)
    }
}

pub type MessageFactory = Arc<dyn Fn() -> Box<dyn MessageService> + Send + Sync>;
pub type RpcFactory = Arc<dyn Fn() -> Box<dyn RpcService> + Send + Sync>;

/// A registered handler.  The factory yields a fresh instance per dispatch.
#[derive(Clone)]
pub enum Handler {
    OneWay(MessageFactory),
    Rpc(RpcFactory),
}

impl Handler {
    pub fn one_way<S, F>(factory: F) -> Self
    where
        S: MessageService + 'static,
        F: Fn() -> S + Send + Sync + 'static,
    {
        Self::OneWay(Arc::new(move || Box::new(factory()) as Box<dyn MessageService>))
    }

    pub fn rpc<S, F>(factory: F) -> Self
    where
        S: RpcService + 'static,
        F: Fn() -> S + Send + Sync + 'static,
    {
        Self::Rpc(Arc::new(move || Box::new(factory()) as Box<dyn RpcService>))
    }

    pub fn kind(&self) -> ServiceKind {
        match self {
            Self::OneWay(_) => ServiceKind::Message,
            Self::Rpc(_) => ServiceKind::Rpc,
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OneWay(_) => f.write_str("Handler::OneWay"),
            Self::Rpc(_) => f.write_str("Handler::Rpc"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    Message,
    Rpc,
}

/// How a service's jobs are executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConcurrencyPolicy {
    /// Inline on the runner thread, one at a time in arrival order.
    #[default]
    Foreground,
    /// One detached thread per job; completion order is unspecified.
    Background,
}

#[derive(Debug, Clone)]
pub struct ServiceEntry {
    pub handler: Handler,
    pub policy: ConcurrencyPolicy,
}

type Hook = Arc<dyn Fn() + Send + Sync>;

// ── ServiceBus ──────────────────────────────────────────────────────────────

/// Registry of services plus the server loops that feed them.
pub struct ServiceBus {
    config: Arc<Configuration>,
    services: HashMap<(ServiceKind, String), ServiceEntry>,
    on_start: Option<Hook>,
    on_exit: Option<Hook>,
}

impl ServiceBus {
    pub fn new(config: impl Into<Arc<Configuration>>) -> Self {
        Self {
            config: config.into(),
            services: HashMap::new(),
            on_start: None,
            on_exit: None,
        }
    }

    pub fn configuration(&self) -> &Arc<Configuration> {
        &self.config
    }

    /// Register a foreground RPC service at `category.name`.
    pub fn add_rpc_service<S, F>(&mut self, category: &str, name: &str, factory: F) -> &mut Self
    where
        S: RpcService + 'static,
        F: Fn() -> S + Send + Sync + 'static,
    {
        self.register(category, name, Handler::rpc(factory), ConcurrencyPolicy::Foreground)
    }

    /// Register a foreground message service at `category.name`.
    pub fn add_message_service<S, F>(
        &mut self,
        category: &str,
        name: &str,
        factory: F,
    ) -> &mut Self
    where
        S: MessageService + 'static,
        F: Fn() -> S + Send + Sync + 'static,
    {
        self.register(
            category,
            name,
            Handler::one_way(factory),
            ConcurrencyPolicy::Foreground,
        )
    }

    /// Register `handler` under `category.name`.  A later registration of the
    /// same kind and key replaces the earlier one.
    pub fn register(
        &mut self,
        category: &str,
        name: &str,
        handler: Handler,
        policy: ConcurrencyPolicy,
    ) -> &mut Self {
        let key = service_key(category, name);
        if self
            .services
            .insert((handler.kind(), key.clone()), ServiceEntry { handler, policy })
            .is_some()
        {
            warn!("service {key} registered twice, keeping the latest");
        }
        self
    }

    pub fn lookup(&self, kind: ServiceKind, category: &str, name: &str) -> Option<&ServiceEntry> {
        self.services.get(&(kind, service_key(category, name)))
    }

    /// Runs at the start of every host loop thread.
    pub fn set_on_start_hook(&mut self, hook: impl Fn() + Send + Sync + 'static) -> &mut Self {
        self.on_start = Some(Arc::new(hook));
        self
    }

    /// Runs when a host loop exits.
    pub fn set_on_exit_hook(&mut self, hook: impl Fn() + Send + Sync + 'static) -> &mut Self {
        self.on_exit = Some(Arc::new(hook));
        self
    }

    /// Start one server loop thread per configured host.
    pub fn run(self) -> Result<ServiceBusHandle> {
        self.config.validate()?;
        let bus = Arc::new(self);
        let shutdown = StopSignal::new();
        let mut threads = Vec::with_capacity(bus.config.hosts.len());

        for host in bus.config.hosts.clone() {
            let thread_bus = Arc::clone(&bus);
            let thread_shutdown = shutdown.clone();
            let spawned = Builder::new()
                .name("trv1SbHost".to_string())
                .spawn(move || thread_bus.run_server(&host, &thread_shutdown));
            match spawned {
                Ok(thread) => threads.push(thread),
                Err(e) => {
                    shutdown.trigger();
                    for thread in threads {
                        let _ = thread.join();
                    }
                    return Err(ServiceBusError::Io(e));
                }
            }
        }

        Ok(ServiceBusHandle {
            shutdown,
            threads,
            registry: Arc::clone(&bus.config.registry),
        })
    }

    /// Serve `host` until `shutdown` fires, rebuilding the connection after
    /// every loss.
    pub fn run_server(&self, host: &str, shutdown: &StopSignal) {
        if let Some(hook) = &self.on_start {
            hook();
        }

        while !shutdown.is_triggered() {
            info!("[Server {host}]: Build Server");
            let runners = RunnerSet::start_all(&self.services, self.config.queue_len);
            let mut receiver = self.config.create_receiver(host);

            let outcome = self.serve(host, &mut receiver, &runners, shutdown);

            runners.stop_all();
            receiver.flush_outbox();
            receiver.close();

            match outcome {
                Ok(ReceiveOutcome::Shutdown) => break,
                Ok(ReceiveOutcome::Disconnected) => {}
                Err(e) => error!("[Server {host}]: {e}"),
            }
            if shutdown.is_triggered() {
                break;
            }
            info!(
                "[Server {host}]: Connection lost, retrying in {:?}",
                self.config.reconnect_delay()
            );
            if shutdown.wait(self.config.reconnect_delay()) {
                break;
            }
        }

        if let Some(hook) = &self.on_exit {
            info!("[Server {host}]: Call on_exit hook");
            hook();
        }
        info!("[Server {host}]: Shutdown");
    }

    fn serve(
        &self,
        host: &str,
        receiver: &mut MessageBusReceiver,
        runners: &RunnerSet,
        shutdown: &StopSignal,
    ) -> Result<ReceiveOutcome> {
        receiver.connect()?;
        receiver.bind_queue_to_exchange()?;

        let watcher = PingWatcher::start(
            receiver.link(),
            self.config.reachability_probe(),
            self.config.watcher.clone(),
        );
        info!("[Server {host}]: Start Receive");
        let outcome = receiver.start_receive(runners, shutdown);
        watcher.stop();
        watcher.join();
        Ok(outcome)
    }
}

// ── ServiceBusHandle ────────────────────────────────────────────────────────

/// Control handle for running server loops.
pub struct ServiceBusHandle {
    shutdown: StopSignal,
    threads: Vec<JoinHandle<()>>,
    registry: Arc<ConnectionRegistry>,
}

impl ServiceBusHandle {
    /// Ask every server loop to finish.  In-flight handlers are waited for,
    /// never interrupted.
    pub fn shutdown(&self) {
        info!("service bus shutdown requested");
        self.shutdown.trigger();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_triggered()
    }

    /// Wait for every server loop to exit.
    pub fn join(self) {
        for thread in self.threads {
            if thread.join().is_err() {
                error!("service bus host loop panicked");
            }
        }
    }

    /// Mark every registered broker link down.  Last resort when a loop is
    /// stuck on a connection that will not notice shutdown on its own.
    pub fn force_close_connections(&self) -> usize {
        self.registry.close_all()
    }

    /// Open broker links in this bus's registry.
    pub fn connection_count(&self) -> usize {
        self.registry.count()
    }
}

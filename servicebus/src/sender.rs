//! High-level sender used by applications and by handlers through
//! [`Request::sender`](crate::request::Request::sender).

use {
    crate::{
        caller::Caller,
        config::Configuration,
        error::{Result, ServiceBusError},
        message::{decode_response, encode_request, next_event_id, RpcReply, Target, PING, PONG},
        router::RoutingStrategy,
        token::current_token,
    },
    log::debug,
    serde::Serialize,
    std::{
        collections::{hash_map::Entry, HashMap},
        sync::Arc,
        time::Duration,
    },
};

pub struct Sender {
    config: Arc<Configuration>,
    strategy: RoutingStrategy,
    /// Caller per target node, reused until its host fails.  Smart routing
    /// picks a host for one node, so callers are never shared across nodes.
    routes: HashMap<String, Caller>,
    /// One caller per connectable host, built on first `ping_all`.
    callers: Option<Vec<Caller>>,
}

impl Sender {
    pub fn new(config: Arc<Configuration>) -> Self {
        let strategy = config.routing;
        Self {
            config,
            strategy,
            routes: HashMap::new(),
            callers: None,
        }
    }

    pub fn with_strategy(mut self, strategy: RoutingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn configuration(&self) -> &Arc<Configuration> {
        &self.config
    }

    /// Split `"<node>.<category>.<service>"`.
    pub fn parse_target(target: &str) -> Result<Target> {
        Target::parse(target)
    }

    /// Call the RPC service at `target` and wait up to `timeout` for its reply.
    pub fn call<P: Serialize + ?Sized>(
        &mut self,
        target: &str,
        params: &P,
        timeout: Duration,
    ) -> Result<RpcReply> {
        let target = Self::parse_target(target)?;
        let body = self.encode(&target, params)?;
        let raw = {
            let caller = self.caller(&target.node, false)?;
            caller.call(&target.node, &body, timeout)
        };
        let raw = self.forget_failed_caller(&target.node, raw)?;
        decode_response(&raw)
    }

    /// Deliver `params` to the message service at `target` without waiting.
    pub fn send<P: Serialize + ?Sized>(&mut self, target: &str, params: &P) -> Result<()> {
        let target = Self::parse_target(target)?;
        let body = self.encode(&target, params)?;
        let result = {
            let caller = self.caller(&target.node, false)?;
            caller.send(&target.node, &body)
        };
        if result.is_err() {
            self.routes.remove(&target.node);
        }
        result
    }

    /// Whether `node` answers `PING` within `timeout`.  Host selection walks
    /// the host list in reverse.
    pub fn ping(&mut self, node: &str, timeout: Duration) -> Result<bool> {
        let reply = {
            let caller = self.caller(node, true)?;
            caller.call(node, PING, timeout)
        };
        match self.forget_failed_caller(node, reply) {
            Ok(reply) => Ok(reply == PONG),
            Err(ServiceBusError::Timeout(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Ping `node` through every connectable host.  Returns
    /// `(answered, connectable hosts)`.
    pub fn ping_all(&mut self, node: &str, timeout: Duration) -> (usize, usize) {
        let config = Arc::clone(&self.config);
        let callers = self
            .callers
            .get_or_insert_with(|| config.create_senders());
        let total = callers.len();
        let answered = callers
            .iter_mut()
            .map(|caller| match caller.call(node, PING, timeout) {
                Ok(reply) => reply == PONG,
                Err(e) => {
                    debug!("ping of {node} via {} failed: {e}", caller.host());
                    false
                }
            })
            .filter(|answered| *answered)
            .count();
        (answered, total)
    }

    /// Close every caller this sender opened.
    pub fn close(&mut self) {
        for (_, mut caller) in self.routes.drain() {
            caller.close();
        }
        if let Some(callers) = self.callers.take() {
            for mut caller in callers {
                caller.close();
            }
        }
    }

    fn encode<P: Serialize + ?Sized>(&self, target: &Target, params: &P) -> Result<String> {
        let params = serde_json::to_value(params)?;
        encode_request(
            &next_event_id().to_string(),
            &current_token(&self.config.secret_token),
            &target.category,
            &target.service,
            &params,
        )
    }

    fn caller(&mut self, node: &str, reverse: bool) -> Result<&mut Caller> {
        let caller = match self.routes.entry(node.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                entry.insert(self.config.create_caller(node, self.strategy, reverse)?)
            }
        };
        Ok(caller)
    }

    /// Drop the node's cached caller when its host is gone so the next
    /// operation selects again.
    fn forget_failed_caller<T>(&mut self, node: &str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_connection() {
                if let Some(mut caller) = self.routes.remove(node) {
                    debug!("discarding caller on {}: {e}", caller.host());
                    caller.close();
                }
            }
        }
        result
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        self.close();
    }
}

//! Broker-wide registries.
//!
//! [`Broker`] maps exchange and queue names to their objects and tracks live
//! connections. Channels resolve names through it; connections register on
//! accept and deregister during teardown.
//!
//! Auto-delete exchanges report themselves on a channel once they have stayed
//! empty for [`AUTO_DELETE_WINDOW`](crate::routing::AUTO_DELETE_WINDOW). The
//! [`ExchangeReaper`] drains that channel and deletes an exchange only after
//! re-checking that it is still registered, still empty and still eligible.

mod queue;

use std::sync::{
    Arc,
    Weak,
    atomic::{AtomicU64, Ordering},
};

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use queue::{Message, Queue};

use crate::{
    config::BrokerConfig,
    error::AmqpError,
    protocol::{QueueBind, QueueDeclare, QueueDelete, QueueUnbind, ReplyCode},
    routing::{
        Binding,
        Exchange,
        ExchangeDeclaration,
        ExchangeSnapshot,
        ExchangeType,
        RoutingError,
    },
    session::{ConnectionId, ConnectionRegistry},
};

/// Name of the default exchange every queue is bound to.
pub const DEFAULT_EXCHANGE: &str = "";

const RESERVED_PREFIX: &str = "amq.";
const DELETION_BACKLOG: usize = 64;

/// Exchange and queue registries plus the live connection table.
pub struct Broker {
    exchanges: DashMap<String, Arc<Exchange>>,
    queues: DashMap<String, Arc<Queue>>,
    connections: ConnectionRegistry,
    deletions: mpsc::Sender<Arc<Exchange>>,
    next_message_id: AtomicU64,
    next_queue_id: AtomicU64,
    queue_capacity: usize,
}

/// Consumer of auto-delete signals; see [`Broker::new`].
pub struct ExchangeReaper {
    broker: Weak<Broker>,
    signals: mpsc::Receiver<Arc<Exchange>>,
}

impl Broker {
    /// Create a broker with the system exchanges in place and default limits.
    ///
    /// The returned [`ExchangeReaper`] must be run for auto-delete exchanges
    /// to be removed; dropping it disables auto-delete.
    #[must_use]
    pub fn new() -> (Arc<Self>, ExchangeReaper) { Self::with_config(&BrokerConfig::default()) }

    /// As [`Broker::new`], taking queue limits from `config`.
    #[must_use]
    pub fn with_config(config: &BrokerConfig) -> (Arc<Self>, ExchangeReaper) {
        let (deletions, signals) = mpsc::channel(DELETION_BACKLOG);
        let broker = Arc::new(Self {
            exchanges: DashMap::new(),
            queues: DashMap::new(),
            connections: ConnectionRegistry::default(),
            deletions,
            next_message_id: AtomicU64::new(1),
            next_queue_id: AtomicU64::new(1),
            queue_capacity: config.queue_capacity.max(1),
        });
        for (name, kind) in [
            (DEFAULT_EXCHANGE, ExchangeType::Direct),
            ("amq.direct", ExchangeType::Direct),
            ("amq.fanout", ExchangeType::Fanout),
            ("amq.topic", ExchangeType::Topic),
        ] {
            let declaration = ExchangeDeclaration::new(name, kind).durable(true);
            broker
                .exchanges
                .insert(name.to_owned(), Arc::new(Exchange::new(declaration, true, None)));
        }
        let reaper = ExchangeReaper {
            broker: Arc::downgrade(&broker),
            signals,
        };
        (broker, reaper)
    }

    #[must_use]
    pub fn connections(&self) -> &ConnectionRegistry { &self.connections }

    #[must_use]
    pub fn exchange(&self, name: &str) -> Option<Arc<Exchange>> {
        self.exchanges.get(name).map(|e| Arc::clone(e.value()))
    }

    #[must_use]
    pub fn exchange_count(&self) -> usize { self.exchanges.len() }

    #[must_use]
    pub fn exchange_snapshots(&self) -> Vec<ExchangeSnapshot> {
        let mut snapshots: Vec<_> = self.exchanges.iter().map(|e| e.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    #[must_use]
    pub fn queue(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.get(name).map(|q| Arc::clone(q.value()))
    }

    #[must_use]
    pub fn queue_count(&self) -> usize { self.queues.len() }

    pub fn next_message_id(&self) -> u64 { self.next_message_id.fetch_add(1, Ordering::Relaxed) }

    /// Declare an exchange, or confirm an equivalent one exists.
    ///
    /// # Errors
    ///
    /// - `NOT_FOUND` for a passive declare of a missing exchange.
    /// - `NOT_IMPLEMENTED` for headers exchanges.
    /// - `PRECONDITION_FAILED` when an existing exchange is not equivalent.
    /// - `ACCESS_REFUSED` for new names in the reserved `amq.` namespace and
    ///   for the default exchange.
    pub fn declare_exchange(
        &self,
        declaration: ExchangeDeclaration,
        passive: bool,
    ) -> Result<Arc<Exchange>, AmqpError> {
        if passive {
            return self
                .exchange(&declaration.name)
                .ok_or_else(|| AmqpError::not_found(format!("no exchange '{}'", declaration.name)));
        }
        if declaration.kind == ExchangeType::Headers {
            return Err(RoutingError::NotImplemented(ExchangeType::Headers).into());
        }
        if declaration.name == DEFAULT_EXCHANGE {
            return Err(AmqpError::access_refused("the default exchange cannot be declared"));
        }
        match self.exchanges.entry(declaration.name.clone()) {
            Entry::Occupied(existing) => {
                let existing = Arc::clone(existing.get());
                if existing.is_equivalent(&declaration) {
                    Ok(existing)
                } else {
                    Err(AmqpError::precondition_failed(format!(
                        "exchange '{}' redeclared with different properties",
                        declaration.name
                    )))
                }
            }
            Entry::Vacant(slot) => {
                if declaration.name.starts_with(RESERVED_PREFIX) {
                    return Err(AmqpError::access_refused(format!(
                        "exchange name '{}' uses the reserved prefix '{RESERVED_PREFIX}'",
                        declaration.name
                    )));
                }
                info!(
                    "exchange declared: name={}, type={}, durable={}, auto_delete={}",
                    declaration.name, declaration.kind, declaration.durable, declaration.auto_delete
                );
                let exchange = Arc::new(Exchange::new(
                    declaration,
                    false,
                    Some(self.deletions.clone()),
                ));
                slot.insert(Arc::clone(&exchange));
                Ok(exchange)
            }
        }
    }

    /// Delete an exchange on client request.
    ///
    /// # Errors
    ///
    /// `NOT_FOUND` if missing, `ACCESS_REFUSED` for system exchanges and
    /// `PRECONDITION_FAILED` when `if_unused` is set and bindings remain.
    pub fn delete_exchange(&self, name: &str, if_unused: bool) -> Result<(), AmqpError> {
        let exchange = self
            .exchange(name)
            .ok_or_else(|| AmqpError::not_found(format!("no exchange '{name}'")))?;
        if exchange.is_system() {
            return Err(AmqpError::access_refused(format!(
                "system exchange '{name}' cannot be deleted"
            )));
        }
        if if_unused && exchange.binding_count() > 0 {
            return Err(AmqpError::precondition_failed(format!(
                "exchange '{name}' is in use"
            )));
        }
        self.exchanges
            .remove_if(name, |_, current| Arc::ptr_eq(current, &exchange));
        info!("exchange deleted: name={name}");
        Ok(())
    }

    /// Delete `exchange` if it is still the registered, empty, auto-delete
    /// exchange of that name. Returns whether it was removed.
    pub fn reap_exchange(&self, exchange: &Arc<Exchange>) -> bool {
        let removed = self
            .exchanges
            .remove_if(exchange.name(), |_, current| {
                Arc::ptr_eq(current, exchange)
                    && current.is_auto_delete()
                    && !current.is_system()
                    && current.binding_count() == 0
            })
            .is_some();
        if removed {
            info!("exchange auto-deleted: name={}", exchange.name());
        } else {
            debug!("stale auto-delete signal ignored: name={}", exchange.name());
        }
        removed
    }

    /// Declare a queue, or confirm an equivalent one exists.
    ///
    /// A new queue is bound to the default exchange under its own name.
    ///
    /// # Errors
    ///
    /// - `NOT_FOUND` for a passive declare of a missing queue.
    /// - `RESOURCE_LOCKED` for another connection's exclusive queue.
    /// - `PRECONDITION_FAILED` for a non-equivalent redeclaration.
    /// - `ACCESS_REFUSED` for explicit names in the `amq.` namespace.
    pub fn declare_queue(
        &self,
        method: &QueueDeclare,
        connection: ConnectionId,
    ) -> Result<Arc<Queue>, AmqpError> {
        let name = if method.queue.is_empty() && !method.passive {
            let n = self.next_queue_id.fetch_add(1, Ordering::Relaxed);
            format!("{RESERVED_PREFIX}gen-{}-{n}", connection.as_u64())
        } else {
            if !method.passive && method.queue.starts_with(RESERVED_PREFIX) {
                return Err(AmqpError::access_refused(format!(
                    "queue name '{}' uses the reserved prefix '{RESERVED_PREFIX}'",
                    method.queue
                )));
            }
            method.queue.clone()
        };

        let queue = match self.queues.entry(name.clone()) {
            Entry::Occupied(existing) => {
                let queue = Arc::clone(existing.get());
                if !queue.accessible_by(connection) {
                    return Err(locked(&name));
                }
                if !method.passive && !queue.is_equivalent(method) {
                    return Err(AmqpError::precondition_failed(format!(
                        "queue '{name}' redeclared with different properties"
                    )));
                }
                return Ok(queue);
            }
            Entry::Vacant(_) if method.passive => {
                return Err(AmqpError::not_found(format!("no queue '{name}'")));
            }
            Entry::Vacant(slot) => {
                let queue = Arc::new(Queue::from_declare(
                    name.clone(),
                    method,
                    connection,
                    self.queue_capacity,
                ));
                slot.insert(Arc::clone(&queue));
                queue
            }
        };

        if let Some(default) = self.exchange(DEFAULT_EXCHANGE) {
            let bind = QueueBind {
                queue: name.clone(),
                exchange: DEFAULT_EXCHANGE.to_owned(),
                routing_key: name.clone(),
                ..QueueBind::default()
            };
            default.add_binding(&bind, connection, false)?;
        }
        info!(
            "queue declared: name={name}, exclusive={}, connection={connection}",
            queue.is_exclusive()
        );
        Ok(queue)
    }

    fn accessible_queue(&self, name: &str, connection: ConnectionId) -> Result<Arc<Queue>, AmqpError> {
        let queue = self
            .queue(name)
            .ok_or_else(|| AmqpError::not_found(format!("no queue '{name}'")))?;
        if queue.accessible_by(connection) {
            Ok(queue)
        } else {
            Err(locked(name))
        }
    }

    fn bindable_exchange(&self, name: &str) -> Result<Arc<Exchange>, AmqpError> {
        if name == DEFAULT_EXCHANGE {
            return Err(AmqpError::access_refused(
                "queues cannot be bound to the default exchange",
            ));
        }
        self.exchange(name)
            .ok_or_else(|| AmqpError::not_found(format!("no exchange '{name}'")))
    }

    /// Bind a queue to an exchange.
    ///
    /// # Errors
    ///
    /// `NOT_FOUND` for a missing queue or exchange, `RESOURCE_LOCKED` for
    /// another connection's exclusive queue, `ACCESS_REFUSED` for the default
    /// exchange.
    pub fn bind_queue(&self, method: &QueueBind, connection: ConnectionId) -> Result<(), AmqpError> {
        self.accessible_queue(&method.queue, connection)?;
        let exchange = self.bindable_exchange(&method.exchange)?;
        exchange.add_binding(method, connection, false)?;
        Ok(())
    }

    /// Remove a binding. Removing a binding that does not exist succeeds.
    ///
    /// # Errors
    ///
    /// As for [`Broker::bind_queue`].
    pub fn unbind_queue(&self, method: &QueueUnbind, connection: ConnectionId) -> Result<(), AmqpError> {
        self.accessible_queue(&method.queue, connection)?;
        let exchange = self.bindable_exchange(&method.exchange)?;
        let binding = Binding::new(
            method.queue.as_str(),
            method.exchange.as_str(),
            method.routing_key.as_str(),
            method.arguments.clone(),
        );
        exchange.remove_binding(&binding)?;
        Ok(())
    }

    /// Delete a queue and every binding targeting it. Returns the number of
    /// messages discarded.
    ///
    /// # Errors
    ///
    /// `NOT_FOUND`, `RESOURCE_LOCKED`, or `PRECONDITION_FAILED` when
    /// `if_empty` is set and messages remain.
    pub fn delete_queue(&self, method: &QueueDelete, connection: ConnectionId) -> Result<u32, AmqpError> {
        let queue = self.accessible_queue(&method.queue, connection)?;
        if method.if_empty && !queue.is_empty() {
            return Err(AmqpError::precondition_failed(format!(
                "queue '{}' is not empty",
                method.queue
            )));
        }
        self.remove_queue(&queue);
        Ok(queue.message_count())
    }

    fn remove_queue(&self, queue: &Arc<Queue>) {
        let removed = self
            .queues
            .remove_if(queue.name(), |_, current| Arc::ptr_eq(current, queue))
            .is_some();
        if !removed {
            return;
        }
        for exchange in &self.exchanges {
            exchange.remove_bindings_for_queue(queue.name());
        }
        info!("queue deleted: name={}", queue.name());
    }

    /// Delete every exclusive queue owned by `connection`.
    pub fn delete_queues_for_connection(&self, connection: ConnectionId) {
        let owned: Vec<Arc<Queue>> = self
            .queues
            .iter()
            .filter(|q| q.owner() == Some(connection))
            .map(|q| Arc::clone(q.value()))
            .collect();
        for queue in &owned {
            self.remove_queue(queue);
        }
    }

    /// Hand `message` to every queue `exchange` routes it to. Returns the
    /// number of queues that accepted it; full queues drop the message.
    ///
    /// # Errors
    ///
    /// Propagates [`RoutingError`] from the exchange.
    pub fn publish(&self, exchange: &Exchange, message: Message) -> Result<usize, RoutingError> {
        let targets = exchange.queues_for_publish(&message.publish)?;
        let message = Arc::new(message);
        let mut delivered = 0;
        for name in targets {
            let Some(queue) = self.queue(&name) else {
                continue;
            };
            if queue.enqueue(Arc::clone(&message)) {
                delivered += 1;
            } else {
                debug!(
                    "queue full, message dropped: queue={name}, capacity={}, message_id={}",
                    queue.capacity(),
                    message.id
                );
            }
        }
        Ok(delivered)
    }
}

fn locked(name: &str) -> AmqpError {
    AmqpError::new(
        ReplyCode::ResourceLocked,
        format!("queue '{name}' is exclusive to another connection"),
    )
}

impl ExchangeReaper {
    /// Process auto-delete signals until `shutdown` fires or the broker is
    /// dropped.
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            let exchange = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                signal = self.signals.recv() => match signal {
                    Some(exchange) => exchange,
                    None => break,
                },
            };
            let Some(broker) = self.broker.upgrade() else {
                break;
            };
            broker.reap_exchange(&exchange);
        }
        debug!("exchange reaper stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use rstest::{fixture, rstest};

    use super::*;
    use crate::{
        protocol::{BasicPublish, ContentHeader},
        routing::AUTO_DELETE_WINDOW,
    };

    #[fixture]
    fn broker() -> Arc<Broker> { Broker::new().0 }

    const CONN: ConnectionId = ConnectionId::new(1);

    fn declare(name: &str) -> QueueDeclare {
        QueueDeclare {
            queue: name.into(),
            ..QueueDeclare::default()
        }
    }

    fn bind(queue: &str, exchange: &str, key: &str) -> QueueBind {
        QueueBind {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: key.into(),
            ..QueueBind::default()
        }
    }

    fn message(broker: &Broker, exchange: &str, key: &str) -> Message {
        Message {
            id: broker.next_message_id(),
            publish: BasicPublish {
                exchange: exchange.into(),
                routing_key: key.into(),
                ..BasicPublish::default()
            },
            header: ContentHeader::new(60, 2),
            body: Bytes::from_static(b"hi"),
        }
    }

    #[rstest]
    fn system_exchanges_are_bootstrapped(broker: Arc<Broker>) {
        assert_eq!(broker.exchange_count(), 4);
        for name in ["", "amq.direct", "amq.fanout", "amq.topic"] {
            let exchange = broker.exchange(name).expect("system exchange");
            assert!(exchange.is_system());
        }
        let err = broker.delete_exchange("amq.topic", false).expect_err("system");
        assert_eq!(err.code, ReplyCode::AccessRefused);
    }

    #[rstest]
    fn topic_scenario_routes_by_pattern(broker: Arc<Broker>) {
        let decl = ExchangeDeclaration::new("ex-1", ExchangeType::Topic);
        let exchange = broker.declare_exchange(decl, false).expect("declare");
        assert_eq!(broker.exchange_count(), 5);
        broker.declare_queue(&declare("q-1"), CONN).expect("queue");
        broker.bind_queue(&bind("q-1", "ex-1", "x.y"), CONN).expect("bind");

        let routed = exchange
            .queues_for_publish(&message(&broker, "ex-1", "x.y").publish)
            .expect("route");
        assert_eq!(routed, ["q-1".to_owned()].into());
        let routed = exchange
            .queues_for_publish(&message(&broker, "ex-1", "x.z").publish)
            .expect("route");
        assert!(routed.is_empty());

        let delivered = broker
            .publish(&exchange, message(&broker, "ex-1", "x.y"))
            .expect("publish");
        assert_eq!(delivered, 1);
        assert_eq!(broker.queue("q-1").expect("queue").len(), 1);
    }

    #[rstest]
    fn default_exchange_routes_by_queue_name(broker: Arc<Broker>) {
        broker.declare_queue(&declare("jobs"), CONN).expect("queue");
        let default = broker.exchange(DEFAULT_EXCHANGE).expect("default");
        let delivered = broker
            .publish(&default, message(&broker, "", "jobs"))
            .expect("publish");
        assert_eq!(delivered, 1);

        let err = broker
            .bind_queue(&bind("jobs", "", "other"), CONN)
            .expect_err("default exchange is not bindable");
        assert_eq!(err.code, ReplyCode::AccessRefused);
    }

    #[rstest]
    fn redeclare_rules(broker: Arc<Broker>) {
        let decl = ExchangeDeclaration::new("logs", ExchangeType::Fanout);
        let first = broker.declare_exchange(decl.clone(), false).expect("declare");
        let again = broker
            .declare_exchange(decl.clone().auto_delete(true), false)
            .expect("auto-delete differences are tolerated");
        assert!(Arc::ptr_eq(&first, &again));

        let err = broker
            .declare_exchange(decl.durable(true), false)
            .expect_err("durability mismatch");
        assert_eq!(err.code, ReplyCode::PreconditionFailed);

        let err = broker
            .declare_exchange(ExchangeDeclaration::new("missing", ExchangeType::Direct), true)
            .expect_err("passive on missing exchange");
        assert_eq!(err.code, ReplyCode::NotFound);
    }

    #[rstest]
    #[case::headers(ExchangeDeclaration::new("h", ExchangeType::Headers), ReplyCode::NotImplemented)]
    #[case::reserved(ExchangeDeclaration::new("amq.custom", ExchangeType::Direct), ReplyCode::AccessRefused)]
    #[case::default(ExchangeDeclaration::new("", ExchangeType::Direct), ReplyCode::AccessRefused)]
    fn rejected_declarations(
        broker: Arc<Broker>,
        #[case] decl: ExchangeDeclaration,
        #[case] code: ReplyCode,
    ) {
        let err = broker.declare_exchange(decl, false).expect_err("rejected");
        assert_eq!(err.code, code);
    }

    #[rstest]
    fn generated_queue_names_are_unique(broker: Arc<Broker>) {
        let a = broker.declare_queue(&declare(""), CONN).expect("queue");
        let b = broker.declare_queue(&declare(""), CONN).expect("queue");
        assert_ne!(a.name(), b.name());
        assert!(a.name().starts_with("amq.gen-"));
    }

    #[rstest]
    fn exclusive_queues_are_locked_and_released(broker: Arc<Broker>) {
        let owner = ConnectionId::new(10);
        let other = ConnectionId::new(11);
        let mut method = declare("private");
        method.exclusive = true;
        broker.declare_queue(&method, owner).expect("queue");
        broker
            .declare_exchange(ExchangeDeclaration::new("fan", ExchangeType::Fanout), false)
            .expect("exchange");
        broker.bind_queue(&bind("private", "fan", ""), owner).expect("bind");

        let err = broker.declare_queue(&method, other).expect_err("locked");
        assert_eq!(err.code, ReplyCode::ResourceLocked);

        broker.delete_queues_for_connection(owner);
        assert!(broker.queue("private").is_none());
        assert_eq!(broker.exchange("fan").expect("exchange").binding_count(), 0);
    }

    #[rstest]
    fn delete_queue_checks_emptiness(broker: Arc<Broker>) {
        broker.declare_queue(&declare("q"), CONN).expect("queue");
        let default = broker.exchange(DEFAULT_EXCHANGE).expect("default");
        broker
            .publish(&default, message(&broker, "", "q"))
            .expect("publish");

        let mut delete = QueueDelete {
            queue: "q".into(),
            if_empty: true,
            ..QueueDelete::default()
        };
        let err = broker.delete_queue(&delete, CONN).expect_err("not empty");
        assert_eq!(err.code, ReplyCode::PreconditionFailed);

        delete.if_empty = false;
        assert_eq!(broker.delete_queue(&delete, CONN), Ok(1));
        assert!(default.bindings_for_queue("q").is_empty());
    }

    #[test]
    fn full_queues_stop_counting_as_deliveries() {
        let (broker, _reaper) = Broker::with_config(&BrokerConfig::default().queue_capacity(2));
        broker.declare_queue(&declare("small"), CONN).expect("queue");
        let default = broker.exchange(DEFAULT_EXCHANGE).expect("default");

        let outcomes: Vec<usize> = (0..3)
            .map(|_| {
                broker
                    .publish(&default, message(&broker, "", "small"))
                    .expect("publish")
            })
            .collect();
        assert_eq!(outcomes, [1, 1, 0]);
        assert_eq!(broker.queue("small").expect("queue").len(), 2);
    }

    #[rstest]
    fn reaper_revalidates_before_deleting(broker: Arc<Broker>) {
        let decl = ExchangeDeclaration::new("tmp", ExchangeType::Direct).auto_delete(true);
        let exchange = broker.declare_exchange(decl, false).expect("declare");
        broker.declare_queue(&declare("q"), CONN).expect("queue");
        broker.bind_queue(&bind("q", "tmp", "k"), CONN).expect("bind");

        assert!(!broker.reap_exchange(&exchange), "bound exchanges survive");
        exchange.remove_bindings_for_queue("q");
        assert!(broker.reap_exchange(&exchange));
        assert!(!broker.reap_exchange(&exchange), "second signal is ignored");
        assert!(broker.exchange("tmp").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn reaper_deletes_after_window() {
        let (broker, reaper) = Broker::new();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(reaper.run(shutdown.clone()));

        let decl = ExchangeDeclaration::new("tmp", ExchangeType::Fanout).auto_delete(true);
        broker.declare_exchange(decl, false).expect("declare");
        broker.declare_queue(&declare("q"), CONN).expect("queue");
        broker.bind_queue(&bind("q", "tmp", ""), CONN).expect("bind");
        let unbind = QueueUnbind {
            queue: "q".into(),
            exchange: "tmp".into(),
            ..QueueUnbind::default()
        };
        broker.unbind_queue(&unbind, CONN).expect("unbind");
        assert!(broker.exchange("tmp").is_some());

        tokio::time::sleep(AUTO_DELETE_WINDOW + Duration::from_millis(10)).await;
        assert!(broker.exchange("tmp").is_none());

        shutdown.cancel();
        task.await.expect("reaper task");
    }
}

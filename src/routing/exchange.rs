//! Exchanges: binding ownership, routing and auto-delete.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde::Serialize;
use tokio::{runtime::Handle, sync::mpsc, time::Instant};
use tracing::{debug, trace, warn};

use super::{Binding, ExchangeType, RoutingError};
use crate::{
    protocol::{BasicPublish, BasicReturn, ExchangeDeclare, FieldTable, QueueBind, ReplyCode},
    session::ConnectionId,
};

/// Quiescence window an auto-delete exchange must stay empty before deletion.
pub const AUTO_DELETE_WINDOW: Duration = Duration::from_secs(5);

/// The declared identity of an exchange.
#[derive(Clone, Debug, PartialEq)]
pub struct ExchangeDeclaration {
    pub name: String,
    pub kind: ExchangeType,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub arguments: FieldTable,
}

impl ExchangeDeclaration {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: ExchangeType) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: false,
            auto_delete: false,
            internal: false,
            arguments: FieldTable::new(),
        }
    }

    #[must_use]
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    #[must_use]
    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    #[must_use]
    pub fn internal(mut self, internal: bool) -> Self {
        self.internal = internal;
        self
    }

    #[must_use]
    pub fn arguments(mut self, arguments: FieldTable) -> Self {
        self.arguments = arguments;
        self
    }

    /// Validate an `exchange.declare` method.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::UnknownExchangeType`] when the type name is not
    /// one of the four AMQP exchange types.
    pub fn from_method(method: &ExchangeDeclare) -> Result<Self, RoutingError> {
        Ok(Self::new(
            method.exchange.as_str(),
            ExchangeType::from_name(&method.kind)?,
        )
        .durable(method.durable)
        .auto_delete(method.auto_delete)
        .internal(method.internal)
        .arguments(method.arguments.clone()))
    }
}

/// Whether redeclaring `existing` as `requested` is acceptable.
///
/// Auto-delete is not compared: redeclaring with a different auto-delete
/// flag succeeds and keeps the original setting.
#[must_use]
pub fn equivalent_exchanges(existing: &ExchangeDeclaration, requested: &ExchangeDeclaration) -> bool {
    existing.name == requested.name
        && existing.kind == requested.kind
        && existing.durable == requested.durable
        && existing.internal == requested.internal
        && existing.arguments == requested.arguments
}

#[derive(Debug, Default)]
struct ExchangeState {
    bindings: Vec<Binding>,
    // Set when the last binding is removed; cleared by any new binding.
    delete_marker: Option<Instant>,
}

/// A routing entity owning an ordered, duplicate-free list of bindings.
///
/// Routing and binding mutation share one lock, so a publish observes either
/// all or none of a concurrent binding change.
#[derive(Debug)]
pub struct Exchange {
    declaration: ExchangeDeclaration,
    system: bool,
    state: Mutex<ExchangeState>,
    deletions: Option<mpsc::Sender<Arc<Exchange>>>,
}

/// Serialisable view of an exchange for introspection.
#[derive(Clone, Debug, Serialize)]
pub struct ExchangeSnapshot {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ExchangeType,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub system: bool,
    pub arguments: FieldTable,
    pub bindings: Vec<Binding>,
}

impl Exchange {
    /// Create an exchange.
    ///
    /// `deletions` receives the exchange once an auto-delete window elapses
    /// with no bindings; without it auto-delete never fires.
    #[must_use]
    pub fn new(
        declaration: ExchangeDeclaration,
        system: bool,
        deletions: Option<mpsc::Sender<Arc<Exchange>>>,
    ) -> Self {
        Self {
            declaration,
            system,
            state: Mutex::new(ExchangeState::default()),
            deletions,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str { &self.declaration.name }

    #[must_use]
    pub fn kind(&self) -> ExchangeType { self.declaration.kind }

    #[must_use]
    pub fn declaration(&self) -> &ExchangeDeclaration { &self.declaration }

    #[must_use]
    pub fn is_system(&self) -> bool { self.system }

    #[must_use]
    pub fn is_auto_delete(&self) -> bool { self.declaration.auto_delete }

    #[must_use]
    pub fn is_internal(&self) -> bool { self.declaration.internal }

    #[must_use]
    pub fn is_equivalent(&self, requested: &ExchangeDeclaration) -> bool {
        equivalent_exchanges(&self.declaration, requested)
    }

    fn state(&self) -> MutexGuard<'_, ExchangeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn binding_count(&self) -> usize { self.state().bindings.len() }

    /// Compute the set of queues a publish is routed to.
    ///
    /// A queue bound more than once appears once.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::NotImplemented`] for headers exchanges.
    pub fn queues_for_publish(&self, publish: &BasicPublish) -> Result<HashSet<String>, RoutingError> {
        if self.declaration.kind == ExchangeType::Headers {
            return Err(RoutingError::NotImplemented(ExchangeType::Headers));
        }
        let state = self.state();
        let mut queues = HashSet::new();
        for binding in &state.bindings {
            let matched = match self.declaration.kind {
                ExchangeType::Direct => binding.match_direct(publish),
                ExchangeType::Fanout => binding.match_fanout(publish),
                ExchangeType::Topic => binding.match_topic(publish),
                ExchangeType::Headers => binding.match_headers(publish)?,
            };
            if matched {
                queues.insert(binding.queue.clone());
            }
        }
        Ok(queues)
    }

    /// Add the binding described by a `queue.bind` method.
    ///
    /// Adding a binding equal to an existing one is a no-op.
    ///
    /// # Errors
    ///
    /// Currently never fails.
    pub fn add_binding(
        &self,
        method: &QueueBind,
        connection: ConnectionId,
        from_disk: bool,
    ) -> Result<(), RoutingError> {
        let binding = Binding::from_bind(method);
        let mut state = self.state();
        if state.bindings.contains(&binding) {
            trace!(
                "binding already present: exchange={}, queue={}, routing_key={}",
                self.name(),
                binding.queue,
                binding.routing_key
            );
            return Ok(());
        }
        if self.declaration.auto_delete {
            state.delete_marker = None;
        }
        debug!(
            "binding added: exchange={}, queue={}, routing_key={}, connection={connection}, \
             from_disk={from_disk}",
            self.name(),
            binding.queue,
            binding.routing_key
        );
        state.bindings.push(binding);
        Ok(())
    }

    /// Remove the first binding equal to `binding`, preserving order.
    ///
    /// When this leaves an auto-delete exchange empty a deletion timer is
    /// started. A missing binding is not an error.
    ///
    /// # Errors
    ///
    /// Currently never fails.
    pub fn remove_binding(self: &Arc<Self>, binding: &Binding) -> Result<(), RoutingError> {
        let mut state = self.state();
        let Some(index) = state.bindings.iter().position(|b| b == binding) else {
            return Ok(());
        };
        state.bindings.remove(index);
        if state.bindings.is_empty() && self.declaration.auto_delete {
            let marker = Instant::now();
            state.delete_marker = Some(marker);
            drop(state);
            self.start_auto_delete_timer(marker);
        }
        Ok(())
    }

    /// Drop every binding targeting `queue`, starting the deletion timer if
    /// that empties an auto-delete exchange.
    pub fn remove_bindings_for_queue(self: &Arc<Self>, queue: &str) {
        let mut state = self.state();
        let before = state.bindings.len();
        state.bindings.retain(|b| b.queue != queue);
        if state.bindings.len() < before && state.bindings.is_empty() && self.declaration.auto_delete {
            let marker = Instant::now();
            state.delete_marker = Some(marker);
            drop(state);
            self.start_auto_delete_timer(marker);
        }
    }

    #[must_use]
    pub fn bindings_for_queue(&self, queue: &str) -> Vec<Binding> {
        self.state()
            .bindings
            .iter()
            .filter(|b| b.queue == queue)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn bindings(&self) -> Vec<Binding> { self.state().bindings.clone() }

    /// The `basic.return` announcing that `publish` could not be delivered.
    #[must_use]
    pub fn return_message(
        &self,
        publish: &BasicPublish,
        code: ReplyCode,
        text: impl Into<String>,
    ) -> BasicReturn {
        BasicReturn {
            reply_code: code.as_u16(),
            reply_text: text.into(),
            exchange: self.name().to_owned(),
            routing_key: publish.routing_key.clone(),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> ExchangeSnapshot {
        ExchangeSnapshot {
            name: self.declaration.name.clone(),
            kind: self.declaration.kind,
            durable: self.declaration.durable,
            auto_delete: self.declaration.auto_delete,
            internal: self.declaration.internal,
            system: self.system,
            arguments: self.declaration.arguments.clone(),
            bindings: self.bindings(),
        }
    }

    // Detached: a binding added inside the window changes the marker and the
    // timer lapses without signalling. Two timers can still race; the
    // registry re-checks emptiness before deleting.
    fn start_auto_delete_timer(self: &Arc<Self>, marker: Instant) {
        let Some(deletions) = self.deletions.clone() else {
            return;
        };
        let Ok(runtime) = Handle::try_current() else {
            warn!(
                "no runtime for auto-delete timer: exchange={}",
                self.name()
            );
            return;
        };
        let exchange = Arc::clone(self);
        runtime.spawn(async move {
            tokio::time::sleep(AUTO_DELETE_WINDOW).await;
            let unchanged = exchange.state().delete_marker == Some(marker);
            if unchanged {
                debug!("auto-delete window elapsed: exchange={}", exchange.name());
                if deletions.send(Arc::clone(&exchange)).await.is_err() {
                    debug!("exchange registry gone: exchange={}", exchange.name());
                }
            }
        });
    }
}

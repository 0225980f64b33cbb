//! # Dispatch Router
//!
//! Maps every event to its handler and to the ordering key that serializes it.
//!
//! ## Ordering Key Resolution
//!
//! ```text
//! event names a process?          ──yes──→ Process(id)
//!   │ no
//! port owned by a known process?  ──yes──→ Process(owner)
//!   │ no
//! event names a port?             ──yes──→ Port(port)
//!   │ no
//! event names an application?     ──yes──→ Application(name)
//!   │ no
//!   └────────────────────────────────────→ Runtime
//! ```
//!
//! The handler table is fixed once the router is built. A tag with no handler
//! fails with `UnhandledEventType`; the worker logs it and drops the event.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use ipcm_core::EntityRegistry;
use ipcm_types::{Event, EventTag, IpcmError, IpcmResult, OrderingKey};
use tracing::warn;

/// Handles one kind of event.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: Event) -> IpcmResult<()>;
}

impl<F> EventHandler for F
where
    F: Fn(Event) -> IpcmResult<()> + Send + Sync,
{
    fn handle(&self, event: Event) -> IpcmResult<()> {
        self(event)
    }
}

/// Event tag → handler mapping.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<EventTag, Arc<dyn EventHandler>>,
}

impl HandlerTable {
    #[must_use]
    pub fn builder() -> HandlerTableBuilder {
        HandlerTableBuilder::default()
    }

    #[must_use]
    pub fn get(&self, tag: EventTag) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(&tag).cloned()
    }

    /// Tags with no registered handler.
    #[must_use]
    pub fn missing_tags(&self) -> Vec<EventTag> {
        EventTag::ALL
            .iter()
            .copied()
            .filter(|tag| !self.handlers.contains_key(tag))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<_> = self.handlers.keys().collect();
        tags.sort();
        f.debug_struct("HandlerTable").field("tags", &tags).finish()
    }
}

/// Builder for [`HandlerTable`]. Registering a tag twice keeps the last handler.
#[derive(Default)]
pub struct HandlerTableBuilder {
    handlers: HashMap<EventTag, Arc<dyn EventHandler>>,
}

impl HandlerTableBuilder {
    #[must_use]
    pub fn on<H>(mut self, tag: EventTag, handler: H) -> Self
    where
        H: EventHandler + 'static,
    {
        self.handlers.insert(tag, Arc::new(handler));
        self
    }

    /// Register an already shared handler.
    #[must_use]
    pub fn on_shared(mut self, tag: EventTag, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.insert(tag, handler);
        self
    }

    /// Remove the handler for `tag`, if any.
    #[must_use]
    pub fn without(mut self, tag: EventTag) -> Self {
        self.handlers.remove(&tag);
        self
    }

    #[must_use]
    pub fn build(self) -> HandlerTable {
        HandlerTable {
            handlers: self.handlers,
        }
    }
}

/// Routing decision for one event.
#[derive(Clone)]
pub struct Routed {
    pub tag: EventTag,
    pub key: OrderingKey,
    pub handler: Arc<dyn EventHandler>,
}

impl fmt::Debug for Routed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Routed")
            .field("tag", &self.tag)
            .field("key", &self.key)
            .finish()
    }
}

/// Handler lookup plus ordering key resolution.
pub struct DispatchRouter {
    table: HandlerTable,
    registry: Option<Arc<EntityRegistry>>,
}

impl DispatchRouter {
    /// Router resolving port ownership through `registry`.
    #[must_use]
    pub fn new(table: HandlerTable, registry: Arc<EntityRegistry>) -> Self {
        Self::log_missing(&table);
        Self {
            table,
            registry: Some(registry),
        }
    }

    /// Router that keys port events by port only.
    #[must_use]
    pub fn standalone(table: HandlerTable) -> Self {
        Self::log_missing(&table);
        Self {
            table,
            registry: None,
        }
    }

    fn log_missing(table: &HandlerTable) {
        let missing = table.missing_tags();
        if !missing.is_empty() {
            warn!(?missing, "[router] Events with these tags will be dropped");
        }
    }

    #[must_use]
    pub fn table(&self) -> &HandlerTable {
        &self.table
    }

    /// The entity `event` concerns.
    #[must_use]
    pub fn ordering_key(&self, event: &Event) -> OrderingKey {
        if let Some(process_id) = event.process_id() {
            return OrderingKey::Process(process_id);
        }
        if let Some(port_id) = event.port_id() {
            let owner = self
                .registry
                .as_ref()
                .and_then(|registry| registry.owner_of(port_id));
            return match owner {
                Some(process_id) => OrderingKey::Process(process_id),
                None => OrderingKey::Port(port_id),
            };
        }
        if let Some(application) = event.application() {
            return OrderingKey::Application(application.clone());
        }
        OrderingKey::Runtime
    }

    /// Resolve the handler and ordering key for `event`.
    ///
    /// # Errors
    ///
    /// `UnhandledEventType` if no handler is registered for the event's tag.
    pub fn route(&self, event: &Event) -> IpcmResult<Routed> {
        let tag = event.tag();
        let handler = self
            .table
            .get(tag)
            .ok_or(IpcmError::UnhandledEventType(tag))?;
        Ok(Routed {
            tag,
            key: self.ordering_key(event),
            handler,
        })
    }
}

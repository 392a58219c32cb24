use std::sync::Arc;

use blockscript_core::{ActorId, HandlerId, ScopeId};

use crate::event::EventInstance;

/// Reacts to a dispatched event.
///
/// Errors are reported back to the bus, which logs them and moves on to the
/// next handler. A handler can never abort dispatch for the handlers after it.
/// Compiled script fragments are wrapped in this trait by the script runtime;
/// the bus only supplies the validated event.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &EventInstance) -> anyhow::Result<()>;
}

impl<F> EventHandler for F
where
    F: Fn(&EventInstance) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, event: &EventInstance) -> anyhow::Result<()> {
        self(event)
    }
}

/// A handler plus the routing metadata the bus needs to place and order it.
#[derive(Clone)]
pub struct Handler {
    id: HandlerId,
    bound_actor: Option<ActorId>,
    bound_scope: Option<ScopeId>,
    priority: i32,
    callback: Arc<dyn EventHandler>,
}

impl Handler {
    pub fn new(callback: impl EventHandler + 'static) -> Self {
        Self {
            id: HandlerId::new(),
            bound_actor: None,
            bound_scope: None,
            priority: 0,
            callback: Arc::new(callback),
        }
    }

    /// Build from a closure.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&EventInstance) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::new(f)
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Record the actor that owns this handler (e.g. the author of a script).
    pub fn owned_by(mut self, actor: ActorId) -> Self {
        self.bound_actor = Some(actor);
        self
    }

    /// Confine the handler to one scope. Only matters for local schemas.
    pub fn in_scope(mut self, scope: ScopeId) -> Self {
        self.bound_scope = Some(scope);
        self
    }

    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn bound_actor(&self) -> Option<&ActorId> {
        self.bound_actor.as_ref()
    }

    pub fn bound_scope(&self) -> Option<&ScopeId> {
        self.bound_scope.as_ref()
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// True iff the handler is not bound to a scope.
    pub fn is_global(&self) -> bool {
        self.bound_scope.is_none()
    }

    /// Whether a local event from `scope` should reach this handler.
    pub(crate) fn accepts_scope(&self, scope: Option<&ScopeId>) -> bool {
        match &self.bound_scope {
            None => true,
            Some(bound) => scope == Some(bound),
        }
    }

    pub(crate) fn invoke(&self, event: &EventInstance) -> anyhow::Result<()> {
        self.callback.handle(event)
    }
}

impl core::fmt::Debug for Handler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Handler")
            .field("id", &self.id)
            .field("bound_actor", &self.bound_actor)
            .field("bound_scope", &self.bound_scope)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

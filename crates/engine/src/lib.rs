//! Chatwire Routing and Lifecycle Engine
//!
//! The core of the live-chat backend: presence tracking, capacity-aware
//! conversation assignment, lifecycle transitions, and the messaging
//! pipeline. The engine is storage-agnostic: all conversation state flows
//! through the [`store::ConversationStore`] trait, liveness through
//! [`presence::Presence`], and cross-process coordination through
//! [`lock::LockManager`]. Post-commit notifications leave through
//! [`events::EventSink`].

pub mod assignment;
pub mod events;
pub mod lifecycle;
pub mod lock;
pub mod messaging;
pub mod presence;
pub mod settings;
pub mod store;

use std::sync::Arc;

use assignment::{RoundRobin, StrategyRegistry};
use events::{EventSink, NullSink};
use lock::LockManager;
use messaging::{Engagement, NoEngagement};
use presence::Presence;
use store::ConversationStore;

/// Policy for the unconditional `assign` override. `claim` is always open to
/// any staff member; whether the override is admin-only is configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AssignPolicy {
    #[default]
    AnyStaff,
    AdminOnly,
}

/// The routing/lifecycle engine. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct Engine {
    pub(crate) store: Arc<dyn ConversationStore>,
    pub(crate) presence: Arc<dyn Presence>,
    pub(crate) locks: Arc<dyn LockManager>,
    pub(crate) strategies: Arc<StrategyRegistry>,
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) engagement: Arc<dyn Engagement>,
    pub(crate) assign_policy: AssignPolicy,
}

impl Engine {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        presence: Arc<dyn Presence>,
        locks: Arc<dyn LockManager>,
    ) -> Self {
        Self {
            store,
            presence,
            locks,
            strategies: Arc::new(StrategyRegistry::new(Arc::new(RoundRobin))),
            sink: Arc::new(NullSink),
            engagement: Arc::new(NoEngagement),
            assign_policy: AssignPolicy::default(),
        }
    }

    /// Install the live fan-out sink (the API process wires the WS hub here).
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Install the subscriber-engagement signal used by message authorization.
    pub fn with_engagement(mut self, engagement: Arc<dyn Engagement>) -> Self {
        self.engagement = engagement;
        self
    }

    pub fn with_strategies(mut self, strategies: Arc<StrategyRegistry>) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn with_assign_policy(mut self, policy: AssignPolicy) -> Self {
        self.assign_policy = policy;
        self
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    pub fn presence(&self) -> &Arc<dyn Presence> {
        &self.presence
    }
}

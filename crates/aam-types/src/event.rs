//! The event record — the unit of mutation flowing through C1–C8.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::hash::hash32;

/// Globally unique identifier for a single event (128-bit, UUID v4).
pub type EventId = Uuid;

/// Commit-ordering tiebreaker assigned at persistence, unique within a
/// single transaction-time instant in one shard group.
pub type TransactionSequence = u64;

/// Whether an event introduces (`Add`) or retracts (`Remove`) its subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// Introduces the element or mapping.
    Add,
    /// Retracts a previously-added element or mapping.
    Remove,
}

/// The ten event kinds defined in `spec.md` §3, each carrying exactly the
/// payload fields its row of the table specifies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    /// A user element. Key element: `user`.
    User {
        /// User identifier string.
        user: String,
    },
    /// A group element. Key element: `group`.
    Group {
        /// Group identifier string.
        group: String,
    },
    /// A user's membership in a group. Key element: `user`.
    UserToGroupMapping {
        /// User identifier string.
        user: String,
        /// Group identifier string.
        group: String,
    },
    /// A group's membership in another group. Key element: `fromGroup`.
    GroupToGroupMapping {
        /// Source group identifier string.
        from_group: String,
        /// Destination group identifier string.
        to_group: String,
    },
    /// A user's access level on a component. Key element: `user`.
    UserToComponentAccess {
        /// User identifier string.
        user: String,
        /// Application component identifier string.
        component: String,
        /// Access level identifier string.
        access_level: String,
    },
    /// A group's access level on a component. Key element: `group`.
    GroupToComponentAccess {
        /// Group identifier string.
        group: String,
        /// Application component identifier string.
        component: String,
        /// Access level identifier string.
        access_level: String,
    },
    /// An entity-type element. Replicated to every shard group.
    EntityType {
        /// Entity type identifier string.
        entity_type: String,
    },
    /// An entity element. Replicated to every shard group.
    Entity {
        /// Entity type identifier string.
        entity_type: String,
        /// Entity identifier string.
        entity: String,
    },
    /// A user's mapping to an entity. Key element: `user`.
    UserToEntityMapping {
        /// User identifier string.
        user: String,
        /// Entity type identifier string.
        entity_type: String,
        /// Entity identifier string.
        entity: String,
    },
    /// A group's mapping to an entity. Key element: `group`.
    GroupToEntityMapping {
        /// Group identifier string.
        group: String,
        /// Entity type identifier string.
        entity_type: String,
        /// Entity identifier string.
        entity: String,
    },
}

impl EventKind {
    /// The key element's string form, used for hashing and shard routing.
    /// `EntityType`/`Entity` have no key element since they are replicated
    /// to every shard group unconditionally.
    pub fn key_element(&self) -> Option<&str> {
        match self {
            EventKind::User { user } => Some(user),
            EventKind::Group { group } => Some(group),
            EventKind::UserToGroupMapping { user, .. } => Some(user),
            EventKind::GroupToGroupMapping { from_group, .. } => Some(from_group),
            EventKind::UserToComponentAccess { user, .. } => Some(user),
            EventKind::GroupToComponentAccess { group, .. } => Some(group),
            EventKind::EntityType { .. } => None,
            EventKind::Entity { .. } => None,
            EventKind::UserToEntityMapping { user, .. } => Some(user),
            EventKind::GroupToEntityMapping { group, .. } => Some(group),
        }
    }

    /// True for the primary-element kinds (`User`, `Group`, `EntityType`,
    /// `Entity`) that introduce or retract an element rather than a mapping
    /// between elements.
    pub fn is_primary(&self) -> bool {
        matches!(
            self,
            EventKind::User { .. }
                | EventKind::Group { .. }
                | EventKind::EntityType { .. }
                | EventKind::Entity { .. }
        )
    }

    /// True for `EntityType`/`Entity`, the two kinds replicated to every
    /// shard group regardless of hash range.
    pub fn is_unfiltered(&self) -> bool {
        matches!(self, EventKind::EntityType { .. } | EventKind::Entity { .. })
    }

    /// True for `Group` primary events, which user-shard reads must see
    /// unconditionally so that user→group mappings resolve (`spec.md` §4.1).
    pub fn is_group_primary(&self) -> bool {
        matches!(self, EventKind::Group { .. })
    }

    /// A short, stable tag used by the backup-file codec and by storage
    /// backends that key per-kind tables/columns.
    pub fn tag(&self) -> u8 {
        match self {
            EventKind::User { .. } => 0,
            EventKind::Group { .. } => 1,
            EventKind::UserToGroupMapping { .. } => 2,
            EventKind::GroupToGroupMapping { .. } => 3,
            EventKind::UserToComponentAccess { .. } => 4,
            EventKind::GroupToComponentAccess { .. } => 5,
            EventKind::EntityType { .. } => 6,
            EventKind::Entity { .. } => 7,
            EventKind::UserToEntityMapping { .. } => 8,
            EventKind::GroupToEntityMapping { .. } => 9,
        }
    }
}

/// An immutable record of one mutation to the access-control graph.
///
/// `transaction_time`/`transaction_sequence` are `None` until the event has
/// been committed by the bulk persister (C2); every event that has left C5
/// for C1 via C2 carries `Some` in both fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Globally unique event identifier.
    pub event_id: EventId,
    /// The typed payload and its discriminant kind.
    pub kind: EventKind,
    /// Whether this event adds or removes its subject.
    pub action: Action,
    /// Wall-clock instant the event was accepted by the write buffer (C5).
    pub occurred_time: DateTime<Utc>,
    /// Signed 32-bit hash of the key element, used for shard routing.
    pub hash_code: i32,
    /// Commit timestamp assigned by the bulk persister (C2), `None` until committed.
    pub transaction_time: Option<DateTime<Utc>>,
    /// Per-timestamp ordering tiebreaker assigned by the bulk persister (C2).
    pub transaction_sequence: Option<TransactionSequence>,
}

impl Event {
    /// Constructs a new, not-yet-committed event for `kind`/`action`,
    /// computing `hash_code` from the kind's key element (0 for the
    /// unfiltered `EntityType`/`Entity` kinds, which carry no key element).
    pub fn new(event_id: EventId, kind: EventKind, action: Action, occurred_time: DateTime<Utc>) -> Self {
        let hash_code = kind.key_element().map(hash32).unwrap_or(0);
        Self {
            event_id,
            kind,
            action,
            occurred_time,
            hash_code,
            transaction_time: None,
            transaction_sequence: None,
        }
    }

    /// Returns a copy of this event stamped with the given commit
    /// coordinates, as performed by the bulk persister (C2) on commit.
    pub fn with_transaction_coords(&self, transaction_time: DateTime<Utc>, transaction_sequence: TransactionSequence) -> Self {
        let mut stamped = self.clone();
        stamped.transaction_time = Some(transaction_time);
        stamped.transaction_sequence = Some(transaction_sequence);
        stamped
    }

    /// The `(transaction_time, transaction_sequence)` total-order key.
    /// Panics if the event has not yet been committed — callers only compare
    /// order among committed events (an invariant upheld by C1/C2).
    pub fn order_key(&self) -> (DateTime<Utc>, TransactionSequence) {
        (
            self.transaction_time.expect("event not yet committed"),
            self.transaction_sequence.expect("event not yet committed"),
        )
    }

    /// True iff `hash_code` lies in `range`, or the event is one of the two
    /// kinds (`EntityType`/`Entity`) always emitted regardless of range.
    pub fn in_range(&self, range: crate::shard::HashRange) -> bool {
        self.kind.is_unfiltered() || range.contains(self.hash_code)
    }
}

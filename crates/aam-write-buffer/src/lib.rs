#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **aam-write-buffer** – Write buffer (C5) for the ApplicationAccess
//! sharded event pipeline.
//!
//! One entry point per event kind in `spec.md` §3, generalized from
//! `toka-kernel::Kernel::submit`'s single-opcode shape (validate → stamp →
//! append → notify) to ten typed constructors, each appending to a
//! `parking_lot::Mutex`-guarded buffer and tripping the flush signal (C4).

use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use aam_flush::{BufferSource, FlushSignal};
use aam_types::clock::{Clock, SystemClock};
use aam_types::error::AamError;
use aam_types::event::{Action, Event, EventKind};

fn require_non_empty(field: &str, value: &str) -> Result<(), AamError> {
    if value.is_empty() {
        Err(AamError::ValidationError(format!("{field} must not be empty")))
    } else {
        Ok(())
    }
}

/// Per-operation event buffer accepting one call per accepted request.
/// Ordering within the buffer is arrival order (`spec.md` §4.5).
pub struct WriteBuffer {
    events: Mutex<Vec<Event>>,
    signal: Arc<FlushSignal>,
    clock: Arc<dyn Clock>,
}

impl WriteBuffer {
    /// Builds a write buffer that trips `signal` on every accepted event,
    /// using the system wall clock for `occurred_time`.
    pub fn new(signal: Arc<FlushSignal>) -> Self {
        Self::with_clock(signal, Arc::new(SystemClock))
    }

    /// As [`Self::new`], with an injectable clock — used by tests that need
    /// deterministic `occurred_time` ordering.
    pub fn with_clock(signal: Arc<FlushSignal>, clock: Arc<dyn Clock>) -> Self {
        Self { events: Mutex::new(Vec::new()), signal, clock }
    }

    fn accept(&self, kind: EventKind, action: Action) -> Event {
        let event = Event::new(Uuid::new_v4(), kind, action, self.clock.now());
        self.events.lock().push(event.clone());
        self.signal.record_event();
        event
    }

    /// Number of events currently buffered, awaiting flush.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// True iff no events are buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records a `User` element event.
    pub fn add_user(&self, user: impl Into<String>) -> Result<Event, AamError> {
        let user = user.into();
        require_non_empty("user", &user)?;
        Ok(self.accept(EventKind::User { user }, Action::Add))
    }

    /// Records removal of a `User` element.
    pub fn remove_user(&self, user: impl Into<String>) -> Result<Event, AamError> {
        let user = user.into();
        require_non_empty("user", &user)?;
        Ok(self.accept(EventKind::User { user }, Action::Remove))
    }

    /// Records a `Group` element event.
    pub fn add_group(&self, group: impl Into<String>) -> Result<Event, AamError> {
        let group = group.into();
        require_non_empty("group", &group)?;
        Ok(self.accept(EventKind::Group { group }, Action::Add))
    }

    /// Records removal of a `Group` element.
    pub fn remove_group(&self, group: impl Into<String>) -> Result<Event, AamError> {
        let group = group.into();
        require_non_empty("group", &group)?;
        Ok(self.accept(EventKind::Group { group }, Action::Remove))
    }

    /// Records a user's membership in a group.
    pub fn add_user_to_group_mapping(&self, user: impl Into<String>, group: impl Into<String>) -> Result<Event, AamError> {
        let (user, group) = (user.into(), group.into());
        require_non_empty("user", &user)?;
        require_non_empty("group", &group)?;
        Ok(self.accept(EventKind::UserToGroupMapping { user, group }, Action::Add))
    }

    /// Records removal of a user's membership in a group.
    pub fn remove_user_to_group_mapping(&self, user: impl Into<String>, group: impl Into<String>) -> Result<Event, AamError> {
        let (user, group) = (user.into(), group.into());
        require_non_empty("user", &user)?;
        require_non_empty("group", &group)?;
        Ok(self.accept(EventKind::UserToGroupMapping { user, group }, Action::Remove))
    }

    /// Records a group's membership in another group.
    pub fn add_group_to_group_mapping(
        &self,
        from_group: impl Into<String>,
        to_group: impl Into<String>,
    ) -> Result<Event, AamError> {
        let (from_group, to_group) = (from_group.into(), to_group.into());
        require_non_empty("fromGroup", &from_group)?;
        require_non_empty("toGroup", &to_group)?;
        Ok(self.accept(EventKind::GroupToGroupMapping { from_group, to_group }, Action::Add))
    }

    /// Records removal of a group's membership in another group.
    pub fn remove_group_to_group_mapping(
        &self,
        from_group: impl Into<String>,
        to_group: impl Into<String>,
    ) -> Result<Event, AamError> {
        let (from_group, to_group) = (from_group.into(), to_group.into());
        require_non_empty("fromGroup", &from_group)?;
        require_non_empty("toGroup", &to_group)?;
        Ok(self.accept(EventKind::GroupToGroupMapping { from_group, to_group }, Action::Remove))
    }

    /// Records a user's access level on a component.
    pub fn add_user_to_component_access(
        &self,
        user: impl Into<String>,
        component: impl Into<String>,
        access_level: impl Into<String>,
    ) -> Result<Event, AamError> {
        let (user, component, access_level) = (user.into(), component.into(), access_level.into());
        require_non_empty("user", &user)?;
        require_non_empty("component", &component)?;
        require_non_empty("accessLevel", &access_level)?;
        Ok(self.accept(EventKind::UserToComponentAccess { user, component, access_level }, Action::Add))
    }

    /// Records removal of a user's access level on a component.
    pub fn remove_user_to_component_access(
        &self,
        user: impl Into<String>,
        component: impl Into<String>,
        access_level: impl Into<String>,
    ) -> Result<Event, AamError> {
        let (user, component, access_level) = (user.into(), component.into(), access_level.into());
        require_non_empty("user", &user)?;
        require_non_empty("component", &component)?;
        require_non_empty("accessLevel", &access_level)?;
        Ok(self.accept(EventKind::UserToComponentAccess { user, component, access_level }, Action::Remove))
    }

    /// Records a group's access level on a component.
    pub fn add_group_to_component_access(
        &self,
        group: impl Into<String>,
        component: impl Into<String>,
        access_level: impl Into<String>,
    ) -> Result<Event, AamError> {
        let (group, component, access_level) = (group.into(), component.into(), access_level.into());
        require_non_empty("group", &group)?;
        require_non_empty("component", &component)?;
        require_non_empty("accessLevel", &access_level)?;
        Ok(self.accept(EventKind::GroupToComponentAccess { group, component, access_level }, Action::Add))
    }

    /// Records removal of a group's access level on a component.
    pub fn remove_group_to_component_access(
        &self,
        group: impl Into<String>,
        component: impl Into<String>,
        access_level: impl Into<String>,
    ) -> Result<Event, AamError> {
        let (group, component, access_level) = (group.into(), component.into(), access_level.into());
        require_non_empty("group", &group)?;
        require_non_empty("component", &component)?;
        require_non_empty("accessLevel", &access_level)?;
        Ok(self.accept(EventKind::GroupToComponentAccess { group, component, access_level }, Action::Remove))
    }

    /// Records an entity-type element, replicated to every shard group.
    pub fn add_entity_type(&self, entity_type: impl Into<String>) -> Result<Event, AamError> {
        let entity_type = entity_type.into();
        require_non_empty("entityType", &entity_type)?;
        Ok(self.accept(EventKind::EntityType { entity_type }, Action::Add))
    }

    /// Records removal of an entity-type element.
    pub fn remove_entity_type(&self, entity_type: impl Into<String>) -> Result<Event, AamError> {
        let entity_type = entity_type.into();
        require_non_empty("entityType", &entity_type)?;
        Ok(self.accept(EventKind::EntityType { entity_type }, Action::Remove))
    }

    /// Records an entity element, replicated to every shard group.
    pub fn add_entity(&self, entity_type: impl Into<String>, entity: impl Into<String>) -> Result<Event, AamError> {
        let (entity_type, entity) = (entity_type.into(), entity.into());
        require_non_empty("entityType", &entity_type)?;
        require_non_empty("entity", &entity)?;
        Ok(self.accept(EventKind::Entity { entity_type, entity }, Action::Add))
    }

    /// Records removal of an entity element.
    pub fn remove_entity(&self, entity_type: impl Into<String>, entity: impl Into<String>) -> Result<Event, AamError> {
        let (entity_type, entity) = (entity_type.into(), entity.into());
        require_non_empty("entityType", &entity_type)?;
        require_non_empty("entity", &entity)?;
        Ok(self.accept(EventKind::Entity { entity_type, entity }, Action::Remove))
    }

    /// Records a user's mapping to an entity.
    pub fn add_user_to_entity_mapping(
        &self,
        user: impl Into<String>,
        entity_type: impl Into<String>,
        entity: impl Into<String>,
    ) -> Result<Event, AamError> {
        let (user, entity_type, entity) = (user.into(), entity_type.into(), entity.into());
        require_non_empty("user", &user)?;
        require_non_empty("entityType", &entity_type)?;
        require_non_empty("entity", &entity)?;
        Ok(self.accept(EventKind::UserToEntityMapping { user, entity_type, entity }, Action::Add))
    }

    /// Records removal of a user's mapping to an entity.
    pub fn remove_user_to_entity_mapping(
        &self,
        user: impl Into<String>,
        entity_type: impl Into<String>,
        entity: impl Into<String>,
    ) -> Result<Event, AamError> {
        let (user, entity_type, entity) = (user.into(), entity_type.into(), entity.into());
        require_non_empty("user", &user)?;
        require_non_empty("entityType", &entity_type)?;
        require_non_empty("entity", &entity)?;
        Ok(self.accept(EventKind::UserToEntityMapping { user, entity_type, entity }, Action::Remove))
    }

    /// Records a group's mapping to an entity.
    pub fn add_group_to_entity_mapping(
        &self,
        group: impl Into<String>,
        entity_type: impl Into<String>,
        entity: impl Into<String>,
    ) -> Result<Event, AamError> {
        let (group, entity_type, entity) = (group.into(), entity_type.into(), entity.into());
        require_non_empty("group", &group)?;
        require_non_empty("entityType", &entity_type)?;
        require_non_empty("entity", &entity)?;
        Ok(self.accept(EventKind::GroupToEntityMapping { group, entity_type, entity }, Action::Add))
    }

    /// Records removal of a group's mapping to an entity.
    pub fn remove_group_to_entity_mapping(
        &self,
        group: impl Into<String>,
        entity_type: impl Into<String>,
        entity: impl Into<String>,
    ) -> Result<Event, AamError> {
        let (group, entity_type, entity) = (group.into(), entity_type.into(), entity.into());
        require_non_empty("group", &group)?;
        require_non_empty("entityType", &entity_type)?;
        require_non_empty("entity", &entity)?;
        Ok(self.accept(EventKind::GroupToEntityMapping { group, entity_type, entity }, Action::Remove))
    }
}

impl BufferSource for WriteBuffer {
    fn drain(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aam_types::clock::FixedClock;
    use chrono::Utc;

    #[test]
    fn add_user_rejects_empty_key_element() {
        let buffer = WriteBuffer::new(dummy_signal());
        let err = buffer.add_user("").unwrap_err();
        assert!(matches!(err, AamError::ValidationError(_)));
    }

    #[test]
    fn buffer_preserves_arrival_order() {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let buffer = WriteBuffer::with_clock(dummy_signal(), clock);
        buffer.add_user("alice").unwrap();
        buffer.add_group("g1").unwrap();
        buffer.add_user("bob").unwrap();

        let drained = buffer.drain();
        assert_eq!(drained.len(), 3);
        assert!(matches!(&drained[0].kind, EventKind::User { user } if user == "alice"));
        assert!(matches!(&drained[1].kind, EventKind::Group { group } if group == "g1"));
        assert!(matches!(&drained[2].kind, EventKind::User { user } if user == "bob"));
    }

    fn dummy_signal() -> Arc<FlushSignal> {
        FlushSignal::for_testing(1_000_000)
    }
}

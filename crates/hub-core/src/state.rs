//! Immutable snapshot of one entity's state

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Context, EntityId};

/// Attribute map attached to a state
///
/// Values are schema-less JSON: null, bool, number, string, list or map.
pub type Attributes = HashMap<String, serde_json::Value>;

/// The state of an entity at a point in time
///
/// A `State` is never edited after construction. Writing a new value builds
/// a new record with [`State::with_update`]; readers holding the old one
/// keep seeing the old one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    pub entity_id: EntityId,

    /// The state value (`home`, `not_home`, `on`, `23.5`, ...)
    pub state: String,

    #[serde(default)]
    pub attributes: Attributes,

    /// When `state` last took a different value
    pub last_changed: DateTime<Utc>,

    /// When the record was last written, even with an identical value
    pub last_updated: DateTime<Utc>,

    /// Context of the write that produced this record
    pub context: Context,
}

impl State {
    /// First state of an entity, written at `now`
    pub fn new(
        entity_id: EntityId,
        state: impl Into<String>,
        attributes: Attributes,
        context: Context,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_id,
            state: state.into(),
            attributes,
            last_changed: now,
            last_updated: now,
            context,
        }
    }

    /// Successor of this state written at `now`
    ///
    /// `last_changed` only moves when the state string differs; attribute
    /// changes alone update `last_updated`.
    pub fn with_update(
        &self,
        new_state: impl Into<String>,
        new_attributes: Attributes,
        context: Context,
        now: DateTime<Utc>,
    ) -> Self {
        let new_state = new_state.into();
        let last_changed = if self.state != new_state {
            now
        } else {
            self.last_changed
        };

        Self {
            entity_id: self.entity_id.clone(),
            state: new_state,
            attributes: new_attributes,
            last_changed,
            last_updated: now.max(last_changed),
            context,
        }
    }

    /// Typed attribute lookup
    pub fn attribute<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.attributes
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn domain(&self) -> &str {
        self.entity_id.domain()
    }
}

impl PartialEq for State {
    /// Timestamps and context are not part of equality
    fn eq(&self, other: &Self) -> bool {
        self.entity_id == other.entity_id
            && self.state == other.state
            && self.attributes == other.attributes
    }
}

// src/model/state.rs

use parking_lot::RwLock;
use std::sync::Arc;

use crate::model::{Definition, Mapping};

/// Agent state shared between the host thread and the reactor.
///
/// Guarded by a single reader/writer lock (`SharedModel`). Callers take the lock for
/// the duration of one read or write and never hold it across a network send.
#[derive(Debug, Clone)]
pub struct AgentModel {
    pub agent_name: String,
    pub definition: Definition,
    pub mapping: Mapping,
    pub muted: bool,
    pub frozen: bool,
    pub can_be_frozen: bool,
    pub state: String,
    pub log_file_path: Option<String>,
    pub definition_path: Option<String>,
    pub mapping_path: Option<String>,
    /// Local definition changed since the last broadcast.
    pub definition_dirty: bool,
    /// Local mapping changed since the last broadcast.
    pub mapping_dirty: bool,
    /// The mapping was replaced wholesale; active filters are rebuilt on the next pass.
    pub mapping_replaced: bool,
}

pub type SharedModel = Arc<RwLock<AgentModel>>;

impl AgentModel {
    pub fn new(agent_name: impl Into<String>) -> Self {
        let agent_name = agent_name.into();
        Self {
            definition: Definition::new(agent_name.clone()),
            mapping: Mapping::new(agent_name.clone()),
            agent_name,
            muted: false,
            frozen: false,
            can_be_frozen: false,
            state: String::new(),
            log_file_path: None,
            definition_path: None,
            mapping_path: None,
            definition_dirty: false,
            mapping_dirty: false,
            mapping_replaced: false,
        }
    }

    pub fn shared(self) -> SharedModel {
        Arc::new(RwLock::new(self))
    }

    pub fn replace_definition(&mut self, definition: Definition) {
        self.definition = definition;
        self.definition_dirty = true;
    }

    pub fn replace_mapping(&mut self, mapping: Mapping) {
        self.mapping = mapping;
        self.mapping_dirty = true;
        self.mapping_replaced = true;
    }

    /// Take and reset the definition dirty bit.
    pub fn take_definition_dirty(&mut self) -> bool {
        std::mem::take(&mut self.definition_dirty)
    }

    /// Take and reset the mapping dirty bits, returning `(dirty, replaced)`.
    pub fn take_mapping_dirty(&mut self) -> (bool, bool) {
        (
            std::mem::take(&mut self.mapping_dirty),
            std::mem::take(&mut self.mapping_replaced),
        )
    }
}

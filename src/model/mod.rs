pub mod definition;
pub mod iop;
pub mod mapping;
pub mod state;

pub use definition::Definition;
pub use iop::{Iop, IopKind, IopType, IopValue};
pub use mapping::{Mapping, MappingElement};
pub use state::{AgentModel, SharedModel};

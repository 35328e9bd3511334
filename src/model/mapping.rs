// src/model/mapping.rs

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::constants::MAPPING_WILDCARD;
use crate::error::ModelError;
use crate::utils::sanitize_name;

/// One wiring rule: local input <- (agent, output).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MappingElement {
    pub input_name: String,
    pub agent_name: String,
    pub output_name: String,
}

impl MappingElement {
    pub fn new(input: &str, agent: &str, output: &str) -> Self {
        Self {
            input_name: sanitize_name(input),
            agent_name: sanitize_agent(agent),
            output_name: sanitize_name(output),
        }
    }

    /// Stable identifier derived from the three fields (djb2 over `input.agent.output`).
    pub fn id(&self) -> u64 {
        let key = format!(
            "{}.{}.{}",
            self.input_name, self.agent_name, self.output_name
        );
        key.bytes().fold(5381u64, |h, b| {
            h.wrapping_shl(5).wrapping_add(h).wrapping_add(u64::from(b))
        })
    }

    /// True when this element sources from an agent called `agent_name`.
    pub fn targets_agent(&self, agent_name: &str) -> bool {
        self.agent_name == MAPPING_WILDCARD || self.agent_name == agent_name
    }
}

fn sanitize_agent(agent: &str) -> String {
    if agent == MAPPING_WILDCARD {
        agent.to_string()
    } else {
        sanitize_name(agent)
    }
}

/// The local wiring description: which remote outputs feed which local inputs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mapping {
    pub name: String,
    pub description: String,
    pub version: String,
    /// Keyed by the element itself; ids are derived handles and may collide.
    elements: BTreeSet<MappingElement>,
}

impl Mapping {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn elements(&self) -> impl Iterator<Item = &MappingElement> {
        self.elements.iter()
    }

    /// First element carrying `id`.
    pub fn get(&self, id: u64) -> Option<&MappingElement> {
        self.elements.iter().find(|e| e.id() == id)
    }

    /// Add an element; adding an existing element is a no-op returning its id.
    pub fn add(&mut self, input: &str, agent: &str, output: &str) -> Result<u64, ModelError> {
        if input.trim().is_empty() || agent.trim().is_empty() || output.trim().is_empty() {
            return Err(ModelError::EmptyName);
        }
        let element = MappingElement::new(input, agent, output);
        let id = element.id();
        self.elements.insert(element);
        Ok(id)
    }

    /// Remove the element carrying `id`. Fails when no element, or more than
    /// one, carries it; use `remove` to address a colliding element.
    pub fn remove_by_id(&mut self, id: u64) -> Result<MappingElement, ModelError> {
        let mut matching = self.elements.iter().filter(|e| e.id() == id);
        let element = matching
            .next()
            .cloned()
            .ok_or(ModelError::UnknownMappingElement(id))?;
        if matching.next().is_some() {
            return Err(ModelError::AmbiguousMappingElement(id));
        }
        self.elements.remove(&element);
        Ok(element)
    }

    pub fn remove(
        &mut self,
        input: &str,
        agent: &str,
        output: &str,
    ) -> Result<MappingElement, ModelError> {
        let element = MappingElement::new(input, agent, output);
        if self.elements.remove(&element) {
            Ok(element)
        } else {
            Err(ModelError::UnknownMappingElement(element.id()))
        }
    }

    pub fn clear(&mut self) {
        self.elements.clear();
    }

    /// Elements sourcing `output` from an agent named `agent_name` (or the wildcard).
    pub fn elements_for_output<'a>(
        &'a self,
        agent_name: &'a str,
        output: &'a str,
    ) -> impl Iterator<Item = &'a MappingElement> + 'a {
        self.elements
            .iter()
            .filter(move |e| e.output_name == output && e.targets_agent(agent_name))
    }

    pub fn to_json(&self) -> String {
        let doc = MappingDoc {
            mapping: MappingBody {
                name: self.name.clone(),
                description: self.description.clone(),
                version: self.version.clone(),
                mapping_out: self.elements.iter().cloned().collect(),
            },
        };
        serde_json::to_string_pretty(&doc).unwrap_or_else(|_| "{}".into())
    }

    pub fn from_json(json: &str) -> Result<Self, ModelError> {
        let doc: MappingDoc = serde_json::from_str(json)?;
        let body = doc.mapping;
        let mut mapping = Mapping::new(body.name);
        mapping.description = body.description;
        mapping.version = body.version;
        for e in body.mapping_out {
            mapping.add(&e.input_name, &e.agent_name, &e.output_name)?;
        }
        Ok(mapping)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct MappingDoc {
    mapping: MappingBody,
}

#[derive(Debug, Serialize, Deserialize)]
struct MappingBody {
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    mapping_out: Vec<MappingElement>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_is_idempotent() {
        let mut m = Mapping::new("B");
        let a = m.add("t", "A", "temp").unwrap();
        let b = m.add("t", "A", "temp").unwrap();
        assert_eq!(a, b);
        assert_eq!(m.len(), 1);
        assert_ne!(a, m.add("t", "A", "temp2").unwrap());
    }

    #[test]
    fn wildcard_targets_every_agent() {
        let mut m = Mapping::new("B");
        m.add("t", "*", "temp").unwrap();
        m.add("u", "C", "temp").unwrap();
        assert_eq!(m.elements_for_output("A", "temp").count(), 1);
        assert_eq!(m.elements_for_output("C", "temp").count(), 2);
        assert_eq!(m.elements_for_output("C", "other").count(), 0);
    }

    #[test]
    fn colliding_ids_keep_both_elements() {
        // "Ez" and "FY" hash to the same djb2 value.
        let mut m = Mapping::new("B");
        let a = m.add("Ez", "A", "o").unwrap();
        let b = m.add("FY", "A", "o").unwrap();
        assert_eq!(a, b);
        assert_eq!(m.len(), 2);
        assert!(matches!(
            m.remove_by_id(a),
            Err(ModelError::AmbiguousMappingElement(_))
        ));

        let reloaded = Mapping::from_json(&m.to_json()).unwrap();
        assert_eq!(reloaded.len(), 2);

        m.remove("Ez", "A", "o").unwrap();
        assert_eq!(m.remove_by_id(b).unwrap().input_name, "FY");
        assert!(m.is_empty());
    }

    #[test]
    fn remove_unknown_element_fails() {
        let mut m = Mapping::new("B");
        assert!(m.remove("t", "A", "temp").is_err());
        let id = m.add("t", "A", "temp").unwrap();
        assert_eq!(m.remove_by_id(id).unwrap().output_name, "temp");
        assert!(m.is_empty());
    }

    #[test]
    fn empty_fields_are_rejected() {
        let mut m = Mapping::new("B");
        assert!(m.add("", "A", "temp").is_err());
        assert!(m.add("t", " ", "temp").is_err());
    }
}

// src/model/definition.rs

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::constants::MAX_VALUE_LENGTH;
use crate::error::ModelError;
use crate::model::iop::{Iop, IopKind, IopType, IopValue};
use crate::utils::sanitize_name;

/// An agent's declared schema: three name-keyed tables of IOPs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Definition {
    pub name: String,
    pub description: String,
    pub version: String,
    inputs: BTreeMap<String, Iop>,
    outputs: BTreeMap<String, Iop>,
    parameters: BTreeMap<String, Iop>,
}

impl Definition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn table(&self, kind: IopKind) -> &BTreeMap<String, Iop> {
        match kind {
            IopKind::Input => &self.inputs,
            IopKind::Output => &self.outputs,
            IopKind::Parameter => &self.parameters,
        }
    }

    fn table_mut(&mut self, kind: IopKind) -> &mut BTreeMap<String, Iop> {
        match kind {
            IopKind::Input => &mut self.inputs,
            IopKind::Output => &mut self.outputs,
            IopKind::Parameter => &mut self.parameters,
        }
    }

    pub fn inputs(&self) -> impl Iterator<Item = &Iop> {
        self.inputs.values()
    }

    pub fn outputs(&self) -> impl Iterator<Item = &Iop> {
        self.outputs.values()
    }

    pub fn parameters(&self) -> impl Iterator<Item = &Iop> {
        self.parameters.values()
    }

    pub fn get(&self, kind: IopKind, name: &str) -> Option<&Iop> {
        self.table(kind).get(name)
    }

    pub fn get_mut(&mut self, kind: IopKind, name: &str) -> Option<&mut Iop> {
        self.table_mut(kind).get_mut(name)
    }

    pub fn input(&self, name: &str) -> Option<&Iop> {
        self.inputs.get(name)
    }

    pub fn output(&self, name: &str) -> Option<&Iop> {
        self.outputs.get(name)
    }

    /// Which table, if any, already holds `name`.
    pub fn kind_of(&self, name: &str) -> Option<IopKind> {
        [IopKind::Input, IopKind::Output, IopKind::Parameter]
            .into_iter()
            .find(|k| self.table(*k).contains_key(name))
    }

    /// Add a new IOP. Names are unique across the three tables.
    pub fn create(
        &mut self,
        kind: IopKind,
        name: &str,
        iop_type: IopType,
        value: Option<IopValue>,
    ) -> Result<&Iop, ModelError> {
        let name = sanitize_name(name);
        if name.is_empty() {
            return Err(ModelError::EmptyName);
        }
        if let Some(existing) = self.kind_of(&name) {
            return Err(ModelError::NameClash {
                name,
                existing: existing.as_str(),
            });
        }
        let mut iop = Iop::new(name.clone(), iop_type);
        if let Some(v) = value {
            iop = iop.with_value(v)?;
        }
        let table = self.table_mut(kind);
        table.insert(name.clone(), iop);
        Ok(&table[&name])
    }

    pub fn remove(&mut self, kind: IopKind, name: &str) -> Result<Iop, ModelError> {
        self.table_mut(kind)
            .remove(name)
            .ok_or_else(|| ModelError::UnknownIop {
                kind: kind.as_str(),
                name: name.to_string(),
            })
    }

    /// Convert `value` to the IOP's declared type and store it. Returns the stored value.
    pub fn write(
        &mut self,
        kind: IopKind,
        name: &str,
        value: &IopValue,
    ) -> Result<IopValue, ModelError> {
        let iop = self
            .get_mut(kind, name)
            .ok_or_else(|| ModelError::UnknownIop {
                kind: kind.as_str(),
                name: name.to_string(),
            })?;
        let converted = value.convert_to(iop.iop_type)?;
        let len = match &converted {
            IopValue::String(text) => text.len(),
            IopValue::Data(data) => data.len(),
            _ => 0,
        };
        if len > MAX_VALUE_LENGTH {
            return Err(ModelError::ValueTooLarge {
                name: name.to_string(),
                len,
            });
        }
        iop.value = converted.clone();
        Ok(converted)
    }

    pub fn to_json(&self) -> String {
        let doc = DefinitionDoc {
            definition: DefinitionBody {
                name: self.name.clone(),
                description: self.description.clone(),
                version: self.version.clone(),
                inputs: self.inputs.values().map(IopDoc::from).collect(),
                outputs: self.outputs.values().map(IopDoc::from).collect(),
                parameters: self.parameters.values().map(IopDoc::from).collect(),
            },
        };
        serde_json::to_string_pretty(&doc).unwrap_or_else(|_| "{}".into())
    }

    pub fn from_json(json: &str) -> Result<Self, ModelError> {
        let doc: DefinitionDoc = serde_json::from_str(json)?;
        let body = doc.definition;
        let mut def = Definition::new(sanitize_name(&body.name));
        def.description = body.description;
        def.version = body.version;
        for (kind, entries) in [
            (IopKind::Input, body.inputs),
            (IopKind::Output, body.outputs),
            (IopKind::Parameter, body.parameters),
        ] {
            for entry in entries {
                let value = match &entry.value {
                    Some(v) => Some(IopValue::from_json(entry.iop_type, v)?),
                    None => None,
                };
                def.create(kind, &entry.name, entry.iop_type, value)?;
            }
        }
        Ok(def)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct DefinitionDoc {
    definition: DefinitionBody,
}

#[derive(Debug, Serialize, Deserialize)]
struct DefinitionBody {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    inputs: Vec<IopDoc>,
    #[serde(default)]
    outputs: Vec<IopDoc>,
    #[serde(default)]
    parameters: Vec<IopDoc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct IopDoc {
    name: String,
    #[serde(rename = "type")]
    iop_type: IopType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<serde_json::Value>,
}

impl From<&Iop> for IopDoc {
    fn from(iop: &Iop) -> Self {
        Self {
            name: iop.name.clone(),
            iop_type: iop.iop_type,
            value: iop.value.to_json(),
        }
    }
}

// src/runtime/publication.rs

use crate::error::ModelError;
use crate::model::{AgentModel, IopKind, IopValue};
use crate::network::{DataMessage, PublisherHandle};

/// Why an output write did not go out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    AgentMuted,
    OutputMuted,
    Frozen,
}

/// Check the mute/freeze gates for `output` and build its data message from
/// the current value. Gates are read fresh from the model on every call.
pub fn prepare(model: &AgentModel, output: &str) -> Result<Result<DataMessage, Gate>, ModelError> {
    let iop = model
        .definition
        .output(output)
        .ok_or_else(|| ModelError::UnknownIop {
            kind: IopKind::Output.as_str(),
            name: output.to_string(),
        })?;
    if model.frozen {
        return Ok(Err(Gate::Frozen));
    }
    if model.muted {
        return Ok(Err(Gate::AgentMuted));
    }
    if iop.muted {
        return Ok(Err(Gate::OutputMuted));
    }
    Ok(Ok(DataMessage::new(iop.name.clone(), iop.value.clone())))
}

/// Current outputs for an `OUTPUTS` reply: muted outputs are left out and
/// nothing is reported while the agent is muted or frozen.
pub fn snapshot_outputs(model: &AgentModel) -> Vec<DataMessage> {
    if model.muted || model.frozen {
        return Vec::new();
    }
    model
        .definition
        .outputs()
        .filter(|iop| !iop.muted)
        .map(|iop| DataMessage::new(iop.name.clone(), iop.value.clone()))
        .collect()
}

/// Current values of every IOP of `kind`, ungated.
pub fn snapshot(model: &AgentModel, kind: IopKind) -> Vec<DataMessage> {
    model
        .definition
        .table(kind)
        .values()
        .map(|iop| DataMessage::new(iop.name.clone(), iop.value.clone()))
        .collect()
}

/// Sends prepared messages on the publish socket(s).
#[derive(Clone)]
pub struct PublicationEngine {
    publisher: PublisherHandle,
}

impl PublicationEngine {
    pub fn new(publisher: PublisherHandle) -> Self {
        Self { publisher }
    }

    pub fn send(&self, message: DataMessage) -> usize {
        self.publisher.publish(message)
    }
}

/// An input that took a new value from a peer's output.
#[derive(Debug, Clone, PartialEq)]
pub struct InputUpdate {
    pub input: String,
    pub value: IopValue,
}

/// Write an incoming output value into every local input mapped to
/// `(peer_name, message.name)`. Nothing is written while frozen. Inputs whose
/// type cannot take the value are skipped and reported in the error list.
pub fn route_inbound(
    model: &mut AgentModel,
    peer_name: &str,
    message: &DataMessage,
) -> (Vec<InputUpdate>, Vec<ModelError>) {
    let mut updates = Vec::new();
    let mut errors = Vec::new();
    if model.frozen {
        return (updates, errors);
    }
    let targets: Vec<String> = model
        .mapping
        .elements_for_output(peer_name, &message.name)
        .map(|e| e.input_name.clone())
        .collect();
    for input in targets {
        if model.definition.input(&input).is_none() {
            continue;
        }
        match model.definition.write(IopKind::Input, &input, &message.value) {
            Ok(stored) => updates.push(InputUpdate {
                input,
                value: stored,
            }),
            Err(e) => errors.push(e),
        }
    }
    (updates, errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::IopType;

    fn model_with_output() -> AgentModel {
        let mut model = AgentModel::new("A");
        model
            .definition
            .create(IopKind::Output, "temp", IopType::Double, None)
            .unwrap();
        model
            .definition
            .write(IopKind::Output, "temp", &IopValue::Double(21.5))
            .unwrap();
        model
    }

    #[test]
    fn each_gate_blocks_publication() {
        let mut model = model_with_output();
        assert!(prepare(&model, "temp").unwrap().is_ok());

        model.muted = true;
        assert_eq!(prepare(&model, "temp").unwrap(), Err(Gate::AgentMuted));
        model.muted = false;

        model
            .definition
            .get_mut(IopKind::Output, "temp")
            .unwrap()
            .muted = true;
        assert_eq!(prepare(&model, "temp").unwrap(), Err(Gate::OutputMuted));
        model
            .definition
            .get_mut(IopKind::Output, "temp")
            .unwrap()
            .muted = false;

        model.frozen = true;
        assert_eq!(prepare(&model, "temp").unwrap(), Err(Gate::Frozen));
        model.frozen = false;

        let msg = prepare(&model, "temp").unwrap().unwrap();
        assert_eq!(msg.value, IopValue::Double(21.5));
        assert!(prepare(&model, "nope").is_err());
    }

    #[test]
    fn outputs_snapshot_respects_gates() {
        let mut model = model_with_output();
        model
            .definition
            .create(IopKind::Output, "hidden", IopType::Integer, None)
            .unwrap();
        model
            .definition
            .get_mut(IopKind::Output, "hidden")
            .unwrap()
            .muted = true;
        let names: Vec<_> = snapshot_outputs(&model).into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["temp"]);
        model.frozen = true;
        assert!(snapshot_outputs(&model).is_empty());
    }

    #[test]
    fn inbound_values_follow_the_mapping() {
        let mut model = AgentModel::new("B");
        model
            .definition
            .create(IopKind::Input, "t", IopType::Double, None)
            .unwrap();
        model
            .definition
            .create(IopKind::Input, "label", IopType::String, None)
            .unwrap();
        model.mapping.add("t", "A", "temp").unwrap();
        model.mapping.add("label", "*", "temp").unwrap();

        let msg = DataMessage::new("temp", IopValue::Double(21.5));
        let (updates, errors) = route_inbound(&mut model, "A", &msg);
        assert!(errors.is_empty());
        assert_eq!(updates.len(), 2);
        assert_eq!(
            model.definition.input("t").unwrap().value,
            IopValue::Double(21.5)
        );
        assert_eq!(
            model.definition.input("label").unwrap().value,
            IopValue::from("21.5")
        );

        let (updates, _) = route_inbound(&mut model, "C", &msg);
        assert_eq!(updates.len(), 1, "only the wildcard element matches C");

        model.frozen = true;
        let msg = DataMessage::new("temp", IopValue::Double(1.0));
        assert!(route_inbound(&mut model, "A", &msg).0.is_empty());
        assert_eq!(
            model.definition.input("t").unwrap().value,
            IopValue::Double(21.5)
        );
    }
}

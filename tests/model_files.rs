use std::fs;

use agentmesh::config::Config;
use agentmesh::model::{IopType, IopValue};
use agentmesh::network::PresenceHub;
use agentmesh::Agent;

const DEFINITION: &str = r#"{
  "definition": {
    "name": "thermo",
    "description": "room sensor",
    "version": "1.0",
    "inputs": [{ "name": "setpoint", "type": "DOUBLE", "value": 19.0 }],
    "outputs": [{ "name": "temp", "type": "DOUBLE" }, { "name": "alarm", "type": "IMPULSION" }],
    "parameters": [{ "name": "unit", "type": "STRING", "value": "celsius" }]
  }
}"#;

const MAPPING: &str = r#"{
  "mapping": {
    "name": "thermo",
    "mapping_out": [
      { "input_name": "setpoint", "agent_name": "panel", "output_name": "target" },
      { "input_name": "setpoint", "agent_name": "*", "output_name": "override" }
    ]
  }
}"#;

fn agent(name: &str) -> Agent {
    Agent::new(name, Config::default(), Box::new(PresenceHub::new().presence()))
}

#[test]
fn definition_file_loads_and_keeps_agent_name() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("definition.json");
    fs::write(&path, DEFINITION).unwrap();

    let a = agent("living room");
    a.load_definition_file(&path).unwrap();
    let def = a.definition();
    assert_eq!(def.name, "living_room");
    assert_eq!(def.description, "room sensor");
    assert_eq!(a.read_input_as_double("setpoint").unwrap(), 19.0);
    assert_eq!(a.read_parameter_as_string("unit").unwrap(), "celsius");
    assert_eq!(def.output("alarm").unwrap().iop_type, IopType::Impulsion);

    // Export feeds straight back into a fresh agent.
    let b = agent("copy");
    b.load_definition(&a.export_definition()).unwrap();
    assert_eq!(
        b.read_input("setpoint"),
        Some(IopValue::Double(19.0))
    );
    assert_eq!(b.definition().outputs().count(), 2);
}

#[test]
fn mapping_file_loads_and_exports() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mapping.json");
    fs::write(&path, MAPPING).unwrap();

    let a = agent("thermo");
    a.load_mapping_file(&path).unwrap();
    assert_eq!(a.mapping().len(), 2);

    let id = a.add_mapping_entry("setpoint", "panel", "target").unwrap();
    assert_eq!(a.mapping().len(), 2);
    a.remove_mapping_entry_by_id(id).unwrap();
    assert_eq!(a.mapping().len(), 1);

    let b = agent("other");
    b.load_mapping(&a.export_mapping()).unwrap();
    let element = b.mapping().elements().next().cloned().unwrap();
    assert_eq!(element.agent_name, "*");
    assert_eq!(element.output_name, "override");
}

#[test]
fn broken_files_are_rejected_without_changes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.json");
    fs::write(&path, "{ \"definition\": ").unwrap();

    let a = agent("thermo");
    a.create_output("kept", IopType::Integer, None).unwrap();
    assert!(a.load_definition_file(&path).is_err());
    assert!(a.load_definition_file(dir.path().join("missing.json")).is_err());
    assert!(a.definition().output("kept").is_some());
    assert!(a.load_mapping_file(&path).is_err());
}

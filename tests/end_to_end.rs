use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use agentmesh::config::Config;
use agentmesh::model::{IopType, IopValue};
use agentmesh::network::PresenceHub;
use agentmesh::runtime::AgentEvent;
use agentmesh::Agent;

fn test_config(ipc_dir: &std::path::Path, extra: &str) -> Config {
    Config::from_toml_str(&format!(
        r#"
        [agent]
        interrupt_on_forced_stop = false
        {extra}

        [network]
        ipc_dir = "{}"

        [timing]
        broadcast_interval_ms = 50
        outputs_request_delay_ms = 20

        [logging]
        disable_console = true
        disable_file = true
        "#,
        ipc_dir.display()
    ))
    .unwrap()
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    cond()
}

fn sensor_and_display(hub: &PresenceHub, extra_a: &str) -> (Agent, Agent, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut a = Agent::new(
        "A",
        test_config(dir.path(), extra_a),
        Box::new(hub.presence()),
    );
    a.create_output("temp", IopType::Double, None).unwrap();
    let mut b = Agent::new("B", test_config(dir.path(), ""), Box::new(hub.presence()));
    b.create_input("t", IopType::Double, None).unwrap();
    b.add_mapping_entry("t", "A", "temp").unwrap();
    a.start().unwrap();
    b.start().unwrap();
    let subscribed = BTreeSet::from(["temp".to_string()]);
    assert!(
        wait_until(Duration::from_secs(5), || {
            b.peer_filters("A").ok().flatten().as_ref() == Some(&subscribed)
        }),
        "B never subscribed to A.temp"
    );
    (a, b, dir)
}

#[test]
fn output_write_reaches_mapped_input() {
    let hub = PresenceHub::new();
    let (a, b, _dir) = sensor_and_display(&hub, "");
    let mut events = b.subscribe_events();

    // The SUB frame travels asynchronously; keep writing until it lands.
    assert!(wait_until(Duration::from_secs(5), || {
        a.write_output("temp", 21.5).unwrap();
        b.read_input_as_double("t").unwrap() == 21.5
    }));

    let mut saw_update = false;
    while let Ok(event) = events.try_recv() {
        if event
            == (AgentEvent::InputUpdated {
                name: "t".into(),
                value: IopValue::Double(21.5),
            })
        {
            saw_update = true;
        }
    }
    assert!(saw_update);

    let definition = b.peer_definition("A").unwrap().unwrap();
    assert_eq!(definition.output("temp").unwrap().iop_type, IopType::Double);
    assert!(b.peer_mapping("A").unwrap().is_some());
    let names: Vec<String> = a.peers().unwrap().into_iter().map(|p| p.name).collect();
    assert_eq!(names, vec!["B".to_string()]);
}

#[test]
fn muted_and_frozen_outputs_are_not_published() {
    let hub = PresenceHub::new();
    let (a, b, _dir) = sensor_and_display(&hub, "can_be_frozen = true");
    assert!(wait_until(Duration::from_secs(5), || {
        a.write_output("temp", 1.0).unwrap();
        b.read_input_as_double("t").unwrap() == 1.0
    }));

    a.mute();
    a.write_output("temp", 2.0).unwrap();
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(b.read_input_as_double("t").unwrap(), 1.0);
    a.unmute();

    a.mute_output("temp").unwrap();
    a.write_output("temp", 3.0).unwrap();
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(b.read_input_as_double("t").unwrap(), 1.0);
    a.unmute_output("temp").unwrap();

    a.freeze().unwrap();
    a.write_output("temp", 4.0).unwrap();
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(b.read_input_as_double("t").unwrap(), 1.0);
    a.unfreeze().unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        a.write_output("temp", 5.0).unwrap();
        b.read_input_as_double("t").unwrap() == 5.0
    }));
}

#[test]
fn late_mapping_fetches_current_outputs() {
    let hub = PresenceHub::new();
    let dir = tempfile::tempdir().unwrap();
    let mut a = Agent::new("A", test_config(dir.path(), ""), Box::new(hub.presence()));
    a.create_output("temp", IopType::Double, Some(IopValue::Double(7.5)))
        .unwrap();
    let mut b = Agent::new("B", test_config(dir.path(), ""), Box::new(hub.presence()));
    b.create_input("t", IopType::Double, None).unwrap();
    a.start().unwrap();
    b.start().unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        b.peer_definition("A").ok().flatten().is_some()
    }));

    // No write happens on A: the value arrives through REQUEST_OUPUTS/OUTPUTS.
    b.add_mapping_entry("t", "A", "temp").unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        b.read_input_as_double("t").unwrap() == 7.5
    }));
}

#[test]
fn restart_after_stop() {
    let hub = PresenceHub::new();
    let dir = tempfile::tempdir().unwrap();
    let mut a = Agent::new("A", test_config(dir.path(), ""), Box::new(hub.presence()));
    a.start().unwrap();
    assert!(a.is_running());
    assert!(a.start().is_err());
    a.stop();
    assert!(!a.is_running());
    assert_eq!(hub.node_count(), 0);
    a.start().unwrap();
    assert_eq!(hub.node_count(), 1);
}

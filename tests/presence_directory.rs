use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use agentmesh::config::Config;
use agentmesh::constants::PRIVATE_CHANNEL;
use agentmesh::model::IopType;
use agentmesh::network::{text_frames, Presence, PresenceEvent, PresenceHub};
use agentmesh::runtime::AgentEvent;
use agentmesh::Agent;

fn quiet_config() -> Config {
    Config::from_toml_str(
        r#"
        [agent]
        interrupt_on_forced_stop = false

        [network]
        enable_ipc = false

        [timing]
        broadcast_interval_ms = 50

        [logging]
        disable_console = true
        disable_file = true
        "#,
    )
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

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_enter_needs_matching_exits() {
    let hub = PresenceHub::new();
    let mut agent = Agent::new("watcher", quiet_config(), Box::new(hub.presence()));
    agent.start().unwrap();

    let mut other = hub.presence();
    other.set_name("flaky");
    let _other_rx = other.start().await.unwrap();
    let other_id = other.node_id().to_string();

    let reconnections = |agent: &Agent| {
        agent
            .peers()
            .unwrap()
            .into_iter()
            .find(|p| p.id == other_id)
            .map(|p| p.reconnections)
    };
    assert!(wait_until(Duration::from_secs(2), || reconnections(&agent) == Some(0)));

    let enter = hub.enter_event_for(&other_id).unwrap();
    hub.inject(agent.node_id(), enter).unwrap();
    assert!(wait_until(Duration::from_secs(2), || reconnections(&agent) == Some(1)));

    // First exit only cancels the duplicate session.
    other.stop().await;
    assert!(wait_until(Duration::from_secs(2), || reconnections(&agent) == Some(0)));

    hub.inject(
        agent.node_id(),
        PresenceEvent::Exit {
            peer_id: other_id.clone(),
            name: "flaky".into(),
        },
    )
    .unwrap();
    assert!(wait_until(Duration::from_secs(2), || reconnections(&agent).is_none()));
    agent.stop();
}

#[test]
fn duplicate_enter_keeps_subscriber_caches() {
    let hub = PresenceHub::new();
    let mut a = Agent::new("A", quiet_config(), Box::new(hub.presence()));
    a.create_output("temp", IopType::Double, None).unwrap();
    let mut b = Agent::new("B", quiet_config(), Box::new(hub.presence()));
    b.create_input("t", IopType::Double, None).unwrap();
    b.add_mapping_entry("t", "A", "temp").unwrap();
    a.start().unwrap();
    b.start().unwrap();

    let subscribed = BTreeSet::from(["temp".to_string()]);
    let filters = |b: &Agent| b.peer_filters("A").ok().flatten();
    assert!(wait_until(Duration::from_secs(5), || {
        filters(&b).as_ref() == Some(&subscribed) && b.peer_mapping("A").ok().flatten().is_some()
    }));
    let definition = b.peer_definition("A").unwrap();
    let mapping = b.peer_mapping("A").unwrap();

    let a_id = a.node_id().to_string();
    let reconnections = |b: &Agent| {
        b.peers()
            .unwrap()
            .into_iter()
            .find(|p| p.id == a_id)
            .map(|p| p.reconnections)
    };
    hub.inject(b.node_id(), hub.enter_event_for(&a_id).unwrap())
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || reconnections(&b) == Some(1)));

    let exit = PresenceEvent::Exit {
        peer_id: a_id.clone(),
        name: "A".into(),
    };
    hub.inject(b.node_id(), exit.clone()).unwrap();
    assert!(wait_until(Duration::from_secs(2), || reconnections(&b) == Some(0)));
    assert_eq!(b.peer_definition("A").unwrap(), definition);
    assert_eq!(b.peer_mapping("A").unwrap(), mapping);
    assert_eq!(filters(&b), Some(subscribed));

    // The surviving subscriber still receives data.
    assert!(wait_until(Duration::from_secs(5), || {
        a.write_output("temp", 3.5).unwrap();
        b.read_input_as_double("t").unwrap() == 3.5
    }));

    hub.inject(b.node_id(), exit).unwrap();
    assert!(wait_until(Duration::from_secs(2), || reconnections(&b).is_none()));
    assert_eq!(filters(&b), None);
    assert_eq!(b.peer_definition("A").unwrap(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_from_peer_shuts_agent_down() {
    let hub = PresenceHub::new();
    let mut agent = Agent::new("worker", quiet_config(), Box::new(hub.presence()));
    let mut events = agent.subscribe_events();
    agent.start().unwrap();

    let mut boss = hub.presence();
    boss.set_name("boss");
    let _boss_rx = boss.start().await.unwrap();
    let agent_id = agent.node_id().to_string();
    assert!(wait_until(Duration::from_secs(2), || {
        agent.peers().map(|p| p.len() == 1).unwrap_or(false)
    }));

    boss.whisper(&agent_id, text_frames(["STOP"])).unwrap();
    assert!(wait_until(Duration::from_secs(2), || !agent.is_running()));

    let mut forced_by = None;
    while let Ok(event) = events.try_recv() {
        if let AgentEvent::ForcedStop { by } = event {
            forced_by = Some(by);
        }
    }
    assert_eq!(forced_by.as_deref(), Some("boss"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn joiners_receive_definition_catch_up() {
    let hub = PresenceHub::new();
    let mut agent = Agent::new("source", quiet_config(), Box::new(hub.presence()));
    agent
        .create_output("level", IopType::Integer, None)
        .unwrap();
    agent.start().unwrap();

    let mut observer = hub.presence();
    observer.set_name("observer");
    let mut rx = observer.start().await.unwrap();
    observer.join(PRIVATE_CHANNEL).unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    let mut definition = None;
    while definition.is_none() {
        let event = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .expect("no definition whispered")
            .expect("presence closed");
        if let PresenceEvent::Whisper { frames, .. } = event {
            let text = String::from_utf8_lossy(&frames[0]).to_string();
            if let Some(json) = text.strip_prefix("EXTERNAL_DEFINITION#") {
                definition = Some(json.to_string());
            }
        }
    }
    let json = definition.unwrap();
    assert!(json.contains("\"level\""));
    agent.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bus_traffic_reaches_host_events() {
    let hub = PresenceHub::new();
    let mut agent = Agent::new("listener", quiet_config(), Box::new(hub.presence()));
    let mut events = agent.subscribe_events();
    agent.start().unwrap();
    agent.bus_join("chat").unwrap();

    let mut talker = hub.presence();
    talker.set_name("talker");
    let _rx = talker.start().await.unwrap();
    talker.join("chat").unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        agent.peers().map(|p| p.len() == 1).unwrap_or(false)
    }));
    talker.shout("chat", text_frames(["hello", "world"])).unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .expect("no shout delivered")
            .unwrap();
        if let AgentEvent::BusShout { name, group, frames, .. } = event {
            assert_eq!(name, "talker");
            assert_eq!(group, "chat");
            assert_eq!(frames, text_frames(["hello", "world"]));
            break;
        }
    }
    assert!(agent.bus_join(PRIVATE_CHANNEL).is_err());
    agent.stop();
}

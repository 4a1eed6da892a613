//! Presence tracking driven by the scheduler

mod common;

use common::{ScriptedScanner, TestHub};
use hub_core::events::STATE_CHANGED;
use hub_core::{STATE_HOME, STATE_NOT_HOME};

const PHONE: &str = "device_tracker.paulus_phone";
const TABLET: &str = "device_tracker.anne_tablet";
const ALL: &str = "group.all_devices";

fn scanner() -> std::sync::Arc<ScriptedScanner> {
    ScriptedScanner::new(&[
        ("aa:aa:aa:aa:aa:01", "Paulus Phone"),
        ("aa:aa:aa:aa:aa:02", "Anne Tablet"),
    ])
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_devices_start_not_home() {
    let hub = TestHub::new("", scanner());

    hub.assert_state(PHONE, STATE_NOT_HOME);
    hub.assert_state(TABLET, STATE_NOT_HOME);
    hub.assert_state(ALL, STATE_NOT_HOME);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_grace_period_debounces_missed_scans() {
    let hub = TestHub::new("", scanner());
    hub.start().await;

    hub.scanner.set_present(&["aa:aa:aa:aa:aa:01"]);
    hub.run_for(1).await;
    hub.assert_state(PHONE, STATE_HOME);
    hub.assert_state(ALL, STATE_HOME);

    // Missing at +30 s and +60 s: still inside the 70 s grace period
    hub.scanner.set_present(&[]);
    hub.run_for(30).await;
    hub.assert_state(PHONE, STATE_HOME);
    hub.run_for(30).await;
    hub.assert_state(PHONE, STATE_HOME);

    // +90 s: gone for longer than the grace period
    hub.run_for(30).await;
    hub.assert_state(PHONE, STATE_NOT_HOME);
    hub.assert_state(ALL, STATE_NOT_HOME);
    hub.assert_state(TABLET, STATE_NOT_HOME);

    assert_eq!(hub.scanner.scans(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_configured_grace_period_and_names() {
    let yaml = r#"
device_tracker:
  grace_period: 20
  devices:
    "aa:aa:aa:aa:aa:01":
      name: Work Phone
    "aa:aa:aa:aa:aa:02":
      track: false
"#;
    let hub = TestHub::new(yaml, scanner());
    hub.start().await;

    assert!(hub.state(TABLET).is_none());
    assert!(hub.state(PHONE).is_none());

    hub.scanner.set_present(&["aa:aa:aa:aa:aa:01"]);
    hub.run_for(1).await;
    hub.assert_state("device_tracker.work_phone", STATE_HOME);

    hub.scanner.set_present(&[]);
    hub.run_for(30).await;
    hub.assert_state("device_tracker.work_phone", STATE_NOT_HOME);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_aggregate_home_while_any_device_home() {
    let hub = TestHub::new("", scanner());
    hub.start().await;

    hub.scanner.set_present(&["aa:aa:aa:aa:aa:01", "aa:aa:aa:aa:aa:02"]);
    hub.run_for(1).await;
    hub.assert_state(ALL, STATE_HOME);

    // Phone keeps reporting, tablet leaves
    hub.scanner.set_present(&["aa:aa:aa:aa:aa:01"]);
    hub.run_for(90).await;
    hub.assert_state(TABLET, STATE_NOT_HOME);
    hub.assert_state(PHONE, STATE_HOME);
    hub.assert_state(ALL, STATE_HOME);

    let all = hub.hub.states().get(ALL).unwrap();
    assert_eq!(
        all.attributes["entity_id"],
        serde_json::json!([PHONE, TABLET])
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_scanner_errors_leave_state_untouched() {
    let hub = TestHub::new("", scanner());
    hub.start().await;

    hub.scanner.set_present(&["aa:aa:aa:aa:aa:01"]);
    hub.run_for(1).await;
    hub.assert_state(PHONE, STATE_HOME);
    let before = hub.hub.states().get(PHONE).unwrap();
    hub.clear_events();

    // Well past the grace period, but every scan fails
    hub.scanner.set_failing(true);
    hub.run_for(120).await;

    hub.assert_state(PHONE, STATE_HOME);
    assert_eq!(hub.hub.states().get(PHONE).unwrap().last_updated, before.last_updated);
    assert!(hub.events_of_type(STATE_CHANGED).is_empty());
    assert_eq!(hub.scanner.scans(), 5);

    // Recovery: the next good scan applies the grace period normally
    hub.scanner.set_failing(false);
    hub.scanner.set_present(&[]);
    hub.run_for(30).await;
    hub.assert_state(PHONE, STATE_NOT_HOME);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_state_changes_arrive_in_commit_order() {
    let hub = TestHub::new("", scanner());
    hub.start().await;

    for _ in 0..3 {
        hub.scanner.set_present(&["aa:aa:aa:aa:aa:01"]);
        hub.run_for(30).await;
        hub.scanner.set_present(&[]);
        hub.run_for(90).await;
    }

    let phone_states: Vec<String> = hub
        .events_of_type(STATE_CHANGED)
        .iter()
        .filter(|e| e.data["entity_id"] == PHONE)
        .map(|e| e.data["new_state"]["state"].as_str().unwrap_or_default().to_string())
        .collect();

    // Every scan rewrites the state, so collapse repeats before comparing
    let mut transitions = phone_states.clone();
    transitions.dedup();
    assert_eq!(
        transitions,
        vec!["home", "not_home", "home", "not_home", "home", "not_home"]
    );
}

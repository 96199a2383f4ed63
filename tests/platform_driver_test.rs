//! Integration tests for the platform driver lifecycle and command dispatch.
//!
//! All tests drive `PlatformDriver` against the in-process OMS simulator.

mod common;

use common::*;
use rsn_platform_driver::node_config::OmsPortControlId;
use rsn_platform_driver::oms::simulator::InjectedFailure;
use rsn_platform_driver::platform::{
    CommandArgs, DriverAsyncEvent, DriverState, GetRequest, PlatformDriverEvent,
};
use rsn_platform_driver::PlatformError;
use serde_json::json;
use std::time::Duration;

fn port_args(port_id: &str) -> CommandArgs {
    CommandArgs::new().with("port_id", port_id).with("src", "integration-test")
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_configure_connect_disconnect() {
    let mut fx = fixture_with(simulator(), NODE_YAML);
    assert_eq!(fx.driver.state(), DriverState::Unconfigured);

    let settings = fx.settings();
    let outcome = fx.driver.configure(settings).unwrap();
    assert_eq!(outcome.next_state, Some(DriverState::Disconnected));

    let outcome = fx.driver.connect().await.unwrap();
    assert_eq!(outcome.next_state, Some(DriverState::Connected));
    assert_eq!(fx.factory.created(), 1);
    assert!(fx.oms.call_log().iter().any(|c| c.starts_with("ping")));

    fx.driver.disconnect().await.unwrap();
    assert_eq!(fx.driver.state(), DriverState::Disconnected);
    assert_eq!(fx.factory.destroyed(), 1);

    let states: Vec<DriverState> = fx
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            DriverAsyncEvent::StateChange { state } => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            DriverState::Disconnected,
            DriverState::Connected,
            DriverState::Disconnected
        ]
    );
}

#[tokio::test]
async fn test_configure_requires_oms_uri() {
    let mut fx = fixture_with(simulator(), NODE_YAML);
    let mut settings = fx.settings();
    settings.oms_uri = String::new();

    let result = fx.driver.configure(settings);
    assert!(matches!(result, Err(PlatformError::Configuration(msg)) if msg.contains("oms_uri")));
    assert_eq!(fx.driver.state(), DriverState::Unconfigured);
}

#[tokio::test]
async fn test_configure_through_event_args() {
    let mut fx = fixture_with(simulator(), NODE_YAML);
    let args = CommandArgs::new()
        .with("node_id", PLATFORM_ID)
        .with("oms_uri", "sim://test")
        .with("node_cfg_file", fx.node_file.path().to_string_lossy().to_string());

    fx.driver
        .execute(PlatformDriverEvent::Configure, args)
        .await
        .unwrap();
    assert_eq!(fx.driver.state(), DriverState::Disconnected);
    assert_eq!(fx.driver.node().unwrap().reference_designator(), "RS01SLBS-LJ01A");
}

#[tokio::test]
async fn test_connect_fails_on_bad_ping() {
    let oms = simulator();
    oms.set_ping_reply(Some("PNG"));
    let mut fx = fixture_with(oms, NODE_YAML);
    let settings = fx.settings();
    fx.driver.configure(settings).unwrap();

    let result = fx.driver.connect().await;
    assert!(matches!(result, Err(PlatformError::Connection(_))));
    assert_eq!(fx.driver.state(), DriverState::Disconnected);
    assert_eq!(fx.factory.destroyed(), 1);
}

#[tokio::test]
async fn test_connect_rejects_unknown_scheme() {
    let mut fx = fixture_with(simulator(), NODE_YAML);
    let mut settings = fx.settings();
    settings.oms_uri = "http://oms.example:9021".to_string();
    fx.driver.configure(settings).unwrap();

    assert!(matches!(
        fx.driver.connect().await,
        Err(PlatformError::Configuration(_))
    ));
    assert_eq!(fx.driver.state(), DriverState::Disconnected);
}

#[tokio::test]
async fn test_connect_registers_listener() {
    let mut fx = fixture_with(simulator(), NODE_YAML);
    let mut settings = fx.settings();
    settings.listener_url = Some("http://gateway:5000/ion-service/oms_event".to_string());
    fx.driver.configure(settings).unwrap();
    fx.driver.connect().await.unwrap();

    assert_eq!(
        fx.oms.listeners(),
        vec!["http://gateway:5000/ion-service/oms_event".to_string()]
    );
}

// =============================================================================
// Dispatch
// =============================================================================

#[tokio::test]
async fn test_commands_rejected_when_disconnected() {
    let mut fx = fixture_with(simulator(), NODE_YAML);
    let settings = fx.settings();
    fx.driver.configure(settings).unwrap();

    let result = fx
        .driver
        .execute(PlatformDriverEvent::TurnOnPort, port_args("J01"))
        .await;
    assert!(matches!(
        result,
        Err(PlatformError::InvalidState { state: DriverState::Disconnected, .. })
    ));
    assert!(fx.oms.call_log().is_empty());
}

#[tokio::test]
async fn test_turn_on_port_uses_external_port_id() {
    let mut fx = connected().await;

    let outcome = fx
        .driver
        .execute(PlatformDriverEvent::TurnOnPort, port_args("J05"))
        .await
        .unwrap();

    assert_eq!(outcome.next_state, None);
    assert_eq!(outcome.result, json!({"J05": "OK: port turned on"}));
    assert!(fx.oms.port_state(OmsPortControlId(12)).unwrap().on);
}

#[tokio::test]
async fn test_set_over_current_limits() {
    let mut fx = connected().await;
    let args = port_args("J01")
        .with("milliamps", 2000)
        .with("microseconds", "1500");

    fx.driver
        .execute(PlatformDriverEvent::SetPortOverCurrentLimits, args)
        .await
        .unwrap();

    let port = fx.oms.port_state(OmsPortControlId(1)).unwrap();
    assert_eq!(port.milliamps, Some(2000));
    assert_eq!(port.microseconds, Some(1500));
}

#[tokio::test]
async fn test_missing_arguments_are_argument_errors() {
    let mut fx = connected().await;

    let cases = [
        (
            PlatformDriverEvent::TurnOnPort,
            CommandArgs::new().with("port_id", "J01"),
        ),
        (
            PlatformDriverEvent::TurnOffPort,
            CommandArgs::new().with("src", "ops"),
        ),
        (
            PlatformDriverEvent::SetPortOverCurrentLimits,
            port_args("J01").with("milliamps", 10),
        ),
        (
            PlatformDriverEvent::StartProfilerMission,
            CommandArgs::new().with("src", "ops"),
        ),
        (
            PlatformDriverEvent::StopProfilerMission,
            CommandArgs::new().with("flag", "false"),
        ),
    ];

    for (event, args) in cases {
        let result = fx.driver.execute(event, args).await;
        assert!(
            matches!(result, Err(PlatformError::Argument(_))),
            "{event} should fail with an argument error"
        );
    }
    assert_eq!(fx.driver.state(), DriverState::Connected);
    assert!(fx.oms.call_log().is_empty());
}

#[tokio::test]
async fn test_protocol_error_is_not_intercepted() {
    let mut fx = connected().await;
    fx.oms.override_response(
        "turn_off_platform_port",
        json!({PLATFORM_ID: {"1": "ERROR: port locked"}}),
    );

    let result = fx
        .driver
        .execute(PlatformDriverEvent::TurnOffPort, port_args("J01"))
        .await;
    assert!(matches!(result, Err(PlatformError::Protocol(_))));
    assert_eq!(fx.driver.state(), DriverState::Connected);
    assert!(fx.driver.pending_replay().is_none());
}

#[tokio::test]
async fn test_profiler_missions() {
    let mut fx = connected().await;
    let start = CommandArgs::new()
        .with("profile_mission_name", "mission_01")
        .with("src", "ops");

    let outcome = fx
        .driver
        .execute(PlatformDriverEvent::StartProfilerMission, start)
        .await
        .unwrap();
    assert_eq!(outcome.result, json!({"mission_01": "OK: mission started"}));

    let status = fx
        .driver
        .execute(PlatformDriverEvent::GetMissionStatus, CommandArgs::new())
        .await
        .unwrap();
    assert_eq!(status.result["mission"], json!("mission_01"));

    let stop = CommandArgs::new().with("flag", "false").with("src", "ops");
    fx.driver
        .execute(PlatformDriverEvent::StopProfilerMission, stop)
        .await
        .unwrap();
    assert_eq!(fx.oms.running_mission(), None);

    let missions = fx
        .driver
        .execute(PlatformDriverEvent::GetAvailableMissions, CommandArgs::new())
        .await
        .unwrap();
    assert_eq!(missions.result, json!(["mission_01"]));
}

#[tokio::test]
async fn test_unknown_port_triggers_connection_lost() {
    let mut fx = connected().await;

    let outcome = fx
        .driver
        .execute(PlatformDriverEvent::TurnOnPort, port_args("J99"))
        .await
        .unwrap();

    assert_eq!(outcome.next_state, Some(DriverState::Disconnected));
    assert!(fx.drain_events().iter().any(|e| matches!(
        e,
        DriverAsyncEvent::ConnectionLost { reason, .. } if reason.contains("Invalid Port ID")
    )));
}

// =============================================================================
// Connection loss and recovery
// =============================================================================

#[tokio::test]
async fn test_socket_failure_preserves_event_for_replay() {
    let mut fx = connected().await;
    fx.oms.trigger_failure(InjectedFailure::Socket);

    let args = port_args("J01");
    let outcome = fx
        .driver
        .execute(PlatformDriverEvent::TurnOnPort, args.clone())
        .await
        .unwrap();

    assert_eq!(outcome.next_state, Some(DriverState::Disconnected));
    assert_eq!(fx.driver.state(), DriverState::Disconnected);
    assert_eq!(fx.factory.destroyed(), 1);
    assert_eq!(
        fx.driver.pending_replay(),
        Some(&(PlatformDriverEvent::TurnOnPort, args.clone()))
    );

    let lost = fx
        .drain_events()
        .into_iter()
        .find_map(|e| match e {
            DriverAsyncEvent::ConnectionLost { event, args, .. } => Some((event, args)),
            _ => None,
        })
        .unwrap();
    assert_eq!(lost, (PlatformDriverEvent::TurnOnPort, args));
}

#[tokio::test]
async fn test_reconnect_replays_lost_command() {
    let mut fx = connected().await;
    fx.oms.trigger_failure(InjectedFailure::Timeout);
    fx.driver
        .execute(PlatformDriverEvent::TurnOnPort, port_args("J01"))
        .await
        .unwrap();
    assert!(!fx.oms.port_state(OmsPortControlId(1)).unwrap().on);

    let replayed = fx.driver.reconnect().await.unwrap().unwrap();

    assert_eq!(fx.driver.state(), DriverState::Connected);
    assert_eq!(replayed.result, json!({"J01": "OK: port turned on"}));
    assert!(fx.oms.port_state(OmsPortControlId(1)).unwrap().on);
    assert!(fx.driver.pending_replay().is_none());
}

#[tokio::test]
async fn test_reconnect_gives_up_after_policy_attempts() {
    let mut fx = connected().await;
    fx.oms.set_unreachable(true);
    fx.driver
        .execute(PlatformDriverEvent::GetMissionStatus, CommandArgs::new())
        .await
        .unwrap();
    fx.oms.clear_call_log();

    let result = fx.driver.reconnect().await;

    assert!(matches!(result, Err(PlatformError::Connection(_))));
    assert_eq!(fx.driver.state(), DriverState::Disconnected);
    let pings = fx.oms.call_log().iter().filter(|c| c.starts_with("ping")).count();
    assert_eq!(pings, 2);
}

#[tokio::test]
async fn test_reconnect_requires_disconnected_state() {
    let mut fx = connected().await;
    assert!(matches!(
        fx.driver.reconnect().await,
        Err(PlatformError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn test_manual_connect_discards_preserved_event() {
    let mut fx = connected().await;
    fx.oms.trigger_failure(InjectedFailure::Socket);
    fx.driver
        .execute(PlatformDriverEvent::TurnOnPort, port_args("J01"))
        .await
        .unwrap();
    assert!(fx.driver.pending_replay().is_some());

    fx.driver.connect().await.unwrap();
    assert!(fx.driver.pending_replay().is_none());
    fx.driver
        .execute(PlatformDriverEvent::TurnOffPort, port_args("J01"))
        .await
        .unwrap();
    fx.driver.disconnect().await.unwrap();

    let replayed = fx.driver.reconnect().await.unwrap();
    assert!(replayed.is_none());
    assert!(!fx.oms.port_state(OmsPortControlId(1)).unwrap().on);
}

#[tokio::test]
async fn test_unusable_sample_rate_rejected_before_connect() {
    for rate in ["0.000000000001", "1000000000000000000000000000000.0"] {
        let yaml = NODE_YAML.replace("oms_sample_rate: 60", &format!("oms_sample_rate: {rate}"));
        let mut fx = fixture_with(simulator(), &yaml);
        let settings = fx.settings();

        let result = fx.driver.configure(settings);
        assert!(
            matches!(result, Err(PlatformError::Configuration(_))),
            "rate {rate} should be rejected"
        );
        assert_eq!(fx.driver.state(), DriverState::Unconfigured);
        assert_eq!(fx.factory.created(), 0);
        assert_eq!(fx.factory.destroyed(), 0);
    }
}

// =============================================================================
// Get / capabilities
// =============================================================================

#[tokio::test]
async fn test_get_metadata_and_attrs() {
    let mut fx = connected().await;
    fx.oms.push_attribute_value("TEMP", json!(215), NOW - 30.0);

    let meta = fx.driver.get(GetRequest::Metadata).await.unwrap();
    assert_eq!(meta["reference_designator"], json!("RS01SLBS-LJ01A"));

    let values = fx
        .driver
        .get(GetRequest::Attrs(json!([["TEMP", NOW - 60.0], ["NOPE", NOW - 60.0]])))
        .await
        .unwrap();
    assert_eq!(values, json!({"TEMP": [[215, NOW - 30.0]]}));

    let bad = fx.driver.get(GetRequest::Attrs(json!("TEMP"))).await;
    assert!(matches!(bad, Err(PlatformError::Argument(_))));
}

#[tokio::test]
async fn test_capabilities_follow_state() {
    let mut fx = connected().await;
    let caps = fx.driver.capabilities();
    assert_eq!(caps.len(), 8);
    assert!(caps.contains(&"RSN_PLATFORM_DRIVER_TURN_ON_PORT".to_string()));

    fx.driver.disconnect().await.unwrap();
    assert!(fx.driver.capabilities().is_empty());
}

// =============================================================================
// Event loop
// =============================================================================

#[tokio::test]
async fn test_event_loop_processes_queued_commands() {
    let fx = connected().await;
    let mut driver = fx.driver;
    let handle = driver.handle();

    let task = tokio::spawn(async move {
        driver.run_event_loop().await.unwrap();
        driver
    });

    let outcome = handle
        .execute(PlatformDriverEvent::TurnOnPort, port_args("J01"))
        .await
        .unwrap();
    assert_eq!(outcome.result, json!({"J01": "OK: port turned on"}));

    let meta = handle.get(GetRequest::Metadata).await.unwrap();
    assert_eq!(meta["oms_sample_rate"], json!(60.0));

    handle.shutdown().await.unwrap();
    let driver = task.await.unwrap();
    assert_eq!(driver.state(), DriverState::Connected);
}

#[tokio::test]
async fn test_scheduler_enqueues_polls() {
    let yaml = NODE_YAML.replace("oms_sample_rate: 60", "oms_sample_rate: 0.05");
    let mut fx = fixture_with(simulator(), &yaml);
    let settings = fx.settings();
    fx.driver.configure(settings).unwrap();
    fx.driver.connect().await.unwrap();

    let mut driver = fx.driver;
    let handle = driver.handle();
    let task = tokio::spawn(async move {
        driver.run_event_loop().await.unwrap();
        driver
    });

    let polled = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match fx.events.recv().await {
                Some(DriverAsyncEvent::PollCompleted { .. }) => break true,
                Some(_) => continue,
                None => break false,
            }
        }
    })
    .await
    .unwrap();
    assert!(polled);

    handle.shutdown().await.unwrap();
    let mut driver = task.await.unwrap();
    driver.disconnect().await.unwrap();
    assert!(fx
        .oms
        .call_log()
        .iter()
        .any(|c| c.starts_with("get_platform_attribute_values")));
}

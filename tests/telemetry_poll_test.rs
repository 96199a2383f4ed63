//! Integration tests for incremental telemetry polling.

mod common;

use common::*;
use rsn_platform_driver::oms::simulator::InjectedFailure;
use rsn_platform_driver::platform::{
    CommandArgs, DriverAsyncEvent, DriverState, EmittedSample, PlatformDriverEvent,
};
use serde_json::json;
use tracing_test::traced_test;

const ENG: &str = "lj01a_eng";
const PORT_ENG: &str = "lj01a_port_eng";

async fn poll(fx: &mut Fixture) -> serde_json::Value {
    fx.driver
        .execute(PlatformDriverEvent::GetEngData, CommandArgs::new())
        .await
        .unwrap()
        .result
}

fn of_stream<'a>(samples: &'a [EmittedSample], stream: &str) -> Vec<&'a EmittedSample> {
    samples.iter().filter(|s| s.stream == stream).collect()
}

#[tokio::test]
async fn test_first_poll_is_bounded_by_lookback() {
    let mut fx = connected().await;
    // Sample rate 60s: the first cycle looks back at most 600s.
    fx.oms.push_attribute_value("TEMP", json!(200), NOW - 700.0);
    fx.oms.push_attribute_value("TEMP", json!(210), NOW - 500.0);
    fx.oms.push_attribute_value("TEMP", json!(220), NOW - 400.0);

    poll(&mut fx).await;
    let samples = fx.drain_samples();
    let stamps: Vec<f64> = of_stream(&samples, ENG).iter().map(|s| s.timestamp).collect();

    assert_eq!(stamps, vec![NOW - 500.0, NOW - 400.0]);
    assert_eq!(fx.driver.watermark(ENG), Some(NOW - 400.0));
}

#[tokio::test]
async fn test_values_are_renamed_and_scaled() {
    let mut fx = connected().await;
    fx.oms.push_attribute_value("TEMP", json!(250), NOW - 60.0);

    poll(&mut fx).await;
    let samples = fx.drain_samples();

    assert_eq!(samples.len(), 1);
    let sample = &samples[0];
    assert_eq!(sample.stream, ENG);
    assert_eq!(sample.instance, "RS01SLBS-LJ01A-00");
    assert_eq!(sample.timestamp, NOW - 60.0);
    assert_eq!(sample.values.len(), 1);
    assert_eq!(sample.values[0].value_id, "sec_node_temperature");
    assert_eq!(sample.values[0].value, json!(25.0));
}

#[tokio::test]
async fn test_zero_is_not_scaled() {
    let mut fx = connected().await;
    fx.oms.push_attribute_value("VOLT", json!(0), NOW - 60.0);

    poll(&mut fx).await;
    let samples = fx.drain_samples();

    assert_eq!(samples[0].values[0].value_id, "input_voltage");
    assert_eq!(samples[0].values[0].value, json!(0));
}

#[tokio::test]
async fn test_attributes_sharing_a_timestamp_form_one_sample() {
    let mut fx = connected().await;
    fx.oms.push_attribute_value("TEMP", json!(100), NOW - 120.0);
    fx.oms.push_attribute_value("VOLT", json!(12000), NOW - 120.0);
    fx.oms.push_attribute_value("VOLT", json!(11000), NOW - 60.0);

    let result = poll(&mut fx).await;
    let samples = fx.drain_samples();

    assert_eq!(result["emitted"], json!(2));
    assert_eq!(samples.len(), 2);
    assert_eq!(samples[0].timestamp, NOW - 120.0);
    let ids: Vec<&str> = samples[0].values.iter().map(|v| v.value_id.as_str()).collect();
    assert_eq!(ids, vec!["sec_node_temperature", "input_voltage"]);
    assert_eq!(samples[0].values[1].value, json!(12.0));
    assert_eq!(samples[1].timestamp, NOW - 60.0);
    assert_eq!(samples[1].values.len(), 1);
}

#[tokio::test]
async fn test_repoll_emits_nothing_new() {
    let mut fx = connected().await;
    fx.oms.push_attribute_value("TEMP", json!(100), NOW - 120.0);

    poll(&mut fx).await;
    assert_eq!(fx.drain_samples().len(), 1);

    let result = poll(&mut fx).await;
    assert_eq!(result["emitted"], json!(0));
    assert!(fx.drain_samples().is_empty());
    assert_eq!(fx.driver.watermark(ENG), Some(NOW - 120.0));
}

#[tokio::test]
async fn test_watermark_never_regresses() {
    let mut fx = connected().await;
    fx.oms.push_attribute_value("TEMP", json!(100), NOW - 100.0);
    poll(&mut fx).await;
    assert_eq!(fx.driver.watermark(ENG), Some(NOW - 100.0));

    fx.oms.override_attribute("TEMP", json!([[90, NOW - 300.0]]));
    poll(&mut fx).await;

    assert_eq!(fx.driver.watermark(ENG), Some(NOW - 100.0));
}

#[tokio::test]
async fn test_stream_without_data_sits_at_lookback_floor() {
    let mut fx = connected().await;
    poll(&mut fx).await;

    assert_eq!(fx.driver.watermark(ENG), Some(NOW - 600.0));
    assert_eq!(fx.driver.watermark(PORT_ENG), Some(NOW - 600.0));
}

#[tokio::test]
async fn test_empty_instance_makes_no_request() {
    let mut fx = connected().await;
    poll(&mut fx).await;

    let fetches = fx
        .oms
        .call_log()
        .iter()
        .filter(|c| c.starts_with("get_platform_attribute_values"))
        .count();
    // lj01a_eng/00 and lj01a_port_eng/J01; J05 has no attributes.
    assert_eq!(fetches, 2);
}

#[tokio::test]
#[traced_test]
async fn test_protocol_error_skips_only_that_stream() {
    let mut fx = connected().await;
    fx.oms.push_attribute_value("TEMP", json!(100), NOW - 60.0);
    fx.oms.override_attribute("PORT01_CURRENT", json!("garbage"));

    let result = poll(&mut fx).await;
    let samples = fx.drain_samples();

    assert_eq!(result["skipped_streams"], json!([PORT_ENG]));
    assert_eq!(of_stream(&samples, ENG).len(), 1);
    assert!(of_stream(&samples, PORT_ENG).is_empty());
    assert_eq!(fx.driver.state(), DriverState::Connected);
    assert!(logs_contain("skipping stream for this poll cycle"));
}

#[tokio::test]
async fn test_request_too_far_in_past_skips_stream() {
    let oms = simulator().with_history_limit(300.0);
    let mut fx = fixture_with(oms, NODE_YAML);
    let settings = fx.settings();
    fx.driver.configure(settings).unwrap();
    fx.driver.connect().await.unwrap();
    fx.oms.push_attribute_value("TEMP", json!(100), NOW - 10.0);
    fx.oms.push_attribute_value("PORT01_CURRENT", json!(5), NOW - 10.0);

    let result = poll(&mut fx).await;

    assert_eq!(result["skipped_streams"], json!([ENG, PORT_ENG]));
    assert_eq!(result["emitted"], json!(0));
}

#[tokio::test]
async fn test_connection_error_aborts_cycle() {
    let mut fx = connected().await;
    fx.oms.push_attribute_value("TEMP", json!(100), NOW - 60.0);
    fx.oms.trigger_failure(InjectedFailure::Socket);

    let outcome = fx
        .driver
        .execute(PlatformDriverEvent::GetEngData, CommandArgs::new())
        .await
        .unwrap();

    assert_eq!(outcome.next_state, Some(DriverState::Disconnected));
    let events = fx.drain_events();
    assert!(!events.iter().any(|e| matches!(e, DriverAsyncEvent::Sample(_))));
    assert!(!events
        .iter()
        .any(|e| matches!(e, DriverAsyncEvent::PollCompleted { .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        DriverAsyncEvent::ConnectionLost { event: PlatformDriverEvent::GetEngData, .. }
    )));
}

#[tokio::test]
async fn test_reset_watermarks_restarts_from_floor() {
    let mut fx = connected().await;
    fx.oms.push_attribute_value("TEMP", json!(100), NOW - 60.0);
    poll(&mut fx).await;
    assert_eq!(fx.drain_samples().len(), 1);

    fx.driver.reset_watermarks();
    assert_eq!(fx.driver.watermark(ENG), None);

    poll(&mut fx).await;
    assert_eq!(fx.drain_samples().len(), 1);
}

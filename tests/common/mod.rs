//! Shared fixtures for driver integration tests.
#![allow(dead_code)]

use rsn_platform_driver::config::DriverSettings;
use rsn_platform_driver::error_recovery::RetryPolicy;
use rsn_platform_driver::node_config::OmsPortControlId;
use rsn_platform_driver::oms::{SimulatedOms, SimulatedOmsFactory};
use rsn_platform_driver::platform::{DriverAsyncEvent, PlatformDriver};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::sync::mpsc::UnboundedReceiver;

pub const PLATFORM_ID: &str = "LJ01A";

/// Fixed NTP "now" used by the driver clock and the simulator.
pub const NOW: f64 = 3_900_000_000.0;

pub const NODE_YAML: &str = r#"
node_meta_data:
  reference_designator: RS01SLBS-LJ01A
  oms_sample_rate: 60
  nms_source: 1
port_info:
  J01: { port_oms_port_cntl_id: 1 }
  J05: { port_oms_port_cntl_id: 12 }
node_streams:
  lj01a_eng:
    "00":
      TEMP: { scale_factor: 0.1, ion_parameter_name: sec_node_temperature }
      VOLT: { scale_factor: 0.001, ion_parameter_name: input_voltage }
  lj01a_port_eng:
    J01:
      PORT01_CURRENT: { scale_factor: 0.001, ion_parameter_name: port_current }
    J05: {}
"#;

pub struct Fixture {
    pub driver: PlatformDriver,
    pub events: UnboundedReceiver<DriverAsyncEvent>,
    pub oms: Arc<SimulatedOms>,
    pub factory: Arc<SimulatedOmsFactory>,
    pub node_file: NamedTempFile,
}

impl Fixture {
    /// Settings pointing at this fixture's node file.
    pub fn settings(&self) -> DriverSettings {
        settings_for(&self.node_file)
    }

    /// Drain every async event emitted so far.
    pub fn drain_events(&mut self) -> Vec<DriverAsyncEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    /// Samples among the events emitted so far.
    pub fn drain_samples(&mut self) -> Vec<rsn_platform_driver::platform::EmittedSample> {
        self.drain_events()
            .into_iter()
            .filter_map(|event| match event {
                DriverAsyncEvent::Sample(sample) => Some(sample),
                _ => None,
            })
            .collect()
    }
}

pub fn write_node_file(yaml: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();
    file
}

pub fn settings_for(node_file: &NamedTempFile) -> DriverSettings {
    DriverSettings {
        node_id: PLATFORM_ID.to_string(),
        oms_uri: "sim://test".to_string(),
        node_cfg_file: node_file.path().to_path_buf(),
        listener_url: None,
        reconnect: RetryPolicy {
            max_attempts: 2,
            backoff_delay: Duration::from_millis(10),
        },
    }
}

pub fn simulator() -> SimulatedOms {
    let oms = SimulatedOms::new()
        .with_platform(PLATFORM_ID)
        .with_port(OmsPortControlId(1))
        .with_port(OmsPortControlId(12))
        .with_mission("mission_01");
    oms.set_now(Some(NOW));
    oms
}

/// Unconfigured driver over `oms` with the clock pinned at [`NOW`].
pub fn fixture_with(oms: SimulatedOms, yaml: &str) -> Fixture {
    let oms = Arc::new(oms);
    let factory = Arc::new(SimulatedOmsFactory::new(oms.clone()));
    let (driver, events) = PlatformDriver::new(factory.clone());
    Fixture {
        driver: driver.with_clock(|| NOW),
        events,
        oms,
        factory,
        node_file: write_node_file(yaml),
    }
}

/// Configured and connected driver over the default node.
pub async fn connected() -> Fixture {
    let mut fx = fixture_with(simulator(), NODE_YAML);
    let settings = fx.settings();
    fx.driver.configure(settings).unwrap();
    fx.driver.connect().await.unwrap();
    fx.drain_events();
    fx.oms.clear_call_log();
    fx
}

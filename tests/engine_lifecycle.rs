//! Integration tests for engine boot, acquisition and shutdown.

use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::{Duration, Instant};

use mca_daq::config::EngineConfig;
use mca_daq::engine::Engine;
use mca_daq::hardware::{MockSource, SourceRegistry};
use mca_daq::histogram::{Histogram, HistogramSink};
use mca_daq::source::Source;
use mca_daq::status::{Capability, StatusFlags};
use mca_daq::DaqError;

const HITS_PER_SPILL: usize = 8;

/// Engine with short poll intervals so tests do not wait on 1 s slices.
fn test_engine() -> Engine {
    Engine::with_timing(Duration::from_millis(10), Duration::from_millis(20))
}

fn streaming_mock(name: &str) -> MockSource {
    MockSource::new(name)
        .with_hits_per_spill(HITS_PER_SPILL)
        .with_interval(Duration::from_millis(1))
}

/// Poll `condition` until it holds or `timeout` passes.
fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn test_one_failing_device_does_not_stop_the_others() {
    let engine = test_engine();
    engine.add_device("A", Box::new(MockSource::new("A"))).unwrap();
    engine
        .add_device("B", Box::new(MockSource::new("B").failing_boot()))
        .unwrap();

    assert!(!engine.boot());

    // A was attempted and is booted on its own
    assert_eq!(engine.device_status("A"), Some(StatusFlags::booted()));
    assert_eq!(engine.device_status("B"), Some(StatusFlags::loaded()));

    // aggregate structural bits need every loaded device
    let status = engine.status();
    assert!(status.is_loaded());
    assert!(!status.is_booted());
    assert!(!status.can(Capability::Run));

    // nothing can run while B is down
    assert!(!engine.daq_start(Histogram::shared(12)));
}

#[test]
fn test_boot_is_retryable() {
    let engine = test_engine();
    engine.add_device("A", Box::new(MockSource::new("A"))).unwrap();
    assert!(engine.boot());
    assert!(engine.boot());
    assert!(engine.status().is_ready());

    assert!(engine.die());
    assert!(engine.status().is_dead());
    assert!(engine.boot());
    assert!(engine.status().is_ready());
}

#[test]
fn test_fifty_spills_are_counted_exactly() {
    let engine = test_engine();
    engine
        .add_device("A", Box::new(streaming_mock("A").with_spill_count(50)))
        .unwrap();
    assert!(engine.boot());

    let histogram = Histogram::shared(12);
    assert!(engine.daq_start(histogram.clone()));

    // producer exits on its own once all 50 are queued
    assert!(wait_until(Duration::from_secs(5), || !engine.device_running("A")));
    assert!(engine.daq_stop());

    let report = engine.last_report().unwrap();
    assert_eq!(report.data_spills, 50);
    assert_eq!(report.hits, (50 * HITS_PER_SPILL) as u64);

    let snapshot = histogram.snapshot();
    assert_eq!(snapshot.spills, 50);
    assert_eq!(snapshot.total_hits, (50 * HITS_PER_SPILL) as u64);
    assert_eq!(snapshot.runs.len(), 1);
    assert_eq!(snapshot.runs[0].total_events, (50 * HITS_PER_SPILL) as u64);
}

#[test]
fn test_stop_mid_stream_loses_nothing() {
    let engine = test_engine();
    engine.add_device("A", Box::new(streaming_mock("A"))).unwrap();
    engine.add_device("B", Box::new(streaming_mock("B"))).unwrap();
    assert!(engine.boot());

    let histogram = Histogram::shared(12);
    assert!(engine.daq_start(histogram.clone()));
    thread::sleep(Duration::from_millis(60));
    assert!(engine.daq_stop());
    assert!(!engine.daq_running());
    assert!(!engine.device_running("A"));
    assert!(!engine.device_running("B"));

    let report = engine.last_report().unwrap();
    assert!(report.data_spills > 0);
    assert_eq!(report.run_markers, 4);
    assert_eq!(report.hits, report.data_spills * HITS_PER_SPILL as u64);
    assert_eq!(histogram.total_hits(), report.hits);

    // every spill a device counted reached the sink
    let tree = engine.pull_settings();
    let produced: f64 = ["A", "B"]
        .iter()
        .map(|d| {
            tree.find(&format!("{d}/SpillsProduced"))
                .and_then(|n| n.value.as_f64())
                .unwrap()
        })
        .sum();
    assert_eq!(produced as u64, report.data_spills);
}

#[test]
fn test_restart_after_stop() {
    let engine = test_engine();
    engine.add_device("A", Box::new(streaming_mock("A"))).unwrap();
    assert!(engine.boot());

    for _ in 0..3 {
        let histogram = Histogram::shared(12);
        assert!(engine.daq_start(histogram.clone()));
        thread::sleep(Duration::from_millis(20));
        assert!(engine.daq_stop());
        assert_eq!(histogram.total_hits(), engine.last_report().unwrap().hits);
    }
    assert!(!engine.daq_stop());
}

#[test]
fn test_producer_panic_marks_device_not_running() {
    let engine = test_engine();
    engine
        .add_device("A", Box::new(streaming_mock("A").panicking_after(5)))
        .unwrap();
    assert!(engine.boot());

    let histogram = Histogram::shared(12);
    assert!(engine.daq_start(histogram.clone()));

    assert!(wait_until(Duration::from_secs(5), || {
        engine
            .device_status("A")
            .is_some_and(|s| !s.can(Capability::Run))
    }));
    // the worker is still alive and has drained what was queued before the fault
    assert!(engine.daq_running());
    assert!(wait_until(Duration::from_secs(1), || {
        histogram.total_hits() == (5 * HITS_PER_SPILL) as u64
    }));

    assert!(engine.daq_stop());
    assert!(!engine.status().can(Capability::Run));
    assert!(!engine.daq_start(Histogram::shared(12)));

    // die + boot clears the fault
    engine.die();
    assert!(engine.boot());
    assert!(engine.status().is_ready());
}

#[test]
fn test_oscilloscope_is_a_capability() {
    let engine = test_engine();
    engine.add_device("plain", Box::new(MockSource::new("plain"))).unwrap();
    engine
        .add_device("scope", Box::new(MockSource::new("scope").with_oscilloscope()))
        .unwrap();
    assert!(engine.oscilloscope().is_empty());

    assert!(engine.boot());
    assert!(engine.status().can(Capability::Oscilloscope));

    let traces = engine.oscilloscope();
    assert_eq!(traces.len(), 2);
    assert!(traces.iter().all(|hit| !hit.trace.is_empty()));

    let mut plain = MockSource::new("plain");
    plain.boot();
    assert!(matches!(plain.oscilloscope(), Err(DaqError::Unsupported(_))));
}

#[test]
fn test_run_mca_stops_on_cancel() {
    let engine = test_engine();
    engine.add_device("A", Box::new(streaming_mock("A"))).unwrap();
    assert!(engine.boot());

    let cancel = AtomicBool::new(true);
    let histogram = Histogram::shared(12);
    let start = Instant::now();
    assert!(engine.run_mca(Duration::from_secs(30), histogram.clone(), &cancel));
    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(!engine.daq_running());
}

#[test]
fn test_run_mca_for_duration() {
    let engine = test_engine();
    engine.add_device("A", Box::new(streaming_mock("A"))).unwrap();
    assert!(engine.boot());

    let histogram = Histogram::shared(12);
    let start = Instant::now();
    assert!(engine.run_mca(
        Duration::from_millis(80),
        histogram.clone(),
        &AtomicBool::new(false)
    ));
    assert!(start.elapsed() >= Duration::from_millis(80));
    assert!(histogram.total_hits() > 0);
}

#[test]
fn test_run_list_returns_every_hit() {
    let engine = test_engine();
    engine
        .add_device("A", Box::new(streaming_mock("A").with_spill_count(10)))
        .unwrap();
    assert!(matches!(
        engine.run_list(Duration::from_millis(10), &AtomicBool::new(false)),
        Err(DaqError::NotBooted(name)) if name == "A"
    ));

    assert!(engine.boot());
    let list = engine
        .run_list(Duration::from_millis(200), &AtomicBool::new(false))
        .unwrap();
    assert_eq!(list.hits.len(), 10 * HITS_PER_SPILL);
    assert_eq!(list.run.total_events, (10 * HITS_PER_SPILL) as u64);
    assert!(list.run.stopped.is_some());
    assert!(!engine.device_running("A"));
}

#[test]
fn test_engine_from_config() {
    let config: EngineConfig = toml::from_str(
        r#"
        [application]
        name = "Test"
        log_level = "debug"

        [acquisition]
        poll_interval_ms = 10
        worker_timeout_ms = 20

        [[devices]]
        id = "sim0"
        type = "simulator"
        config = { count_rate = 20000.0, spill_interval_ms = 5 }

        [[devices]]
        id = "mock0"
        type = "mock"
        config = { hits_per_spill = 4, interval_ms = 1 }

        [[devices]]
        id = "off"
        type = "mock"
        enabled = false
        "#,
    )
    .unwrap();

    let engine = Engine::from_config(&config, &SourceRegistry::with_builtins()).unwrap();
    assert_eq!(engine.device_names(), vec!["sim0", "mock0"]);
    assert!(engine.boot());
    // simulator offers previews, so the engine does
    assert!(engine.status().can(Capability::Oscilloscope));

    let histogram = Histogram::shared(12);
    assert!(engine.run_mca(
        Duration::from_millis(50),
        histogram.clone(),
        &AtomicBool::new(false)
    ));
    assert!(histogram.total_hits() > 0);
}

#[test]
fn test_engine_from_config_rejects_unknown_plugin() {
    let config: EngineConfig = toml::from_str(
        r#"
        [[devices]]
        id = "crate0"
        type = "vme"
        "#,
    )
    .unwrap();

    let err = Engine::from_config(&config, &SourceRegistry::with_builtins())
        .err()
        .unwrap();
    assert!(matches!(err, DaqError::UnknownPlugin(name) if name == "vme"));
}

#[test]
fn test_unbounded_duration_runs_until_cancelled() {
    let engine = test_engine();
    engine.add_device("A", Box::new(streaming_mock("A"))).unwrap();
    assert!(engine.boot());

    let cancel = AtomicBool::new(true);
    let start = Instant::now();
    assert!(engine.run_mca(Duration::MAX, Histogram::shared(12), &cancel));
    assert!(!engine.daq_running());

    let list = engine.run_list(Duration::MAX, &cancel).unwrap();
    assert!(list.run.stopped.is_some());
    assert!(!engine.device_running("A"));
    assert!(start.elapsed() < Duration::from_secs(5));

    // the engine is still usable afterwards
    assert!(engine.run_mca(
        Duration::from_millis(20),
        Histogram::shared(12),
        &AtomicBool::new(false)
    ));
}

#[test]
fn test_engine_stays_dead_after_die() {
    let engine = test_engine();
    engine.add_device("A", Box::new(MockSource::new("A"))).unwrap();
    engine.add_device("B", Box::new(MockSource::new("B"))).unwrap();
    assert!(engine.boot());

    assert!(engine.die());
    assert_eq!(engine.device_status("A"), Some(StatusFlags::DEAD));
    assert_eq!(engine.device_status("B"), Some(StatusFlags::DEAD));

    // operations that recompute the aggregate do not resurrect it
    engine.write_settings_bulk().unwrap();
    engine.pull_settings();
    assert!(engine.refresh_status().is_dead());
    assert!(engine.status().is_dead());
    assert!(!engine.daq_start(Histogram::shared(12)));

    // a dead instance can be booted again
    assert!(engine.boot());
    assert!(engine.status().is_ready());
}

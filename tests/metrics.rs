#![cfg(feature = "metrics")]
//! Tests for `wirebroker` metrics helpers.
//!
//! These tests verify that counters and gauges update as expected using
//! `metrics_util::debugging::DebuggingRecorder`.
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use rstest::rstest;
use wirebroker::metrics::{self as broker_metrics, Direction, ErrorKind};

fn debugging_recorder_setup() -> (Snapshotter, DebuggingRecorder) {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    (snapshotter, recorder)
}

fn counter_with_label(snapshotter: &Snapshotter, name: &str, label: (&str, &str)) -> u64 {
    snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .filter(|(k, _, _, _)| {
            k.key().name() == name
                && k.key()
                    .labels()
                    .any(|l| l.key() == label.0 && l.value() == label.1)
        })
        .map(|(_, _, _, v)| match v {
            DebugValue::Counter(c) => c,
            _ => 0,
        })
        .sum()
}

#[rstest]
#[case(Direction::Inbound, "inbound")]
#[case(Direction::Outbound, "outbound")]
fn frame_metric_carries_direction(#[case] direction: Direction, #[case] label: &str) {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || broker_metrics::inc_frames(direction));
    assert_eq!(
        counter_with_label(&snapshotter, broker_metrics::FRAMES_PROCESSED, ("direction", label)),
        1
    );
}

#[rstest]
#[case(ErrorKind::Protocol, "protocol")]
#[case(ErrorKind::Connection, "connection")]
#[case(ErrorKind::Channel, "channel")]
fn error_metric_carries_kind(#[case] kind: ErrorKind, #[case] label: &str) {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || {
        broker_metrics::inc_errors(kind);
        broker_metrics::inc_errors(kind);
    });
    assert_eq!(
        counter_with_label(&snapshotter, broker_metrics::ERRORS_TOTAL, ("kind", label)),
        2
    );
}

#[test]
fn routing_outcomes_are_counted_separately() {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || {
        broker_metrics::inc_routed();
        broker_metrics::inc_routed();
        broker_metrics::inc_unroutable();
    });

    let metrics = snapshotter.snapshot().into_vec();
    let value = |name: &str| {
        metrics
            .iter()
            .find(|(k, _, _, _)| k.key().name() == name)
            .map(|(_, _, _, v)| v.clone())
    };
    assert_eq!(
        value(broker_metrics::MESSAGES_ROUTED),
        Some(&DebugValue::Counter(2))
    );
    assert_eq!(
        value(broker_metrics::MESSAGES_UNROUTABLE),
        Some(&DebugValue::Counter(1))
    );
}

#[test]
fn connection_gauge_tracks_open_connections() {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || {
        broker_metrics::inc_connections();
        broker_metrics::inc_connections();
        broker_metrics::dec_connections();
    });

    let metrics = snapshotter.snapshot().into_vec();
    let gauge = metrics
        .iter()
        .find(|(k, _, _, _)| k.key().name() == broker_metrics::CONNECTIONS_ACTIVE)
        .map(|(_, _, _, v)| v.clone());
    assert!(matches!(gauge, Some(DebugValue::Gauge(g)) if g.into_inner() == 1.0));
}

#[test]
fn write_latency_is_recorded() {
    let (snapshotter, recorder) = debugging_recorder_setup();
    metrics::with_local_recorder(&recorder, || {
        broker_metrics::record_write(std::time::Duration::from_millis(3));
    });
    let metrics = snapshotter.snapshot().into_vec();
    assert!(metrics.iter().any(|(k, _, _, v)| {
        k.key().name() == broker_metrics::OUTBOUND_WRITE_SECONDS
            && matches!(v, DebugValue::Histogram(h) if h.len() == 1)
    }));
}

#[test]
fn connection_gauge_guard_releases_on_drop() {
    let (snapshotter, recorder) = debugging_recorder_setup();
    let gauge_value = || {
        snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .find(|(k, _, _, _)| k.key().name() == broker_metrics::CONNECTIONS_ACTIVE)
            .map(|(_, _, _, v)| v)
    };
    metrics::with_local_recorder(&recorder, || {
        let first = broker_metrics::ConnectionGauge::acquire();
        let second = broker_metrics::ConnectionGauge::acquire();
        drop(first);
        assert!(matches!(gauge_value(), Some(DebugValue::Gauge(g)) if g.into_inner() == 1.0));
        drop(second);
    });
    assert!(matches!(gauge_value(), Some(DebugValue::Gauge(g)) if g.into_inner() == 0.0));
}

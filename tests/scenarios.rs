//! End-to-end behaviour across the poller, metric and outcome layers, driven
//! by virtual time and a scripted executor.

use std::sync::Arc;
use std::time::Duration;

use lisorch::clock::{Clock, ManualClock};
use lisorch::host::{Host, Role};
use lisorch::marker::{MarkerStore, StateMarker};
use lisorch::metrics::{
    parse_log, reduce, FieldPattern, MetricSet, Reduction, TestConfiguration,
};
use lisorch::outcome::{aggregate, FinalVerdict, SubTestVerdict};
use lisorch::poller::{PollConfig, PollResult, ReadinessPoller, WaitSpec};
use lisorch::remote::fake::ScriptedExecutor;

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

fn hosts() -> (Host, Host) {
    (
        Host::new("sender", "10.0.0.4", Role::Sender),
        Host::new("receiver", "10.0.0.5", Role::Receiver),
    )
}

#[tokio::test]
async fn sender_becomes_ready_at_first_poll_after_transition() {
    let clock = ManualClock::new();
    let exec = Arc::new(ScriptedExecutor::with_clock(clock.clone()));
    exec.file_timeline(
        "sender",
        "state.txt",
        vec![(secs(0), "TestRunning\n"), (secs(10), "NetperfRunning\n")],
    );
    exec.file_timeline("receiver", "state.txt", vec![(secs(0), "TestRunning\n")]);

    let (sender, _receiver) = hosts();
    let store = MarkerStore::new(exec.clone(), "state.txt");
    let result = ReadinessPoller::new(&store, &clock)
        .wait_for_state(
            &sender,
            &WaitSpec::accept(vec![StateMarker::NetperfRunning]),
            &PollConfig::new(secs(5), secs(60)),
        )
        .await;

    assert_eq!(
        result,
        PollResult::Ready {
            marker: StateMarker::NetperfRunning,
            elapsed: secs(10),
            polls: 3,
        }
    );
    assert!(exec.calls_for("receiver").is_empty());
}

#[tokio::test]
async fn receiver_failure_ends_wait_long_before_timeout() {
    let clock = ManualClock::new();
    let exec = Arc::new(ScriptedExecutor::with_clock(clock.clone()));
    exec.file_timeline(
        "receiver",
        "state.txt",
        vec![(secs(0), "TestRunning\n"), (secs(3), "TestFailed\n")],
    );

    let (_sender, receiver) = hosts();
    let store = MarkerStore::new(exec.clone(), "state.txt");
    let spec = WaitSpec::accept(vec![StateMarker::TestCompleted])
        .with_fail(vec![StateMarker::TestFailed]);
    let result = ReadinessPoller::new(&store, &clock)
        .wait_for_state(&receiver, &spec, &PollConfig::new(secs(5), secs(600)))
        .await;

    match result {
        PollResult::RemoteFailed { marker, elapsed, .. } => {
            assert_eq!(marker, StateMarker::TestFailed);
            assert_eq!(elapsed, secs(5));
        }
        other => panic!("expected RemoteFailed, got {:?}", other),
    }
    assert!(clock.now() < secs(600));
}

#[tokio::test]
async fn silent_host_times_out_within_one_extra_poll() {
    let clock = ManualClock::new();
    let exec = Arc::new(ScriptedExecutor::with_clock(clock.clone()));
    let (sender, _) = hosts();
    let store = MarkerStore::new(exec.clone(), "state.txt");

    let result = ReadinessPoller::new(&store, &clock)
        .wait_for_state(
            &sender,
            &WaitSpec::accept(vec![StateMarker::NetperfRunning]),
            &PollConfig::new(secs(5), secs(600)),
        )
        .await;

    assert!(matches!(result, PollResult::TimedOut { last_seen: None, .. }));
    assert_eq!(result.elapsed(), secs(600));
    // one read at t=0 plus one per interval up to and including the deadline
    assert_eq!(result.polls(), 121);
    assert_eq!(exec.calls_for("sender").len(), 121);
}

#[test]
fn skipped_subtest_does_not_mask_passes() {
    let results = vec![
        SubTestVerdict::passed("netperf[connections=1]"),
        SubTestVerdict::skipped("netperf[connections=64]", "SR-IOV not available"),
        SubTestVerdict::passed("netperf[connections=128]"),
    ];
    assert_eq!(aggregate(&results), FinalVerdict::Completed);

    let mut with_failure = results.clone();
    with_failure.push(SubTestVerdict::failed("netperf[connections=256]", "below floor"));
    assert_eq!(aggregate(&with_failure), FinalVerdict::Failed);
}

#[test]
fn log_reduces_to_mean_and_max() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("testpmd.log");
    std::fs::write(&path, "Tx-pps: 100\nTx-pps: 200\nTx-pps: 300\n").unwrap();

    let pattern = FieldPattern::new("tx_pps", r"Tx-pps:\s+([0-9]+)").unwrap();
    let samples = parse_log(
        &Role::Forwarder,
        &TestConfiguration::default(),
        &path,
        &[pattern],
    )
    .unwrap();
    let mut set = MetricSet::new();
    set.extend(samples);
    let tx = set.select("tx_pps", None, None);

    let mean = reduce(&tx, Reduction::Mean);
    assert_eq!(mean.value, 200.0);
    assert_eq!(mean.count, 3);
    assert_eq!(reduce(&tx, Reduction::Max).value, 300.0);

    let preset = parse_log(
        &Role::Forwarder,
        &TestConfiguration::default(),
        &path,
        &[FieldPattern::preset("tx_pps").unwrap()],
    )
    .unwrap();
    assert_eq!(reduce(&preset, Reduction::Mean).value, 200.0);
    assert_eq!(reduce(&preset, Reduction::Max).value, 300.0);

    let none = reduce(&set.select("rx_pps", None, None), Reduction::Mean);
    assert!(none.no_samples);
    assert_eq!(none.value, 0.0);
}

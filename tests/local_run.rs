//! A full run on the local box: real shells, real processes, real signals.
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use lisorch::clock::TokioClock;
use lisorch::orchestrator::{Orchestrator, Plan};
use lisorch::poller::PollConfig;
use lisorch::remote::local::LocalExecutor;
use lisorch::remote::terminate::TerminationOutcome;
use lisorch::state::RunStatus;

// comm names are capped at 15 bytes; keep the peer's name under that
const PEER: &str = "lisorch_peer";

const PLAN: &str = r#"
name = "local-loop"
workload_secs = 1
settle_secs = 0
grace_secs = 1

[[hosts]]
name = "receiver"
address = "127.0.0.1"
role = "receiver"

[[hosts]]
name = "sender"
address = "127.0.0.1"
role = "sender"

[[setup]]
host = "receiver"
command = "test -x ./lisorch_peer"

[[workloads]]
host = "receiver"
command = "./lisorch_peer"
process = "lisorch_peer"
ready_marker = "PeerRunning"

[[workloads]]
host = "sender"
command = "for n in 100 200 300; do echo \"Tx-pps: $n\"; done > tx.log"
process = "lisorch_sender"
log = "tx.log"
mode = "blocking"
order = 1

[[fields]]
name = "tx"
pattern = 'Tx-pps:\s+([0-9]+)'

[[criteria]]
role = "sender"
field = "tx"
min = 150.0
"#;

fn install_peer(dir: &std::path::Path) {
    let script = dir.join(PEER);
    std::fs::write(
        &script,
        "#!/bin/sh\nprintf '%s\\n' PeerRunning > state.txt\nwhile :; do sleep 1; done\n",
    )
    .unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
}

#[tokio::test]
async fn test_local_run_completes_and_stops_peer() {
    let dir = tempfile::TempDir::new().unwrap();
    install_peer(dir.path());

    let plan: Plan = toml::from_str(PLAN).unwrap();
    let orchestrator = Orchestrator::new(
        Arc::new(LocalExecutor::in_dir(dir.path())),
        Arc::new(TokioClock::new()),
    )
    .with_poll(PollConfig::new(
        Duration::from_millis(100),
        Duration::from_secs(10),
    ));
    let run_marker = dir.path().join("run").join("state.txt");
    let sink = orchestrator.marker_sink(&plan, &run_marker);

    let report = orchestrator.run(&plan, sink).await;

    assert_eq!(report.status(), RunStatus::Completed, "{:?}", report.state.reason);
    assert_eq!(std::fs::read_to_string(&run_marker).unwrap(), "TestCompleted\n");

    let cfg = &report.configurations[0];
    assert_eq!(cfg.samples, 3);
    assert_eq!(cfg.criteria[0].value, 200.0);

    let stop = &cfg.terminations[0];
    assert_eq!(stop.process, PEER);
    assert_eq!(stop.outcome, Some(TerminationOutcome::Terminated));
}

#[tokio::test]
async fn test_local_run_failing_setup_aborts() {
    let dir = tempfile::TempDir::new().unwrap();
    // no peer script installed, so the setup check exits 1

    let plan: Plan = toml::from_str(PLAN).unwrap();
    let orchestrator = Orchestrator::new(
        Arc::new(LocalExecutor::in_dir(dir.path())),
        Arc::new(TokioClock::new()),
    );
    let run_marker = dir.path().join("state-run.txt");
    let sink = orchestrator.marker_sink(&plan, &run_marker);

    let report = orchestrator.run(&plan, sink).await;

    assert_eq!(report.status(), RunStatus::Aborted);
    assert_eq!(std::fs::read_to_string(&run_marker).unwrap(), "TestAborted\n");
    assert!(report.configurations.is_empty());
}

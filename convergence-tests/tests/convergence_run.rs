//! Full verification runs against in-process fake replicas.

mod common;

#[cfg(test)]
mod tests {
    use core::future::pending;
    use core::time::Duration;
    use std::sync::Arc;

    use camino::{Utf8Path, Utf8PathBuf};
    use convergence_tests::client::ReplicaClient;
    use convergence_tests::config::{Config, Properties, SnapshotPolicy, Workload};
    use convergence_tests::driver::{Driver, RunLayout};
    use convergence_tests::operation::{Operation, OperationBatch};
    use convergence_tests::output::{OutputFormat, OutputWriter};
    use convergence_tests::probe::Readiness;
    use convergence_tests::report::{Report, RunStatus};
    use convergence_tests::settle::SettleStrategy;
    use convergence_tests::verifier::{Property, Verdict};
    use tempfile::{tempdir, TempDir};
    use tokio::net::TcpListener;
    use tokio::time::sleep;

    use crate::common::{Behavior, InProcessLauncher};

    const RUN_ID: &str = "test-run";

    struct Workspace {
        _dir: TempDir,
        root: Utf8PathBuf,
    }

    impl Workspace {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let root = Utf8Path::from_path(dir.path()).unwrap().to_owned();
            Self { _dir: dir, root }
        }

        fn output_dir(&self) -> Utf8PathBuf {
            self.root.join("out")
        }

        fn data_root(&self) -> Utf8PathBuf {
            self.root.join("data")
        }

        fn data_dir(&self, scope: &str) -> Utf8PathBuf {
            self.data_root()
                .join(format!("convergence-{RUN_ID}-{scope}"))
        }
    }

    fn fast_config() -> Config {
        let mut config = Config::two_replica("in-process".into());
        config.settle = SettleStrategy::Fixed { delay_ms: 10 };
        config.timeouts.readiness_ms = 2_000;
        config.timeouts.poll_interval_ms = 20;
        config.timeouts.probe_attempt_ms = 200;
        config.timeouts.request_ms = 2_000;
        config.timeouts.shutdown_grace_ms = 500;
        config
    }

    fn driver(workspace: &Workspace, config: Config, launcher: InProcessLauncher) -> Driver {
        let layout = RunLayout::new(
            RUN_ID.to_owned(),
            workspace.output_dir(),
            workspace.data_root(),
        );
        let client = ReplicaClient::new(config.timeouts.request()).unwrap();

        Driver::new(
            config,
            layout,
            Arc::new(launcher),
            client,
            OutputWriter::new(OutputFormat::PlainText),
        )
    }

    async fn run(workspace: &Workspace, config: Config, launcher: InProcessLauncher) -> Report {
        driver(workspace, config, launcher).run(pending()).await
    }

    fn hash_of<'a>(report: &'a Report, node: &str, checkpoint: &str) -> &'a str {
        &report
            .run()
            .fingerprints
            .get(node, checkpoint, 0)
            .unwrap_or_else(|| panic!("no fingerprint for {node}@{checkpoint}"))
            .hash
    }

    #[tokio::test]
    async fn correct_replicas_pass_every_property() {
        let workspace = Workspace::new();
        let mut config = fast_config();
        config.properties = Properties::only(&Property::ALL);

        let report = run(&workspace, config, InProcessLauncher::new()).await;

        assert_eq!(report.status(), RunStatus::Pass, "error: {:?}", report.error());
        assert_eq!(report.status().exit_code(), 0, "pass exits with 0");
        for property in Property::ALL {
            assert!(
                matches!(report.verdict(property), Some(Verdict::Pass)),
                "{property}: {:?}",
                report.verdict(property)
            );
        }

        assert_ne!(
            hash_of(&report, "node1", "pre-sync"),
            hash_of(&report, "node2", "pre-sync"),
            "only node1 received operations"
        );
        assert_eq!(
            hash_of(&report, "node1", "post-sync"),
            hash_of(&report, "node2", "post-sync"),
            "forward sync converges"
        );
        assert_eq!(
            hash_of(&report, "node1", "post-reverse-sync"),
            hash_of(&report, "node2", "post-reverse-sync"),
            "reverse sync converges"
        );
        assert_ne!(
            hash_of(&report, "node1", "post-sync"),
            hash_of(&report, "node1", "post-reverse-sync"),
            "node2's follow-up write reached node1"
        );

        let run = report.run();
        assert_eq!(run.orderings.len(), 2, "identity and reversed ordering");
        assert_eq!(run.releases.len(), 3, "main scope plus one per ordering");
        assert!(run.warnings.is_empty(), "warnings: {:?}", run.warnings);
        assert!(run.snapshots.is_empty(), "no snapshots on success");

        let main_settles: Vec<&str> = run
            .settles
            .iter()
            .filter(|settle| settle.scope == "main")
            .map(|settle| settle.after.as_str())
            .collect();
        assert_eq!(
            main_settles,
            ["submit", "forward-sync", "reverse-submit", "reverse-sync", "repeat-sync"],
            "every submit and sync is followed by a settle"
        );

        for scope in ["main", "ordering-0", "ordering-1"] {
            assert!(
                !workspace.data_dir(scope).exists(),
                "data directory of {scope} is removed"
            );
        }

        let log = std::fs::read_to_string(workspace.output_dir().join("logs/test-run/node1.log"))
            .unwrap();
        assert!(log.contains("node1 listening on"), "replica log is kept: {log}");
        assert!(
            workspace
                .output_dir()
                .join("logs/test-run/ordering-1/node2.log")
                .exists(),
            "each ordering logs separately"
        );
    }

    #[tokio::test]
    async fn ignored_sync_fails_convergence_with_evidence() {
        let workspace = Workspace::new();
        let launcher = InProcessLauncher::new()
            .with_behavior("node1", Behavior::IgnoresSync)
            .with_behavior("node2", Behavior::IgnoresSync);

        let report = run(&workspace, fast_config(), launcher).await;

        assert_eq!(report.status(), RunStatus::Fail, "error: {:?}", report.error());
        assert_eq!(report.status().exit_code(), 1, "findings exit with 1");
        assert!(report.error().is_none(), "a finding is not an error");

        let Some(Verdict::Fail(evidence)) = report.verdict(Property::Convergence) else {
            panic!("expected a convergence failure: {:?}", report.verdict(Property::Convergence));
        };
        assert!(
            evidence
                .mismatches
                .iter()
                .any(|mismatch| mismatch.left.checkpoint == "post-sync"
                    && mismatch.left.node_id == "node1"
                    && mismatch.right.node_id == "node2"),
            "evidence names the disagreeing pair: {:?}",
            evidence.mismatches
        );
        assert!(
            matches!(report.verdict(Property::Idempotence), Some(Verdict::Pass)),
            "a no-op sync is still idempotent"
        );

        let snapshots = &report.run().snapshots;
        assert_eq!(snapshots.len(), 2, "one snapshot per replica on failure");
        assert!(
            snapshots.iter().all(|snapshot| snapshot.path.exists()),
            "snapshot files are written"
        );
        assert_eq!(
            snapshots[0].path,
            workspace
                .output_dir()
                .join("snapshots/test-run/node1-main-repeat-sync.json"),
            "named after replica, scope and last checkpoint"
        );
        assert!(!workspace.data_dir("main").exists(), "teardown still ran");
    }

    #[tokio::test]
    async fn repeated_sync_that_changes_state_fails_idempotence() {
        let workspace = Workspace::new();
        let launcher = InProcessLauncher::new().with_behavior("node1", Behavior::CountsSyncs);

        let report = run(&workspace, fast_config(), launcher).await;

        assert_eq!(report.status(), RunStatus::Fail, "error: {:?}", report.error());
        assert!(
            matches!(report.verdict(Property::Convergence), Some(Verdict::Pass)),
            "replicas still agree with each other: {:?}",
            report.verdict(Property::Convergence)
        );

        let Some(Verdict::Fail(evidence)) = report.verdict(Property::Idempotence) else {
            panic!("expected an idempotence failure: {:?}", report.verdict(Property::Idempotence));
        };
        assert_eq!(evidence.mismatches.len(), 2, "both ends changed");
        assert!(
            evidence
                .mismatches
                .iter()
                .all(|mismatch| mismatch.left.sequence == 0 && mismatch.right.sequence == 1),
            "before and after the repeat: {:?}",
            evidence.mismatches
        );
    }

    #[tokio::test]
    async fn unready_replica_aborts_and_cleans_up() {
        let workspace = Workspace::new();
        let mut config = fast_config();
        config.timeouts.readiness_ms = 300;
        let launcher = InProcessLauncher::new().with_behavior("node2", Behavior::NeverReady);

        let report = run(&workspace, config, launcher).await;

        assert_eq!(report.status(), RunStatus::Error, "setup failure");
        assert_eq!(report.status().exit_code(), 2, "errors exit with 2");
        let error = report.error().unwrap();
        assert!(
            error.contains("node2") && error.contains("did not become ready"),
            "unexpected error: {error}"
        );

        let run = report.run();
        let node2 = run
            .readiness
            .iter()
            .find(|record| record.node_id == "node2")
            .unwrap();
        assert!(
            matches!(node2.readiness, Readiness::TimedOut { .. }),
            "node2 timed out: {:?}",
            node2.readiness
        );
        assert!(
            run.fingerprints.entries().is_empty(),
            "nothing is captured from an unready environment"
        );
        assert!(
            matches!(report.verdict(Property::Convergence), Some(Verdict::Skipped { .. })),
            "unreached properties are skipped"
        );
        assert_eq!(run.releases.len(), 1, "environment released once");
        assert!(!workspace.data_dir("main").exists(), "data directory removed");
    }

    #[tokio::test]
    async fn crashed_replica_is_reported() {
        let workspace = Workspace::new();
        let launcher = InProcessLauncher::new().with_behavior("node1", Behavior::Crashes);

        let report = run(&workspace, fast_config(), launcher).await;

        assert_eq!(report.status(), RunStatus::Error, "setup failure");
        let error = report.error().unwrap();
        assert!(error.contains("exited during startup"), "unexpected error: {error}");
        assert!(!workspace.data_dir("main").exists(), "data directory removed");
    }

    #[tokio::test]
    async fn rejected_batch_aborts_the_run() {
        let workspace = Workspace::new();
        let launcher = InProcessLauncher::new().with_behavior("node1", Behavior::RejectsWrites);

        let report = run(&workspace, fast_config(), launcher).await;

        assert_eq!(report.status(), RunStatus::Error, "setup failure");
        let error = report.error().unwrap();
        assert!(
            error.contains("rejected batch 'initial'") && error.contains("read-only"),
            "unexpected error: {error}"
        );
        assert_eq!(report.run().submissions.len(), 1, "the rejection is recorded");
        assert!(report.run().sync_edges.is_empty(), "no sync after a rejection");
    }

    #[tokio::test]
    async fn busy_port_fails_before_launch() {
        let workspace = Workspace::new();
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut config = fast_config();
        config.network.replicas[0].port = Some(port);

        let report = run(&workspace, config, InProcessLauncher::new()).await;

        assert_eq!(report.status(), RunStatus::Error, "setup failure");
        let error = report.error().unwrap();
        assert!(
            error.contains(&format!("port {port} is already in use")),
            "unexpected error: {error}"
        );
        assert!(report.run().replicas.is_empty(), "no replica was allocated");
        assert!(!workspace.data_dir("main").exists(), "nothing left behind");
    }

    #[tokio::test]
    async fn interrupt_still_releases_replicas() {
        let workspace = Workspace::new();
        let mut config = fast_config();
        config.settle = SettleStrategy::Fixed { delay_ms: 30_000 };

        let report = driver(&workspace, config, InProcessLauncher::new())
            .run(sleep(Duration::from_millis(500)))
            .await;

        assert_eq!(report.status(), RunStatus::Interrupted, "interrupted");
        assert_eq!(report.status().exit_code(), 130, "conventional SIGINT code");

        let run = report.run();
        assert_eq!(run.releases.len(), 1, "released on interrupt");
        assert_eq!(run.releases[0].terminated.len(), 2, "both replicas stopped");
        assert!(run.snapshots.is_empty(), "no snapshots while interrupted");
        assert!(!workspace.data_dir("main").exists(), "data directory removed");
    }

    #[tokio::test]
    async fn accidental_pre_sync_equality_is_a_warning() {
        let workspace = Workspace::new();
        let mut config = fast_config();
        config.scenario.workload = vec![Workload::new(
            "node1",
            OperationBatch::new(
                "add-then-remove",
                vec![
                    Operation::add("user", "Mallory"),
                    Operation::remove("user", "Mallory"),
                ],
            ),
        )];

        let report = run(&workspace, config, InProcessLauncher::new()).await;

        assert_eq!(report.status(), RunStatus::Pass, "error: {:?}", report.error());
        assert_eq!(report.run().warnings.len(), 1, "{:?}", report.run().warnings);
        assert!(
            report.run().warnings[0].contains("before sync"),
            "warning: {}",
            report.run().warnings[0]
        );
    }

    #[tokio::test]
    async fn sample_config_passes_on_three_replicas() {
        let workspace = Workspace::new();
        let path = Utf8Path::new(env!("CARGO_MANIFEST_DIR")).join("config/config.json");

        let mut config = Config::load(&path).await.unwrap();
        config.network.base_port = None;
        config.settle = SettleStrategy::Stable {
            interval_ms: 20,
            timeout_ms: 2_000,
        };
        config.timeouts = fast_config().timeouts;
        config.snapshots = SnapshotPolicy::Always;

        let report = run(&workspace, config, InProcessLauncher::new()).await;

        assert_eq!(report.status(), RunStatus::Pass, "error: {:?}", report.error());
        assert_eq!(
            report.run().fingerprints.at("post-reverse-sync").count(),
            3,
            "every replica captured"
        );
        assert_eq!(
            report.run().snapshots.len(),
            9,
            "three replicas in each of three scopes"
        );

        let files = report
            .store_to_dir(&workspace.output_dir().join(RUN_ID))
            .await
            .unwrap();
        let markdown = std::fs::read_to_string(&files.markdown).unwrap();
        assert!(markdown.contains("| commutativity |"), "verdict table: {markdown}");
    }
}

//! Lifecycle against a fake cloud: teardown happens exactly once on every
//! exit path.

use async_trait::async_trait;
use capsule_core::{CapsuleConfig, CloudResourceSet, Host, HostId, HostState, ResourceKind};
use capsule_os::{CommandSpec, Executor, MockExecutor, MockReply};
use capsule_vm::{
    supervise, CloudProvider, Connector, CreateFailure, HostRequest, LifecycleManager,
    Provisioned, RetryConfig, TaskOutcome, TaskSpec, TestPlan, VmError, Workload,
};
use capsule_core::ProvisioningReport;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const HOME: &str = "/home/agent";

// ============================================================================
// Fakes
// ============================================================================

#[derive(Default)]
struct FakeCloud {
    fail_create: bool,
    fail_delete: bool,
    delete_delay: Option<Duration>,
    known: Vec<&'static str>,
    creates: AtomicUsize,
    deletes: AtomicUsize,
}

impl FakeCloud {
    fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CloudProvider for FakeCloud {
    fn name(&self) -> &str {
        "fake"
    }

    async fn create(&self, request: &HostRequest) -> Result<Provisioned, CreateFailure> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if self.fail_create {
            let mut partial = CloudResourceSet::new(request.id.clone());
            partial.record(ResourceKind::VirtualNetwork);
            partial.record(ResourceKind::PublicIp);
            return Err(CreateFailure {
                partial,
                error: "QuotaExceeded: not enough cores".into(),
            });
        }
        Ok(Provisioned {
            resources: CloudResourceSet::full(request.id.clone()),
            address: "20.1.2.3".into(),
        })
    }

    async fn delete(&self, _resources: &CloudResourceSet) -> anyhow::Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delete_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_delete {
            anyhow::bail!("AuthorizationFailed");
        }
        Ok(())
    }

    async fn discover(&self, host: &HostId) -> anyhow::Result<Option<Provisioned>> {
        Ok(self
            .known
            .iter()
            .any(|k| *k == host.as_str())
            .then(|| Provisioned {
                resources: CloudResourceSet::full(host.clone()),
                address: "20.9.9.9".into(),
            }))
    }
}

struct FixedConnector(Arc<MockExecutor>);

impl Connector for FixedConnector {
    fn connect(&self, _host: &Host) -> Result<Arc<dyn Executor>, VmError> {
        Ok(self.0.clone())
    }
}

#[derive(Default)]
struct CountingWorkload {
    calls: AtomicUsize,
}

#[async_trait]
impl Workload for CountingWorkload {
    async fn invoke(&self, _executor: &dyn Executor, workdir: &str, task: &TaskSpec) -> TaskOutcome {
        assert_eq!(workdir, HOME);
        self.calls.fetch_add(1, Ordering::SeqCst);
        TaskOutcome::Completed(serde_json::json!({ "answer": task.id }))
    }
}

#[derive(Clone, Copy, Default)]
struct Faults {
    unreachable: bool,
    no_apt: bool,
    /// Host stops answering once Xvfb is started.
    lost_at_display: bool,
    unpack_fails: bool,
}

fn script(cmd: &CommandSpec) -> &str {
    cmd.args.get(1).map(String::as_str).unwrap_or("")
}

fn target(faults: Faults) -> Arc<MockExecutor> {
    let gone = AtomicBool::new(false);
    Arc::new(MockExecutor::new(move |cmd| {
        if faults.lost_at_display && (gone.load(Ordering::SeqCst) || script(cmd).contains("Xvfb")) {
            gone.store(true, Ordering::SeqCst);
            return MockReply::Transport("connection reset by peer".into());
        }
        if faults.unpack_fails && script(cmd).contains("tar -xzf") {
            return MockReply::fail(2, "tar: Unexpected EOF in archive");
        }
        reply(cmd, faults)
    }))
}

fn reply(cmd: &CommandSpec, faults: Faults) -> MockReply {
    match cmd.program.as_str() {
        "true" if faults.unreachable => MockReply::Transport("Connection refused".into()),
        "sh" => {
            let s = script(cmd);
            if s.contains("$HOME") {
                MockReply::ok(HOME)
            } else if s.contains("pwd -P") {
                MockReply::ok(format!("{}\n", cmd.args[3]))
            } else if s.contains("command -v \"$1\"") && faults.no_apt && cmd.args[3] == "apt-get" {
                MockReply::fail(1, "")
            } else {
                MockReply::ok("")
            }
        }
        "dpkg-query" => MockReply::ok("git\t1:2.34.1\tinstalled\n"),
        _ => MockReply::ok(""),
    }
}

struct Harness {
    cloud: Arc<FakeCloud>,
    workload: Arc<CountingWorkload>,
    manager: Arc<LifecycleManager>,
    _logs: tempfile::TempDir,
}

impl Harness {
    fn log_dir(&self) -> &std::path::Path {
        self._logs.path()
    }
}

fn harness(cloud: FakeCloud, faults: Faults) -> Harness {
    let logs = tempfile::TempDir::new().unwrap();
    let mut config = CapsuleConfig::default();
    config.prep.use_sudo = false;
    config.prep.system_packages = vec!["git".into()];
    config.workload.log_dir = logs.path().to_path_buf();
    config.workload.run_id = Some("run1".into());

    let cloud = Arc::new(cloud);
    let workload = Arc::new(CountingWorkload::default());
    let manager = LifecycleManager::new(
        cloud.clone(),
        Arc::new(FixedConnector(target(faults))),
        config,
    )
    .with_retry_config(RetryConfig {
        max_attempts: 3,
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(2),
        backoff_factor: 2.0,
        max_jitter: Duration::ZERO,
    })
    .with_workload(workload.clone());

    Harness {
        cloud,
        workload,
        manager: Arc::new(manager),
        _logs: logs,
    }
}

fn plan() -> TestPlan {
    TestPlan {
        agent_dir: None,
        tasks: vec![TaskSpec {
            id: "capsule-5507257".into(),
            input: serde_json::json!({"prompt": "run"}),
            agent_args: serde_json::json!({}),
        }],
    }
}

fn request(name: &str) -> HostRequest {
    HostRequest::new(HostId::from(name))
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_create_test_release() {
    let h = harness(FakeCloud::default(), Faults::default());
    let lease = h.manager.create(request("capsule-a")).await.unwrap();
    let id = lease.id().clone();
    assert_eq!(h.manager.state(&id).await, Some(HostState::Ready));

    let outcome = h.manager.run_test(&id, &plan()).await.unwrap();
    assert_eq!(outcome.exit_code(), 0, "errors: {:?}", outcome.report.errors);
    assert_eq!(outcome.tasks.len(), 1);
    assert!(outcome.tasks[0].1.is_completed());
    assert_eq!(h.manager.state(&id).await, Some(HostState::Ready));

    let local_report = h.log_dir().join("env_prep_report_capsule-a.json");
    assert!(local_report.exists());
    let submissions = h.manager.submissions().read_all().unwrap();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0]["capsule-5507257"]["answer"], "capsule-5507257");

    lease.release().await.unwrap();
    assert_eq!(h.cloud.deletes(), 1);
    assert_eq!(h.manager.state(&id).await, Some(HostState::Destroyed));

    // idempotent
    h.manager.destroy(&id).await.unwrap();
    assert!(h.manager.destroy_all().await.is_empty());
    assert_eq!(h.cloud.deletes(), 1);
}

#[tokio::test]
async fn test_create_failure_cleans_up_partial_resources_once() {
    let h = harness(
        FakeCloud {
            fail_create: true,
            ..Default::default()
        },
        Faults::default(),
    );
    let id = HostId::from("capsule-b");
    let err = h.manager.create(request("capsule-b")).await.err().unwrap();
    assert!(matches!(err, VmError::Create(ref m) if m.contains("QuotaExceeded")));
    assert_eq!(err.exit_code(), 1);
    assert_eq!(h.cloud.deletes(), 1);
    assert_eq!(h.manager.state(&id).await, Some(HostState::Destroyed));

    h.manager.destroy(&id).await.unwrap();
    assert_eq!(h.cloud.deletes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_host_fails_after_bounded_attempts() {
    let h = harness(
        FakeCloud::default(),
        Faults {
            unreachable: true,
            ..Default::default()
        },
    );
    let err = h.manager.create(request("capsule-c")).await.err().unwrap();
    match err {
        VmError::NotReady { attempts, reason, .. } => {
            assert_eq!(attempts, 3);
            assert!(reason.contains("Connection refused"));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(h.cloud.deletes(), 1);
}

#[tokio::test]
async fn test_mandatory_failure_skips_workload_and_still_tears_down() {
    let h = harness(
        FakeCloud::default(),
        Faults {
            no_apt: true,
            ..Default::default()
        },
    );
    let lease = h.manager.create(request("capsule-d")).await.unwrap();
    let outcome = h.manager.run_test(lease.id(), &plan()).await.unwrap();

    assert_eq!(outcome.exit_code(), 1);
    assert_eq!(outcome.report.mandatory_failure.as_deref(), Some("system_packages"));
    assert!(outcome.tasks.is_empty());
    assert_eq!(h.workload.calls.load(Ordering::SeqCst), 0);

    lease.release().await.unwrap();
    assert_eq!(h.cloud.deletes(), 1);
}

#[tokio::test]
async fn test_cleanup_failure_is_reported_once() {
    let h = harness(
        FakeCloud {
            fail_delete: true,
            ..Default::default()
        },
        Faults::default(),
    );
    let lease = h.manager.create(request("capsule-e")).await.unwrap();
    let id = lease.id().clone();
    let err = lease.release().await.err().unwrap();
    assert!(matches!(err, VmError::Cleanup { ref message, .. } if message.contains("AuthorizationFailed")));
    assert_eq!(h.manager.state(&id).await, Some(HostState::Failed));

    // a second attempt is not made
    h.manager.destroy(&id).await.unwrap();
    assert!(h.manager.destroy_all().await.is_empty());
    assert_eq!(h.cloud.deletes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_destroy_deletes_once() {
    let h = harness(
        FakeCloud {
            delete_delay: Some(Duration::from_secs(5)),
            ..Default::default()
        },
        Faults::default(),
    );
    let lease = h.manager.create(request("capsule-f")).await.unwrap();
    let id = lease.id().clone();

    let (a, b) = tokio::join!(h.manager.destroy(&id), h.manager.destroy(&id));
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(h.cloud.deletes(), 1);

    lease.release().await.unwrap();
    assert_eq!(h.cloud.deletes(), 1);
}

#[tokio::test]
async fn test_dropped_lease_still_tears_down() {
    let h = harness(FakeCloud::default(), Faults::default());
    let lease = h.manager.create(request("capsule-g")).await.unwrap();
    let id = lease.id().clone();
    drop(lease);

    for _ in 0..100 {
        if h.cloud.deletes() == 1 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(h.cloud.deletes(), 1);
    assert_eq!(h.manager.state(&id).await, Some(HostState::Destroyed));
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_tears_down_in_flight_host() {
    let h = harness(FakeCloud::default(), Faults::default());
    let manager = h.manager.clone();
    let flow = async move {
        let lease = manager.create(request("capsule-h")).await?;
        // long-running test that never finishes on its own
        tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
        lease.release().await
    };
    let interrupt = tokio::time::sleep(Duration::from_secs(5));

    let supervised = supervise(&h.manager, flow, interrupt).await;
    assert!(supervised.interrupted());
    assert!(supervised.cleanup_errors.is_empty());

    for _ in 0..100 {
        tokio::task::yield_now().await;
    }
    assert_eq!(h.cloud.deletes(), 1);
    assert_eq!(
        h.manager.state(&HostId::from("capsule-h")).await,
        Some(HostState::Destroyed)
    );
}

#[tokio::test]
async fn test_supervise_sweeps_leaked_hosts_after_success() {
    let h = harness(FakeCloud::default(), Faults::default());
    let manager = h.manager.clone();
    let supervised = supervise(
        &h.manager,
        async move {
            let lease = manager.create(request("capsule-i")).await.unwrap();
            // hand the lease out without releasing it
            std::mem::forget(lease);
            7
        },
        std::future::pending(),
    )
    .await;

    assert_eq!(supervised.outcome, Some(7));
    assert_eq!(h.cloud.deletes(), 1);
}

#[tokio::test]
async fn test_adopted_retained_host_survives_sweep() {
    let h = harness(
        FakeCloud {
            known: vec!["capsule-existing"],
            ..Default::default()
        },
        Faults::default(),
    );
    let lease = h
        .manager
        .adopt(HostId::from("capsule-existing"), true)
        .await
        .unwrap();
    assert!(lease.is_retained());
    assert_eq!(h.cloud.creates.load(Ordering::SeqCst), 0);

    assert!(h.manager.destroy_all().await.is_empty());
    lease.release().await.unwrap();
    assert_eq!(h.cloud.deletes(), 0);
    assert_eq!(
        h.manager.state(&HostId::from("capsule-existing")).await,
        Some(HostState::Ready)
    );
}

#[tokio::test]
async fn test_adopted_host_with_cleanup_is_destroyed() {
    let h = harness(
        FakeCloud {
            known: vec!["capsule-existing"],
            ..Default::default()
        },
        Faults::default(),
    );
    let lease = h
        .manager
        .adopt(HostId::from("capsule-existing"), false)
        .await
        .unwrap();
    lease.release().await.unwrap();
    assert_eq!(h.cloud.deletes(), 1);
}

#[tokio::test]
async fn test_adopt_unknown_host() {
    let h = harness(FakeCloud::default(), Faults::default());
    let err = h.manager.adopt(HostId::from("capsule-nope"), true).await.err().unwrap();
    assert!(matches!(err, VmError::UnknownHost(_)));
    assert_eq!(h.cloud.deletes(), 0);
}

#[tokio::test]
async fn test_destroy_unmanaged_host_is_noop() {
    let h = harness(FakeCloud::default(), Faults::default());
    h.manager.destroy(&HostId::from("capsule-zzz")).await.unwrap();
    let err = h
        .manager
        .run_test(&HostId::from("capsule-zzz"), &plan())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, VmError::UnknownHost(_)));
    assert_eq!(h.cloud.deletes(), 0);
}

#[tokio::test]
async fn test_adopt_keeps_name_verbatim() {
    let h = harness(
        FakeCloud {
            known: vec!["Agent_Corebench_VM"],
            ..Default::default()
        },
        Faults::default(),
    );
    let id = HostId::existing("Agent_Corebench_VM");
    let lease = h.manager.adopt(id.clone(), true).await.unwrap();
    assert_eq!(lease.id().as_str(), "Agent_Corebench_VM");
    assert_eq!(h.manager.state(&id).await, Some(HostState::Ready));
    assert_eq!(h.manager.state(&HostId::normalize("Agent_Corebench_VM")).await, None);

    let outcome = h.manager.run_test(&id, &plan()).await.unwrap();
    assert_eq!(outcome.exit_code(), 0, "errors: {:?}", outcome.report.errors);
    assert!(h.log_dir().join("env_prep_report_Agent_Corebench_VM.json").exists());
    lease.release().await.unwrap();
}

#[tokio::test]
async fn test_connection_lost_during_prep_fails_host() {
    let h = harness(
        FakeCloud::default(),
        Faults {
            lost_at_display: true,
            ..Default::default()
        },
    );
    let lease = h.manager.create(request("capsule-lost")).await.unwrap();
    let id = lease.id().clone();

    let outcome = h.manager.run_test(&id, &plan()).await.unwrap();
    assert_ne!(outcome.exit_code(), 0);
    assert_eq!(outcome.report.mandatory_failure.as_deref(), Some("display"));
    assert!(outcome.tasks.is_empty());
    assert_eq!(h.workload.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.manager.state(&id).await, Some(HostState::Failed));

    lease.release().await.unwrap();
    assert_eq!(h.cloud.deletes(), 1);
    assert_eq!(h.manager.state(&id).await, Some(HostState::Destroyed));
}

#[tokio::test]
async fn test_upload_failure_leaves_partial_report() {
    let h = harness(
        FakeCloud::default(),
        Faults {
            unpack_fails: true,
            ..Default::default()
        },
    );
    let lease = h.manager.create(request("capsule-up")).await.unwrap();
    let id = lease.id().clone();

    let err = h.manager.run_test(&id, &plan()).await.err().unwrap();
    assert!(matches!(err, VmError::Artifact(_)));
    assert_eq!(h.manager.state(&id).await, Some(HostState::Failed));

    let path = h.log_dir().join("env_prep_report_capsule-up.json");
    let report = ProvisioningReport::from_json(&std::fs::read_to_string(path).unwrap()).unwrap();
    assert_eq!(report.mandatory_failure.as_deref(), Some("upload"));
    assert!(report.errors[0].contains("Unexpected EOF"));
    assert_eq!(report.exit_code(), 1);

    lease.release().await.unwrap();
    assert_eq!(h.cloud.deletes(), 1);
}

//! Host lifecycle: create, test, destroy, with teardown guaranteed on every
//! exit path.

use crate::artifacts::{upload_bundle, ArtifactBundle};
use crate::cloud::{CloudProvider, HostRequest};
use crate::connector::Connector;
use crate::error::VmError;
use crate::retry::{with_retry, RetryConfig};
use crate::submissions::SubmissionLog;
use crate::workload::{RemoteWorkload, TaskOutcome, TaskSpec, Workload};
use capsule_core::{CapsuleConfig, CloudResourceSet, Host, HostId, HostState, ProvisioningReport};
use capsule_install::scan_r_sources;
use capsule_os::{CommandSpec, Executor};
use capsule_prep::EnvironmentPreparer;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const READY_PROBE_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Plan / outcome
// ============================================================================

/// What to run on a ready host.
#[derive(Debug, Clone, Default)]
pub struct TestPlan {
    pub agent_dir: Option<PathBuf>,
    pub tasks: Vec<TaskSpec>,
}

#[derive(Debug, Clone)]
pub struct TestOutcome {
    pub report: ProvisioningReport,
    /// Empty when preparation failed a mandatory step.
    pub tasks: Vec<(String, TaskOutcome)>,
}

impl TestOutcome {
    pub fn exit_code(&self) -> u8 {
        self.report.exit_code()
    }
}

// ============================================================================
// Registry
// ============================================================================

struct HostRecord {
    host: Host,
    /// Everything that may exist in the cloud for this host.
    resources: Option<CloudResourceSet>,
    /// Adopted without `--cleanup`: never destroyed by a sweep or a lease.
    retain: bool,
    cleanup_attempted: bool,
    executor: Option<Arc<dyn Executor>>,
}

impl HostRecord {
    fn new(host: Host, retain: bool) -> Self {
        Self {
            host,
            resources: None,
            retain,
            cleanup_attempted: false,
            executor: None,
        }
    }
}

pub struct LifecycleManager {
    cloud: Arc<dyn CloudProvider>,
    connector: Arc<dyn Connector>,
    config: CapsuleConfig,
    retry: RetryConfig,
    workload: Arc<dyn Workload>,
    submissions: SubmissionLog,
    hosts: Mutex<HashMap<HostId, Arc<Mutex<HostRecord>>>>,
}

impl LifecycleManager {
    pub fn new(
        cloud: Arc<dyn CloudProvider>,
        connector: Arc<dyn Connector>,
        config: CapsuleConfig,
    ) -> Self {
        let run_id = config
            .workload
            .run_id
            .clone()
            .unwrap_or_else(|| chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string());
        let workload = RemoteWorkload::new(config.workload.clone(), config.ssh.command_timeout());
        Self {
            cloud,
            connector,
            retry: RetryConfig::from(&config.ssh),
            workload: Arc::new(workload),
            submissions: SubmissionLog::new(&config.workload.log_dir, &run_id),
            config,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_workload(mut self, workload: Arc<dyn Workload>) -> Self {
        self.workload = workload;
        self
    }

    pub fn submissions(&self) -> &SubmissionLog {
        &self.submissions
    }

    pub fn cloud_name(&self) -> &str {
        self.cloud.name()
    }

    /// Current state of a registered host.
    pub async fn state(&self, id: &HostId) -> Option<HostState> {
        let record = self.hosts.lock().await.get(id).cloned()?;
        let state = record.lock().await.host.state;
        Some(state)
    }

    async fn record(&self, id: &HostId) -> Result<Arc<Mutex<HostRecord>>, VmError> {
        self.hosts
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| VmError::UnknownHost(id.clone()))
    }

    fn new_host(&self, id: HostId) -> Host {
        Host::new(
            id,
            self.config.cloud.username.clone(),
            self.config.ssh.private_key_path.clone().unwrap_or_default(),
        )
    }

    /// Register a record, returning it already locked so no other caller
    /// observes it half-built.
    async fn register(
        &self,
        record: HostRecord,
    ) -> Result<tokio::sync::OwnedMutexGuard<HostRecord>, VmError> {
        let id = record.host.id.clone();
        let record = Arc::new(Mutex::new(record));
        let guard = record.clone().lock_owned().await;
        let mut hosts = self.hosts.lock().await;
        if hosts.contains_key(&id) {
            return Err(VmError::Create(format!("host {} is already managed", id)));
        }
        hosts.insert(id, record);
        Ok(guard)
    }

    // ========================================================================
    // Create / adopt
    // ========================================================================

    /// Provision a new host and wait until it answers over SSH.
    ///
    /// On any failure the host goes to `Failed` and whatever was created is
    /// deleted before the error is returned.
    pub async fn create(self: &Arc<Self>, request: HostRequest) -> Result<HostLease, VmError> {
        let id = request.id.clone();
        let mut rec = self
            .register(HostRecord::new(self.new_host(id.clone()), false))
            .await?;

        tracing::info!("Creating host {} via {}", id, self.cloud.name());
        match self.provision(&mut rec, &request).await {
            Ok(()) => {
                tracing::info!(
                    "Host {} ready at {}",
                    id,
                    rec.host.address.as_deref().unwrap_or("?")
                );
                Ok(HostLease::new(self.clone(), id, false))
            }
            Err(e) => {
                tracing::warn!("Creating host {} failed: {}", id, e);
                if !rec.host.state.is_terminal() {
                    rec.host.transition(HostState::Failed)?;
                }
                // Logged inside; the creation error is what the caller sees.
                let _ = self.teardown(&mut rec).await;
                Err(e)
            }
        }
    }

    async fn provision(&self, rec: &mut HostRecord, request: &HostRequest) -> Result<(), VmError> {
        rec.host.transition(HostState::Creating)?;
        // Covers a creation that is cancelled mid-flight.
        rec.resources = Some(CloudResourceSet::full(request.id.clone()));

        let provisioned = match self.cloud.create(request).await {
            Ok(p) => p,
            Err(failure) => {
                rec.resources = Some(failure.partial);
                return Err(VmError::Create(failure.error));
            }
        };
        rec.resources = Some(provisioned.resources);
        rec.host.address = Some(provisioned.address);

        let executor = self.connector.connect(&rec.host)?;
        rec.executor = Some(executor.clone());
        self.wait_ready(&rec.host.id, executor).await?;
        rec.host.transition(HostState::Ready)?;
        Ok(())
    }

    async fn wait_ready(&self, id: &HostId, executor: Arc<dyn Executor>) -> Result<(), VmError> {
        let what = format!("SSH readiness of {}", id);
        with_retry(&self.retry, &what, || {
            let executor = executor.clone();
            async move {
                let result = executor
                    .run(&CommandSpec::new("true"), READY_PROBE_TIMEOUT)
                    .await?;
                anyhow::ensure!(result.success(), "probe returned {}", result.describe());
                Ok::<(), anyhow::Error>(())
            }
        })
        .await
        .map_err(|e| VmError::NotReady {
            host: id.clone(),
            attempts: e.attempts,
            reason: e.last_error,
        })
    }

    /// Take over an existing host. A retained host is never destroyed by
    /// lease release or the supervisory sweep.
    pub async fn adopt(self: &Arc<Self>, id: HostId, retain: bool) -> Result<HostLease, VmError> {
        let mut rec = self
            .register(HostRecord::new(self.new_host(id.clone()), retain))
            .await?;

        let result = async {
            let found = self
                .cloud
                .discover(&id)
                .await
                .map_err(|e| VmError::Create(format!("looking up {}: {:#}", id, e)))?
                .ok_or_else(|| VmError::UnknownHost(id.clone()))?;
            rec.host.transition(HostState::Creating)?;
            rec.resources = Some(found.resources);
            rec.host.address = Some(found.address);
            let executor = self.connector.connect(&rec.host)?;
            rec.executor = Some(executor.clone());
            self.wait_ready(&id, executor).await?;
            rec.host.transition(HostState::Ready)?;
            Ok::<(), VmError>(())
        }
        .await;

        match result {
            Ok(()) => {
                tracing::info!("Adopted existing host {} (retain: {})", id, retain);
                Ok(HostLease::new(self.clone(), id, retain))
            }
            Err(e) => {
                tracing::warn!("Adopting host {} failed: {}", id, e);
                if !rec.host.state.is_terminal() {
                    rec.host.transition(HostState::Failed)?;
                }
                if !retain && rec.resources.is_some() {
                    let _ = self.teardown(&mut rec).await;
                }
                Err(e)
            }
        }
    }

    // ========================================================================
    // Test
    // ========================================================================

    /// Upload artifacts, prepare the environment, then run every task.
    ///
    /// A mandatory preparation failure is not an error here: it is in the
    /// returned report and the tasks are skipped.
    pub async fn run_test(&self, id: &HostId, plan: &TestPlan) -> Result<TestOutcome, VmError> {
        let record = self.record(id).await?;
        let mut rec = record.lock().await;
        let executor = rec
            .executor
            .clone()
            .ok_or_else(|| VmError::UnknownHost(id.clone()))?;
        rec.host.transition(HostState::InUse)?;

        let result = self.exercise(&rec.host, executor, plan).await;
        match &result {
            Ok(outcome) if outcome.report.connection_lost => {
                tracing::warn!("Lost connection to {} during preparation", id);
                rec.host.transition(HostState::Failed)?;
            }
            Ok(_) => rec.host.transition(HostState::Ready)?,
            Err(e) => {
                tracing::warn!("Test on {} failed: {}", id, e);
                rec.host.transition(HostState::Failed)?;
            }
        }
        result
    }

    async fn exercise(
        &self,
        host: &Host,
        executor: Arc<dyn Executor>,
        plan: &TestPlan,
    ) -> Result<TestOutcome, VmError> {
        let workdir = self
            .config
            .prep
            .workdir
            .clone()
            .unwrap_or_else(|| host.home_dir());
        let timeout = self.config.ssh.command_timeout();

        let (bundle, detected) = self.bundle_for(plan)?;
        if !bundle.is_empty() {
            if let Err(e) = upload_bundle(executor.as_ref(), &bundle, &workdir, timeout).await {
                let mut report = ProvisioningReport::for_host(host.id.to_string());
                report.record_mandatory_failure("upload", &e.to_string());
                report.finish();
                self.save_report(&host.id, &report);
                return Err(e);
            }
        }

        let report = EnvironmentPreparer::new(executor.clone(), self.config.clone())
            .with_host(host.id.to_string())
            .with_detected_r_packages(detected)
            .run()
            .await;
        self.save_report(&host.id, &report);

        let mut tasks = Vec::new();
        if !report.succeeded() {
            tracing::warn!(
                "Skipping {} task(s) on {}: environment not ready",
                plan.tasks.len(),
                host.id
            );
            return Ok(TestOutcome { report, tasks });
        }

        for task in &plan.tasks {
            let outcome = self.workload.invoke(executor.as_ref(), &workdir, task).await;
            if let Err(e) = self.submissions.append(task, &outcome).await {
                tracing::warn!("Could not record submission for {}: {:#}", task.id, e);
            }
            tasks.push((task.id.clone(), outcome));
        }
        Ok(TestOutcome { report, tasks })
    }

    fn bundle_for(&self, plan: &TestPlan) -> Result<(ArtifactBundle, Vec<String>), VmError> {
        let mut bundle = ArtifactBundle::new();
        let mut detected = Vec::new();
        if let Some(dir) = &plan.agent_dir {
            if self.config.prep.detect_r_packages {
                let scan = scan_r_sources(dir);
                if scan.has_r_code() {
                    detected = scan.required_packages();
                    tracing::info!(
                        "Found {} R package reference(s) in {} file(s)",
                        detected.len(),
                        scan.files_scanned
                    );
                }
            }
            bundle = bundle.with_agent_dir(dir);
        }
        for task in &plan.tasks {
            for (dest, source) in task.staged_files() {
                tracing::debug!("Staging {} as {}", source.display(), dest);
                bundle.stage(dest, source);
            }
        }

        if !plan.tasks.is_empty() {
            let mut input = Map::new();
            for task in &plan.tasks {
                input.insert(task.id.clone(), task.input.clone());
            }
            let args = plan
                .tasks
                .first()
                .map(|t| t.agent_args.clone())
                .unwrap_or(Value::Null);
            let encode = |v: &Value| {
                serde_json::to_vec_pretty(v).map_err(|e| VmError::Artifact(e.to_string()))
            };
            bundle.add_file("input.json", encode(&Value::Object(input))?);
            bundle.add_file("agent_args.json", encode(&args)?);
        }
        Ok((bundle, detected))
    }

    fn save_report(&self, id: &HostId, report: &ProvisioningReport) {
        let path = self
            .config
            .workload
            .log_dir
            .join(format!("env_prep_report_{}.json", id));
        match report.write_to(&path) {
            Ok(()) => tracing::info!("Provisioning report saved to {}", path.display()),
            Err(e) => tracing::warn!("Could not save report to {}: {:#}", path.display(), e),
        }
    }

    // ========================================================================
    // Destroy
    // ========================================================================

    /// Delete every cloud resource of the host. Idempotent: unknown,
    /// destroyed, and already-cleaned-up hosts are left alone. Concurrent
    /// callers wait for the teardown in flight.
    pub async fn destroy(&self, id: &HostId) -> Result<(), VmError> {
        let record = match self.hosts.lock().await.get(id).cloned() {
            Some(record) => record,
            None => {
                tracing::debug!("Destroy of unmanaged host {} ignored", id);
                return Ok(());
            }
        };
        let mut rec = record.lock().await;
        self.teardown(&mut rec).await
    }

    /// Tear down every host that is not retained. Returns the failures.
    pub async fn destroy_all(&self) -> Vec<VmError> {
        let records: Vec<_> = self.hosts.lock().await.values().cloned().collect();
        let mut errors = Vec::new();
        for record in records {
            let mut rec = record.lock().await;
            if rec.retain {
                tracing::info!("Keeping retained host {}", rec.host.id);
                continue;
            }
            if let Err(e) = self.teardown(&mut rec).await {
                errors.push(e);
            }
        }
        errors
    }

    async fn teardown(&self, rec: &mut HostRecord) -> Result<(), VmError> {
        match rec.host.state {
            HostState::Destroyed => return Ok(()),
            HostState::Failed if rec.cleanup_attempted => return Ok(()),
            HostState::Requested | HostState::Creating => rec.host.transition(HostState::Failed)?,
            _ => {}
        }
        rec.host.transition(HostState::Destroying)?;
        rec.cleanup_attempted = true;
        rec.executor = None;

        let id = rec.host.id.clone();
        let Some(resources) = rec.resources.clone() else {
            rec.host.transition(HostState::Destroyed)?;
            return Ok(());
        };

        tracing::info!("Destroying host {} ({} resources)", id, resources.len());
        match self.cloud.delete(&resources).await {
            Ok(()) => {
                rec.host.transition(HostState::Destroyed)?;
                tracing::info!("Host {} destroyed", id);
                Ok(())
            }
            Err(e) => {
                rec.host.transition(HostState::Failed)?;
                let message = format!("{:#}", e);
                tracing::error!(
                    "Cleanup of host {} failed, resources may remain in the cloud: {}",
                    id,
                    message
                );
                Err(VmError::Cleanup { host: id, message })
            }
        }
    }
}

// ============================================================================
// Lease
// ============================================================================

/// Scoped ownership of a host. Release it explicitly; dropping it unreleased
/// still schedules teardown.
pub struct HostLease {
    manager: Arc<LifecycleManager>,
    id: HostId,
    retain: bool,
    released: bool,
}

impl HostLease {
    fn new(manager: Arc<LifecycleManager>, id: HostId, retain: bool) -> Self {
        Self {
            manager,
            id,
            retain,
            released: false,
        }
    }

    pub fn id(&self) -> &HostId {
        &self.id
    }

    pub fn is_retained(&self) -> bool {
        self.retain
    }

    /// Destroy the host unless it is retained.
    pub async fn release(mut self) -> Result<(), VmError> {
        self.released = true;
        if self.retain {
            tracing::info!("Leaving host {} running", self.id);
            return Ok(());
        }
        self.manager.destroy(&self.id).await
    }
}

impl Drop for HostLease {
    fn drop(&mut self) {
        if self.released || self.retain {
            return;
        }
        tracing::warn!("Lease on host {} dropped without release, destroying", self.id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let manager = self.manager.clone();
                let id = self.id.clone();
                handle.spawn(async move {
                    if let Err(e) = manager.destroy(&id).await {
                        tracing::error!("Teardown of dropped lease {} failed: {}", id, e);
                    }
                });
            }
            Err(_) => tracing::error!("No runtime to destroy host {}; it may be leaked", self.id),
        }
    }
}

// ============================================================================
// Supervisor
// ============================================================================

#[derive(Debug)]
pub struct Supervised<T> {
    /// `None` when the interrupt won.
    pub outcome: Option<T>,
    pub cleanup_errors: Vec<VmError>,
}

impl<T> Supervised<T> {
    pub fn interrupted(&self) -> bool {
        self.outcome.is_none()
    }
}

/// Run `flow` until it finishes or `interrupt` fires, then sweep every
/// non-retained host.
pub async fn supervise<T, F, I>(manager: &LifecycleManager, flow: F, interrupt: I) -> Supervised<T>
where
    F: Future<Output = T>,
    I: Future<Output = ()>,
{
    let outcome = tokio::select! {
        out = flow => Some(out),
        _ = interrupt => {
            tracing::warn!("Interrupted, tearing down managed hosts");
            None
        }
    };
    let cleanup_errors = manager.destroy_all().await;
    Supervised {
        outcome,
        cleanup_errors,
    }
}

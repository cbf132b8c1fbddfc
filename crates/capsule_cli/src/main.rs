use anyhow::Result;
use capsule_core::{CapsuleConfig, ConfigError, HostId, ProvisioningReport};
use capsule_install::scan_r_sources;
use capsule_os::LocalExecutor;
use capsule_prep::EnvironmentPreparer;
use capsule_vm::{
    supervise, AzureCli, CloudProvider, HostRequest, LifecycleManager, SshConnector, TaskSpec,
    TestOutcome, TestPlan, VmError,
};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "capsule", author, version, about, long_about = None)]
struct Args {
    /// Reuse an existing VM instead of creating one
    #[arg(long)]
    vm_name: Option<String>,

    /// Destroy the reused VM when done (only with --vm-name)
    #[arg(long)]
    cleanup: bool,

    /// Login user on the VM
    #[arg(long)]
    username: Option<String>,

    /// Private SSH key; the public key is expected next to it with `.pub`
    #[arg(long, env = "SSH_PRIVATE_KEY_PATH")]
    ssh_key: Option<PathBuf>,

    /// Request a GPU machine size
    #[arg(long)]
    gpu: bool,

    /// JSON file mapping task id to task input
    #[arg(long)]
    task: Option<PathBuf>,

    /// Local agent directory uploaded to the VM
    #[arg(long)]
    agent_dir: Option<PathBuf>,

    /// Prepare this machine instead of a VM
    #[arg(long)]
    local: bool,

    /// Path to the config file
    #[arg(short, long, default_value = "capsule.toml")]
    config: PathBuf,

    /// Directory for reports, traces and submissions
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Verbose logs
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    dotenv::dotenv().ok();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(2);
        }
    };
    let _guard = init_logging(args.verbose, &config.workload.log_dir);

    match run(args, config).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("error: {:#}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn exit_code_for(e: &anyhow::Error) -> u8 {
    if let Some(vm) = e.downcast_ref::<VmError>() {
        vm.exit_code()
    } else if e.downcast_ref::<ConfigError>().is_some() {
        2
    } else {
        1
    }
}

/// File, then environment, then flags.
fn load_config(args: &Args) -> Result<CapsuleConfig, ConfigError> {
    let mut config = if args.config.exists() {
        CapsuleConfig::load(&args.config)?
    } else {
        CapsuleConfig::load_or_default(&args.config)
    };

    if let Some(user) = &args.username {
        config.cloud.username = user.clone();
    }
    if let Some(key) = &args.ssh_key {
        if config.ssh.public_key_path.is_none() {
            config.ssh.public_key_path = Some(PathBuf::from(format!("{}.pub", key.display())));
        }
        config.ssh.private_key_path = Some(key.clone());
    }
    if let Some(dir) = &args.log_dir {
        config.workload.log_dir = dir.clone();
    }
    if let Some(dir) = &args.agent_dir {
        config.workload.agent_dir = Some(dir.clone());
    }
    if args.cleanup && args.vm_name.is_none() {
        return Err(ConfigError::Invalid(
            "--cleanup only applies together with --vm-name".to_string(),
        ));
    }
    Ok(config)
}

/// Stderr for humans, JSON lines in `<log_dir>/capsule.log` for later analysis.
fn init_logging(verbose: bool, log_dir: &Path) -> Option<WorkerGuard> {
    let default = if verbose { "info" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("CAPSULE_LOG").unwrap_or_else(|_| default.into()),
    );

    let (file_layer, guard) = match std::fs::create_dir_all(log_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::never(log_dir, "capsule.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        Err(e) => {
            eprintln!("warning: cannot create log directory {}: {}", log_dir.display(), e);
            (None, None)
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    guard
}

async fn run(args: Args, config: CapsuleConfig) -> Result<u8> {
    if args.local {
        return run_local(config).await;
    }

    let tasks = match &args.task {
        Some(path) => TaskSpec::load_all(path)?,
        None => Vec::new(),
    };
    let plan = TestPlan {
        agent_dir: config.workload.agent_dir.clone(),
        tasks,
    };

    // Validation happens here, before anything is created.
    let cloud: Arc<dyn CloudProvider> = match &args.vm_name {
        None => Arc::new(AzureCli::from_config(&config)?),
        Some(_) => Arc::new(AzureCli::for_existing_host(&config)?),
    };
    let connector = Arc::new(SshConnector::new(
        config.ssh.port,
        config.ssh.connect_timeout(),
    ));
    let prefix = config.cloud.name_prefix.clone();
    let manager = Arc::new(LifecycleManager::new(cloud, connector, config));

    let flow = {
        let manager = manager.clone();
        let vm_name = args.vm_name.clone();
        let retain = !args.cleanup;
        let gpu = args.gpu;
        async move {
            let lease = match vm_name {
                None => {
                    let request = HostRequest::new(HostId::generate(&prefix)).with_gpu(gpu);
                    manager.create(request).await?
                }
                Some(name) => manager.adopt(HostId::existing(&name), retain).await?,
            };
            info!("Using host {}", lease.id());
            let outcome = manager.run_test(lease.id(), &plan).await;
            // Logged inside; never replaces the test outcome.
            let _ = lease.release().await;
            outcome
        }
    };

    let supervised = supervise(&manager, flow, interrupted()).await;
    for e in &supervised.cleanup_errors {
        error!("{}", e);
    }
    match supervised.outcome {
        None => {
            eprintln!("interrupted; managed hosts were torn down");
            Ok(EXIT_INTERRUPTED)
        }
        Some(Ok(outcome)) => {
            print_outcome(&outcome);
            Ok(outcome.exit_code())
        }
        Some(Err(e)) => Err(e.into()),
    }
}

async fn run_local(config: CapsuleConfig) -> Result<u8> {
    let mut detected = Vec::new();
    if let Some(dir) = &config.workload.agent_dir {
        detected = scan_r_sources(dir).required_packages();
    }
    let log_dir = config.workload.log_dir.clone();
    let preparer = EnvironmentPreparer::new(Arc::new(LocalExecutor::new()), config)
        .with_host("local")
        .with_detected_r_packages(detected);

    let path = log_dir.join("env_prep_report_local.json");
    let report = tokio::select! {
        report = preparer.run() => report,
        _ = interrupted() => {
            eprintln!("interrupted");
            save_report(&interrupted_report("local"), &path);
            return Ok(EXIT_INTERRUPTED);
        }
    };
    save_report(&report, &path);
    print_report(&report);
    Ok(report.exit_code())
}

/// What is left to record when preparation is cut short.
fn interrupted_report(host: &str) -> ProvisioningReport {
    let mut report = ProvisioningReport::for_host(host);
    report.record_mandatory_failure("interrupted", "preparation interrupted by signal");
    report.finish();
    report
}

fn save_report(report: &ProvisioningReport, path: &Path) {
    if let Err(e) = report.write_to(path) {
        warn!("Could not save report to {}: {:#}", path.display(), e);
    }
}

/// Resolves on ctrl-c. Never resolves if the handler cannot be installed.
async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}

fn print_report(report: &ProvisioningReport) {
    println!("Steps completed: {}", report.steps_completed.len());
    for step in &report.steps_completed {
        println!("  {}", step);
    }
    if !report.errors.is_empty() {
        println!("Errors: {}", report.errors.len());
        for e in &report.errors {
            println!("  {}", e);
        }
    }
    if let Some(step) = &report.mandatory_failure {
        println!("Mandatory step failed: {}", step);
    }
}

fn print_outcome(outcome: &TestOutcome) {
    print_report(&outcome.report);
    for (task, result) in &outcome.tasks {
        let status = if result.is_completed() { "completed" } else { "not completed" };
        println!("Task {}: {}", task, status);
    }
}

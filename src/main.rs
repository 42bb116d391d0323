use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, trace};

use cellmatrix::config::{ConfigLoader, ServiceConfig};
use cellmatrix::ledger::Stage;
use cellmatrix::orchestrator::{
    complete_conversion, get_status, Dispatcher, DriverPayload, LocalRuntime, QueueConsumer,
    QueueInvoker, Reconciler, StageContext,
};
use cellmatrix::source::CsvSource;
use cellmatrix::storage::{Invoker, MessageQueue, ObjectStore, StorageFactory, StoreClients};

/// Merge per-cell expression bundles into chunked arrays
#[derive(Parser)]
#[command(name = "cellmatrix")]
#[command(about = "Distributed merging of per-cell gene-expression bundles", long_about = None)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace, -vvv for all)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to configuration file (TOML or YAML)
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a request to completion in this process
    Run {
        /// Local CSV bundles to upload and merge
        files: Vec<PathBuf>,

        /// Bundles already in the object store
        #[arg(long = "ref")]
        refs: Vec<String>,

        /// Output format
        #[arg(short, long, default_value = "zarr")]
        format: String,

        /// Request id (generated when omitted)
        #[arg(long)]
        request_id: Option<String>,

        /// Request parameters as JSON
        #[arg(long)]
        params: Option<String>,
    },
    /// Show the status of a request
    Status {
        request_id: String,
    },
    /// Consume stage triggers from the queue
    ServeQueue {
        /// Skip the periodic reconciler
        #[arg(long)]
        no_reconcile: bool,
    },
    /// Re-trigger reducers for stalled requests once
    Reconcile,
    /// Send one stage trigger from a YAML or JSON payload file
    Invoke {
        /// Stage to trigger (driver, mapper, worker, reducer)
        stage: String,

        /// Payload file, or `-` for stdin
        payload: PathBuf,

        /// Handle the trigger and everything it fans out in this process
        #[arg(long)]
        local: bool,
    },
    /// Mark a request aborted
    Abort {
        request_id: String,
    },
    /// Record the output of a finished conversion job
    CompleteConversion {
        request_id: String,
        job_id: String,
        location: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        2 => "trace",
        _ => "trace,hyper=debug,aws_smithy_runtime=debug", // -vvv shows everything including dependencies
    };

    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_target(cli.verbose >= 2)
        .with_thread_ids(cli.verbose >= 3)
        .with_line_number(cli.verbose >= 3)
        .with_writer(std::io::stderr)
        .init();

    debug!("cellmatrix started with verbosity level: {}", cli.verbose);
    trace!("Full CLI args: {:?}", std::env::args().collect::<Vec<_>>());

    if let Err(e) = run(cli).await {
        error!("Fatal error: {:#}", e);
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Run {
            files,
            refs,
            format,
            request_id,
            params,
        } => run_local(&config, files, refs, format, request_id, params).await,
        Commands::Status { request_id } => {
            let service = Service::connect(&config).await?;
            let status = get_status(&service.context(), &request_id).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Commands::ServeQueue { no_reconcile } => serve_queue(&config, no_reconcile).await,
        Commands::Reconcile => {
            let service = Service::connect(&config).await?;
            let report = Reconciler::new(service.context()).reconcile_once().await?;
            println!(
                "Scanned {} requests, retriggered {}",
                report.scanned,
                report.retriggered.len()
            );
            for request_id in report.retriggered {
                println!("  {request_id}");
            }
            Ok(())
        }
        Commands::Invoke {
            stage,
            payload,
            local,
        } => invoke(&config, &stage, &payload, local).await,
        Commands::Abort { request_id } => {
            let service = Service::connect(&config).await?;
            service.context().ledger.abort(&request_id).await?;
            println!("Request {request_id} aborted");
            Ok(())
        }
        Commands::CompleteConversion {
            request_id,
            job_id,
            location,
        } => {
            let service = Service::connect(&config).await?;
            complete_conversion(&service.context(), &request_id, &job_id, &location).await?;
            println!("Request {request_id} converted to {location}");
            Ok(())
        }
    }
}

async fn load_config(path: Option<&Path>) -> anyhow::Result<ServiceConfig> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = path {
        loader = loader.with_file(path);
    }
    loader.load().await.context("Failed to load configuration")
}

/// Store clients plus the queue conversion jobs are sent to
struct Service {
    config: ServiceConfig,
    clients: StoreClients,
    conversions: Arc<dyn MessageQueue>,
}

impl Service {
    async fn connect(config: &ServiceConfig) -> anyhow::Result<Self> {
        let queue_name = &config.orchestrator.queue_name;
        let clients = StorageFactory::from_config(&config.backend, queue_name)
            .await
            .context("Failed to connect to storage backends")?;
        let conversions =
            StorageFactory::message_queue(&config.backend.queue, &format!("{queue_name}-converter"))
                .await
                .context("Failed to connect to conversion queue")?;
        Ok(Self {
            config: config.clone(),
            clients,
            conversions,
        })
    }

    fn invoker(&self) -> Arc<dyn Invoker> {
        Arc::new(QueueInvoker::new(
            self.clients.queue.clone(),
            self.conversions.clone(),
        ))
    }

    fn context_with(&self, invoker: Arc<dyn Invoker>) -> StageContext {
        StageContext::new(
            self.clients.kv.clone(),
            self.clients.objects.clone(),
            Arc::new(CsvSource::new(self.clients.objects.clone())),
            invoker,
            &self.config,
        )
    }

    /// Context whose triggers go to the queue
    fn context(&self) -> StageContext {
        self.context_with(self.invoker())
    }

    fn local_runtime(&self) -> LocalRuntime {
        LocalRuntime::new(|invoker| self.context_with(invoker))
    }
}

async fn run_local(
    config: &ServiceConfig,
    files: Vec<PathBuf>,
    mut refs: Vec<String>,
    format: String,
    request_id: Option<String>,
    params: Option<String>,
) -> anyhow::Result<()> {
    let service = Service::connect(config).await?;

    for file in &files {
        let name = file
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("Invalid input path {}", file.display()))?;
        let body = tokio::fs::read(file)
            .await
            .with_context(|| format!("Failed to read {}", file.display()))?;
        let key = format!("inputs/{name}");
        service.clients.objects.put(&key, body).await?;
        info!("Uploaded {} as {}", file.display(), key);
        refs.push(key);
    }
    if refs.is_empty() {
        bail!("No inputs given; pass CSV files or --ref keys");
    }

    let params = match params {
        Some(raw) => serde_json::from_str(&raw).context("--params must be valid JSON")?,
        None => Value::Null,
    };
    let request_id = request_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let mut runtime = service.local_runtime();
    runtime
        .submit(&DriverPayload {
            request_id: request_id.clone(),
            input_refs: refs,
            format,
            params,
        })
        .await?;
    let report = runtime.run_until_idle().await;
    info!(
        "Handled {} triggers with {} failures",
        report.invocations,
        report.failures.len()
    );
    for (stage, message) in &report.failures {
        error!("{} failed: {}", stage, message);
    }
    for conversion in &report.conversions {
        println!("Conversion job: {}", conversion.payload);
    }

    let status = get_status(runtime.context(), &request_id).await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn serve_queue(config: &ServiceConfig, no_reconcile: bool) -> anyhow::Result<()> {
    let service = Service::connect(config).await?;
    let ctx = service.context();
    let consumer = QueueConsumer::new(service.clients.queue.clone(), Dispatcher::new(ctx.clone()));

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
    };

    if no_reconcile {
        consumer.run(shutdown).await;
    } else {
        let reconciler = Reconciler::new(ctx);
        let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        let reconcile = async {
            let mut stop_rx = stop_rx;
            reconciler
                .run(async move {
                    let _ = stop_rx.changed().await;
                })
                .await
        };
        let consume = async {
            consumer.run(shutdown).await;
            let _ = stop_tx.send(true);
        };
        tokio::join!(consume, reconcile);
    }
    Ok(())
}

async fn read_payload(path: &Path) -> anyhow::Result<Value> {
    let content = if path == Path::new("-") {
        let mut buf = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut tokio::io::stdin(), &mut buf).await?;
        buf
    } else {
        tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read payload {}", path.display()))?
    };
    // YAML is a superset of JSON
    serde_yaml::from_str(&content).context("Payload is neither YAML nor JSON")
}

async fn invoke(
    config: &ServiceConfig,
    stage: &str,
    payload_path: &Path,
    local: bool,
) -> anyhow::Result<()> {
    let stage: Stage = stage.parse().map_err(anyhow::Error::msg)?;
    if stage == Stage::Converter {
        bail!("converter jobs are emitted by the reducer, not invoked directly");
    }
    let payload = read_payload(payload_path).await?;
    let service = Service::connect(config).await?;

    if local {
        let mut runtime = service.local_runtime();
        runtime.context().invoker.invoke(stage.as_str(), payload).await?;
        let report = runtime.run_until_idle().await;
        println!(
            "Handled {} triggers, {} failed",
            report.invocations,
            report.failures.len()
        );
        for (stage, message) in report.failures {
            println!("  {stage}: {message}");
        }
    } else {
        service.invoker().invoke(stage.as_str(), payload).await?;
        println!("Queued {stage} trigger");
    }
    Ok(())
}

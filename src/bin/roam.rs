//! roam CLI: gateway, workers, the child execution mode, and a job client.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use tokio_util::sync::CancellationToken;
use tracing::info;

use roam::broker::{JobQueue, MemoryBroker, ResultChannel, StatusStore};
use roam::client::{DEFAULT_BASE_URL, RemoteEnv};
use roam::config::Config;
use roam::db::Db;
use roam::engine::sandbox::DEFAULT_SANDBOX_TIMEOUT;
use roam::engine::{
    Dispatcher, ExecutionBackend, HttpSandboxApi, ProcessBackend, Reaper, SandboxBackend,
    WorkerConfig, WorkerPool, child,
};
use roam::gateway::{AppState, router};
use roam::model::JobId;
use roam::payload::{FunctionRef, Payload, PayloadBuilder};
use roam::registry::builtin;
use roam::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "roam", version, about = "Run registered functions on another machine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway and a worker pool in one process
    Serve,
    /// Run only the HTTP gateway (requires DATABASE_URL)
    Gateway,
    /// Run only a worker pool (requires DATABASE_URL)
    Worker,
    /// Execute one payload from ROAM_PAYLOAD or stdin and print its outcome
    #[command(hide = true)]
    Exec,
    /// List the functions this binary can execute
    Functions,
    /// Job client operations
    Job {
        /// Gateway base URL
        #[arg(long, global = true, default_value = DEFAULT_BASE_URL)]
        url: String,
        #[command(subcommand)]
        action: JobAction,
    },
}

#[derive(Subcommand)]
enum JobAction {
    /// Submit a job and print its id and stream URL
    Submit(CallArgs),
    /// Show a job's status
    Status {
        /// Job ID (full UUID)
        id: String,
    },
    /// Submit a job, wait for it, and print its return value
    Call {
        #[command(flatten)]
        call: CallArgs,
        /// Seconds to wait for the outcome
        #[arg(long, default_value_t = 300)]
        wait: u64,
    },
}

#[derive(clap::Args)]
struct CallArgs {
    /// Registered function name
    function: String,
    /// Positional arguments as a JSON array
    #[arg(long)]
    args: Option<String>,
    /// Keyword arguments as a JSON object
    #[arg(long)]
    kwargs: Option<String>,
    /// Read the return value from this binding instead of the return
    #[arg(long)]
    slot: Option<String>,
}

fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // The child mode owns stdout and must not start telemetry or a runtime.
    if let Command::Exec = cli.command {
        return Ok(child::run(&builtin::standard()));
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(cli.command))?;
    Ok(ExitCode::SUCCESS)
}

async fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Serve => cmd_serve(true, true).await,
        Command::Gateway => cmd_serve(true, false).await,
        Command::Worker => cmd_serve(false, true).await,
        Command::Exec => anyhow::bail!("exec runs before the async runtime starts"),
        Command::Functions => {
            for name in builtin::standard().names() {
                println!("{name}");
            }
            Ok(())
        }
        Command::Job { url, action } => match action {
            JobAction::Submit(call) => cmd_job_submit(&url, call).await,
            JobAction::Status { id } => cmd_job_status(&url, id).await,
            JobAction::Call { call, wait } => cmd_job_call(&url, call, wait).await,
        },
    }
}

/// Queue, store, and channel shared by every component in this process.
struct Broker {
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn StatusStore>,
    channel: Arc<dyn ResultChannel>,
}

async fn connect_broker(config: &Config, require_db: bool) -> anyhow::Result<Broker> {
    match &config.database_url {
        Some(url) => {
            let db = Db::connect(url.expose_secret())
                .await?
                .with_retention(config.result_retention)
                .with_max_depth(config.max_queue_depth);
            db.migrate().await?;
            db.health_check().await?;
            info!("using postgres broker");
            let db = Arc::new(db);
            Ok(Broker {
                queue: db.clone(),
                store: db.clone(),
                channel: db,
            })
        }
        None if require_db => {
            anyhow::bail!("DATABASE_URL is required when gateway and workers run separately")
        }
        None => {
            let mut memory = MemoryBroker::new().with_retention(config.result_retention);
            if let Some(depth) = config.max_queue_depth {
                memory = memory.with_max_depth(depth);
            }
            info!("using in-memory broker");
            let memory = Arc::new(memory);
            Ok(Broker {
                queue: memory.clone(),
                store: memory.clone(),
                channel: memory,
            })
        }
    }
}

fn execution_backend(config: &Config) -> anyhow::Result<(Arc<dyn ExecutionBackend>, Duration)> {
    match &config.sandbox {
        Some(sandbox) => {
            info!(url = %sandbox.url, image = %sandbox.image, "using sandbox backend");
            let api = HttpSandboxApi::new(sandbox.url.clone(), sandbox.token.clone())?;
            Ok((
                Arc::new(SandboxBackend::new(api, sandbox.image.clone())),
                DEFAULT_SANDBOX_TIMEOUT,
            ))
        }
        None => {
            let backend = ProcessBackend::current_exe()
                .context("cannot locate the roam binary for child execution")?
                .with_timeout(config.exec_timeout);
            Ok((Arc::new(backend), config.exec_timeout))
        }
    }
}

async fn cmd_serve(gateway: bool, workers: bool) -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "roam".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let broker = connect_broker(&config, !(gateway && workers)).await?;
    let (backend, max_exec) = execution_backend(&config)?;
    let shutdown = CancellationToken::new();

    let mut tasks = tokio::task::JoinSet::new();

    if workers {
        let pool = WorkerPool::new(
            broker.queue.clone(),
            broker.store.clone(),
            broker.channel.clone(),
            backend,
            WorkerConfig {
                workers: config.workers,
                ..WorkerConfig::default()
            },
        );
        let stopping = pool.clone();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            stop.cancelled().await;
            stopping.shutdown();
        });
        tasks.spawn(async move { pool.run().await.map_err(anyhow::Error::from) });
    }

    if gateway {
        let reaper = Arc::new(Reaper::new(
            broker.store.clone(),
            broker.channel.clone(),
            max_exec + Duration::from_secs(60),
        ));
        let stopping = reaper.clone();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            stop.cancelled().await;
            stopping.shutdown();
        });
        tasks.spawn(async move {
            reaper.run().await;
            Ok(())
        });

        let app = router(AppState {
            dispatcher: Dispatcher::new(broker.queue.clone(), broker.store.clone()),
            store: broker.store.clone(),
            channel: broker.channel.clone(),
            stream_timeout: config.stream_timeout,
        });
        let listener = tokio::net::TcpListener::bind(config.bind_addr)
            .await
            .with_context(|| format!("cannot bind {}", config.bind_addr))?;
        info!(addr = %listener.local_addr()?, "gateway listening");
        let stop = shutdown.clone();
        tasks.spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await
                .map_err(anyhow::Error::from)
        });
    }

    let stop = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown requested");
        stop.cancel();
    });

    while let Some(joined) = tasks.join_next().await {
        joined??;
    }
    Ok(())
}

fn build_payload(call: CallArgs) -> anyhow::Result<Payload> {
    let mut builder = PayloadBuilder::new(FunctionRef::new(call.function));
    if let Some(args) = call.args {
        let args: Vec<serde_json::Value> =
            serde_json::from_str(&args).context("--args must be a JSON array")?;
        for arg in &args {
            builder = builder.arg(arg);
        }
    }
    if let Some(kwargs) = call.kwargs {
        let kwargs: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(&kwargs).context("--kwargs must be a JSON object")?;
        for (name, value) in &kwargs {
            builder = builder.kwarg(name.clone(), value);
        }
    }
    if let Some(slot) = call.slot {
        builder = builder.bind_result(slot);
    }
    Ok(builder.build()?)
}

async fn cmd_job_submit(url: &str, call: CallArgs) -> anyhow::Result<()> {
    let payload = build_payload(call)?;
    let job = RemoteEnv::new(url).submit(&payload).await?;
    println!("Submitted: {}", job.job_id);
    println!("Stream:    {}{}", url.trim_end_matches('/'), job.stream_url);
    Ok(())
}

async fn cmd_job_status(url: &str, id: String) -> anyhow::Result<()> {
    let job_id: JobId = id.parse()?;
    let status = RemoteEnv::new(url).status(job_id).await?;

    println!("ID:       {}", status.job_id);
    println!("Status:   {}", status.status);
    if let Some(ref outcome) = status.result {
        println!("---");
        println!(
            "Outcome:  {}",
            if outcome.success { "success" } else { "failure" }
        );
        if let Some(ref value) = outcome.return_value {
            println!("Return:   {}", serde_json::to_string_pretty(value)?);
        }
        if !outcome.stdout.is_empty() {
            println!("Stdout:\n{}", outcome.stdout);
        }
        if let Some(ref err) = outcome.error {
            println!("Error:    {err}");
        }
        println!("Duration: {}ms", outcome.duration_ms);
    }
    Ok(())
}

async fn cmd_job_call(url: &str, call: CallArgs, wait: u64) -> anyhow::Result<()> {
    let payload = build_payload(call)?;
    let env = RemoteEnv::new(url).with_wait_timeout(Duration::from_secs(wait));
    let value = env.call(payload).await?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

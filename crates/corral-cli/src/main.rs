//! # corral CLI entry point
//!
//! ## Usage
//!
//! ```bash
//! # Register an instance of "orders" by hand
//! corral register orders --ip 10.0.0.5 --port 9001
//!
//! # Show every registered instance, or one service's
//! corral list
//! corral list orders
//!
//! # Resolve a service the way clients do
//! corral resolve orders
//!
//! # Call a method (outputs raw JSON)
//! corral call orders get_order '{"id": 7}'
//!
//! # Run a registered echo service with at most 8 concurrent requests
//! corral serve echo --advertise-ip 10.0.0.5 --max-concurrent 8
//! ```
//!
//! The registry defaults to `CORRAL_REGISTRY_URLS`, then `http://127.0.0.1:2379`.

use std::net::IpAddr;
use std::time::Duration;

use anyhow::Result;
use argh::FromArgs;
use corral_client::{resolve_addresses, AppContext, ClientConfig};
use corral_common::transport::TcpServer;
use corral_common::{AdmissionConfig, AdmissionController, Request, Shutdown};
use corral_cli::serve::{run_serve, EchoService};
use corral_cli::{connect_registry, parse_json_args};
use corral_registry::{Registry, ServiceKind};

#[derive(FromArgs)]
/// corral - service discovery and client-side load balancing
struct Cli {
    /// comma-separated registry URLs
    #[argh(option)]
    registry: Option<String>,

    /// registry cluster segment (default "load-balance")
    #[argh(option)]
    cluster: Option<String>,

    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Register(RegisterArgs),
    Deregister(DeregisterArgs),
    List(ListArgs),
    Resolve(ResolveArgs),
    Call(CallArgs),
    Serve(ServeArgs),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "register")]
/// register a service instance
struct RegisterArgs {
    /// service name
    #[argh(positional)]
    service: String,

    /// instance IP address
    #[argh(option)]
    ip: IpAddr,

    /// instance port; 0 picks one from 50000..60000
    #[argh(option, default = "0")]
    port: u16,

    /// instance kind, rpc or http
    #[argh(option, default = "ServiceKind::Rpc")]
    kind: ServiceKind,

    /// version string stored with the record
    #[argh(option, default = "String::new()")]
    version: String,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "deregister")]
/// remove a registered instance
struct DeregisterArgs {
    /// service name
    #[argh(positional)]
    service: String,

    /// instance sequence, as printed by register
    #[argh(positional)]
    sequence: String,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "list")]
/// list registered instances
struct ListArgs {
    /// only list this service
    #[argh(positional)]
    service: Option<String>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "resolve")]
/// resolve a service to its current address set
struct ResolveArgs {
    /// service name
    #[argh(positional)]
    service: String,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// call a method on a service
struct CallArgs {
    /// service name
    #[argh(positional)]
    service: String,

    /// method to call
    #[argh(positional)]
    method: String,

    /// JSON arguments
    #[argh(positional, default = "\"{}\".into()")]
    args: String,

    /// call timeout in milliseconds
    #[argh(option, long = "timeout-ms")]
    timeout_ms: Option<u64>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// run a registered echo service
struct ServeArgs {
    /// service name to register under
    #[argh(positional)]
    service: String,

    /// address to bind to
    #[argh(option, short = 'b', default = "\"0.0.0.0:0\".into()")]
    bind: String,

    /// IP address to register
    #[argh(option, long = "advertise-ip", default = "IpAddr::from([127, 0, 0, 1])")]
    advertise_ip: IpAddr,

    /// version string stored with the record
    #[argh(option, default = "String::new()")]
    version: String,

    /// maximum concurrent requests; 0 disables admission control
    #[argh(option, long = "max-concurrent", default = "0")]
    max_concurrent: usize,

    /// maximum queued requests; 0 rejects as soon as all tickets are taken
    #[argh(option, long = "max-wait-num", default = "0")]
    max_wait_num: usize,

    /// how long a queued request may wait, in milliseconds
    #[argh(option, long = "max-wait-ms", default = "5000")]
    max_wait_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Keep `call` output clean for piping.
    if !matches!(cli.command, Commands::Call(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let registry = connect_registry(cli.registry.as_deref(), cli.cluster.as_deref())?;

    match cli.command {
        Commands::Register(args) => {
            let registration = registry
                .service(args.service)
                .register(args.ip, args.port, args.kind, &args.version)
                .await?;
            println!("{}", registration.sequence);
            Ok(())
        }
        Commands::Deregister(args) => {
            registry.service(args.service).deregister(&args.sequence).await?;
            Ok(())
        }
        Commands::List(args) => {
            let configs = match &args.service {
                Some(service) => registry.get_configs(service).await?,
                None => registry.list_configs().await?,
            };
            println!("{}", serde_json::to_string_pretty(&configs)?);
            Ok(())
        }
        Commands::Resolve(args) => {
            let addresses = resolve_addresses(&registry.service(args.service), 3).await?;
            for address in addresses.iter() {
                println!("{}", address.addr);
            }
            Ok(())
        }
        Commands::Call(args) => run_call(registry, args).await,
        Commands::Serve(args) => run_serve_command(registry, args).await,
    }
}

async fn run_call(registry: Registry, args: CallArgs) -> Result<()> {
    let call_args = parse_json_args(&args.args)?;
    let ctx = AppContext::new(registry, ClientConfig::default(), Shutdown::new())?;

    let mut request = Request::new(args.method, call_args);
    if let Some(timeout_ms) = args.timeout_ms {
        request = request.with_timeout(timeout_ms);
    }

    let result = async {
        let channel = ctx.connection(&args.service).await?;
        channel.invoke(request).await
    }
    .await;
    ctx.close().await;

    println!("{}", serde_json::to_string(&result?)?);
    Ok(())
}

async fn run_serve_command(registry: Registry, args: ServeArgs) -> Result<()> {
    let shutdown = Shutdown::new();

    let admission_config = AdmissionConfig::hard_cap(args.max_concurrent)
        .with_queue(args.max_wait_num, Duration::from_millis(args.max_wait_ms));
    let admission = AdmissionController::new(admission_config, shutdown.clone())?;

    let server = TcpServer::bind(&args.bind).await?;
    tracing::info!(service = %args.service, addr = %server.local_addr()?, "serving echo");

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
        }
        tracing::info!("shutting down");
        signal.trigger();
    });

    let echo = EchoService::new(&args.service, admission.clone());
    let registration = run_serve(
        server,
        registry.service(args.service.clone()),
        args.advertise_ip,
        &args.version,
        echo,
        shutdown,
    )
    .await?;
    admission.close();

    tracing::info!(sequence = %registration.sequence, "deregistered");
    Ok(())
}

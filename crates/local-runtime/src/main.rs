#[cfg(feature = "cli")]
use clap::{Parser, Subcommand};
#[cfg(feature = "cli")]
use local_runtime::{backends, config::Config, run_server};

/// Local model-serving runtime.
#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(name = "local-runtime", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP API (the default).
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the models eligible on this machine, best first.
    Models,
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    local_runtime::telemetry::init_tracing();
    let mut cfg = Config::from_env()?;

    match cli.command.unwrap_or(Command::Serve { host: None, port: None }) {
        Command::Serve { host, port } => {
            if let Some(host) = host {
                cfg.api_host = host;
            }
            if let Some(port) = port {
                cfg.api_port = port;
            }
            run_server(cfg).await
        }
        Command::Models => {
            let loader = backends::build_loader(&cfg, cfg.environment())?;
            for model in loader.discover() {
                let spec = &model.spec;
                println!(
                    "{:<32} {:<10} {:<12} priority={}",
                    spec.id,
                    spec.kind.to_string(),
                    spec.api.advertised_model_name,
                    spec.compat.priority
                );
            }
            Ok(())
        }
    }
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use broadcast_chat::{
    client,
    cli::{Cli, Command},
    server::ChatServer,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => {
            let server = ChatServer::new();
            let addr = server
                .start(args.listen)
                .await
                .with_context(|| format!("failed to start server on {}", args.listen))?;
            info!("server listening on {}", addr);
            server.run_until_ctrl_c().await;
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}

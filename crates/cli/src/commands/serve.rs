//! UI server with a live runner behind it

use clap::Args;
use creevey_common::Request;
use creevey_web::WebServer;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use super::{build_runner, load_config, ConfigOverrides};
use crate::output;

#[derive(Args)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ConfigOverrides,

    /// Bind address
    #[arg(long, default_value = "127.0.0.1")]
    pub host: IpAddr,

    /// Port, defaults to the configured one
    #[arg(short, long, env = "CREEVEY_PORT")]
    pub port: Option<u16>,

    /// Run workers as tasks of this process instead of child processes
    #[arg(long)]
    pub in_process: bool,

    /// Start running every test right away
    #[arg(long)]
    pub run: bool,
}

pub async fn execute(args: ServeArgs, config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path, &args.overrides)?;
    let addr = SocketAddr::new(args.host, args.port.unwrap_or(config.port));
    let runner = Arc::new(build_runner(config, args.in_process)?);
    for e in runner.compile_errors() {
        output::print_warning(e);
    }

    if args.run {
        runner.handle(Request::Start(Vec::new()))?;
    }

    output::print_info(&format!("Creevey is ready at http://{}", addr));
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutting down");
    };
    WebServer::new(Arc::clone(&runner))
        .serve_with_shutdown(addr, shutdown)
        .await?;

    // let running workers report and release their browser sessions
    runner.stop();
    runner.wait().await;
    Ok(())
}

use std::net::SocketAddr;

use clap::Parser;
use opthub_core::Config;
use opthub_server::init_logging;
use opthub_server::run_main;

#[derive(Debug, Parser)]
#[command(name = "opthub-server", about = "Optimization job execution service")]
struct ServerArgs {
    /// Address to listen on.
    #[arg(long = "listen", value_name = "ADDR", default_value = "127.0.0.1:8080")]
    listen: SocketAddr,
}

fn main() -> anyhow::Result<()> {
    let args = ServerArgs::parse();
    init_logging();
    let config = Config::from_env();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run_main(args.listen, config))
}

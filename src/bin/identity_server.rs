//! peerdoc-identity: issues actor ids and keeps the peer address directory

use clap::Parser;

use peerdoc::identity::server::{new_state, routes};

#[derive(Parser)]
#[command(name = "peerdoc-identity")]
#[command(about = "Identity and rendezvous service for peerdoc replicas")]
struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value = "4000")]
    port: u16,

    /// Listen on every interface instead of loopback only
    #[arg(long)]
    public: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let host: [u8; 4] = if cli.public { [0, 0, 0, 0] } else { [127, 0, 0, 1] };
    log::info!("identity service on {}.{}.{}.{}:{}", host[0], host[1], host[2], host[3], cli.port);
    warp::serve(routes(new_state())).run((host, cli.port)).await;
    Ok(())
}

use agent_bridge_lib::config::{BridgeConfig, DEFAULT_LOG_FILTER, ENV_LOG};
use agent_bridge_lib::runtime::server;

fn main() {
    // stdout carries the protocol, so logs go to stderr
    env_logger::Builder::from_env(env_logger::Env::new().filter_or(ENV_LOG, DEFAULT_LOG_FILTER))
        .target(env_logger::Target::Stderr)
        .init();

    let config = BridgeConfig::from_env();
    log::info!(
        "Starting agent-bridge-worker {} (pid={})",
        env!("CARGO_PKG_VERSION"),
        std::process::id()
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to start async runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(server::run_stdio(config)) {
        log::error!("Worker stopped with error: {e}");
        std::process::exit(1);
    }
    log::info!("Input closed; worker exiting");
}

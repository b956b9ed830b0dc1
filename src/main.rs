use vpn_fleet::config_io::{config_path_from_env, load_config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = config_path_from_env();
    let cfg = load_config(&path).await?;

    vpn_fleet::config::init_tracing(&cfg);
    tracing::info!(config = %path, "vpn-fleet gateway booted");

    tokio::select! {
        res = vpn_fleet::gateway::serve(cfg) => res?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
        }
    }
    Ok(())
}

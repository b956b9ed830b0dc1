use vpn_fleet::config_io::{config_path_from_env, load_or_create_config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = config_path_from_env();
    // Workers only read their own section; fleet pairing is the gateway's concern.
    let mut cfg = load_or_create_config(&path).await?;
    cfg.apply_env_overrides();
    cfg.worker.output_dir = cfg.worker_output_dir().display().to_string();

    vpn_fleet::config::init_tracing(&cfg);
    tracing::info!(worker = %cfg.worker.id, "vpn-worker booted");

    tokio::select! {
        res = vpn_fleet::worker::serve(&cfg.worker) => res?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
        }
    }
    Ok(())
}

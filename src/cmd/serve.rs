//! Control API server: `evolve serve`.

use anyhow::Result;

use evolve::config::Config;
use evolve::server::{ServerConfig, start_server};

pub async fn cmd_serve(
    config: Config,
    port: Option<u16>,
    host: Option<String>,
    dev: bool,
) -> Result<()> {
    let mut server = ServerConfig::from_config(&config);
    if let Some(port) = port {
        server.port = port;
    }
    if let Some(host) = host {
        server.host = host;
    }
    server.permissive_cors = dev;

    start_server(&config, server).await
}

//! Run a driver against a serial-over-TCP bridge and print what happens

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use zwrust::{Driver, DriverConfig, Notification, TcpTransport};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Change to your bridge address
    let host = std::env::var("ZWAVE_HOST").unwrap_or_else(|_| "192.168.1.50".to_string());
    let port = std::env::var("ZWAVE_PORT")
        .ok()
        .map(|p| p.parse())
        .transpose()
        .context("ZWAVE_PORT is not a port number")?
        .unwrap_or(zwrust_core::DEFAULT_TCP_PORT);

    let config = match std::env::var("ZWAVE_CONFIG") {
        Ok(path) => {
            let json = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path))?;
            DriverConfig::from_json(&json)?
        }
        Err(_) => DriverConfig::default().with_state_dir("zwave-state"),
    };

    let mut driver = Driver::new(config)?;
    let mut notifications = driver.take_notifications().context("notifications already taken")?;

    println!("Connecting to {}:{}...", host, port);
    driver.start(TcpTransport::new(host, port))?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            notification = notifications.recv() => match notification {
                Some(Notification::AllNodesQueried { home_id }) => {
                    println!("Network 0x{:08X} ready", home_id);
                }
                Some(notification) => println!("{}", notification),
                None => break,
            },
        }
    }

    driver.stop().await?;
    println!("Stopped");
    Ok(())
}

//! Toggle every binary switch once the network has been queried

use std::time::Duration;
use tokio::time::sleep;
use zwrust::{Driver, DriverConfig, Notification, TcpTransport, ValueData, ValueGenre};

const SWITCH_BINARY: u8 = 0x25;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let host = std::env::var("ZWAVE_HOST").unwrap_or_else(|_| "192.168.1.50".to_string());

    let mut driver = Driver::new(DriverConfig::default())?;
    let mut notifications = driver.take_notifications().expect("first call");
    driver.start(TcpTransport::new(host, 4001))?;

    while let Some(notification) = notifications.recv().await {
        if matches!(notification, Notification::AllNodesQueried { .. }) {
            break;
        }
    }

    let handle = driver.handle();
    for node_id in handle.node_ids() {
        let name = handle.with_node(node_id, |n| n.name().to_string()).unwrap_or_default();
        for value in handle.values(node_id) {
            let id = value.id();
            if id.command_class_id != SWITCH_BINARY || id.genre != ValueGenre::User {
                continue;
            }
            let on = matches!(value.data(), ValueData::Bool(true));
            println!("Node {} {:?}: switching {}", node_id, name, if on { "off" } else { "on" });
            handle.set_value(&id, ValueData::Bool(!on))?;
        }
    }

    // Give the queue time to drain before stopping
    sleep(Duration::from_secs(5)).await;
    driver.stop().await?;
    Ok(())
}

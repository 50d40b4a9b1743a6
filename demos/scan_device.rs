//! Discovers a device, prints its layout and polls it.
//!
//! # Usage
//!
//! Discovery and polling only:
//! ```sh
//! cargo run --example scan_device -- 192.168.0.14 sec
//! ```
//!
//! With the push endpoint on port 8080 (configure the device to call
//! `http://<this host>:8080/mega`):
//! ```sh
//! cargo run --example scan_device --features web -- 192.168.0.14 sec 0.0.0.0:8080
//! ```
//!
//! Log verbosity follows `RUST_LOG`, e.g. `RUST_LOG=rs_megad=debug`.

use std::sync::Arc;

use anyhow::{bail, Context};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use rs_megad::hal::ReqwestTransport;
use rs_megad::{Config, DeviceConfig, DeviceHandle, EntityDescriptor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rs_megad=info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let host = args.next().context("usage: scan_device <host> <secret> [listen addr]")?;
    let secret = args.next().unwrap_or_else(|| "sec".to_string());
    let listen = args.next();

    let config = Config::new(DeviceConfig::new(host, secret));
    let device = Arc::new(DeviceHandle::new(ReqwestTransport::new()?, config));

    if !device.authenticate().await? {
        bail!("device rejected the secret");
    }
    println!("MQTT id: {}", device.mqtt_id().await?);

    let layout = device.discover().await;
    for port in &layout.ports {
        let entities: Vec<String> = port
            .entities
            .iter()
            .map(|e| match e {
                EntityDescriptor::BinarySensor => "binary sensor".to_string(),
                EntityDescriptor::Output {
                    dimmable: false, ..
                } => "switch".to_string(),
                EntityDescriptor::Output { max_value, .. } => format!("dimmer 0..{max_value}"),
                EntityDescriptor::Sensor(channel) => {
                    format!("{} ({})", channel.suffix, channel.kind.unit())
                }
            })
            .collect();
        println!("{:>8}  {:<28}  {}", port.id, format!("{:?}", port.config), entities.join(", "));
    }

    let token = CancellationToken::new();
    device.start();

    #[cfg(feature = "web")]
    if let Some(addr) = listen {
        let addr = addr.parse().context("invalid listen address")?;
        tokio::spawn(rs_megad::services::run_server(
            Arc::clone(&device),
            addr,
            token.clone(),
        ));
    }
    #[cfg(not(feature = "web"))]
    if listen.is_some() {
        eprintln!("push endpoint needs the `web` feature; ignoring listen address");
    }

    tokio::signal::ctrl_c().await?;
    token.cancel();
    device.stop();

    for (port, value) in device.store().snapshot() {
        println!("{port:>8} = {value}");
    }
    Ok(())
}

// ABOUTME: Voxspace server binary
// ABOUTME: Standalone voice server that logs client activity until Ctrl+C

use clap::Parser;
use std::sync::Arc;
use voxspace::server::{ServerArgs, VoiceServer};

#[derive(Parser, Debug)]
#[command(name = "voxspace-server")]
#[command(author, version, about = "Positional voice chat server", long_about = None)]
struct Args {
    #[command(flatten)]
    server: ServerArgs,
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    // Initialize tracing
    args.server.init_tracing();

    // Log startup info
    args.server.log_startup_info();

    let server = Arc::new(VoiceServer::new());

    server.register_client_connected(|handle| tracing::info!("Client {} connected", handle));
    server.register_client_disconnected(|handle| {
        tracing::info!("Client {} disconnected", handle)
    });
    server.register_client_rejected(|request, reason| {
        tracing::info!(
            "Rejected connection from {:?} ({:?})",
            request.peer_addr,
            reason
        )
    });
    server.register_client_talking_changed(|handle, talking| {
        tracing::debug!("Client {} talking: {}", handle, talking)
    });

    server.create(args.server.build_config())?;
    server.start()?;

    if let Some(addr) = server.local_addr() {
        tracing::info!("Listening on ws://{}{}", addr, args.server.path);
    }

    let report = Arc::clone(&server);
    std::thread::Builder::new()
        .name("voxspace-report".to_string())
        .spawn(move || loop {
            std::thread::sleep(std::time::Duration::from_secs(5));
            let handles = report.client_handles(64);
            if !handles.is_empty() {
                tracing::info!("Connected clients: {}", report.client_count());
                for handle in handles {
                    let nickname = report.client_nickname(handle).unwrap_or_default();
                    tracing::info!("  - {} {:?}", handle, nickname);
                }
            }
        })?;

    tracing::info!("Press Ctrl+C to stop");

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(tokio::signal::ctrl_c())?;

    tracing::info!("Shutting down");
    server.destroy();
    Ok(())
}

// src/network/bootstrap.rs

use std::time::Duration;

use crate::events::model::LogLevel;
use crate::network::events::emit_network_event;
use crate::network::tcp::PresenceContext;
use crate::network::transport::connect_to_peer;

const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Keep a connection to each bootstrap address, redialing while it is absent.
pub(crate) fn connect_to_bootstrap_nodes(ctx: PresenceContext, peers: &[String]) {
    if peers.is_empty() {
        emit_network_event(
            "bootstrap",
            LogLevel::Debug,
            "bootstrap_nodes_missing",
            None,
            Some("source=config".to_string()),
            ctx.allow_console,
        );
        return;
    }
    for addr in peers {
        if *addr == ctx.listen_addr {
            continue;
        }
        let addr = addr.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let mut shutdown = ctx.shutdown.clone();
            loop {
                if ctx.is_shutting_down() {
                    break;
                }
                // Suppress the dial while a node advertising this address is connected
                if !ctx.peer_manager.has_listen_addr(&addr) {
                    match connect_to_peer(ctx.clone(), addr.clone()).await {
                        Ok(_) => {
                            emit_network_event(
                                "bootstrap",
                                LogLevel::Info,
                                "bootstrap_connect_success",
                                Some(addr.clone()),
                                None,
                                ctx.allow_console,
                            );
                        }
                        Err(e) => {
                            emit_network_event(
                                "bootstrap",
                                LogLevel::Debug,
                                "bootstrap_connect_failed",
                                Some(addr.clone()),
                                Some(e.to_string()),
                                ctx.allow_console,
                            );
                        }
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(RETRY_INTERVAL) => {}
                    _ = shutdown.changed() => break,
                }
            }
        });
    }
}

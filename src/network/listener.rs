// src/network/listener.rs

use tokio::net::TcpListener;

use crate::events::model::LogLevel;
use crate::network::events::emit_network_event;
use crate::network::tcp::PresenceContext;
use crate::network::transport::{establish_session, Direction};

fn log_network_event(
    level: LogLevel,
    action: &str,
    addr: Option<String>,
    detail: Option<String>,
    allow_console: bool,
) {
    emit_network_event("listener", level, action, addr, detail, allow_console);
}

/// Accept presence connections until shutdown.
pub(crate) async fn start_listener(listener: TcpListener, ctx: PresenceContext) {
    let local = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();
    log_network_event(
        LogLevel::Info,
        "listener_bind",
        Some(local),
        None,
        ctx.allow_console,
    );
    let mut shutdown = ctx.shutdown.clone();
    loop {
        let accepted = tokio::select! {
            r = listener.accept() => r,
            _ = shutdown.changed() => break,
        };
        match accepted {
            Ok((stream, peer_addr)) => {
                log_network_event(
                    LogLevel::Debug,
                    "incoming_connection",
                    Some(peer_addr.to_string()),
                    None,
                    ctx.allow_console,
                );
                let ctx_clone = ctx.clone();
                tokio::spawn(async move {
                    let allow_console = ctx_clone.allow_console;
                    if let Err(e) =
                        establish_session(ctx_clone, stream, peer_addr, Direction::Inbound).await
                    {
                        log_network_event(
                            LogLevel::Debug,
                            "handshake_failed",
                            Some(peer_addr.to_string()),
                            Some(e.to_string()),
                            allow_console,
                        );
                    }
                });
            }
            Err(e) => {
                log_network_event(
                    LogLevel::Error,
                    "accept_failed",
                    None,
                    Some(e.to_string()),
                    ctx.allow_console,
                );
            }
        }
    }
}

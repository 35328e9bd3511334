// src/network/transport.rs

use futures_util::future::{BoxFuture, FutureExt};
use std::collections::BTreeSet;
use std::error::Error;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::constants::PROTOCOL_NAME;
use crate::events::model::LogLevel;
use crate::network::events::emit_network_event;
use crate::network::message::{Message, MessageType};
use crate::network::peer_manager::{ConnId, PeerInfo};
use crate::network::presence::PresenceEvent;
use crate::network::tcp::PresenceContext;

const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) type BoxError = Box<dyn Error + Send + Sync>;
type BoxedReader = Box<dyn AsyncBufRead + Unpin + Send>;
type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    /// We accepted the connection and speak first
    Inbound,
    /// We dialed and wait for the remote HELLO
    Outbound,
}

/// Dial a presence node and run the session in the background once the
/// handshake completed.
///
/// Boxed because sessions dial gossiped peers from inside their own receive loop.
pub(crate) fn connect_to_peer(
    ctx: PresenceContext,
    addr: String,
) -> BoxFuture<'static, Result<(), BoxError>> {
    async move {
        emit_network_event(
            "transport",
            LogLevel::Debug,
            "dial_start",
            Some(addr.clone()),
            None,
            ctx.allow_console,
        );
        let stream = TcpStream::connect(&addr).await?;
        let remote = stream.peer_addr()?;
        establish_session(ctx, stream, remote, Direction::Outbound).await
    }
    .boxed()
}

/// Exchange HELLOs, register the connection and spawn its receive loop.
pub(crate) async fn establish_session(
    ctx: PresenceContext,
    stream: TcpStream,
    remote: SocketAddr,
    direction: Direction,
) -> Result<(), BoxError> {
    let (read_half, write_half) = stream.into_split();
    let mut reader: BoxedReader = Box::new(BufReader::new(read_half));
    let mut writer: BoxedWriter = Box::new(write_half);

    let hello_line = format!("{}\n", ctx.hello().as_json());
    if direction == Direction::Inbound {
        writer.write_all(hello_line.as_bytes()).await?;
    }
    let mut line = String::new();
    let n = tokio::time::timeout(HELLO_TIMEOUT, reader.read_line(&mut line)).await??;
    if n == 0 {
        return Err("peer closed before HELLO".into());
    }
    let hello = Message::from_json(&line).ok_or("Failed to parse HELLO")?;
    let (node_id, name, listen_addr, protocol, headers, groups) = match hello.msg_type {
        MessageType::Hello {
            node_id,
            name,
            listen_addr,
            protocol,
            headers,
            groups,
            ..
        } => (node_id, name, listen_addr, protocol, headers, groups),
        _ => return Err("Expected HELLO".into()),
    };
    if node_id == ctx.node_id {
        emit_network_event(
            "transport",
            LogLevel::Debug,
            "self_connection_dropped",
            Some(remote.to_string()),
            None,
            ctx.allow_console,
        );
        return Err("connected to ourselves".into());
    }
    if let Some(p) = &protocol {
        if p != PROTOCOL_NAME {
            emit_network_event(
                "transport",
                LogLevel::Warn,
                "protocol_mismatch",
                Some(remote.to_string()),
                Some(format!("remote_protocol={}", p)),
                ctx.allow_console,
            );
            return Err(format!("unsupported protocol {}", p).into());
        }
    }
    if direction == Direction::Outbound {
        writer.write_all(hello_line.as_bytes()).await?;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let remote_str = remote.to_string();
    let allow_console = ctx.allow_console;
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = writer.write_all(msg.as_bytes()).await {
                emit_network_event(
                    "transport",
                    LogLevel::Warn,
                    "stream_write_failed",
                    Some(remote_str.clone()),
                    Some(e.to_string()),
                    allow_console,
                );
                break;
            }
            if let Err(e) = writer.write_all(b"\n").await {
                emit_network_event(
                    "transport",
                    LogLevel::Warn,
                    "stream_newline_failed",
                    Some(remote_str.clone()),
                    Some(e.to_string()),
                    allow_console,
                );
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let host = peer_ip(listen_addr.as_deref(), &remote);
    // Gossip the address peers can actually dial, not what was advertised.
    let listen_addr = listen_addr
        .and_then(|a| a.parse::<SocketAddr>().ok())
        .map(|a| SocketAddr::new(host, a.port()).to_string());
    let info = PeerInfo {
        node_id: node_id.clone(),
        name: name.clone(),
        address: host.to_string(),
        listen_addr,
        headers,
        groups: groups.iter().cloned().collect::<BTreeSet<_>>(),
    };
    let conn = ctx.peer_manager.next_conn_id();
    let first = ctx
        .peer_manager
        .add_connection(info.clone(), conn, tx.clone());
    emit_network_event(
        "transport",
        LogLevel::Info,
        "session_established",
        Some(remote.to_string()),
        Some(format!(
            "node_id={} name={} direction={:?} first={}",
            node_id, name, direction, first
        )),
        ctx.allow_console,
    );
    if first {
        ctx.emit(PresenceEvent::Enter {
            peer_id: node_id.clone(),
            name: name.clone(),
            address: info.address.clone(),
            headers: info.headers.clone(),
        });
        for group in &info.groups {
            ctx.emit(PresenceEvent::Join {
                peer_id: node_id.clone(),
                name: name.clone(),
                group: group.clone(),
            });
        }
        // Groups joined after our HELLO went out would otherwise be missed.
        let ours: Vec<String> = ctx.groups.lock().iter().cloned().collect();
        for group in ours {
            let _ = tx.send(ctx.line(MessageType::Join { group }, None));
        }
        if ctx.gossip {
            let peers = ctx.peer_manager.listen_addrs();
            ctx.peer_manager
                .broadcast(&ctx.line(MessageType::PeerList { peers }, None));
        }
    }
    tokio::spawn(receive_and_dispatch(ctx, reader, remote, info, conn));
    Ok(())
}

/// Host used to reach the peer: its advertised address, unless that is
/// unspecified or a loopback address seen from another machine.
fn peer_ip(listen_addr: Option<&str>, remote: &SocketAddr) -> IpAddr {
    listen_addr
        .and_then(|a| a.parse::<SocketAddr>().ok())
        .map(|a| a.ip())
        .filter(|ip| !ip.is_unspecified())
        .filter(|ip| !ip.is_loopback() || remote.ip().is_loopback())
        .unwrap_or_else(|| remote.ip())
}

async fn receive_and_dispatch(
    mut ctx: PresenceContext,
    mut reader: BoxedReader,
    addr: SocketAddr,
    peer: PeerInfo,
    conn: ConnId,
) {
    let mut line = String::new();
    loop {
        line.clear();
        let read = tokio::select! {
            r = reader.read_line(&mut line) => r,
            _ = ctx.shutdown.changed() => break,
        };
        match read {
            Ok(0) => {
                emit_network_event(
                    "transport",
                    LogLevel::Info,
                    "peer_disconnected",
                    Some(addr.to_string()),
                    Some(format!("node_id={}", peer.node_id)),
                    ctx.allow_console,
                );
                break;
            }
            Ok(_) => {
                let Some(msg) = Message::from_json(&line) else {
                    emit_network_event(
                        "transport",
                        LogLevel::Debug,
                        "message_unparsed",
                        Some(addr.to_string()),
                        Some(line.trim_end().to_string()),
                        ctx.allow_console,
                    );
                    continue;
                };
                if !dispatch(&ctx, &peer, addr, msg) {
                    break;
                }
            }
            Err(e) => {
                emit_network_event(
                    "transport",
                    LogLevel::Warn,
                    "peer_read_error",
                    Some(addr.to_string()),
                    Some(e.to_string()),
                    ctx.allow_console,
                );
                break;
            }
        }
    }
    if ctx.is_shutting_down() {
        return;
    }
    if let Some(info) = ctx.peer_manager.remove_connection(&peer.node_id, conn) {
        ctx.emit(PresenceEvent::Exit {
            peer_id: info.node_id,
            name: info.name,
        });
    }
}

/// Handle one control line; returns false when the session should end.
fn dispatch(ctx: &PresenceContext, peer: &PeerInfo, addr: SocketAddr, msg: Message) -> bool {
    match msg.msg_type {
        MessageType::Hello { .. } => {
            emit_network_event(
                "transport",
                LogLevel::Debug,
                "duplicate_hello_ignored",
                Some(addr.to_string()),
                None,
                ctx.allow_console,
            );
        }
        MessageType::Join { group } => {
            if let Some(name) = ctx.peer_manager.set_group(&peer.node_id, &group, true) {
                ctx.emit(PresenceEvent::Join {
                    peer_id: peer.node_id.clone(),
                    name,
                    group,
                });
            }
        }
        MessageType::Leave { group } => {
            if let Some(name) = ctx.peer_manager.set_group(&peer.node_id, &group, false) {
                ctx.emit(PresenceEvent::Leave {
                    peer_id: peer.node_id.clone(),
                    name,
                    group,
                });
            }
        }
        MessageType::Whisper => {
            if let Some(frames) = msg.payload.and_then(|p| p.into_frames()) {
                ctx.emit(PresenceEvent::Whisper {
                    peer_id: peer.node_id.clone(),
                    name: peer.name.clone(),
                    frames,
                });
            }
        }
        MessageType::Shout { group } => {
            if !ctx.groups.lock().contains(&group) {
                return true;
            }
            if let Some(frames) = msg.payload.and_then(|p| p.into_frames()) {
                ctx.emit(PresenceEvent::Shout {
                    peer_id: peer.node_id.clone(),
                    name: peer.name.clone(),
                    group,
                    frames,
                });
            }
        }
        MessageType::PeerList { peers } => {
            if !ctx.gossip {
                return true;
            }
            let mut dialed = 0usize;
            for p in peers {
                // Lower id dials so two nodes learning of each other do not cross-connect.
                if p.node_id == ctx.node_id
                    || ctx.node_id > p.node_id
                    || ctx.peer_manager.has_node_id(&p.node_id)
                    || ctx.peer_manager.has_listen_addr(&p.addr)
                {
                    continue;
                }
                dialed += 1;
                let ctx_clone = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = connect_to_peer(ctx_clone.clone(), p.addr.clone()).await {
                        emit_network_event(
                            "transport",
                            LogLevel::Debug,
                            "gossip_dial_failed",
                            Some(p.addr.clone()),
                            Some(e.to_string()),
                            ctx_clone.allow_console,
                        );
                    }
                });
            }
            emit_network_event(
                "transport",
                LogLevel::Debug,
                "peer_list_received",
                Some(addr.to_string()),
                Some(format!("dialed={}", dialed)),
                ctx.allow_console,
            );
        }
        MessageType::Heartbeat => {}
        MessageType::Disconnect => return false,
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_ip_prefers_advertised_address() {
        let remote: SocketAddr = "10.0.0.9:40000".parse().unwrap();
        assert_eq!(peer_ip(Some("192.168.1.4:5670"), &remote).to_string(), "192.168.1.4");
        assert_eq!(peer_ip(Some("0.0.0.0:5670"), &remote).to_string(), "10.0.0.9");
        assert_eq!(peer_ip(None, &remote).to_string(), "10.0.0.9");
    }

    #[test]
    fn loopback_advertised_by_remote_host_is_ignored() {
        let remote: SocketAddr = "10.0.0.5:5555".parse().unwrap();
        assert_eq!(peer_ip(Some("127.0.0.1:4000"), &remote).to_string(), "10.0.0.5");
        let local: SocketAddr = "127.0.0.1:5555".parse().unwrap();
        assert_eq!(peer_ip(Some("127.0.0.1:4000"), &local).to_string(), "127.0.0.1");
    }
}

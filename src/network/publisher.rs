// src/network/publisher.rs

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::events::model::LogLevel;
use crate::network::events::emit_network_event;
use crate::network::framing::{MultipartSink, MultipartStream, SUBSCRIBE, UNSUBSCRIBE};
use crate::network::message::DataMessage;

const FANOUT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub bind_ip: String,
    /// 0 picks an ephemeral port
    pub port: u16,
    /// Unix socket exposed next to the TCP endpoint for same-host subscribers
    pub ipc_path: Option<PathBuf>,
    pub allow_console: bool,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            bind_ip: "0.0.0.0".into(),
            port: 0,
            ipc_path: None,
            allow_console: true,
        }
    }
}

/// Cheap clonable entry point for publishing; lives on the host side.
#[derive(Clone)]
pub struct PublisherHandle {
    tx: broadcast::Sender<Arc<DataMessage>>,
}

impl PublisherHandle {
    /// Queue a message for every connected subscriber; returns how many connections saw it.
    /// Delivery is at-most-once: subscribers not yet filtering `name` never get it.
    pub fn publish(&self, message: DataMessage) -> usize {
        self.tx.send(Arc::new(message)).unwrap_or(0)
    }

    pub fn connection_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Publish socket: subscribers connect over TCP (or IPC) and select output
/// names with `SUB`/`UNSUB` control frames; matching is exact-name.
pub struct Publisher {
    handle: PublisherHandle,
    port: u16,
    ipc_path: Option<PathBuf>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Publisher {
    pub async fn bind(config: PublisherConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(format!("{}:{}", config.bind_ip, config.port)).await?;
        let port = listener.local_addr()?.port();
        let (tx, _) = broadcast::channel(FANOUT_CAPACITY);
        let handle = PublisherHandle { tx };
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = vec![tokio::spawn(accept_tcp(
            listener,
            handle.clone(),
            shutdown_rx.clone(),
            config.allow_console,
        ))];
        let ipc_path = match config.ipc_path {
            Some(path) => match bind_ipc(&path, &handle, &shutdown_rx, config.allow_console) {
                Ok(task) => {
                    tasks.push(task);
                    Some(path)
                }
                Err(e) => {
                    emit_network_event(
                        "publisher",
                        LogLevel::Warn,
                        "ipc_bind_failed",
                        Some(path.display().to_string()),
                        Some(e.to_string()),
                        config.allow_console,
                    );
                    None
                }
            },
            None => None,
        };
        emit_network_event(
            "publisher",
            LogLevel::Info,
            "publisher_bind",
            Some(format!("{}:{}", config.bind_ip, port)),
            ipc_path.as_ref().map(|p| format!("ipc={}", p.display())),
            config.allow_console,
        );
        Ok(Self {
            handle,
            port,
            ipc_path,
            shutdown,
            tasks,
        })
    }

    pub fn handle(&self) -> PublisherHandle {
        self.handle.clone()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn ipc_path(&self) -> Option<&Path> {
        self.ipc_path.as_deref()
    }

    /// Close every subscriber connection and remove the IPC endpoint.
    pub fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in &self.tasks {
            task.abort();
        }
        if let Some(path) = &self.ipc_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

async fn accept_tcp(
    listener: TcpListener,
    handle: PublisherHandle,
    mut shutdown: watch::Receiver<bool>,
    allow_console: bool,
) {
    loop {
        let accepted = tokio::select! {
            r = listener.accept() => r,
            _ = shutdown.changed() => break,
        };
        match accepted {
            Ok((stream, addr)) => {
                let (reader, writer) = stream.into_split();
                tokio::spawn(serve_subscriber(
                    reader,
                    writer,
                    handle.tx.subscribe(),
                    shutdown.clone(),
                    addr.to_string(),
                    allow_console,
                ));
            }
            Err(e) => {
                emit_network_event(
                    "publisher",
                    LogLevel::Warn,
                    "accept_failed",
                    None,
                    Some(e.to_string()),
                    allow_console,
                );
            }
        }
    }
}

#[cfg(unix)]
fn bind_ipc(
    path: &Path,
    handle: &PublisherHandle,
    shutdown: &watch::Receiver<bool>,
    allow_console: bool,
) -> io::Result<JoinHandle<()>> {
    use tokio::net::UnixListener;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if path.exists() {
        let _ = std::fs::remove_file(path);
    }
    let listener = UnixListener::bind(path)?;
    let handle = handle.clone();
    let mut shutdown = shutdown.clone();
    let label = path.display().to_string();
    Ok(tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                r = listener.accept() => r,
                _ = shutdown.changed() => break,
            };
            match accepted {
                Ok((stream, _)) => {
                    let (reader, writer) = stream.into_split();
                    tokio::spawn(serve_subscriber(
                        reader,
                        writer,
                        handle.tx.subscribe(),
                        shutdown.clone(),
                        label.clone(),
                        allow_console,
                    ));
                }
                Err(e) => {
                    emit_network_event(
                        "publisher",
                        LogLevel::Warn,
                        "ipc_accept_failed",
                        Some(label.clone()),
                        Some(e.to_string()),
                        allow_console,
                    );
                }
            }
        }
    }))
}

#[cfg(not(unix))]
fn bind_ipc(
    _path: &Path,
    _handle: &PublisherHandle,
    _shutdown: &watch::Receiver<bool>,
    _allow_console: bool,
) -> io::Result<JoinHandle<()>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "ipc endpoints need unix sockets",
    ))
}

/// Apply one control message to a connection's filter set.
fn apply_control(filters: &mut HashSet<String>, parts: &[bytes::Bytes]) -> bool {
    let [op, name] = parts else {
        return false;
    };
    let Ok(name) = std::str::from_utf8(name) else {
        return false;
    };
    match &op[..] {
        SUBSCRIBE => filters.insert(name.to_string()),
        UNSUBSCRIBE => filters.remove(name),
        _ => false,
    }
}

async fn serve_subscriber<R, W>(
    reader: R,
    writer: W,
    mut rx: broadcast::Receiver<Arc<DataMessage>>,
    mut shutdown: watch::Receiver<bool>,
    label: String,
    allow_console: bool,
) where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut stream = MultipartStream::new(reader);
    let mut sink = MultipartSink::new(writer);
    let mut filters = HashSet::new();
    emit_network_event(
        "publisher",
        LogLevel::Debug,
        "subscriber_connected",
        Some(label.clone()),
        None,
        allow_console,
    );
    loop {
        tokio::select! {
            control = stream.recv() => match control {
                Ok(Some(parts)) => {
                    apply_control(&mut filters, &parts);
                }
                Ok(None) => break,
                Err(e) => {
                    emit_network_event(
                        "publisher",
                        LogLevel::Debug,
                        "subscriber_read_failed",
                        Some(label.clone()),
                        Some(e),
                        allow_console,
                    );
                    break;
                }
            },
            published = rx.recv() => match published {
                Ok(message) => {
                    if filters.contains(&message.name) && sink.send(&message.to_frames()).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    emit_network_event(
                        "publisher",
                        LogLevel::Warn,
                        "subscriber_lagged",
                        Some(label.clone()),
                        Some(format!("dropped={}", skipped)),
                        allow_console,
                    );
                }
                Err(RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        }
    }
    emit_network_event(
        "publisher",
        LogLevel::Debug,
        "subscriber_disconnected",
        Some(label),
        None,
        allow_console,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn control_frames_update_filters() {
        let mut filters = HashSet::new();
        let sub = [Bytes::from_static(SUBSCRIBE), Bytes::from_static(b"temp")];
        let unsub = [Bytes::from_static(UNSUBSCRIBE), Bytes::from_static(b"temp")];
        assert!(apply_control(&mut filters, &sub));
        assert!(!apply_control(&mut filters, &sub));
        assert!(filters.contains("temp"));
        assert!(apply_control(&mut filters, &unsub));
        assert!(filters.is_empty());
        assert!(!apply_control(&mut filters, &[Bytes::from_static(b"NOPE")]));
    }
}

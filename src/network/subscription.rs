// src/network/subscription.rs

use bytes::Bytes;
use std::collections::BTreeSet;
use std::fmt;
#[cfg(unix)]
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::events::model::LogLevel;
use crate::network::events::emit_network_event;
use crate::network::framing::{MultipartSink, MultipartStream, SUBSCRIBE, UNSUBSCRIBE};
use crate::network::message::DataMessage;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Where a peer's publish socket can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    #[cfg(unix)]
    Ipc(PathBuf),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
            #[cfg(unix)]
            Endpoint::Ipc(path) => write!(f, "ipc://{}", path.display()),
        }
    }
}

/// A decoded data message tagged with the peer it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundData {
    pub peer_id: String,
    pub message: DataMessage,
}

enum Control {
    Subscribe(String),
    Unsubscribe(String),
}

type BoxedRead = Box<dyn AsyncRead + Unpin + Send>;
type BoxedWrite = Box<dyn AsyncWrite + Unpin + Send>;

/// Subscribe side of one peer's publish socket.
///
/// Connects in the background, retries with backoff, and replays its filter set
/// on every reconnect. Dropping the socket closes it.
pub struct SubscriptionSocket {
    endpoint: Endpoint,
    control: mpsc::UnboundedSender<Control>,
    task: JoinHandle<()>,
}

impl SubscriptionSocket {
    /// Must be called from within a tokio runtime.
    pub fn connect(
        peer_id: &str,
        endpoint: Endpoint,
        inbound: mpsc::UnboundedSender<InboundData>,
        allow_console: bool,
    ) -> Self {
        let (control, control_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(
            peer_id.to_string(),
            endpoint.clone(),
            control_rx,
            inbound,
            allow_console,
        ));
        Self {
            endpoint,
            control,
            task,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn subscribe(&self, name: &str) {
        let _ = self.control.send(Control::Subscribe(name.to_string()));
    }

    pub fn unsubscribe(&self, name: &str) {
        let _ = self.control.send(Control::Unsubscribe(name.to_string()));
    }
}

impl Drop for SubscriptionSocket {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn open(endpoint: &Endpoint) -> std::io::Result<(BoxedRead, BoxedWrite)> {
    match endpoint {
        Endpoint::Tcp(addr) => {
            let stream = TcpStream::connect(addr).await?;
            let _ = stream.set_nodelay(true);
            let (r, w) = stream.into_split();
            Ok((Box::new(r), Box::new(w)))
        }
        #[cfg(unix)]
        Endpoint::Ipc(path) => {
            let stream = tokio::net::UnixStream::connect(path).await?;
            let (r, w) = stream.into_split();
            Ok((Box::new(r), Box::new(w)))
        }
    }
}

fn control_frames(op: &'static [u8], name: &str) -> [Bytes; 2] {
    [Bytes::from_static(op), Bytes::from(name.as_bytes().to_vec())]
}

/// Update the filter set; returns the frames to send when it changed.
fn apply(filters: &mut BTreeSet<String>, control: Control) -> Option<[Bytes; 2]> {
    match control {
        Control::Subscribe(name) => {
            let frames = control_frames(SUBSCRIBE, &name);
            filters.insert(name).then_some(frames)
        }
        Control::Unsubscribe(name) => filters
            .remove(&name)
            .then(|| control_frames(UNSUBSCRIBE, &name)),
    }
}

async fn run(
    peer_id: String,
    endpoint: Endpoint,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
    inbound: mpsc::UnboundedSender<InboundData>,
    allow_console: bool,
) {
    let label = endpoint.to_string();
    let mut filters = BTreeSet::new();
    let mut backoff = INITIAL_BACKOFF;
    'connect: loop {
        let (reader, writer) = match open(&endpoint).await {
            Ok(pair) => pair,
            Err(e) => {
                emit_network_event(
                    "subscriber",
                    LogLevel::Debug,
                    "subscribe_connect_failed",
                    Some(label.clone()),
                    Some(e.to_string()),
                    allow_console,
                );
                // Keep tracking filter changes while waiting to retry.
                let sleep = tokio::time::sleep(backoff);
                tokio::pin!(sleep);
                loop {
                    tokio::select! {
                        _ = &mut sleep => break,
                        control = control_rx.recv() => match control {
                            Some(c) => {
                                apply(&mut filters, c);
                            }
                            None => return,
                        },
                    }
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        };
        backoff = INITIAL_BACKOFF;
        let mut stream = MultipartStream::new(reader);
        let mut sink = MultipartSink::new(writer);
        for name in &filters {
            if sink.send(&control_frames(SUBSCRIBE, name)).await.is_err() {
                continue 'connect;
            }
        }
        emit_network_event(
            "subscriber",
            LogLevel::Debug,
            "subscribe_connected",
            Some(label.clone()),
            Some(format!("peer_id={} filters={}", peer_id, filters.len())),
            allow_console,
        );
        loop {
            tokio::select! {
                control = control_rx.recv() => match control {
                    Some(c) => {
                        if let Some(frames) = apply(&mut filters, c) {
                            if sink.send(&frames).await.is_err() {
                                break;
                            }
                        }
                    }
                    None => return,
                },
                received = stream.recv() => match received {
                    Ok(Some(parts)) => match DataMessage::from_frames(&parts) {
                        Ok(message) => {
                            let data = InboundData { peer_id: peer_id.clone(), message };
                            if inbound.send(data).is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            emit_network_event(
                                "subscriber",
                                LogLevel::Warn,
                                "data_decode_failed",
                                Some(label.clone()),
                                Some(e.to_string()),
                                allow_console,
                            );
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        emit_network_event(
                            "subscriber",
                            LogLevel::Debug,
                            "subscribe_read_failed",
                            Some(label.clone()),
                            Some(e),
                            allow_console,
                        );
                        break;
                    }
                },
            }
        }
        emit_network_event(
            "subscriber",
            LogLevel::Debug,
            "subscribe_disconnected",
            Some(label.clone()),
            None,
            allow_console,
        );
        tokio::time::sleep(INITIAL_BACKOFF).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::IopValue;
    use crate::network::publisher::{Publisher, PublisherConfig};

    #[test]
    fn duplicate_subscribe_sends_nothing() {
        let mut filters = BTreeSet::new();
        assert!(apply(&mut filters, Control::Subscribe("temp".into())).is_some());
        assert!(apply(&mut filters, Control::Subscribe("temp".into())).is_none());
        assert!(apply(&mut filters, Control::Unsubscribe("other".into())).is_none());
        assert!(apply(&mut filters, Control::Unsubscribe("temp".into())).is_some());
    }

    #[tokio::test]
    async fn receives_only_filtered_outputs() {
        let publisher = Publisher::bind(PublisherConfig {
            bind_ip: "127.0.0.1".into(),
            allow_console: false,
            ..PublisherConfig::default()
        })
        .await
        .unwrap();
        let handle = publisher.handle();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let socket = SubscriptionSocket::connect(
            "peer-a",
            Endpoint::Tcp(format!("127.0.0.1:{}", publisher.port())),
            tx,
            false,
        );
        socket.subscribe("temp");

        // Publish until the filter is active on the publisher side.
        let received = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                handle.publish(DataMessage::new("other", IopValue::Integer(1)));
                handle.publish(DataMessage::new("temp", IopValue::Double(21.5)));
                if let Ok(Some(data)) =
                    tokio::time::timeout(Duration::from_millis(50), rx.recv()).await
                {
                    return data;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(received.peer_id, "peer-a");
        assert_eq!(received.message.name, "temp");
        assert_eq!(received.message.value, IopValue::Double(21.5));
        drop(socket);
        publisher.shutdown();
    }
}

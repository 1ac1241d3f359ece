//! TCP transport for Wi-Fi ELM327 adapters.
//!
//! Commands are terminated with `\r`; a reply is everything up to the `>`
//! prompt. An exchange that ends before its prompt arrives (timeout or a
//! cancelled caller) leaves the link owing a reply; that reply is read and
//! discarded before the next command is written.

use std::time::Duration;

use async_trait::async_trait;
use elm_obd::transport::split_reply;
use elm_obd::{LinkState, Transport, TransportError, TransportResult};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, watch};

const PROMPT: u8 = b'>';

struct Link {
    stream: TcpStream,
    /// A command was written whose prompt has not been read yet.
    awaiting_prompt: bool,
}

pub struct TcpTransport {
    address: String,
    reply_timeout: Duration,
    stream: Mutex<Option<Link>>,
    link: watch::Sender<LinkState>,
}

impl TcpTransport {
    pub fn new(address: impl Into<String>, reply_timeout: Duration) -> Self {
        let (link, _) = watch::channel(LinkState::Disconnected);
        Self {
            address: address.into(),
            reply_timeout,
            stream: Mutex::new(None),
            link,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn timeout_error(&self) -> TransportError {
        TransportError::Timeout {
            timeout_ms: self.reply_timeout.as_millis() as u64,
        }
    }

    fn drop_link(&self, link: &mut Option<Link>, err: &TransportError) {
        tracing::warn!(address = %self.address, error = %err, "adapter link failed");
        *link = None;
        self.link.send_replace(LinkState::Failed);
    }

    async fn read_until_prompt(stream: &mut TcpStream) -> TransportResult<String> {
        let mut reply = Vec::new();
        let mut chunk = [0u8; 256];
        loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(TransportError::Closed);
            }
            reply.extend_from_slice(&chunk[..n]);
            if chunk[..n].contains(&PROMPT) {
                return Ok(String::from_utf8_lossy(&reply).into_owned());
            }
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, timeout: Duration) -> TransportResult<()> {
        self.link.send_replace(LinkState::Connecting);
        let connected = tokio::time::timeout(timeout, TcpStream::connect(&self.address)).await;
        match connected {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!(error = %e, "TCP_NODELAY not set");
                }
                *self.stream.lock().await = Some(Link {
                    stream,
                    awaiting_prompt: false,
                });
                self.link.send_replace(LinkState::Connected);
                tracing::info!(address = %self.address, "adapter link up");
                Ok(())
            }
            Ok(Err(e)) => {
                self.link.send_replace(LinkState::Failed);
                Err(TransportError::Connect(format!("{}: {e}", self.address)))
            }
            Err(_) => {
                self.link.send_replace(LinkState::Failed);
                Err(TransportError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn send(&self, command: &str) -> TransportResult<Vec<String>> {
        let mut guard = self.stream.lock().await;
        let link = guard.as_mut().ok_or(TransportError::NotConnected)?;

        if link.awaiting_prompt {
            let drained = tokio::time::timeout(self.reply_timeout, Self::read_until_prompt(&mut link.stream)).await;
            match drained {
                Ok(Ok(stale)) => {
                    tracing::debug!(address = %self.address, stale = %stale.trim(), "discarded late reply");
                    link.awaiting_prompt = false;
                }
                Ok(Err(e)) => {
                    self.drop_link(&mut guard, &e);
                    return Err(e);
                }
                Err(_) => {
                    let err = self.timeout_error();
                    self.drop_link(&mut guard, &err);
                    return Err(err);
                }
            }
        }

        let exchange = async {
            link.awaiting_prompt = true;
            link.stream.write_all(format!("{command}\r").as_bytes()).await?;
            let raw = Self::read_until_prompt(&mut link.stream).await?;
            link.awaiting_prompt = false;
            Ok::<_, TransportError>(raw)
        };
        let reply = tokio::time::timeout(self.reply_timeout, exchange).await;
        match reply {
            Ok(Ok(raw)) => Ok(split_reply(&raw)),
            Ok(Err(e)) => {
                self.drop_link(&mut guard, &e);
                Err(e)
            }
            Err(_) => Err(self.timeout_error()),
        }
    }

    async fn disconnect(&self) {
        if let Some(mut link) = self.stream.lock().await.take() {
            // Peer may already be gone.
            let _ = link.stream.shutdown().await;
        }
        self.link.send_replace(LinkState::Disconnected);
    }

    fn link_state(&self) -> watch::Receiver<LinkState> {
        self.link.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// A fake adapter answering each `\r`-terminated command from `replies`.
    async fn fake_adapter(replies: Vec<&'static str>) -> String {
        slow_adapter(replies.into_iter().map(|r| (0, r)).collect()).await
    }

    /// Like [`fake_adapter`], waiting `delay_ms` before each reply.
    async fn slow_adapter(replies: Vec<(u64, &'static str)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            for (delay_ms, reply) in replies {
                let mut command = Vec::new();
                while !command.contains(&b'\r') {
                    let n = socket.read(&mut buf).await.unwrap();
                    if n == 0 {
                        return;
                    }
                    command.extend_from_slice(&buf[..n]);
                }
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                if socket.write_all(reply.as_bytes()).await.is_err() {
                    return;
                }
            }
        });
        address
    }

    #[tokio::test]
    async fn exchange_reads_until_prompt() {
        let address = fake_adapter(vec!["ATZ\r\rELM327 v1.5\r\r>", "7E8 04 41 0C 1A F8\r\r>"]).await;
        let transport = TcpTransport::new(address, Duration::from_secs(2));
        transport.connect(Duration::from_secs(2)).await.unwrap();
        assert_eq!(*transport.link_state().borrow(), LinkState::Connected);

        assert_eq!(transport.send("ATZ").await.unwrap(), vec!["ATZ", "ELM327 v1.5"]);
        assert_eq!(transport.send("010C").await.unwrap(), vec!["7E8 04 41 0C 1A F8"]);

        transport.disconnect().await;
        assert_eq!(transport.send("010C").await, Err(TransportError::NotConnected));
    }

    #[tokio::test]
    async fn peer_close_fails_link() {
        let address = fake_adapter(vec![]).await;
        let transport = TcpTransport::new(address, Duration::from_secs(2));
        transport.connect(Duration::from_secs(2)).await.unwrap();

        let err = transport.send("ATZ").await.unwrap_err();
        assert!(matches!(err, TransportError::Closed | TransportError::Io(_)));
        assert_eq!(*transport.link_state().borrow(), LinkState::Failed);
    }

    #[tokio::test]
    async fn refused_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let transport = TcpTransport::new(address, Duration::from_secs(1));
        let err = transport.connect(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, TransportError::Connect(_)));
        assert_eq!(*transport.link_state().borrow(), LinkState::Failed);
    }

    #[tokio::test]
    async fn late_reply_is_not_taken_for_the_next_one() {
        let address = slow_adapter(vec![
            (400, "7E8 03 41 0D 3C\r\r>"),
            (0, "7E8 04 41 0C 1A F8\r\r>"),
        ])
        .await;
        let transport = TcpTransport::new(address, Duration::from_millis(250));
        transport.connect(Duration::from_secs(2)).await.unwrap();

        assert_eq!(
            transport.send("010D").await,
            Err(TransportError::Timeout { timeout_ms: 250 })
        );
        assert_eq!(transport.send("010C").await.unwrap(), vec!["7E8 04 41 0C 1A F8"]);
        assert_eq!(*transport.link_state().borrow(), LinkState::Connected);
    }

    #[tokio::test]
    async fn cancelled_exchange_is_drained() {
        let address = slow_adapter(vec![
            (200, "7E8 03 41 0D 3C\r\r>"),
            (0, "7E8 04 41 0C 1A F8\r\r>"),
        ])
        .await;
        let transport = TcpTransport::new(address, Duration::from_secs(1));
        transport.connect(Duration::from_secs(2)).await.unwrap();

        let cancelled = tokio::time::timeout(Duration::from_millis(50), transport.send("010D")).await;
        assert!(cancelled.is_err());
        assert_eq!(transport.send("010C").await.unwrap(), vec!["7E8 04 41 0C 1A F8"]);
    }

    #[tokio::test]
    async fn reply_that_never_comes_fails_link() {
        let address = slow_adapter(vec![(60_000, "7E8 03 41 0D 3C\r\r>")]).await;
        let transport = TcpTransport::new(address, Duration::from_millis(100));
        transport.connect(Duration::from_secs(2)).await.unwrap();

        assert!(matches!(
            transport.send("010D").await,
            Err(TransportError::Timeout { .. })
        ));
        assert!(matches!(
            transport.send("010C").await,
            Err(TransportError::Timeout { .. })
        ));
        assert_eq!(*transport.link_state().borrow(), LinkState::Failed);
        assert_eq!(transport.send("010C").await, Err(TransportError::NotConnected));
    }
}

use async_trait::async_trait;
use gobanview_protocol::Envelope;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport io: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad frame: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("transport closed")]
    Closed,
}

/// Persistent bidirectional link to the engine bridge.
///
/// `recv` must be cancel safe: the session polls it inside `tokio::select!`.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError>;

    /// `None` once the peer has closed the connection.
    async fn recv(&mut self) -> Option<Result<Envelope, TransportError>>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Newline-delimited JSON envelopes over TCP.
pub struct TcpTransport {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl TcpTransport {
    pub async fn connect(addr: &str) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        debug!(target: "gobanview.transport", %addr, "connected");
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        let (read, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read).lines(),
            writer,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        let mut line = serde_json::to_vec(envelope)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<Envelope, TransportError>> {
        loop {
            // `next_line` is cancel safe.
            match self.lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => return Some(serde_json::from_str(&line).map_err(Into::into)),
                Ok(None) => return None,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gobanview_protocol::EngineFrame;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn exchanges_json_lines_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let bridge = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut bridge = TcpTransport::from_stream(stream);
            let cmd = bridge.recv().await.unwrap().unwrap();
            assert_eq!(cmd.command_text(), Some("name"));
            bridge
                .send(&Envelope::engine(&EngineFrame::stdout("t", "= KataGo")))
                .await
                .unwrap();
            bridge.close().await.unwrap();
        });

        let mut client = TcpTransport::connect(&addr).await.unwrap();
        client.send(&Envelope::command("name")).await.unwrap();
        let reply = client.recv().await.unwrap().unwrap();
        let frame = reply.engine_frame().unwrap().unwrap();
        assert_eq!(frame.stdout.as_deref(), Some("= KataGo"));
        assert!(client.recv().await.is_none());
        bridge.await.unwrap();
    }
}

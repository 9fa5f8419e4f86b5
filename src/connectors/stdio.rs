use log::{debug, error, info};
use std::io::{BufRead, BufReader};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc};

use super::connector::{Connector, Destination, Message, MessageStream, Source};
use crate::error::{ConnectionError, WriteError};

type Input = Box<dyn BufRead + Send>;

/// Line-oriented standard I/O.
///
/// - As a Source: every stdin line becomes one message (newline stripped).
///   The stream ends at EOF.
/// - As a Destination: every message is written to stdout followed by a
///   newline.
///
/// Stdin is read on its own OS thread. A blocking read can not be
/// cancelled; on tokio's blocking pool it would hold up runtime shutdown
/// until the next line arrives.
pub struct Stdio {
    /// Taken by the first `read()`.
    input: Mutex<Option<Input>>,
    out: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl Default for Stdio {
    fn default() -> Self {
        Self::new()
    }
}

impl Stdio {
    pub fn new() -> Self {
        Self::with_io(BufReader::new(std::io::stdin()), tokio::io::stdout())
    }

    /// Reads from `input` and writes to `out` instead of stdin/stdout.
    pub fn with_io(
        input: impl BufRead + Send + 'static,
        out: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            input: Mutex::new(Some(Box::new(input))),
            out: Mutex::new(Box::new(out)),
        }
    }
}

#[async_trait::async_trait]
impl Connector for Stdio {
    fn name(&self) -> &'static str {
        "stdio"
    }

    async fn connect(&self) -> Result<(), ConnectionError> {
        Ok(())
    }

    /// Flushes stdout. A running stdin reader exits on its next line or at
    /// EOF once its stream is dropped.
    async fn disconnect(&self) -> anyhow::Result<()> {
        self.out.lock().await.flush().await?;
        debug!("stdio flushed");
        Ok(())
    }

    fn info(&self) {
        info!("reading/writing line-delimited messages on standard I/O");
    }
}

#[async_trait::async_trait]
impl Source for Stdio {
    async fn read(&self) -> Result<MessageStream, ConnectionError> {
        let input = self
            .input
            .lock()
            .await
            .take()
            .ok_or(ConnectionError::AlreadyReading)?;

        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name("stdin-reader".to_string())
            .spawn(move || forward_lines(input, tx))?;
        Ok(rx)
    }
}

#[async_trait::async_trait]
impl Destination for Stdio {
    async fn write(&self, message: Message) -> Result<(), WriteError> {
        let mut out = self.out.lock().await;
        out.write_all(message.as_bytes()).await?;
        out.write_all(b"\n").await?;
        out.flush().await?;
        Ok(())
    }
}

/// Forwards lines from `input` until EOF, a read error, or a dropped
/// consumer. Blocks the calling thread.
fn forward_lines(input: impl BufRead, tx: mpsc::UnboundedSender<Message>) {
    let mut lines = input.lines();
    loop {
        match lines.next() {
            Some(Ok(line)) => {
                if tx.send(line).is_err() {
                    debug!("stdin stream dropped by consumer");
                    break;
                }
            }
            None => {
                info!("stdin closed");
                break;
            }
            Some(Err(e)) => {
                error!("stdin read error: {}", e);
                break;
            }
        }
    }
}

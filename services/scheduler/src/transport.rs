//! Transport seam.
//!
//! The scheduler never speaks the resource manager's wire protocol. It
//! hands [`OutboundMessage`]s to a [`Transport`], which delivers them.

use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use keel_events::OutboundMessage;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Delivers scheduler output.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, message: OutboundMessage) -> Result<()>;
}

/// Writes each message as one JSON line.
pub struct JsonLinesTransport<W> {
    writer: tokio::sync::Mutex<W>,
}

impl<W> JsonLinesTransport<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(writer),
        }
    }
}

impl JsonLinesTransport<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

#[async_trait]
impl<W> Transport for JsonLinesTransport<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&self, message: OutboundMessage) -> Result<()> {
        let mut line = message.to_json()?;
        line.push('\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Records messages instead of sending them.
#[derive(Default)]
pub struct MockTransport {
    sent: Mutex<Vec<OutboundMessage>>,

    /// Whether sends should fail.
    fail_sends: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport whose sends always fail.
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail_sends: true,
        }
    }

    /// Messages sent so far.
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, message: OutboundMessage) -> Result<()> {
        if self.fail_sends {
            anyhow::bail!("Mock transport configured to fail");
        }
        debug!(message = ?message, "Mock transport: recording message");
        self.sent
            .lock()
            .map_err(|_| anyhow::anyhow!("mock transport lock poisoned"))?
            .push(message);
        Ok(())
    }
}

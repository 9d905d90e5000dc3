//! Kernel message channel
//!
//! Line-delimited JSON over a pair of byte streams (the kernel's stdin and
//! stdout). A writer task drains an outbound queue, a reader task parses
//! every line into a [`KernelMessage`]. Executions take the inbound
//! receiver for their whole lifetime, so one kernel runs one request at a
//! time and replies are never interleaved.
//!
//! ```text
//!   execute() ──► outbound mpsc ──► writer task ──► kernel stdin
//!                                                        │
//!   Execution ◄── inbound mpsc ◄── reader task ◄── kernel stdout
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{BoxStream, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::protocol::KernelMessage;
use super::KernelError;

const CHANNEL_CAPACITY: usize = 256;

/// Client side of one kernel's message channel
pub struct KernelClient {
    name: String,
    outbound: mpsc::Sender<String>,
    inbound: Arc<Mutex<mpsc::Receiver<KernelMessage>>>,
    connected: Arc<AtomicBool>,
    poll_interval: Duration,
    max_empty_polls: u32,
}

/// One running execute request
pub struct Execution {
    /// Id of the execute request; replies carry it as their parent id
    pub msg_id: String,
    /// Every reply to the request up to (not including) the idle status
    pub messages: BoxStream<'static, Result<KernelMessage, KernelError>>,
}

impl KernelClient {
    /// Start the reader and writer tasks over an already-open channel
    ///
    /// # Arguments
    /// * `name` - Kernel name, for logging
    /// * `reader` - Kernel output (its stdout)
    /// * `writer` - Kernel input (its stdin)
    /// * `poll_interval` - How long one receive waits before counting as empty
    /// * `max_empty_polls` - Empty polls after which an execution gives up
    pub fn connect<R, W>(
        name: &str,
        reader: R,
        writer: W,
        poll_interval: Duration,
        max_empty_polls: u32,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let connected = Arc::new(AtomicBool::new(true));
        let (outbound, mut outbound_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
        let (inbound_tx, inbound) = mpsc::channel::<KernelMessage>(CHANNEL_CAPACITY);

        let writer_connected = connected.clone();
        let writer_name = name.to_string();
        tokio::spawn(async move {
            let mut writer = writer;
            while let Some(line) = outbound_rx.recv().await {
                let result = async {
                    writer.write_all(line.as_bytes()).await?;
                    writer.write_all(b"\n").await?;
                    writer.flush().await
                }
                .await;
                if let Err(e) = result {
                    warn!(kernel = %writer_name, error = %e, "Kernel write failed");
                    writer_connected.store(false, Ordering::SeqCst);
                    break;
                }
            }
        });

        let reader_connected = connected.clone();
        let reader_name = name.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<KernelMessage>(line) {
                            Ok(msg) => {
                                trace!(kernel = %reader_name, msg_type = %msg.msg_type, "Kernel message");
                                if inbound_tx.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!(kernel = %reader_name, error = %e, "Ignoring unparseable kernel line");
                            }
                        }
                    }
                    Ok(None) => {
                        debug!(kernel = %reader_name, "Kernel output closed");
                        break;
                    }
                    Err(e) => {
                        warn!(kernel = %reader_name, error = %e, "Kernel read failed");
                        break;
                    }
                }
            }
            reader_connected.store(false, Ordering::SeqCst);
        });

        Self {
            name: name.to_string(),
            outbound,
            inbound: Arc::new(Mutex::new(inbound)),
            connected,
            poll_interval,
            max_empty_polls: max_empty_polls.max(1),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, msg: &KernelMessage) -> Result<(), KernelError> {
        let line = serde_json::to_string(msg)?;
        self.outbound
            .send(line)
            .await
            .map_err(|_| KernelError::ChannelClosed(self.name.clone()))
    }

    /// Ask for kernel info and wait for the matching reply
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), KernelError> {
        let mut inbound = self.inbound.clone().lock_owned().await;
        let request = KernelMessage::request("kernel_info_request", serde_json::json!({}));
        self.send(&request).await?;

        let deadline = Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, inbound.recv()).await {
                Ok(Some(msg)) => {
                    if msg.msg_type == "kernel_info_reply" && msg.parent_id() == Some(request.msg_id()) {
                        debug!(kernel = %self.name, "Kernel ready");
                        return Ok(());
                    }
                }
                Ok(None) => return Err(KernelError::ChannelClosed(self.name.clone())),
                Err(_) => {
                    return Err(KernelError::NotReady {
                        name: self.name.clone(),
                        waited: timeout,
                    })
                }
            }
        }
    }

    /// Submit code and stream back the replies to it
    ///
    /// Waits for any execution already running on this kernel to finish.
    /// The returned stream ends on the kernel's idle status for this request,
    /// or after `read_timeout` (default: `max_empty_polls` poll intervals) of
    /// silence.
    pub async fn execute(
        &self,
        code: &str,
        language: &str,
        read_timeout: Option<Duration>,
    ) -> Result<Execution, KernelError> {
        let inbound = self.inbound.clone().lock_owned().await;
        let request = KernelMessage::execute_request(code, language);
        let msg_id = request.msg_id().to_string();
        self.send(&request).await?;

        let max_empty = match read_timeout {
            Some(timeout) => empty_polls_for(timeout, self.poll_interval),
            None => self.max_empty_polls,
        };

        Ok(Execution {
            msg_id: msg_id.clone(),
            messages: replies(
                self.name.clone(),
                inbound,
                msg_id,
                self.poll_interval,
                max_empty,
            ),
        })
    }

    /// Ask the kernel to exit; best effort
    pub async fn shutdown(&self) {
        let request = KernelMessage::request("shutdown_request", serde_json::json!({"restart": false}));
        if let Err(e) = self.send(&request).await {
            debug!(kernel = %self.name, error = %e, "Shutdown request not delivered");
        }
    }
}

/// Poll count covering `timeout` at `interval`, at least one
fn empty_polls_for(timeout: Duration, interval: Duration) -> u32 {
    let interval_ms = interval.as_millis().max(1);
    (timeout.as_millis() / interval_ms).clamp(1, u32::MAX as u128) as u32
}

fn replies(
    name: String,
    mut inbound: OwnedMutexGuard<mpsc::Receiver<KernelMessage>>,
    msg_id: String,
    poll_interval: Duration,
    max_empty: u32,
) -> BoxStream<'static, Result<KernelMessage, KernelError>> {
    let stream = async_stream::stream! {
        let mut empty = 0u32;
        loop {
            match tokio::time::timeout(poll_interval, inbound.recv()).await {
                Ok(Some(msg)) => {
                    // Stragglers from an abandoned request
                    if msg.parent_id() != Some(msg_id.as_str()) {
                        continue;
                    }
                    empty = 0;
                    if msg.is_idle() {
                        break;
                    }
                    yield Ok(msg);
                }
                Ok(None) => {
                    yield Err(KernelError::ChannelClosed(name.clone()));
                    break;
                }
                Err(_) => {
                    empty += 1;
                    if empty >= max_empty {
                        warn!(kernel = %name, msg_id = %msg_id, polls = empty, "Kernel went quiet, ending execution");
                        break;
                    }
                }
            }
        }
    };
    stream.boxed()
}

use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// In-memory sink for a server's combined stdout and stderr.
///
/// Cloning shares the same buffer.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, chunk: &[u8]) {
        self.bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(chunk);
    }

    /// Everything captured so far, lossily decoded.
    pub fn snapshot(&self) -> String {
        let bytes = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Spawn a task copying `stream` into the buffer line by line until EOF.
    pub fn capture<R>(&self, label: String, stream: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let sink = self.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stream);
            let mut line = Vec::new();
            loop {
                line.clear();
                match reader.read_until(b'\n', &mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        debug!(
                            process = %label,
                            line = %String::from_utf8_lossy(&line).trim_end(),
                            "server output"
                        );
                        sink.append(&line);
                    }
                    Err(e) => {
                        warn!(process = %label, error = %e, "error reading server output");
                        break;
                    }
                }
            }
        })
    }
}

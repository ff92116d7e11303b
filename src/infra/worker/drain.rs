use std::iter;

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    sync::mpsc,
    task::JoinHandle,
};
use tracing::debug;

/// Background consumer of the worker's diagnostic stream.
///
/// Lines are queued as they arrive so the request/response exchange never
/// waits on stderr. Nothing about protocol correctness depends on the queue
/// being read.
pub struct StderrDrain {
    lines: mpsc::UnboundedReceiver<String>,
    reader: JoinHandle<()>,
}

impl StderrDrain {
    /// Start draining `stream` until end-of-stream. Must be called from within
    /// a tokio runtime.
    pub fn start<R>(stream: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (sender, lines) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async move {
            let mut segments = BufReader::new(stream).split(b'\n');
            loop {
                match segments.next_segment().await {
                    Ok(Some(mut segment)) => {
                        if segment.last() == Some(&b'\r') {
                            segment.pop();
                        }
                        let line = String::from_utf8_lossy(&segment).into_owned();
                        if sender.send(line).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        debug!(
                            target = "infra::worker::drain",
                            op = "drain::read",
                            result = "error",
                            error = %err,
                            "Worker diagnostic stream failed"
                        );
                        break;
                    }
                }
            }
        });

        Self { lines, reader }
    }

    /// Next queued line, or `None` when nothing is queued right now.
    pub fn poll(&mut self) -> Option<String> {
        self.lines.try_recv().ok()
    }

    /// Everything queued so far, oldest first.
    pub fn drain_all(&mut self) -> Vec<String> {
        iter::from_fn(|| self.poll()).collect()
    }

    /// Stop reading. Lines the reader has not consumed yet are lost.
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for StderrDrain {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

//! PTY bridge: binds an interactive subprocess to a pseudo-terminal and
//! exposes a duplex byte stream with live resize and forced termination.
//!
//! Reads happen on blocking tasks feeding a channel of raw byte chunks;
//! writes go through a dedicated thread so the PTY buffer can drain between
//! chunks. The exit code is reported exactly once, after the output stream
//! is exhausted.

use std::io::{Read, Write};
use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::error::AttachError;

const PTY_READ_BUFFER_SIZE: usize = 4096;
const PTY_WRITE_CHUNK_SIZE: usize = 512;
const PTY_INPUT_CHANNEL_SIZE: usize = 1024;
const PTY_OUTPUT_CHANNEL_SIZE: usize = 256;

struct BridgeInner {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send>,
}

/// A live subprocess bound to a pseudo-terminal.
pub struct PtyBridge {
    inner: Mutex<BridgeInner>,
    input_tx: std::sync::mpsc::SyncSender<Vec<u8>>,
}

impl PtyBridge {
    /// Spawn `cmd` under a fresh PTY sized to `cols` x `rows`.
    ///
    /// Returns the bridge handle, the subprocess output stream, and a
    /// one-shot exit notification that fires after the output stream ends.
    pub fn spawn(
        cmd: CommandBuilder,
        cols: u16,
        rows: u16,
    ) -> Result<
        (
            Arc<Self>,
            mpsc::Receiver<Vec<u8>>,
            oneshot::Receiver<Option<i32>>,
        ),
        AttachError,
    > {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| AttachError(e.to_string()))?;

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| AttachError(e.to_string()))?;

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| AttachError(e.to_string()))?;

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| AttachError(e.to_string()))?;

        let (input_tx, input_rx) = std::sync::mpsc::sync_channel(PTY_INPUT_CHANNEL_SIZE);
        spawn_writer_thread(writer, input_rx);

        let bridge = Arc::new(PtyBridge {
            inner: Mutex::new(BridgeInner {
                master: pair.master,
                child,
            }),
            input_tx,
        });

        let (output_tx, output_rx) = mpsc::channel(PTY_OUTPUT_CHANNEL_SIZE);
        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(run_reader(bridge.clone(), reader, output_tx, exit_tx));

        Ok((bridge, output_rx, exit_rx))
    }

    /// Spawn an interactive shell inside the target container, bound to a
    /// PTY with the given dimensions.
    pub fn attach(
        target: &str,
        cols: u16,
        rows: u16,
    ) -> Result<
        (
            Arc<Self>,
            mpsc::Receiver<Vec<u8>>,
            oneshot::Receiver<Option<i32>>,
        ),
        AttachError,
    > {
        let mut cmd = CommandBuilder::new("docker");
        cmd.args(["exec", "-it", target, "/bin/bash"]);
        cmd.env("TERM", "xterm-256color");
        Self::spawn(cmd, cols, rows)
    }

    /// Queue input bytes for the subprocess. Fire-and-forget: input sent
    /// after the writer has shut down is dropped.
    pub fn write(&self, data: Vec<u8>) {
        if self.input_tx.send(data).is_err() {
            warn!("PTY input channel closed, dropping input");
        }
    }

    /// Live-resize the underlying pseudo-terminal.
    pub fn resize(&self, cols: u16, rows: u16) -> anyhow::Result<()> {
        let inner = self.inner.lock();
        inner
            .master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("Failed to resize PTY")
    }

    /// Forcibly terminate the subprocess. Killing an already-dead process
    /// reports an error which is ignored, so this is safe to call twice.
    pub fn kill(&self) {
        let mut inner = self.inner.lock();
        if let Err(e) = inner.child.kill() {
            warn!("Failed to kill PTY process: {}", e);
        }
    }
}

/// Dedicated writer thread: drains the input channel into the PTY in small
/// chunks, flushing between chunks.
fn spawn_writer_thread(
    mut writer: Box<dyn Write + Send>,
    input_rx: std::sync::mpsc::Receiver<Vec<u8>>,
) {
    std::thread::spawn(move || {
        while let Ok(data) = input_rx.recv() {
            for chunk in data.chunks(PTY_WRITE_CHUNK_SIZE) {
                if let Err(e) = writer.write_all(chunk) {
                    error!("PTY write error: {}", e);
                    return;
                }
                if let Err(e) = writer.flush() {
                    error!("PTY flush error: {}", e);
                    return;
                }
                std::thread::yield_now();
            }
        }
    });
}

async fn run_reader(
    bridge: Arc<PtyBridge>,
    mut reader: Box<dyn Read + Send>,
    output_tx: mpsc::Sender<Vec<u8>>,
    exit_tx: oneshot::Sender<Option<i32>>,
) {
    let mut buf = [0u8; PTY_READ_BUFFER_SIZE];

    loop {
        let read_result = tokio::task::spawn_blocking(move || {
            let result = reader.read(&mut buf);
            (reader, buf, result)
        })
        .await;

        let (returned_reader, returned_buf, result) = match read_result {
            Ok(r) => r,
            Err(e) => {
                error!("PTY reader task panicked: {}", e);
                break;
            }
        };
        reader = returned_reader;
        buf = returned_buf;

        match result {
            Ok(0) => break,
            Ok(n) => {
                if output_tx.send(buf[..n].to_vec()).await.is_err() {
                    // Receiver gone; stop reading, the kill path cleans up.
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
            }
            Err(e) => {
                warn!("PTY read error: {}", e);
                break;
            }
        }
    }

    let code = {
        let mut inner = bridge.inner.lock();
        inner
            .child
            .try_wait()
            .ok()
            .flatten()
            .map(|s| s.exit_code().try_into().unwrap_or(1))
    };
    info!("PTY process exited with code {:?}", code);

    drop(output_tx);
    let _ = exit_tx.send(code);
}

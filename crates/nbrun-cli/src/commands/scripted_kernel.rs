//! `nbrun scripted-kernel` command.
//!
//! Runs the scripted kernel as a process kernel: one JSON message per line
//! on stdin and stdout, so it can be registered with
//! `--kernel demo="nbrun scripted-kernel"`.

use std::io::BufRead;

use anyhow::{Context, Result};
use nbrun_host::kernel::KernelChannel;
use nbrun_host::testkernel;
use nbrun_protocol::KernelMessage;
use tokio::io::AsyncWriteExt;

pub async fn cmd_scripted_kernel() -> Result<()> {
    let (host_side, endpoint) = KernelChannel::pair();
    let KernelChannel {
        outbound,
        mut inbound,
    } = host_side;
    let kernel = tokio::spawn(testkernel::run(endpoint, Default::default()));

    // Detached: a blocked stdin read must not stall exit once the kernel is gone.
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<KernelMessage>(&line) {
                Ok(msg) => {
                    if outbound.send(msg).is_err() {
                        break;
                    }
                }
                Err(err) => tracing::warn!("ignoring undecodable message: {err}"),
            }
        }
    });

    let mut stdout = tokio::io::stdout();
    while let Some(msg) = inbound.recv().await {
        let mut line = serde_json::to_vec(&msg).context("encode message")?;
        line.push(b'\n');
        stdout.write_all(&line).await.context("write stdout")?;
        stdout.flush().await.context("flush stdout")?;
    }

    kernel.await.context("kernel task")?;
    Ok(())
}

//! Kernels running as child processes.
//!
//! The child reads one JSON-encoded [`KernelMessage`] per line on stdin and
//! writes one per line on stdout. Stderr is forwarded to the log.

use std::process::{ExitStatus, Stdio};

use nbrun_protocol::KernelMessage;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;

use super::KernelChannel;
use crate::config::KernelSpec;
use crate::error::RegistryError;

pub struct ProcessKernel;

impl ProcessKernel {
    /// Spawn `spec` and wire its stdio into a [`KernelChannel`].
    ///
    /// The child is killed once the host drops the outbound side of the
    /// channel, and the inbound side closes when the child exits. Either way
    /// the child is reaped.
    pub fn spawn(spec: &KernelSpec) -> Result<KernelChannel, RegistryError> {
        let (program, args) = spec
            .argv
            .split_first()
            .ok_or_else(|| RegistryError::EmptyCommand(spec.name.clone()))?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RegistryError::Spawn {
                spec: spec.name.clone(),
                source,
            })?;

        let missing = |what: &str| RegistryError::Spawn {
            spec: spec.name.clone(),
            source: std::io::Error::other(format!("{what} not captured")),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            let name = spec.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::info!(target: "nbrun::kernel_stderr", kernel = %name, "{line}");
                }
            });
        }
        tracing::info!(spec = %spec.name, pid = child.id(), "kernel process started");

        let (outbound, to_child) = mpsc::unbounded_channel();
        let (from_child, inbound) = mpsc::unbounded_channel();
        tokio::spawn(supervise(spec.name.clone(), child, stdin, to_child));
        tokio::spawn(read_messages(spec.name.clone(), stdout, from_child));
        Ok(KernelChannel { outbound, inbound })
    }
}

/// Feed host messages to the child until either side goes away, then make
/// sure the child is reaped. Returns its exit status when one was observed.
async fn supervise(
    name: String,
    mut child: Child,
    mut stdin: ChildStdin,
    mut messages: mpsc::UnboundedReceiver<KernelMessage>,
) -> Option<ExitStatus> {
    loop {
        tokio::select! {
            status = child.wait() => {
                return match status {
                    Ok(status) => {
                        tracing::info!(kernel = %name, %status, "kernel process exited");
                        Some(status)
                    }
                    Err(err) => {
                        tracing::warn!(kernel = %name, "wait for kernel process: {err}");
                        None
                    }
                };
            }
            msg = messages.recv() => {
                let Some(msg) = msg else {
                    break;
                };
                if let Err(err) = write_message(&mut stdin, &msg).await {
                    tracing::warn!(kernel = %name, "write to kernel stdin: {err}");
                    break;
                }
            }
        }
    }
    drop(stdin);
    if let Err(err) = child.kill().await {
        tracing::debug!(kernel = %name, "kill kernel process: {err}");
    }
    let status = child.wait().await.ok();
    tracing::info!(kernel = %name, "kernel process stopped");
    status
}

async fn write_message(stdin: &mut ChildStdin, msg: &KernelMessage) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(msg)?;
    line.push(b'\n');
    stdin.write_all(&line).await?;
    stdin.flush().await
}

async fn read_messages(
    name: String,
    stdout: ChildStdout,
    messages: mpsc::UnboundedSender<KernelMessage>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match serde_json::from_str::<KernelMessage>(&line) {
                Ok(msg) => {
                    if messages.send(msg).is_err() {
                        break;
                    }
                }
                Err(err) => tracing::warn!(kernel = %name, "undecodable kernel output: {err}"),
            },
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(kernel = %name, "read kernel stdout: {err}");
                break;
            }
        }
    }
    tracing::debug!(kernel = %name, "kernel stdout closed");
}

#[cfg(all(test, unix))]
mod tests {
    use nbrun_protocol::Channel;
    use serde_json::json;

    use super::*;

    #[test]
    fn empty_command_is_rejected() {
        let spec = KernelSpec {
            name: "none".into(),
            argv: vec![],
        };
        assert!(matches!(
            ProcessKernel::spawn(&spec),
            Err(RegistryError::EmptyCommand(_))
        ));
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let spec = KernelSpec::from_command_line("ghost", "/nonexistent/nbrun-kernel").unwrap();
        assert!(matches!(
            ProcessKernel::spawn(&spec),
            Err(RegistryError::Spawn { .. })
        ));
    }

    #[tokio::test]
    async fn exited_process_closes_inbound() {
        let spec = KernelSpec::from_command_line("true", "true").unwrap();
        let mut channel = ProcessKernel::spawn(&spec).unwrap();
        assert!(channel.inbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn messages_round_trip_through_child_stdio() {
        let spec = KernelSpec::from_command_line("cat", "cat").unwrap();
        let mut channel = ProcessKernel::spawn(&spec).unwrap();
        let content = json!({"name": "stdout", "text": "hi"});
        let msg = KernelMessage::new(Channel::Iopub, "stream", "s", content);
        channel.outbound.send(msg.clone()).unwrap();
        let echoed = channel.inbound.recv().await.unwrap();
        assert_eq!(echoed, msg);

        drop(channel.outbound);
        assert!(channel.inbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn child_that_exits_on_its_own_is_reaped() {
        let mut child = Command::new("sh")
            .args(["-c", "exit 3"])
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let stdin = child.stdin.take().unwrap();
        // The host still holds the sender, so only the exit can end supervision.
        let (_outbound, messages) = mpsc::unbounded_channel::<KernelMessage>();

        let status = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            supervise("exit3".into(), child, stdin, messages),
        )
        .await
        .expect("child was not reaped")
        .unwrap();
        assert_eq!(status.code(), Some(3));
    }

    #[tokio::test]
    async fn dropping_the_sender_kills_and_reaps_the_child() {
        let mut child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let stdin = child.stdin.take().unwrap();
        let (outbound, messages) = mpsc::unbounded_channel::<KernelMessage>();
        drop(outbound);

        let status = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            supervise("sleeper".into(), child, stdin, messages),
        )
        .await
        .expect("child was not killed")
        .unwrap();
        assert!(!status.success());
    }
}

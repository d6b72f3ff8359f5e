//! A scripted kernel for tests and demos.
//!
//! Each line of submitted code is one directive:
//!
//! | line | effect |
//! |---|---|
//! | `print TEXT` / `eprint TEXT` | stdout / stderr stream `TEXT\n` |
//! | `display TEXT` | `display_data` with `text/plain` |
//! | `= TEXT` | `execute_result` with `text/plain` |
//! | `input PROMPT` / `password PROMPT` | `input_request`; the answer is echoed to stdout |
//! | `clear` / `clear wait` | `clear_output` |
//! | `sleep MS` | pause |
//! | `raise NAME: VALUE` | `error` output and an error reply; later lines are skipped |
//! | `hang` | never reply |
//! | `crash` | close the channel |
//!
//! Other lines are ignored.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use nbrun_protocol::message::{EXECUTE_REQUEST, INPUT_REPLY};
use nbrun_protocol::{Channel, KernelMessage};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::task::JoinHandle;

use crate::kernel::{KernelChannel, KernelEndpoint};

/// Handle to a scripted kernel task. Dropping it hangs up the kernel.
pub struct ScriptedKernel {
    received: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl ScriptedKernel {
    /// Start a kernel task and return the host side of its channel.
    pub fn spawn() -> (KernelChannel, ScriptedKernel) {
        let (channel, endpoint) = KernelChannel::pair();
        let received = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(run(endpoint, received.clone()));
        (channel, ScriptedKernel { received, task })
    }

    /// Code of every execute request received, in arrival order.
    pub fn received(&self) -> Vec<String> {
        self.received.lock().clone()
    }

    /// Kill the kernel, closing its channel.
    pub fn hang_up(&self) {
        self.task.abort();
    }
}

impl Drop for ScriptedKernel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum Flow {
    Continue,
    Stop,
    Crash,
}

struct Session {
    endpoint: KernelEndpoint,
    backlog: VecDeque<KernelMessage>,
    received: Arc<Mutex<Vec<String>>>,
    execution_count: i64,
}

/// Serve execute requests arriving on `endpoint` until the host hangs up.
pub async fn run(endpoint: KernelEndpoint, received: Arc<Mutex<Vec<String>>>) {
    let mut session = Session {
        endpoint,
        backlog: VecDeque::new(),
        received,
        execution_count: 0,
    };
    while let Some(msg) = session.next_message().await {
        if msg.msg_type() != EXECUTE_REQUEST {
            continue;
        }
        if !session.execute(msg).await {
            break;
        }
    }
}

impl Session {
    async fn next_message(&mut self) -> Option<KernelMessage> {
        match self.backlog.pop_front() {
            Some(msg) => Some(msg),
            None => self.endpoint.incoming.recv().await,
        }
    }

    fn send(
        &self,
        request: &KernelMessage,
        channel: Channel,
        msg_type: &str,
        content: Value,
    ) -> bool {
        let msg = KernelMessage::new(channel, msg_type, request.header.session.clone(), content)
            .with_parent(&request.header);
        self.endpoint.outgoing.send(msg).is_ok()
    }

    /// Run one execute request; false once the kernel should go away.
    async fn execute(&mut self, request: KernelMessage) -> bool {
        let code = request
            .content
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let allow_stdin = request
            .content
            .get("allow_stdin")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        self.received.lock().push(code.clone());
        self.execution_count += 1;
        let count = self.execution_count;

        self.status(&request, "busy");
        self.send(
            &request,
            Channel::Iopub,
            "execute_input",
            json!({"code": code, "execution_count": count}),
        );

        let mut error: Option<(String, String)> = None;
        for line in code.lines().map(str::trim) {
            let flow = self.step(&request, line, allow_stdin, count, &mut error);
            match flow.await {
                Flow::Continue => {}
                Flow::Stop => break,
                Flow::Crash => return false,
            }
        }

        let reply = match error {
            None => json!({"status": "ok", "execution_count": count}),
            Some((ename, evalue)) => json!({
                "status": "error",
                "execution_count": count,
                "ename": ename,
                "evalue": evalue,
                "traceback": [],
            }),
        };
        self.send(&request, Channel::Shell, "execute_reply", reply)
            && self.status(&request, "idle")
    }

    fn status(&self, request: &KernelMessage, state: &str) -> bool {
        let content = json!({"execution_state": state});
        self.send(request, Channel::Iopub, "status", content)
    }

    async fn step(
        &mut self,
        request: &KernelMessage,
        line: &str,
        allow_stdin: bool,
        count: i64,
        error: &mut Option<(String, String)>,
    ) -> Flow {
        let (directive, arg) = line.split_once(' ').unwrap_or((line, ""));
        match directive {
            "print" | "eprint" => {
                let name = if directive == "print" { "stdout" } else { "stderr" };
                self.send(
                    request,
                    Channel::Iopub,
                    "stream",
                    json!({"name": name, "text": format!("{arg}\n")}),
                );
            }
            "display" => {
                self.send(
                    request,
                    Channel::Iopub,
                    "display_data",
                    json!({"data": {"text/plain": arg}, "metadata": {}}),
                );
            }
            "=" => {
                self.send(
                    request,
                    Channel::Iopub,
                    "execute_result",
                    json!({"data": {"text/plain": arg}, "metadata": {}, "execution_count": count}),
                );
            }
            "input" | "password" => {
                if !allow_stdin {
                    return self.raise(
                        request,
                        "StdinNotImplementedError",
                        "raw_input was called, but this frontend does not support input requests.",
                        error,
                    );
                }
                let prompt = KernelMessage::new(
                    Channel::Stdin,
                    "input_request",
                    request.header.session.clone(),
                    json!({"prompt": arg, "password": directive == "password"}),
                )
                .with_parent(&request.header);
                let prompt_id = prompt.header.msg_id.clone();
                if self.endpoint.outgoing.send(prompt).is_err() {
                    return Flow::Crash;
                }
                let Some(value) = self.await_input_reply(&prompt_id).await else {
                    return Flow::Crash;
                };
                self.send(
                    request,
                    Channel::Iopub,
                    "stream",
                    json!({"name": "stdout", "text": format!("{value}\n")}),
                );
            }
            "clear" => {
                let content = json!({"wait": arg == "wait"});
                self.send(request, Channel::Iopub, "clear_output", content);
            }
            "sleep" => {
                let ms = arg.parse().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            "raise" => {
                let (ename, evalue) = arg.split_once(':').unwrap_or((arg, ""));
                return self.raise(request, ename.trim(), evalue.trim(), error);
            }
            "hang" => std::future::pending::<()>().await,
            "crash" => return Flow::Crash,
            _ => {}
        }
        Flow::Continue
    }

    fn raise(
        &self,
        request: &KernelMessage,
        ename: &str,
        evalue: &str,
        error: &mut Option<(String, String)>,
    ) -> Flow {
        self.send(
            request,
            Channel::Iopub,
            "error",
            json!({"ename": ename, "evalue": evalue, "traceback": [format!("{ename}: {evalue}")]}),
        );
        *error = Some((ename.to_string(), evalue.to_string()));
        Flow::Stop
    }

    /// Wait for the reply to `prompt_id`, holding back anything else.
    async fn await_input_reply(&mut self, prompt_id: &str) -> Option<String> {
        loop {
            let msg = self.endpoint.incoming.recv().await?;
            if msg.msg_type() == INPUT_REPLY && msg.parent_msg_id() == Some(prompt_id) {
                let value = msg.content.get("value").and_then(Value::as_str);
                return Some(value.unwrap_or_default().to_string());
            }
            self.backlog.push_back(msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelEvent;
    use crate::record::{KernelId, RequestId};
    use crate::kernel::KernelBridge;

    #[tokio::test]
    async fn scripted_kernel_streams_and_replies() {
        let (channel, kernel) = ScriptedKernel::spawn();
        let bridge = KernelBridge::new(KernelId::new("k"), channel, true);
        let mut exec = bridge
            .dispatch(&RequestId::from("r"), "print hello\n= 2")
            .unwrap();
        let mut events = Vec::new();
        while let Some(event) = exec.next_event().await {
            events.push(event);
        }
        assert_eq!(events.len(), 3);
        assert!(matches!(events[2], KernelEvent::Finished(_)));
        assert_eq!(kernel.received(), vec!["print hello\n= 2"]);
    }

    #[tokio::test]
    async fn input_without_stdin_raises() {
        let (channel, _kernel) = ScriptedKernel::spawn();
        let bridge = KernelBridge::new(KernelId::new("k"), channel, false);
        let request_id = RequestId::from("r");
        let mut exec = bridge.dispatch(&request_id, "input Name:").unwrap();
        let mut last = None;
        while let Some(event) = exec.next_event().await {
            last = Some(event);
        }
        let Some(KernelEvent::Finished(reply)) = last else {
            panic!("expected a reply");
        };
        let message = reply.error.unwrap().message;
        assert!(message.starts_with("StdinNotImplementedError"));
    }
}

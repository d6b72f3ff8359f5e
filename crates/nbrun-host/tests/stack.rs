use std::sync::Arc;
use std::time::{Duration, Instant};

use nbrun_host::document::{CellExecutionState, NotebookCell};
use nbrun_host::testkernel::ScriptedKernel;
use nbrun_host::{
    ExecutionStack, KernelId, KernelManager, NotebookStore, NullSink, RequestId, RequestSnapshot,
    StackError,
};
use nbrun_protocol::{ErrorKind, ExecutionStatus, OutputEvent, RequestMetadata, RequestState};

const TTL: Duration = Duration::from_secs(60);

struct Harness {
    stack: ExecutionStack,
    manager: Arc<KernelManager>,
    kernel_id: KernelId,
    kernel: ScriptedKernel,
}

fn harness() -> Harness {
    harness_with_ttl(TTL)
}

fn harness_with_ttl(ttl: Duration) -> Harness {
    let manager = Arc::new(KernelManager::new([], true));
    let (channel, kernel) = ScriptedKernel::spawn();
    let kernel_id = manager.attach("scripted", channel);
    let stack = ExecutionStack::new(manager.clone(), Arc::new(NullSink), ttl);
    Harness {
        stack,
        manager,
        kernel_id,
        kernel,
    }
}

impl Harness {
    fn submit(&self, code: &str) -> RequestId {
        self.stack
            .submit(&self.kernel_id, code, RequestMetadata::default())
            .expect("submit")
    }
}

async fn wait_for(
    stack: &ExecutionStack,
    id: &RequestId,
    done: impl Fn(&RequestSnapshot) -> bool,
) -> RequestSnapshot {
    for _ in 0..500 {
        let snapshot = stack.poll(id).expect("poll");
        if done(&snapshot) {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("request {id} never reached the expected state");
}

async fn wait_terminal(stack: &ExecutionStack, id: &RequestId) -> RequestSnapshot {
    wait_for(stack, id, |s| s.state.is_terminal()).await
}

#[tokio::test]
async fn stream_output_then_ok_reply() {
    let h = harness();
    let id = h.submit("sleep 50\nprint 1+1");
    let first = h.stack.poll(&id).unwrap();
    assert_eq!(first.state, RequestState::Running);
    assert!(first.result.is_none());

    let done = wait_terminal(&h.stack, &id).await;
    assert_eq!(done.state, RequestState::Completed);
    let result = done.result.unwrap();
    assert_eq!(result.status, ExecutionStatus::Ok);
    assert_eq!(result.execution_count, Some(1));
    assert_eq!(result.outputs, vec![OutputEvent::stream("stdout", "1+1\n")]);
}

#[tokio::test]
async fn kernel_receives_requests_in_submission_order() {
    let h = harness();
    let codes: Vec<String> = (0..20).map(|i| format!("print {i}")).collect();
    let ids: Vec<RequestId> = codes.iter().map(|code| h.submit(code)).collect();
    for id in &ids {
        wait_terminal(&h.stack, id).await;
    }
    assert_eq!(h.kernel.received(), codes);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn at_most_one_active_request_under_concurrent_submission() {
    let h = harness();
    let mut submitters = Vec::new();
    for task in 0..8 {
        let stack = h.stack.clone();
        let kernel_id = h.kernel_id.clone();
        submitters.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            for i in 0..5 {
                let code = format!("sleep 2\nprint {task}-{i}");
                let metadata = RequestMetadata::default();
                ids.push(stack.submit(&kernel_id, code, metadata).unwrap());
                tokio::task::yield_now().await;
            }
            ids
        }));
    }

    let mut ids = Vec::new();
    for submitter in submitters {
        ids.extend(submitter.await.unwrap());
    }
    loop {
        let summaries = h.stack.kernel_requests(&h.kernel_id);
        let active = summaries.iter().filter(|s| s.state.is_active()).count();
        assert!(active <= 1, "{active} requests hold the kernel at once");
        if summaries.len() == ids.len() && summaries.iter().all(|s| s.state.is_terminal()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(h.kernel.received().len(), 40);
}

#[tokio::test]
async fn poll_is_idempotent_without_kernel_activity() {
    let h = harness();
    let id = h.submit("print a\nhang");
    wait_for(&h.stack, &id, |s| s.outputs.len() == 1).await;
    let first = h.stack.poll(&id).unwrap();
    let second = h.stack.poll(&id).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.state, RequestState::Running);
}

#[tokio::test]
async fn input_when_none_pending_is_rejected_without_side_effects() {
    let h = harness();
    let running = h.submit("hang");
    let queued = h.submit("print later");
    let before = h.stack.poll(&running).unwrap();

    let err = h.stack.submit_input(&running, "x").unwrap_err();
    assert!(matches!(
        err,
        StackError::InvalidState {
            state: RequestState::Running,
            ..
        }
    ));
    let err = h.stack.submit_input(&queued, "x").unwrap_err();
    assert!(matches!(
        err,
        StackError::InvalidState {
            state: RequestState::Queued,
            ..
        }
    ));
    assert_eq!(h.stack.poll(&running).unwrap(), before);
    assert_eq!(h.stack.poll(&queued).unwrap().state, RequestState::Queued);
    assert!(matches!(
        h.stack.submit_input(&RequestId::from("missing"), "x"),
        Err(StackError::UnknownRequest(_))
    ));
}

#[tokio::test]
async fn input_prompt_round_trip() {
    let h = harness();
    let id = h.submit("print before\ninput Name:");
    let pending = wait_for(&h.stack, &id, |s| s.state == RequestState::PendingInput).await;
    let prompt = pending.pending_input.expect("pending input");
    assert_eq!(prompt.request.prompt, "Name:");
    assert!(!prompt.request.password);

    h.stack.submit_input(&id, "Ada").unwrap();
    let after = h.stack.poll(&id).unwrap();
    assert_ne!(after.state, RequestState::PendingInput);
    assert!(after.pending_input.is_none());
    assert!(h.stack.submit_input(&id, "again").is_err());

    let done = wait_terminal(&h.stack, &id).await;
    assert_eq!(
        done.result.unwrap().outputs,
        vec![
            OutputEvent::stream("stdout", "before\n"),
            OutputEvent::stream("stdout", "Ada\n"),
        ]
    );
}

#[tokio::test]
async fn pending_input_keeps_the_kernel_slot() {
    let h = harness();
    let first = h.submit("input Continue?");
    let second = h.submit("print next");
    wait_for(&h.stack, &first, |s| s.state == RequestState::PendingInput).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.stack.poll(&second).unwrap().state, RequestState::Queued);
    assert_eq!(h.kernel.received(), vec!["input Continue?"]);

    let answered = h.stack.submit_kernel_input(&h.kernel_id, "y").unwrap();
    assert_eq!(answered, first);
    wait_terminal(&h.stack, &second).await;
    assert_eq!(h.kernel.received(), vec!["input Continue?", "print next"]);
    assert!(matches!(
        h.stack.submit_kernel_input(&h.kernel_id, "y"),
        Err(StackError::NoPendingInput(_))
    ));
}

#[tokio::test]
async fn kernel_error_reply_is_a_normal_terminal_result() {
    let h = harness();
    let id = h.submit("print x\nraise ValueError: bad value");
    let done = wait_terminal(&h.stack, &id).await;
    assert_eq!(done.state, RequestState::Errored);
    let result = done.result.unwrap();
    assert_eq!(result.status, ExecutionStatus::Error);
    assert_eq!(result.outputs.len(), 2);
    let error = result.error.unwrap();
    assert_eq!(error.kind, ErrorKind::KernelExecutionError);
    assert_eq!(error.message, "ValueError: bad value");
}

#[tokio::test]
async fn disconnect_mid_run_errors_running_and_queued_requests() {
    let h = harness();
    let running = h.submit("print partial\nhang");
    let queued = h.submit("print never");
    wait_for(&h.stack, &running, |s| s.outputs.len() == 1).await;

    h.kernel.hang_up();
    let done = wait_terminal(&h.stack, &running).await;
    let result = done.result.unwrap();
    assert_eq!(result.status, ExecutionStatus::Error);
    assert_eq!(result.error.unwrap().kind, ErrorKind::KernelDisconnected);
    assert_eq!(
        result.outputs,
        vec![OutputEvent::stream("stdout", "partial\n")]
    );

    let queued = wait_terminal(&h.stack, &queued).await;
    let error = queued.result.unwrap().error.unwrap();
    assert_eq!(error.kind, ErrorKind::KernelDisconnected);
    let metadata = RequestMetadata::default();
    assert!(matches!(
        h.stack.submit(&h.kernel_id, "print x", metadata),
        Err(StackError::UnknownKernel(_))
    ));
}

#[tokio::test]
async fn shutting_down_a_kernel_fails_its_outstanding_requests() {
    let h = harness();
    let running = h.submit("hang");
    let queued = h.submit("print b");
    h.manager.shutdown(&h.kernel_id).unwrap();
    for id in [&running, &queued] {
        let done = wait_terminal(&h.stack, id).await;
        let error = done.result.unwrap().error.unwrap();
        assert_eq!(error.kind, ErrorKind::KernelDisconnected);
    }
}

#[tokio::test]
async fn unknown_kernel_and_request_are_rejected() {
    let h = harness();
    let metadata = RequestMetadata::default();
    assert!(matches!(
        h.stack.submit(&KernelId::new("nope"), "print x", metadata),
        Err(StackError::UnknownKernel(_))
    ));
    assert!(matches!(
        h.stack.poll(&RequestId::from("nope")),
        Err(StackError::UnknownRequest(_))
    ));
    assert!(h.stack.kernel_requests(&KernelId::new("nope")).is_empty());
}

#[tokio::test]
async fn retrieve_hands_out_a_terminal_result_once() {
    let h = harness();
    let id = h.submit("sleep 30\nprint done");
    let early = h.stack.retrieve(&h.kernel_id, &id).unwrap();
    assert!(!early.state.is_terminal());

    wait_terminal(&h.stack, &id).await;
    assert!(matches!(
        h.stack.retrieve(&KernelId::new("other"), &id),
        Err(StackError::UnknownRequest(_))
    ));
    let done = h.stack.retrieve(&h.kernel_id, &id).unwrap();
    assert_eq!(done.state, RequestState::Completed);
    assert!(matches!(
        h.stack.retrieve(&h.kernel_id, &id),
        Err(StackError::UnknownRequest(_))
    ));
    assert!(matches!(
        h.stack.poll(&id),
        Err(StackError::UnknownRequest(_))
    ));
    assert!(h.stack.kernel_requests(&h.kernel_id).is_empty());
}

#[tokio::test]
async fn unretrieved_results_expire_but_active_requests_do_not() {
    let h = harness();
    let finished = h.submit("print x");
    wait_terminal(&h.stack, &finished).await;
    let active = h.submit("hang");

    assert_eq!(h.stack.sweep_expired_at(Instant::now()), 0);
    assert_eq!(h.stack.sweep_expired_at(Instant::now() + TTL * 2), 1);
    assert!(matches!(
        h.stack.poll(&finished),
        Err(StackError::UnknownRequest(_))
    ));

    let next_day = Instant::now() + Duration::from_secs(86_400);
    assert_eq!(h.stack.sweep_expired_at(next_day), 0);
    assert_eq!(h.stack.poll(&active).unwrap().state, RequestState::Running);
}

#[tokio::test]
async fn background_sweeper_drops_expired_results() {
    let h = harness_with_ttl(Duration::from_millis(50));
    let finished = h.submit("print x");
    wait_terminal(&h.stack, &finished).await;
    let active = h.submit("hang");
    h.stack.spawn_sweeper(Duration::from_millis(20));

    let mut swept = false;
    for _ in 0..200 {
        if matches!(h.stack.poll(&finished), Err(StackError::UnknownRequest(_))) {
            swept = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(swept, "sweeper never dropped the expired result");
    assert_eq!(h.stack.poll(&active).unwrap().state, RequestState::Running);
    h.stack.shutdown();
}

#[tokio::test]
async fn kernels_progress_independently() {
    let manager = Arc::new(KernelManager::new([], true));
    let (slow_channel, _slow) = ScriptedKernel::spawn();
    let (fast_channel, _fast) = ScriptedKernel::spawn();
    let slow = manager.attach("slow", slow_channel);
    let fast = manager.attach("fast", fast_channel);
    let stack = ExecutionStack::new(manager.clone(), Arc::new(NullSink), TTL);

    let metadata = RequestMetadata::default();
    let blocked = stack.submit(&slow, "hang", metadata.clone()).unwrap();
    let quick = stack.submit(&fast, "print quick", metadata).unwrap();
    let done = wait_terminal(&stack, &quick).await;
    assert_eq!(done.state, RequestState::Completed);
    assert_eq!(stack.poll(&blocked).unwrap().state, RequestState::Running);
}

#[tokio::test]
async fn outputs_are_mirrored_into_the_document_cell() {
    let manager = Arc::new(KernelManager::new([], true));
    let (channel, _kernel) = ScriptedKernel::spawn();
    let kernel_id = manager.attach("scripted", channel);
    let documents = Arc::new(NotebookStore::new());
    documents.upsert_cell("doc-1", NotebookCell::code("cell-1", "..."));
    let stack = ExecutionStack::new(manager.clone(), documents.clone(), TTL);

    let metadata = RequestMetadata {
        document_id: Some("doc-1".into()),
        cell_id: Some("cell-1".into()),
        record_timing: true,
        ..Default::default()
    };
    let id = stack
        .submit(&kernel_id, "print a\nclear\nprint b\n= 3", metadata)
        .unwrap();
    let done = wait_terminal(&stack, &id).await;
    // The record keeps every output; the cell honors the clear.
    assert_eq!(done.outputs.len(), 3);

    let cell = documents.cell("doc-1", "cell-1").unwrap();
    assert_eq!(cell.outputs.len(), 2);
    assert_eq!(cell.outputs[0], OutputEvent::stream("stdout", "b\n"));
    assert_eq!(cell.outputs[1].output_type(), "execute_result");
    assert_eq!(cell.execution_count, Some(1));
    assert_eq!(cell.execution_state, CellExecutionState::Idle);
    let timing = cell.metadata["execution"].as_object().unwrap();
    assert!(timing.contains_key("shell.execute_reply.started"));
    assert!(timing.contains_key("shell.execute_reply"));
}

#[tokio::test]
async fn missing_document_cell_does_not_fail_the_execution() {
    let manager = Arc::new(KernelManager::new([], true));
    let (channel, _kernel) = ScriptedKernel::spawn();
    let kernel_id = manager.attach("scripted", channel);
    let stack = ExecutionStack::new(manager.clone(), Arc::new(NotebookStore::new()), TTL);
    let metadata = RequestMetadata {
        document_id: Some("ghost".into()),
        cell_id: Some("cell".into()),
        ..Default::default()
    };
    let id = stack.submit(&kernel_id, "print ok", metadata).unwrap();
    let done = wait_terminal(&stack, &id).await;
    assert_eq!(done.state, RequestState::Completed);
}

#[tokio::test]
async fn shutdown_releases_a_blocked_prompt() {
    let h = harness();
    let id = h.submit("input Name:");
    wait_for(&h.stack, &id, |s| s.state == RequestState::PendingInput).await;
    h.stack.shutdown();
    let snapshot = h.stack.poll(&id).unwrap();
    assert_eq!(snapshot.state, RequestState::Running);
    assert!(snapshot.pending_input.is_none());
}

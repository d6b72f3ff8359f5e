//! Per-kernel execution stack.
//!
//! Every kernel gets a lane: a FIFO of queued request ids, a slot for the one
//! request currently holding the kernel, and the records of every retained
//! request. A lane is guarded by its own mutex, so unrelated kernels never
//! contend. Submitting, polling and answering prompts only touch lane state
//! and return immediately; the request holding a lane is driven by a
//! background task that consumes its bridge events and, once the request is
//! terminal, promotes the next queued request.
//!
//! There is no execution timeout. A kernel that never replies keeps its
//! request `RUNNING` (or `PENDING_INPUT`) and blocks its lane; outputs are
//! never dropped to regain liveness.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nbrun_protocol::{
    ErrorKind, ExecutionResult, ExecutionStatus, RequestMetadata, RequestState, RequestSummary,
    now_timestamp,
};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::document::{CellEvent, CellTarget, DocumentSink};
use crate::error::{BridgeError, StackError};
use crate::events;
use crate::kernel::{ExecuteReply, Execution, KernelEvent, KernelRegistry};
use crate::record::{KernelId, RequestId, RequestRecord, RequestSnapshot};

#[derive(Default)]
struct Lane {
    queue: VecDeque<RequestId>,
    current: Option<RequestId>,
    records: HashMap<RequestId, RequestRecord>,
    /// Retained request ids in submission order.
    order: Vec<RequestId>,
    worker: Option<JoinHandle<()>>,
}

impl Lane {
    fn record(&self, id: &RequestId) -> Result<&RequestRecord, StackError> {
        self.records
            .get(id)
            .ok_or_else(|| StackError::UnknownRequest(id.clone()))
    }

    fn record_mut(&mut self, id: &RequestId) -> Result<&mut RequestRecord, StackError> {
        self.records
            .get_mut(id)
            .ok_or_else(|| StackError::UnknownRequest(id.clone()))
    }

    fn remove(&mut self, id: &RequestId) -> Option<RequestRecord> {
        let record = self.records.remove(id)?;
        self.order.retain(|other| other != id);
        Some(record)
    }

    fn is_idle_and_empty(&self) -> bool {
        self.records.is_empty() && self.queue.is_empty() && self.current.is_none()
    }
}

type LaneRef = Arc<Mutex<Lane>>;

enum Outcome {
    Reply(ExecuteReply),
    Disconnected,
}

struct StackInner {
    registry: Arc<dyn KernelRegistry>,
    sink: Arc<dyn DocumentSink>,
    lanes: RwLock<HashMap<KernelId, LaneRef>>,
    index: RwLock<HashMap<RequestId, KernelId>>,
    result_ttl: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap to clone; all clones share the same lanes.
#[derive(Clone)]
pub struct ExecutionStack {
    inner: Arc<StackInner>,
}

impl ExecutionStack {
    pub fn new(
        registry: Arc<dyn KernelRegistry>,
        sink: Arc<dyn DocumentSink>,
        result_ttl: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(StackInner {
                registry,
                sink,
                lanes: RwLock::default(),
                index: RwLock::default(),
                result_ttl,
                sweeper: Mutex::new(None),
            }),
        }
    }

    /// Queue `code` on `kernel_id`, starting it at once when the kernel is
    /// idle. Never waits for execution.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(
        &self,
        kernel_id: &KernelId,
        code: impl Into<String>,
        metadata: RequestMetadata,
    ) -> Result<RequestId, StackError> {
        let inner = &self.inner;
        if !inner.registry.is_alive(kernel_id) {
            return Err(StackError::UnknownKernel(kernel_id.clone()));
        }
        let id = RequestId::generate();
        let record = RequestRecord::new(id.clone(), kernel_id.clone(), code, metadata);
        let mut record = Some(record);
        loop {
            {
                // Holding the map read lock keeps the sweeper from pruning
                // this lane between lookup and insert.
                let lanes = inner.lanes.read();
                if let Some(lane) = lanes.get(kernel_id) {
                    let mut lane = lane.lock();
                    if let Some(record) = record.take() {
                        lane.records.insert(id.clone(), record);
                    }
                    lane.order.push(id.clone());
                    lane.queue.push_back(id.clone());
                    inner.index.write().insert(id.clone(), kernel_id.clone());
                    tracing::debug!(
                        kernel = %kernel_id,
                        request = %id,
                        queued = lane.queue.len(),
                        "request submitted"
                    );
                    inner.promote_next(kernel_id, &mut lane);
                    return Ok(id);
                }
            }
            inner.lanes.write().entry(kernel_id.clone()).or_default();
        }
    }

    /// Copy of the request's current state. Never mutates anything.
    pub fn poll(&self, id: &RequestId) -> Result<RequestSnapshot, StackError> {
        let lane = self.inner.lane_of(id)?;
        let lane = lane.lock();
        Ok(lane.record(id)?.snapshot())
    }

    /// Like [`poll`](Self::poll), scoped to `kernel_id`, and a terminal
    /// record is removed in the same critical section that reads it, so a
    /// result is handed out exactly once.
    pub fn retrieve(
        &self,
        kernel_id: &KernelId,
        id: &RequestId,
    ) -> Result<RequestSnapshot, StackError> {
        let lane = self.inner.lane_of(id)?;
        let snapshot = {
            let mut lane = lane.lock();
            let snapshot = lane.record(id)?.snapshot();
            if &snapshot.kernel_id != kernel_id {
                return Err(StackError::UnknownRequest(id.clone()));
            }
            if snapshot.state.is_terminal() {
                lane.remove(id);
            }
            snapshot
        };
        if snapshot.state.is_terminal() {
            self.inner.index.write().remove(id);
            tracing::debug!(kernel = %kernel_id, request = %id, "result retrieved");
        }
        Ok(snapshot)
    }

    /// Answer the prompt `id` is blocked on.
    ///
    /// The reply is sent before the record leaves `PENDING_INPUT`, and both
    /// happen under the lane lock, so at most one reply is ever in flight.
    pub fn submit_input(&self, id: &RequestId, value: &str) -> Result<(), StackError> {
        let lane = self.inner.lane_of(id)?;
        let mut lane = lane.lock();
        self.inner.answer_prompt(&mut lane, id, value)
    }

    /// Answer whichever request of `kernel_id` is waiting for input.
    pub fn submit_kernel_input(
        &self,
        kernel_id: &KernelId,
        value: &str,
    ) -> Result<RequestId, StackError> {
        let lane = self
            .inner
            .lane(kernel_id)
            .ok_or_else(|| StackError::NoPendingInput(kernel_id.clone()))?;
        let mut lane = lane.lock();
        let id = lane
            .current
            .clone()
            .filter(|id| {
                lane.records
                    .get(id)
                    .is_some_and(|record| record.state() == RequestState::PendingInput)
            })
            .ok_or_else(|| StackError::NoPendingInput(kernel_id.clone()))?;
        self.inner.answer_prompt(&mut lane, &id, value)?;
        Ok(id)
    }

    /// Retained requests of `kernel_id` in submission order, read in one
    /// critical section.
    pub fn kernel_requests(&self, kernel_id: &KernelId) -> Vec<RequestSummary> {
        let Some(lane) = self.inner.lane(kernel_id) else {
            return Vec::new();
        };
        let lane = lane.lock();
        lane.order
            .iter()
            .filter_map(|id| lane.records.get(id))
            .map(|record| RequestSummary {
                uid: record.id().to_string(),
                state: record.state(),
            })
            .collect()
    }

    /// Drop terminal records that have gone unretrieved for the retention
    /// period as of `now`, and lanes left with nothing in them. Returns the
    /// number of records dropped.
    pub fn sweep_expired_at(&self, now: Instant) -> usize {
        let inner = &self.inner;
        let lanes: Vec<(KernelId, LaneRef)> = inner
            .lanes
            .read()
            .iter()
            .map(|(kernel_id, lane)| (kernel_id.clone(), lane.clone()))
            .collect();
        let mut expired = Vec::new();
        let mut empty = Vec::new();
        for (kernel_id, lane) in lanes {
            let mut lane = lane.lock();
            let ids: Vec<RequestId> = lane
                .records
                .values()
                .filter(|record| record.expired(now, inner.result_ttl))
                .map(|record| record.id().clone())
                .collect();
            for id in ids {
                lane.remove(&id);
                expired.push(id);
            }
            if lane.is_idle_and_empty() {
                empty.push(kernel_id);
            }
        }
        if !expired.is_empty() {
            let mut index = inner.index.write();
            for id in &expired {
                index.remove(id);
            }
            tracing::info!(count = expired.len(), "swept unretrieved results");
        }
        if !empty.is_empty() {
            let mut lanes = inner.lanes.write();
            for kernel_id in empty {
                let prune = lanes
                    .get(&kernel_id)
                    .is_some_and(|lane| lane.lock().is_idle_and_empty());
                if prune && !inner.registry.is_alive(&kernel_id) {
                    lanes.remove(&kernel_id);
                }
            }
        }
        expired.len()
    }

    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Instant::now())
    }

    /// Sweep every `interval` in the background until [`shutdown`](Self::shutdown).
    pub fn spawn_sweeper(&self, interval: Duration) {
        let stack = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                stack.sweep_expired();
            }
        });
        if let Some(previous) = self.inner.sweeper.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Release kernels blocked on a prompt with an empty answer, stop the
    /// sweeper and abort every worker.
    pub fn shutdown(&self) {
        if let Some(sweeper) = self.inner.sweeper.lock().take() {
            sweeper.abort();
        }
        let lanes: Vec<LaneRef> = self.inner.lanes.read().values().cloned().collect();
        for lane in lanes {
            let mut lane = lane.lock();
            let pending = lane.current.clone().filter(|id| {
                lane.records
                    .get(id)
                    .is_some_and(|record| record.state() == RequestState::PendingInput)
            });
            if let Some(id) = pending {
                if let Err(err) = self.inner.answer_prompt(&mut lane, &id, "") {
                    tracing::warn!(request = %id, "release pending input: {err}");
                }
            }
            if let Some(worker) = lane.worker.take() {
                worker.abort();
            }
        }
        tracing::info!("execution stack shut down");
    }
}

impl StackInner {
    fn lane(&self, kernel_id: &KernelId) -> Option<LaneRef> {
        self.lanes.read().get(kernel_id).cloned()
    }

    fn lane_of(&self, id: &RequestId) -> Result<LaneRef, StackError> {
        let kernel_id = self
            .index
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StackError::UnknownRequest(id.clone()))?;
        self.lane(&kernel_id)
            .ok_or_else(|| StackError::UnknownRequest(id.clone()))
    }

    fn answer_prompt(
        &self,
        lane: &mut Lane,
        id: &RequestId,
        value: &str,
    ) -> Result<(), StackError> {
        let record = lane.record_mut(id)?;
        let pending = match (record.state(), record.pending_input()) {
            (RequestState::PendingInput, Some(pending)) => pending.clone(),
            (state, _) => {
                return Err(StackError::InvalidState {
                    id: id.clone(),
                    state,
                });
            }
        };
        let kernel_id = record.kernel_id().clone();
        let bridge = self
            .registry
            .bridge(&kernel_id)
            .ok_or_else(|| StackError::KernelDisconnected(kernel_id.clone()))?;
        bridge
            .send_input(&pending.parent_header, value)
            .map_err(|_| StackError::KernelDisconnected(kernel_id.clone()))?;
        record.resume()?;
        tracing::debug!(kernel = %kernel_id, request = %id, "input submitted");
        Ok(())
    }

    /// Start queued requests until one is running or the queue is empty.
    /// A request that cannot be dispatched is failed on the spot so it never
    /// blocks the lane.
    fn promote_next(self: &Arc<Self>, kernel_id: &KernelId, lane: &mut Lane) {
        while lane.current.is_none() {
            let Some(id) = lane.queue.pop_front() else {
                return;
            };
            let Some(record) = lane.records.get_mut(&id) else {
                continue;
            };
            if let Err(err) = record.start() {
                tracing::error!(request = %id, "cannot start queued request: {err}");
                continue;
            }
            let dispatched = self
                .registry
                .bridge(kernel_id)
                .ok_or(BridgeError::Closed)
                .and_then(|bridge| bridge.dispatch(&id, record.code()));
            match dispatched {
                Ok(execution) => {
                    let target = CellTarget::from_metadata(record.metadata());
                    let record_timing = record.metadata().record_timing;
                    lane.current = Some(id.clone());
                    let inner = Arc::clone(self);
                    let task = inner.drive(kernel_id.clone(), id, target, record_timing, execution);
                    lane.worker = Some(tokio::spawn(task));
                }
                Err(err) => {
                    tracing::warn!(
                        kernel = %kernel_id,
                        request = %id,
                        "dispatch failed: {err}"
                    );
                    let message = format!("kernel {kernel_id} disconnected");
                    if let Err(err) = record.fail(ErrorKind::KernelDisconnected, message) {
                        tracing::error!(request = %id, "cannot fail undispatched request: {err}");
                    }
                }
            }
        }
    }

    /// Background unit of work for the request holding a lane.
    async fn drive(
        self: Arc<Self>,
        kernel_id: KernelId,
        id: RequestId,
        target: Option<CellTarget>,
        record_timing: bool,
        mut execution: Execution,
    ) {
        tracing::debug!(
            kernel = %kernel_id,
            request = %id,
            token = execution.token(),
            "execution started"
        );
        if let Some(target) = &target {
            let at = now_timestamp();
            events::execution_start(target, &at);
            let started = CellEvent::ExecutionStarted { record_timing, at };
            self.push(target, started).await;
        }

        let outcome = loop {
            match execution.next_event().await {
                Some(KernelEvent::Output(output)) => {
                    let appended = self.update(&kernel_id, &id, |record| {
                        record.push_output(output.clone())
                    });
                    if !appended {
                        continue;
                    }
                    if let Some(target) = &target {
                        self.push(target, CellEvent::Output(output)).await;
                    }
                }
                Some(KernelEvent::ClearOutput { wait }) => {
                    if let Some(target) = &target {
                        self.push(target, CellEvent::ClearOutput { wait }).await;
                    }
                }
                Some(KernelEvent::InputRequested(pending)) => {
                    self.update(&kernel_id, &id, |record| record.await_input(pending));
                }
                Some(KernelEvent::Finished(reply)) => break Outcome::Reply(reply),
                Some(KernelEvent::Disconnected) | None => break Outcome::Disconnected,
            }
        };

        let (status, execution_count) = match &outcome {
            Outcome::Reply(reply) => (reply.status, reply.execution_count),
            Outcome::Disconnected => (ExecutionStatus::Error, None),
        };
        if let Some(target) = &target {
            let finished = CellEvent::ExecutionFinished {
                execution_count,
                status,
                record_timing,
                at: now_timestamp(),
            };
            self.push(target, finished).await;
        }

        let result = self.complete(&kernel_id, &id, outcome);
        if let (Some(target), Some(result)) = (&target, &result) {
            events::execution_end(target, result, &now_timestamp());
        }
    }

    /// Apply `f` to a record held by this lane; false (and a log line) when it
    /// is rejected.
    fn update(
        &self,
        kernel_id: &KernelId,
        id: &RequestId,
        f: impl FnOnce(&mut RequestRecord) -> Result<(), StackError>,
    ) -> bool {
        let Some(lane) = self.lane(kernel_id) else {
            return false;
        };
        let mut lane = lane.lock();
        match lane.record_mut(id).and_then(f) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(kernel = %kernel_id, request = %id, "dropping kernel event: {err}");
                false
            }
        }
    }

    /// Terminal transition, then hand the lane to the next queued request.
    fn complete(
        self: &Arc<Self>,
        kernel_id: &KernelId,
        id: &RequestId,
        outcome: Outcome,
    ) -> Option<ExecutionResult> {
        let lane = self.lane(kernel_id)?;
        let mut lane = lane.lock();
        let result = lane.record_mut(id).and_then(|record| {
            let finished = match outcome {
                Outcome::Reply(reply) => {
                    record.finish(reply.status, reply.execution_count, reply.error)
                }
                Outcome::Disconnected => record.fail(
                    ErrorKind::KernelDisconnected,
                    format!("kernel {kernel_id} disconnected"),
                ),
            };
            finished.cloned()
        });
        match &result {
            Ok(result) => {
                tracing::info!(
                    kernel = %kernel_id,
                    request = %id,
                    status = ?result.status,
                    "execution finished"
                );
            }
            Err(err) => {
                tracing::warn!(
                    kernel = %kernel_id,
                    request = %id,
                    "completion rejected: {err}"
                );
            }
        }
        if lane.current.as_ref() == Some(id) {
            lane.current = None;
            lane.worker = None;
        }
        self.promote_next(kernel_id, &mut lane);
        result.ok()
    }

    async fn push(&self, target: &CellTarget, event: CellEvent) {
        if let Err(err) = self.sink.push(target, event).await {
            tracing::warn!(
                document = %target.document_id,
                cell = %target.cell_id,
                "document update failed: {err}"
            );
        }
    }
}

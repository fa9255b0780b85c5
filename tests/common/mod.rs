//! Shared mock stage and transports for the schedule integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ndarray::IxDyn;
use tokio::sync::{Mutex as AsyncMutex, Notify};

use pipeline_sched::{
    Args, Kwargs, P2pKind, P2pOp, PipelineStage, StageError, Tensor, Transport, TransportError,
    WorkHandle,
};

/// Everything a schedule did to a stage, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Cleared { stage: usize },
    Forward { stage: usize, mb: usize },
    Backward { stage: usize, mb: usize },
    DataParallel { stage: usize, last_backward: bool },
}

#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<Event>>>);

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }

    pub fn forwards(&self) -> Vec<Event> {
        self.snapshot()
            .into_iter()
            .filter(|e| matches!(e, Event::Forward { .. }))
            .collect()
    }

    pub fn backwards(&self) -> Vec<Event> {
        self.snapshot()
            .into_iter()
            .filter(|e| matches!(e, Event::Backward { .. }))
            .collect()
    }
}

pub fn arange(len: usize) -> Tensor {
    Tensor::from_shape_vec(IxDyn(&[len]), (0..len).map(|v| v as f32).collect())
        .expect("shape matches data")
}

pub fn scalar(v: f32) -> Tensor {
    Tensor::from_elem(IxDyn(&[]), v)
}

/// Sum-of-squared-error loss used throughout the tests.
pub fn sse_loss() -> pipeline_sched::LossFn {
    Box::new(|output: &Tensor, target: &Tensor| scalar((output - target).mapv(|v| v * v).sum()))
}

/// A stage that records every call and computes `input * 2 + stage_index`
/// elementwise, so a chain of stages yields an exactly predictable output.
///
/// The first stage reads its input from `args[0]`; later stages pop the
/// activation most recently delivered to `inbox` (when wired to a loopback
/// transport) or fall back to a unit placeholder.
pub struct MockStage {
    stage_index: usize,
    num_stages: usize,
    group_rank: usize,
    group_size: usize,
    has_backward: bool,
    log: EventLog,
    inbox: Option<Arc<AsyncMutex<VecDeque<Tensor>>>>,
    outputs: Vec<Tensor>,
    last_output: Option<Tensor>,
    fwd_count: usize,
    bwd_count: usize,
}

impl MockStage {
    pub fn new(
        stage_index: usize,
        num_stages: usize,
        group_rank: usize,
        group_size: usize,
        log: EventLog,
    ) -> Self {
        Self {
            stage_index,
            num_stages,
            group_rank,
            group_size,
            has_backward: false,
            log,
            inbox: None,
            outputs: Vec::new(),
            last_output: None,
            fwd_count: 0,
            bwd_count: 0,
        }
    }

    /// Wire this stage to the inbox a [`LoopbackTransport`] delivers into.
    pub fn with_inbox(mut self, inbox: Arc<AsyncMutex<VecDeque<Tensor>>>) -> Self {
        self.inbox = Some(inbox);
        self
    }

    fn prev_peer(&self) -> usize {
        (self.stage_index + self.group_size - 1) % self.group_size
    }

    fn next_peer(&self) -> usize {
        (self.stage_index + 1) % self.group_size
    }
}

#[async_trait]
impl PipelineStage for MockStage {
    fn stage_index(&self) -> usize {
        self.stage_index
    }

    fn num_stages(&self) -> usize {
        self.num_stages
    }

    fn group_rank(&self) -> usize {
        self.group_rank
    }

    fn group_size(&self) -> usize {
        self.group_size
    }

    fn set_has_backward(&mut self, has_backward: bool) {
        self.has_backward = has_backward;
    }

    fn clear_runtime_states(&mut self) {
        self.outputs.clear();
        self.last_output = None;
        self.fwd_count = 0;
        self.bwd_count = 0;
        self.log.push(Event::Cleared {
            stage: self.stage_index,
        });
    }

    async fn forward_one_chunk(
        &mut self,
        args: Args,
        _kwargs: Kwargs,
    ) -> Result<Tensor, StageError> {
        let input = if self.is_first() {
            args.into_iter()
                .next()
                .unwrap_or_else(|| Tensor::zeros(IxDyn(&[1])))
        } else if let Some(inbox) = &self.inbox {
            inbox
                .lock()
                .await
                .pop_front()
                .expect("activation not delivered before forward")
        } else {
            Tensor::zeros(IxDyn(&[1]))
        };

        let output = input.mapv(|v| v * 2.0 + self.stage_index as f32);
        self.outputs.push(output.clone());
        self.last_output = Some(output.clone());
        self.log.push(Event::Forward {
            stage: self.stage_index,
            mb: self.fwd_count,
        });
        self.fwd_count += 1;
        Ok(output)
    }

    async fn backward_one_chunk(&mut self, loss: Option<Tensor>) -> Result<(), StageError> {
        if self.is_last() && self.has_backward {
            assert!(loss.is_some(), "last stage backward expects a loss");
        } else {
            assert!(loss.is_none(), "non-last stage backward got a loss");
        }
        self.log.push(Event::Backward {
            stage: self.stage_index,
            mb: self.bwd_count,
        });
        self.bwd_count += 1;
        Ok(())
    }

    fn get_fwd_recv_ops(&mut self) -> Vec<P2pOp> {
        if self.is_first() {
            Vec::new()
        } else {
            vec![P2pOp::recv(self.prev_peer(), Tensor::zeros(IxDyn(&[1])))]
        }
    }

    fn get_fwd_send_ops(&mut self) -> Vec<P2pOp> {
        if self.is_last() {
            Vec::new()
        } else {
            let payload = self
                .last_output
                .clone()
                .unwrap_or_else(|| Tensor::zeros(IxDyn(&[1])));
            vec![P2pOp::send(self.next_peer(), payload)]
        }
    }

    fn get_bwd_recv_ops(&mut self) -> Vec<P2pOp> {
        if self.is_last() {
            Vec::new()
        } else {
            vec![P2pOp::recv(self.next_peer(), Tensor::zeros(IxDyn(&[1])))]
        }
    }

    fn get_bwd_send_ops(&mut self) -> Vec<P2pOp> {
        if self.is_first() {
            Vec::new()
        } else {
            vec![P2pOp::send(self.prev_peer(), Tensor::zeros(IxDyn(&[1])))]
        }
    }

    fn configure_data_parallel_mode(&mut self, last_backward: bool) {
        self.log.push(Event::DataParallel {
            stage: self.stage_index,
            last_backward,
        });
    }

    fn output_chunks(&self) -> &[Tensor] {
        &self.outputs
    }
}

/// A stage whose forward always fails, for error-propagation tests.
pub struct FailingStage {
    inner: MockStage,
}

impl FailingStage {
    pub fn new(stage_index: usize, num_stages: usize, log: EventLog) -> Self {
        Self {
            inner: MockStage::new(stage_index, num_stages, stage_index, num_stages, log),
        }
    }
}

#[async_trait]
impl PipelineStage for FailingStage {
    fn stage_index(&self) -> usize {
        self.inner.stage_index()
    }

    fn num_stages(&self) -> usize {
        self.inner.num_stages()
    }

    fn group_rank(&self) -> usize {
        self.inner.group_rank()
    }

    fn group_size(&self) -> usize {
        self.inner.group_size()
    }

    fn set_has_backward(&mut self, has_backward: bool) {
        self.inner.set_has_backward(has_backward);
    }

    fn clear_runtime_states(&mut self) {
        self.inner.clear_runtime_states();
    }

    async fn forward_one_chunk(
        &mut self,
        _args: Args,
        _kwargs: Kwargs,
    ) -> Result<Tensor, StageError> {
        Err(StageError::ForwardFailed {
            micro_batch: 0,
            reason: "kernel exploded".into(),
        })
    }

    async fn backward_one_chunk(&mut self, loss: Option<Tensor>) -> Result<(), StageError> {
        self.inner.backward_one_chunk(loss).await
    }

    fn get_fwd_recv_ops(&mut self) -> Vec<P2pOp> {
        self.inner.get_fwd_recv_ops()
    }

    fn get_fwd_send_ops(&mut self) -> Vec<P2pOp> {
        self.inner.get_fwd_send_ops()
    }

    fn get_bwd_recv_ops(&mut self) -> Vec<P2pOp> {
        self.inner.get_bwd_recv_ops()
    }

    fn get_bwd_send_ops(&mut self) -> Vec<P2pOp> {
        self.inner.get_bwd_send_ops()
    }

    fn configure_data_parallel_mode(&mut self, last_backward: bool) {
        self.inner.configure_data_parallel_mode(last_backward);
    }

    fn output_chunks(&self) -> &[Tensor] {
        self.inner.output_chunks()
    }
}

#[derive(Clone, Default)]
pub struct BatchLog(Arc<Mutex<Vec<Vec<P2pOp>>>>);

impl BatchLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<Vec<P2pOp>> {
        self.0.lock().unwrap().clone()
    }
}

/// Completes every batch instantly; records what was posted. Suitable for
/// driving a single rank in isolation.
pub struct NullTransport {
    pub log: BatchLog,
}

impl NullTransport {
    pub fn new(log: BatchLog) -> Self {
        Self { log }
    }
}

#[async_trait]
impl Transport for NullTransport {
    async fn batch_isend_irecv(&mut self, ops: Vec<P2pOp>) -> Result<WorkHandle, TransportError> {
        self.log.0.lock().unwrap().push(ops);
        Ok(WorkHandle::ready())
    }
}

/// In-memory network shared by the per-rank [`LoopbackTransport`]s.
///
/// Tensors move through per-(source, destination) FIFO queues; a recv blocks
/// until the matching send arrives, so a mis-scheduled iteration deadlocks
/// instead of silently passing.
pub struct LoopbackNetwork {
    queues: AsyncMutex<HashMap<(usize, usize), VecDeque<Tensor>>>,
    notify: Notify,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queues: AsyncMutex::new(HashMap::new()),
            notify: Notify::new(),
        })
    }
}

pub struct LoopbackTransport {
    rank: usize,
    net: Arc<LoopbackNetwork>,
    inbox: Arc<AsyncMutex<VecDeque<Tensor>>>,
}

impl LoopbackTransport {
    pub fn new(
        rank: usize,
        net: Arc<LoopbackNetwork>,
        inbox: Arc<AsyncMutex<VecDeque<Tensor>>>,
    ) -> Self {
        Self { rank, net, inbox }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn batch_isend_irecv(&mut self, ops: Vec<P2pOp>) -> Result<WorkHandle, TransportError> {
        let mut recv_srcs = Vec::new();
        {
            let mut queues = self.net.queues.lock().await;
            for op in ops {
                match op.kind {
                    P2pKind::Send => {
                        queues
                            .entry((self.rank, op.peer))
                            .or_default()
                            .push_back(op.tensor);
                    }
                    P2pKind::Recv => recv_srcs.push(op.peer),
                }
            }
        }
        self.net.notify.notify_waiters();

        if recv_srcs.is_empty() {
            return Ok(WorkHandle::ready());
        }

        let (handle, tx) = WorkHandle::pending();
        let net = self.net.clone();
        let inbox = self.inbox.clone();
        let rank = self.rank;
        tokio::spawn(async move {
            for src in recv_srcs {
                loop {
                    let notified = net.notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    let popped = net
                        .queues
                        .lock()
                        .await
                        .get_mut(&(src, rank))
                        .and_then(VecDeque::pop_front);
                    if let Some(tensor) = popped {
                        inbox.lock().await.push_back(tensor);
                        break;
                    }
                    notified.await;
                }
            }
            let _ = tx.send(Ok(()));
        });
        Ok(handle)
    }
}

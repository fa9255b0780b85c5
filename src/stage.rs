use async_trait::async_trait;

use crate::error::StageError;
use crate::microbatch::{Args, Kwargs, Tensor};
use crate::transport::P2pOp;

/// User-implemented interface for one pipeline stage: a contiguous shard of
/// the model held by this rank.
///
/// The stage owns its parameters, autograd state, activation stash, and
/// output chunks. A schedule drives it one microbatch at a time and only
/// ever mutates it through this interface.
///
/// The four `get_*_ops` methods describe the point-to-point traffic implied
/// by the *most recent* (or, for recvs, the *next*) compute call on this
/// stage. A first stage has no forward recvs and no backward sends; a last
/// stage has no forward sends and no backward recvs.
#[async_trait]
pub trait PipelineStage: Send {
    /// Global position of this stage in the pipeline; `0` is first.
    fn stage_index(&self) -> usize;

    /// Total number of stages in the pipeline.
    fn num_stages(&self) -> usize;

    /// This worker's rank within the pipeline-parallel group.
    fn group_rank(&self) -> usize;

    /// Number of workers in the pipeline-parallel group.
    fn group_size(&self) -> usize;

    fn is_first(&self) -> bool {
        self.stage_index() == 0
    }

    fn is_last(&self) -> bool {
        self.stage_index() + 1 == self.num_stages()
    }

    /// Set by the owning schedule at construction: whether this iteration
    /// will run backward passes.
    fn set_has_backward(&mut self, has_backward: bool);

    /// Drop per-iteration state (activation stash, output chunks, counters).
    fn clear_runtime_states(&mut self);

    /// Run the forward computation for one microbatch.
    ///
    /// Non-first stages take their input from previously received
    /// activations; `args`/`kwargs` are only meaningful on the first stage.
    async fn forward_one_chunk(&mut self, args: Args, kwargs: Kwargs)
        -> Result<Tensor, StageError>;

    /// Run the backward computation for one microbatch. `loss` is present
    /// exactly on the last stage.
    async fn backward_one_chunk(&mut self, loss: Option<Tensor>) -> Result<(), StageError>;

    fn get_fwd_recv_ops(&mut self) -> Vec<P2pOp>;
    fn get_fwd_send_ops(&mut self) -> Vec<P2pOp>;
    fn get_bwd_recv_ops(&mut self) -> Vec<P2pOp>;
    fn get_bwd_send_ops(&mut self) -> Vec<P2pOp>;

    /// Toggle data-parallel gradient synchronisation for the next backward.
    /// `last_backward = true` must be seen exactly once per iteration, on
    /// the microbatch that carries this stage's final backward.
    fn configure_data_parallel_mode(&mut self, last_backward: bool);

    /// Output tensors produced by this stage, one per microbatch, in
    /// microbatch order. Only consulted on the last stage.
    fn output_chunks(&self) -> &[Tensor];
}

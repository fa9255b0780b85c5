use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, info};

use crate::comm::batch_p2p;
use crate::error::{ConfigError, Result};
use crate::microbatch::{Args, ChunkSpec, Kwargs, Tensor};
use crate::schedule::{LossFn, ScheduleCore};
use crate::stage::PipelineStage;
use crate::transport::{Transport, WorkHandle};

/// Breadth-first pipeline parallelism over multiple local stages.
///
/// When microbatches are ready for several local stages, the earliest stage
/// wins: the forward pass runs every microbatch through each local stage in
/// ascending stage order, then the backward pass walks the stages in
/// reverse.
pub struct ScheduleLoopedBFS<S, T> {
    core: ScheduleCore,
    stages: Vec<S>,
    transport: T,
}

impl<S, T> fmt::Debug for ScheduleLoopedBFS<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduleLoopedBFS").finish_non_exhaustive()
    }
}

impl<S: PipelineStage, T: Transport> ScheduleLoopedBFS<S, T> {
    /// `stages` must hold this rank's local stages in ascending stage order.
    pub fn new(
        mut stages: Vec<S>,
        transport: T,
        n_microbatches: usize,
        loss_fn: Option<LossFn>,
        output_merge_spec: Option<ChunkSpec>,
    ) -> Result<Self> {
        if stages.len() <= 1 {
            return Err(ConfigError::TooFewStages { got: stages.len() }.into());
        }
        let core = ScheduleCore::new(n_microbatches, loss_fn, output_merge_spec)?;
        for stage in &mut stages {
            stage.set_has_backward(core.has_backward);
        }
        info!(
            n_microbatches,
            n_local_stages = stages.len(),
            "using looped BFS schedule"
        );
        Ok(Self {
            core,
            stages,
            transport,
        })
    }

    /// Override the default split-along-axis-0 chunking of `step` inputs.
    pub fn with_chunk_specs(
        mut self,
        args_chunk_spec: Option<Vec<ChunkSpec>>,
        kwargs_chunk_spec: Option<BTreeMap<String, ChunkSpec>>,
    ) -> Self {
        self.core.set_chunk_specs(args_chunk_spec, kwargs_chunk_spec);
        self
    }

    /// Run one training iteration on a whole-batch input.
    ///
    /// Returns the merged whole-batch output when this rank owns the last
    /// stage, `None` otherwise.
    pub async fn step(
        &mut self,
        args: Args,
        kwargs: Kwargs,
        target: Option<Tensor>,
        losses: Option<&mut Vec<Tensor>>,
    ) -> Result<Option<Tensor>> {
        for stage in &mut self.stages {
            stage.clear_runtime_states();
        }
        let (args_split, kwargs_split) = self.core.split_inputs(args, kwargs)?;
        let targets_split = self.core.split_target(target)?;
        self.step_microbatches(Some(args_split), Some(kwargs_split), targets_split, losses)
            .await?;
        for stage in &self.stages {
            if stage.is_last() {
                return Ok(Some(self.core.merge_outputs(stage.output_chunks())?));
            }
        }
        Ok(None)
    }

    /// Run one training iteration on pre-split microbatch inputs.
    ///
    /// The microbatch count fixed at construction is authoritative: input
    /// lists of any other length are a configuration error.
    pub async fn step_microbatches(
        &mut self,
        arg_mbs: Option<Vec<Args>>,
        kwarg_mbs: Option<Vec<Kwargs>>,
        target_mbs: Option<Vec<Tensor>>,
        losses: Option<&mut Vec<Tensor>>,
    ) -> Result<()> {
        let (arg_mbs, kwarg_mbs) =
            self.core
                .check_inputs(arg_mbs, kwarg_mbs, target_mbs.as_deref())?;
        let n = self.core.n_microbatches;

        let mut fwd_sends_to_wait: Vec<WorkHandle> = Vec::new();
        for stage in &mut self.stages {
            for i in 0..n {
                let ops = stage.get_fwd_recv_ops();
                batch_p2p(&mut self.transport, ops, "fwd_recv")
                    .await?
                    .wait()
                    .await?;

                let output = stage
                    .forward_one_chunk(arg_mbs[i].clone(), kwarg_mbs[i].clone())
                    .await?;
                self.core
                    .maybe_compute_loss(stage.is_last(), &output, target_mbs.as_deref(), i)?;

                let ops = stage.get_fwd_send_ops();
                fwd_sends_to_wait.push(batch_p2p(&mut self.transport, ops, "fwd_send").await?);

                debug!(stage = stage.stage_index(), microbatch = i, "forwarded");
            }
        }
        for work in fwd_sends_to_wait {
            work.wait().await?;
        }

        if self.core.has_backward {
            let mut bwd_sends_to_wait: Vec<WorkHandle> = Vec::new();
            for stage in self.stages.iter_mut().rev() {
                for i in 0..n {
                    stage.configure_data_parallel_mode(i == n - 1);

                    let ops = stage.get_bwd_recv_ops();
                    batch_p2p(&mut self.transport, ops, "bwd_recv")
                        .await?
                        .wait()
                        .await?;

                    let loss = self.core.maybe_get_loss(stage.is_last(), i)?;
                    stage.backward_one_chunk(loss).await?;

                    let ops = stage.get_bwd_send_ops();
                    bwd_sends_to_wait.push(batch_p2p(&mut self.transport, ops, "bwd_send").await?);

                    debug!(stage = stage.stage_index(), microbatch = i, "backwarded");
                }
            }
            for work in bwd_sends_to_wait {
                work.wait().await?;
            }
        }

        let contains_last_stage = self.stages.iter().any(|s| s.is_last());
        self.core.update_losses(contains_last_stage, losses)?;

        Ok(())
    }

    /// Hand the stages back to the caller.
    pub fn into_stages(self) -> Vec<S> {
        self.stages
    }
}

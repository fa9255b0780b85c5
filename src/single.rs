use std::collections::BTreeMap;
use std::mem;

use tracing::{debug, info};

use crate::comm::sorted_batch_p2p;
use crate::error::Result;
use crate::microbatch::{Args, ChunkSpec, Kwargs, Tensor};
use crate::schedule::{LossFn, ScheduleCore};
use crate::stage::PipelineStage;
use crate::transport::{Transport, WorkHandle};

/// Step counts for one stage under the 1F1B schedule.
///
/// `total` counts time steps, not work units: a steady-state step performs
/// both a forward and a backward, so `warmup + 2 * main_1f1b + cooldown`
/// always equals `2 * n_microbatches`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepCounts {
    pub warmup: usize,
    pub main_1f1b: usize,
    pub cooldown: usize,
    pub total: usize,
}

/// Derive the warmup / steady-state / cooldown step counts for a stage.
///
/// Warmup grows by two steps per hop away from the last stage, capped at the
/// microbatch count.
pub fn one_f_one_b_counts(
    n_microbatches: usize,
    num_stages: usize,
    stage_index: usize,
) -> StepCounts {
    let warmup = n_microbatches.min(2 * (num_stages - stage_index - 1));
    let main_1f1b = n_microbatches - warmup;
    let cooldown = 2 * n_microbatches - (warmup + 2 * main_1f1b);
    StepCounts {
        warmup,
        main_1f1b,
        cooldown,
        total: warmup + main_1f1b + cooldown,
    }
}

/// The GPipe schedule: all forwards fill the pipeline, then all backwards
/// drain it. One stage per rank.
pub struct ScheduleGPipe<S, T> {
    core: ScheduleCore,
    stage: S,
    transport: T,
}

impl<S: PipelineStage, T: Transport> ScheduleGPipe<S, T> {
    pub fn new(
        mut stage: S,
        transport: T,
        n_microbatches: usize,
        loss_fn: Option<LossFn>,
        output_merge_spec: Option<ChunkSpec>,
    ) -> Result<Self> {
        let core = ScheduleCore::new(n_microbatches, loss_fn, output_merge_spec)?;
        stage.set_has_backward(core.has_backward);
        info!(
            n_microbatches,
            stage = stage.stage_index(),
            "using GPipe schedule"
        );
        Ok(Self {
            core,
            stage,
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
    /// Returns the merged whole-batch output on the last stage, `None`
    /// elsewhere.
    pub async fn step(
        &mut self,
        args: Args,
        kwargs: Kwargs,
        target: Option<Tensor>,
        losses: Option<&mut Vec<Tensor>>,
    ) -> Result<Option<Tensor>> {
        self.stage.clear_runtime_states();
        let (args_split, kwargs_split) = self.core.split_inputs(args, kwargs)?;
        let targets_split = self.core.split_target(target)?;
        self.step_microbatches(Some(args_split), Some(kwargs_split), targets_split, losses)
            .await?;
        if self.stage.is_last() {
            Ok(Some(self.core.merge_outputs(self.stage.output_chunks())?))
        } else {
            Ok(None)
        }
    }

    /// Run one training iteration on pre-split microbatch inputs.
    pub async fn step_microbatches(
        &mut self,
        arg_mbs: Option<Vec<Args>>,
        kwarg_mbs: Option<Vec<Kwargs>>,
        target_mbs: Option<Vec<Tensor>>,
        losses: Option<&mut Vec<Tensor>>,
    ) -> Result<()> {
        let (mut arg_mbs, mut kwarg_mbs) =
            self.core
                .check_inputs(arg_mbs, kwarg_mbs, target_mbs.as_deref())?;

        // Delay send-side waits until the fill phase has drained.
        let mut fwd_sends_to_wait: Vec<WorkHandle> = Vec::new();

        for i in 0..self.core.n_microbatches {
            let ops = self.stage.get_fwd_recv_ops();
            let works = sorted_batch_p2p(&mut self.transport, ops, "fwd_recv").await?;
            for (_, work) in works {
                work.wait().await?;
            }

            let output = self
                .stage
                .forward_one_chunk(mem::take(&mut arg_mbs[i]), mem::take(&mut kwarg_mbs[i]))
                .await?;

            let ops = self.stage.get_fwd_send_ops();
            let works = sorted_batch_p2p(&mut self.transport, ops, "fwd_send").await?;
            fwd_sends_to_wait.extend(works.into_values());

            debug!(stage = self.stage.stage_index(), microbatch = i, "forwarded");

            self.core
                .maybe_compute_loss(self.stage.is_last(), &output, target_mbs.as_deref(), i)?;
        }

        // By the time the first backward arrives these have long completed;
        // the handles are only retained so the transport keeps them alive.
        for work in fwd_sends_to_wait {
            work.wait().await?;
        }

        if !self.core.has_backward {
            return Ok(());
        }

        let mut bwd_sends_to_wait: Vec<WorkHandle> = Vec::new();
        for i in 0..self.core.n_microbatches {
            // Gradient accumulation: sync data-parallel grads only on the
            // final microbatch.
            self.stage
                .configure_data_parallel_mode(i == self.core.n_microbatches - 1);

            let ops = self.stage.get_bwd_recv_ops();
            let works = sorted_batch_p2p(&mut self.transport, ops, "bwd_recv").await?;
            for (_, work) in works {
                work.wait().await?;
            }

            let loss = self.core.maybe_get_loss(self.stage.is_last(), i)?;
            self.stage.backward_one_chunk(loss).await?;

            let ops = self.stage.get_bwd_send_ops();
            let works = sorted_batch_p2p(&mut self.transport, ops, "bwd_send").await?;
            bwd_sends_to_wait.extend(works.into_values());

            debug!(stage = self.stage.stage_index(), microbatch = i, "backwarded");
        }

        self.core.update_losses(self.stage.is_last(), losses)?;

        for work in bwd_sends_to_wait {
            work.wait().await?;
        }

        Ok(())
    }

    /// Hand the stage back to the caller.
    pub fn into_stage(self) -> S {
        self.stage
    }
}

/// The 1F1B schedule: after a per-stage warmup, every step runs one forward
/// and one backward, halving activation memory pressure relative to GPipe.
/// One stage per rank.
pub struct Schedule1F1B<S, T> {
    core: ScheduleCore,
    stage: S,
    transport: T,
}

impl<S: PipelineStage, T: Transport> Schedule1F1B<S, T> {
    pub fn new(
        mut stage: S,
        transport: T,
        n_microbatches: usize,
        loss_fn: Option<LossFn>,
        output_merge_spec: Option<ChunkSpec>,
    ) -> Result<Self> {
        let core = ScheduleCore::new(n_microbatches, loss_fn, output_merge_spec)?;
        stage.set_has_backward(core.has_backward);
        info!(
            n_microbatches,
            stage = stage.stage_index(),
            "using 1F1B schedule"
        );
        Ok(Self {
            core,
            stage,
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
    pub async fn step(
        &mut self,
        args: Args,
        kwargs: Kwargs,
        target: Option<Tensor>,
        losses: Option<&mut Vec<Tensor>>,
    ) -> Result<Option<Tensor>> {
        self.stage.clear_runtime_states();
        let (args_split, kwargs_split) = self.core.split_inputs(args, kwargs)?;
        let targets_split = self.core.split_target(target)?;
        self.step_microbatches(Some(args_split), Some(kwargs_split), targets_split, losses)
            .await?;
        if self.stage.is_last() {
            Ok(Some(self.core.merge_outputs(self.stage.output_chunks())?))
        } else {
            Ok(None)
        }
    }

    /// Run one training iteration on pre-split microbatch inputs.
    pub async fn step_microbatches(
        &mut self,
        arg_mbs: Option<Vec<Args>>,
        kwarg_mbs: Option<Vec<Kwargs>>,
        target_mbs: Option<Vec<Tensor>>,
        losses: Option<&mut Vec<Tensor>>,
    ) -> Result<()> {
        let (mut arg_mbs, mut kwarg_mbs) =
            self.core
                .check_inputs(arg_mbs, kwarg_mbs, target_mbs.as_deref())?;

        let n = self.core.n_microbatches;
        let counts = one_f_one_b_counts(n, self.stage.num_stages(), self.stage.stage_index());
        let StepCounts {
            warmup,
            main_1f1b,
            cooldown,
            total,
        } = counts;
        debug!(
            stage = self.stage.stage_index(),
            warmup, main_1f1b, cooldown, total, "1F1B step counts"
        );

        let has_backward = self.core.has_backward;
        let has_fwd = move |t: usize| t < n;
        let has_bwd = move |t: usize| t >= warmup && has_backward;
        let is_1f1b = move |t: usize| has_fwd(t) && has_bwd(t);
        let is_warmup = move |t: usize| has_fwd(t) && !has_bwd(t);
        let is_cooldown = move |t: usize| !has_fwd(t) && has_bwd(t);

        // A forward send coalesces with the bwd recv of the same step in
        // steady state, and across the warmup -> cooldown seam.
        let coalesce_fwd_send_bwd_recv = move |t: usize| {
            is_1f1b(t)
                || (is_warmup(t) && is_cooldown(t + 1))
                || (t >= 1 && is_warmup(t - 1) && is_cooldown(t))
        };
        // A backward send coalesces with the fwd recv of the following step
        // while that step is still in steady state.
        let coalesce_bwd_send_fwd_recv = move |t: usize| t >= warmup && is_1f1b(t + 1);

        let mut fwd_sends_to_wait: Vec<WorkHandle> = Vec::new();
        let mut bwd_sends_to_wait: Vec<WorkHandle> = Vec::new();
        let mut bwd_mb_index = 0usize;

        self.stage.configure_data_parallel_mode(false);

        for t in 0..total {
            if has_fwd(t) {
                let mut ops = self.stage.get_fwd_recv_ops();
                let mut desc = "fwd_recv";
                if t >= 1 && coalesce_bwd_send_fwd_recv(t - 1) {
                    // Pick up the backward send deferred from the previous step.
                    ops.extend(self.stage.get_bwd_send_ops());
                    desc = "fwd_recv_bwd_send";
                }
                let works = sorted_batch_p2p(&mut self.transport, ops, desc).await?;
                for (_, work) in works {
                    work.wait().await?;
                }

                let output = self
                    .stage
                    .forward_one_chunk(mem::take(&mut arg_mbs[t]), mem::take(&mut kwarg_mbs[t]))
                    .await?;

                if !coalesce_fwd_send_bwd_recv(t) {
                    let ops = self.stage.get_fwd_send_ops();
                    let works = sorted_batch_p2p(&mut self.transport, ops, "fwd_send").await?;
                    fwd_sends_to_wait.extend(works.into_values());
                }

                debug!(stage = self.stage.stage_index(), microbatch = t, "forwarded");

                self.core
                    .maybe_compute_loss(self.stage.is_last(), &output, target_mbs.as_deref(), t)?;
            }

            if has_bwd(t) {
                self.stage
                    .configure_data_parallel_mode(t == total - 1);

                let mut ops = self.stage.get_bwd_recv_ops();
                let mut desc = "bwd_recv";
                if coalesce_fwd_send_bwd_recv(t) {
                    ops.extend(self.stage.get_fwd_send_ops());
                    desc = "bwd_recv_fwd_send";
                }
                let works = sorted_batch_p2p(&mut self.transport, ops, desc).await?;
                for (_, work) in works {
                    work.wait().await?;
                }

                let loss = self.core.maybe_get_loss(self.stage.is_last(), bwd_mb_index)?;
                self.stage.backward_one_chunk(loss).await?;

                if !coalesce_bwd_send_fwd_recv(t) {
                    let ops = self.stage.get_bwd_send_ops();
                    let works = sorted_batch_p2p(&mut self.transport, ops, "bwd_send").await?;
                    bwd_sends_to_wait.extend(works.into_values());
                }

                debug!(
                    stage = self.stage.stage_index(),
                    microbatch = bwd_mb_index,
                    "backwarded"
                );
                bwd_mb_index += 1;
            }
        }

        for work in fwd_sends_to_wait {
            work.wait().await?;
        }
        for work in bwd_sends_to_wait {
            work.wait().await?;
        }

        self.core.update_losses(self.stage.is_last(), losses)?;

        Ok(())
    }

    /// Hand the stage back to the caller.
    pub fn into_stage(self) -> S {
        self.stage
    }
}

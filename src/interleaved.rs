use std::collections::{BTreeMap, HashMap};
use std::fmt;

use tracing::{debug, info};

use crate::comm::batch_p2p;
use crate::error::{ConfigError, Result, ScheduleError};
use crate::microbatch::{Args, ChunkSpec, Kwargs, Tensor};
use crate::schedule::{ComputationType, LossFn, ScheduleCore};
use crate::stage::PipelineStage;
use crate::transport::{P2pOp, Transport};

/// One occupied timeline slot: which computation, on which microbatch, on
/// which stage. A bubble is represented as `None` in the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Action {
    pub computation: ComputationType,
    pub microbatch_index: usize,
    pub stage_index: usize,
}

/// Compute the full interleaved-1F1B timeline for every rank.
///
/// Returned as `order[rank][slot]`. Rows are ragged: padding differs per
/// rank, so peeks at a neighbour's row must bounds-check.
///
/// The function is pure and deterministic; every rank computes the same
/// matrix locally, which is what lets execution infer incoming traffic by
/// peeking at a neighbour's row instead of exchanging any control messages.
///
/// `group_size` and `n_local_stages` must both be at least 1.
pub fn interleaved_pipeline_order(
    group_size: usize,
    n_local_stages: usize,
    n_microbatches: usize,
) -> std::result::Result<Vec<Vec<Option<Action>>>, ConfigError> {
    if n_microbatches == 0 {
        return Err(ConfigError::ZeroMicrobatches);
    }
    if n_microbatches % group_size != 0 {
        return Err(ConfigError::UnevenMicrobatches {
            n_microbatches,
            group_size,
        });
    }
    Ok((0..group_size)
        .map(|rank| single_rank_operations(rank, group_size, n_local_stages, n_microbatches))
        .collect())
}

/// Build one rank's timeline.
fn single_rank_operations(
    rank: usize,
    group_size: usize,
    n_local_stages: usize,
    n_microbatches: usize,
) -> Vec<Option<Action>> {
    let slots = n_local_stages * n_microbatches;
    // Warmup grows by two steps per hop away from the last rank.
    let warmup_steps = ((n_local_stages - 1) * group_size + 2 * (group_size - 1 - rank)).min(slots);
    let fwd_bwd_steps = slots - warmup_steps;
    let cooldown_steps = slots - fwd_bwd_steps;
    let total_steps = warmup_steps + fwd_bwd_steps + cooldown_steps;
    debug_assert_eq!(warmup_steps + 2 * fwd_bwd_steps + cooldown_steps, 2 * slots);
    debug!(
        rank,
        warmup_steps, fwd_bwd_steps, cooldown_steps, "interleaved rank timeline"
    );

    let num_stages = n_local_stages * group_size;
    let forward_stage_index =
        move |step: usize| ((step / group_size) % n_local_stages) * group_size + rank;
    let backward_stage_index = move |step: usize| {
        let local_index = n_local_stages - 1 - ((step - warmup_steps) / group_size) % n_local_stages;
        local_index * group_size + rank
    };

    let mut fwd_stage_mb_index = vec![0usize; num_stages];
    let mut bwd_stage_mb_index = vec![0usize; num_stages];

    let mut rank_ops: Vec<Option<Action>> = Vec::new();
    // Pre-padding: each rank starts one slot after its upstream neighbour.
    rank_ops.resize(rank, None);

    // Extra bubbles after the warmup while the first backward trickles back
    // up; rank 0 is the full round trip away from the last stage's backward.
    let mut post_warmup_steps = if rank == 0 { 2 } else { 0 };

    for step in 0..total_steps {
        if step < warmup_steps {
            let fwd_stage = forward_stage_index(step);
            let mb_index = fwd_stage_mb_index[fwd_stage];
            fwd_stage_mb_index[fwd_stage] += 1;
            rank_ops.push(Some(Action {
                computation: ComputationType::Forward,
                microbatch_index: mb_index,
                stage_index: fwd_stage,
            }));
            if step + 1 == warmup_steps {
                while post_warmup_steps > 0 {
                    rank_ops.push(None);
                    post_warmup_steps -= 1;
                }
            }
        } else if step < warmup_steps + fwd_bwd_steps {
            let fwd_stage = forward_stage_index(step);
            let fwd_mb_index = fwd_stage_mb_index[fwd_stage];
            fwd_stage_mb_index[fwd_stage] += 1;
            rank_ops.push(Some(Action {
                computation: ComputationType::Forward,
                microbatch_index: fwd_mb_index,
                stage_index: fwd_stage,
            }));

            let bwd_stage = backward_stage_index(step);
            let bwd_mb_index = bwd_stage_mb_index[bwd_stage];
            bwd_stage_mb_index[bwd_stage] += 1;
            rank_ops.push(Some(Action {
                computation: ComputationType::Backward,
                microbatch_index: bwd_mb_index,
                stage_index: bwd_stage,
            }));
        } else {
            // Cooldown: pad each backward so steps stay aligned with the
            // steady state still running on other ranks.
            rank_ops.push(None);
            let bwd_stage = backward_stage_index(step);
            let bwd_mb_index = bwd_stage_mb_index[bwd_stage];
            bwd_stage_mb_index[bwd_stage] += 1;
            rank_ops.push(Some(Action {
                computation: ComputationType::Backward,
                microbatch_index: bwd_mb_index,
                stage_index: bwd_stage,
            }));
        }
    }

    // Post-padding mirrors the pre-padding of the ranks below.
    for _ in 0..(group_size - rank - 1) {
        rank_ops.push(None);
    }
    rank_ops
}

/// The interleaved 1F1B schedule: multiple stages per rank, driven by a
/// per-rank timeline precomputed for the whole group.
///
/// Every rank holds the full timeline matrix; at execution time, incoming
/// traffic is inferred by peeking at the previous and next rank's row for
/// the current step, and all of a step's sends and recvs go out as a single
/// un-sorted batched isend/irecv. That single batch is why models with skip
/// connections are not supported under this schedule.
pub struct ScheduleInterleaved1F1B<S, T> {
    core: ScheduleCore,
    stages: Vec<S>,
    transport: T,
    group_size: usize,
    rank: usize,
    num_stages: usize,
    pipeline_order: Vec<Vec<Option<Action>>>,
    dp_mode_hooks: bool,
}

impl<S, T> fmt::Debug for ScheduleInterleaved1F1B<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduleInterleaved1F1B")
            .field("group_size", &self.group_size)
            .field("rank", &self.rank)
            .field("num_stages", &self.num_stages)
            .field("pipeline_order", &self.pipeline_order)
            .field("dp_mode_hooks", &self.dp_mode_hooks)
            .finish_non_exhaustive()
    }
}

impl<S: PipelineStage, T: Transport> ScheduleInterleaved1F1B<S, T> {
    /// `stages` must hold this rank's local stages in ascending stage order;
    /// stage `k * group_size + rank` for `k` in `0..n_local_stages`.
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
        let group_size = stages[0].group_size();
        let rank = stages[0].group_rank();
        let num_stages = stages[0].num_stages();
        let pipeline_order = interleaved_pipeline_order(group_size, stages.len(), n_microbatches)?;

        let core = ScheduleCore::new(n_microbatches, loss_fn, output_merge_spec)?;
        for stage in &mut stages {
            stage.set_has_backward(core.has_backward);
        }
        info!(
            n_microbatches,
            rank,
            group_size,
            n_local_stages = stages.len(),
            "using interleaved 1F1B schedule"
        );
        Ok(Self {
            core,
            stages,
            transport,
            group_size,
            rank,
            num_stages,
            pipeline_order,
            dp_mode_hooks: false,
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

    /// Issue `configure_data_parallel_mode` around backwards, `true` exactly
    /// on each local stage's final backward.
    ///
    /// Off by default: the reference trace for this schedule never toggles
    /// data-parallel gradient sync, so the default reproduces it.
    pub fn enable_data_parallel_hooks(mut self) -> Self {
        self.dp_mode_hooks = true;
        self
    }

    /// The precomputed timeline, indexed `[rank][slot]`.
    pub fn pipeline_order(&self) -> &[Vec<Option<Action>>] {
        &self.pipeline_order
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

        let stage_pos: HashMap<usize, usize> = self
            .stages
            .iter()
            .enumerate()
            .map(|(pos, stage)| (stage.stage_index(), pos))
            .collect();
        let prev_rank = (self.rank + self.group_size - 1) % self.group_size;
        let next_rank = (self.rank + 1) % self.group_size;

        // Per-local-stage countdown for the data-parallel hooks.
        let mut bwd_remaining = vec![self.core.n_microbatches; self.stages.len()];
        if self.dp_mode_hooks {
            for stage in &mut self.stages {
                stage.configure_data_parallel_mode(false);
            }
        }

        for time_step in 0..self.pipeline_order[self.rank].len() {
            let action = self.pipeline_order[self.rank][time_step];
            let mut ops: Vec<P2pOp> = Vec::new();

            if let Some(action) = action {
                let pos = *stage_pos
                    .get(&action.stage_index)
                    .ok_or(ScheduleError::UnownedStage {
                        stage_index: action.stage_index,
                    })?;
                match action.computation {
                    ComputationType::Forward => {
                        let stage = &mut self.stages[pos];
                        let output = stage
                            .forward_one_chunk(
                                arg_mbs[action.microbatch_index].clone(),
                                kwarg_mbs[action.microbatch_index].clone(),
                            )
                            .await?;
                        self.core.maybe_compute_loss(
                            stage.is_last(),
                            &output,
                            target_mbs.as_deref(),
                            action.microbatch_index,
                        )?;
                        ops.extend(stage.get_fwd_send_ops());
                        debug!(
                            rank = self.rank,
                            time_step,
                            stage = action.stage_index,
                            microbatch = action.microbatch_index,
                            "forwarded"
                        );
                    }
                    ComputationType::Backward => {
                        if self.dp_mode_hooks {
                            self.stages[pos]
                                .configure_data_parallel_mode(bwd_remaining[pos] == 1);
                        }
                        let stage = &mut self.stages[pos];
                        let loss = self
                            .core
                            .maybe_get_loss(stage.is_last(), action.microbatch_index)?;
                        stage.backward_one_chunk(loss).await?;
                        bwd_remaining[pos] -= 1;
                        ops.extend(stage.get_bwd_send_ops());
                        debug!(
                            rank = self.rank,
                            time_step,
                            stage = action.stage_index,
                            microbatch = action.microbatch_index,
                            "backwarded"
                        );
                    }
                }
            }

            // A forward completing on the previous rank means its downstream
            // stage, which lives here, must post the matching recv now.
            if let Some(Some(prev_action)) = self.pipeline_order[prev_rank].get(time_step) {
                if prev_action.computation == ComputationType::Forward
                    && prev_action.stage_index + 1 != self.num_stages
                {
                    let pos = *stage_pos.get(&(prev_action.stage_index + 1)).ok_or(
                        ScheduleError::UnownedStage {
                            stage_index: prev_action.stage_index + 1,
                        },
                    )?;
                    ops.extend(self.stages[pos].get_fwd_recv_ops());
                }
            }

            // Symmetrically, a backward on the next rank feeds the upstream
            // stage held by this rank.
            if let Some(Some(next_action)) = self.pipeline_order[next_rank].get(time_step) {
                if next_action.computation == ComputationType::Backward
                    && next_action.stage_index != 0
                {
                    let pos = *stage_pos.get(&(next_action.stage_index - 1)).ok_or(
                        ScheduleError::UnownedStage {
                            stage_index: next_action.stage_index - 1,
                        },
                    )?;
                    ops.extend(self.stages[pos].get_bwd_recv_ops());
                }
            }

            if !ops.is_empty() {
                batch_p2p(&mut self.transport, ops, "interleaved_step")
                    .await?
                    .wait()
                    .await?;
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

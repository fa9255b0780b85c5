use std::collections::BTreeMap;

use crate::error::{ConfigError, Result, ScheduleError};
use crate::microbatch::{
    merge_chunks, split_args_kwargs_into_chunks, tensor_split, Args, ChunkSpec, Kwargs, Tensor,
};

/// Loss function applied on the last stage: `(output, target) -> loss`.
pub type LossFn = Box<dyn Fn(&Tensor, &Tensor) -> Tensor + Send>;

/// The two kinds of computation a schedule can place in a timeline slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComputationType {
    Forward,
    Backward,
}

/// State and plumbing shared by every schedule: the microbatch count, loss
/// bookkeeping, and the split/merge adapters.
pub(crate) struct ScheduleCore {
    pub(crate) n_microbatches: usize,
    pub(crate) has_backward: bool,
    loss_fn: Option<LossFn>,
    output_merge_spec: Option<ChunkSpec>,
    args_chunk_spec: Option<Vec<ChunkSpec>>,
    kwargs_chunk_spec: Option<BTreeMap<String, ChunkSpec>>,
    /// Per-microbatch losses recorded on the last stage, in microbatch order.
    internal_losses: Vec<Tensor>,
}

impl ScheduleCore {
    pub(crate) fn new(
        n_microbatches: usize,
        loss_fn: Option<LossFn>,
        output_merge_spec: Option<ChunkSpec>,
    ) -> Result<Self> {
        if n_microbatches == 0 {
            return Err(ConfigError::ZeroMicrobatches.into());
        }
        Ok(Self {
            n_microbatches,
            has_backward: loss_fn.is_some(),
            loss_fn,
            output_merge_spec,
            args_chunk_spec: None,
            kwargs_chunk_spec: None,
            internal_losses: Vec::new(),
        })
    }

    pub(crate) fn set_chunk_specs(
        &mut self,
        args_chunk_spec: Option<Vec<ChunkSpec>>,
        kwargs_chunk_spec: Option<BTreeMap<String, ChunkSpec>>,
    ) {
        self.args_chunk_spec = args_chunk_spec;
        self.kwargs_chunk_spec = kwargs_chunk_spec;
    }

    /// On the last stage with backward enabled, compute and record the loss
    /// for microbatch `mb_index`.
    pub(crate) fn maybe_compute_loss(
        &mut self,
        stage_is_last: bool,
        output: &Tensor,
        target_mbs: Option<&[Tensor]>,
        mb_index: usize,
    ) -> Result<()> {
        if !(stage_is_last && self.has_backward) {
            return Ok(());
        }
        let targets = target_mbs.ok_or(ConfigError::MissingTarget)?;
        if let Some(loss_fn) = &self.loss_fn {
            self.internal_losses.push(loss_fn(output, &targets[mb_index]));
        }
        Ok(())
    }

    /// Fetch the recorded loss for microbatch `mb_index` on the last stage.
    ///
    /// Returns `None` off the last stage or when backward is disabled.
    /// Errors when losses were recorded but the index is out of range.
    pub(crate) fn maybe_get_loss(
        &self,
        stage_is_last: bool,
        mb_index: usize,
    ) -> Result<Option<Tensor>> {
        let valid_index = mb_index < self.internal_losses.len();
        if stage_is_last && self.has_backward && valid_index {
            Ok(Some(self.internal_losses[mb_index].clone()))
        } else if !self.internal_losses.is_empty() && !valid_index {
            Err(ScheduleError::LossUnavailable {
                mb_index,
                available: self.internal_losses.len(),
            })
        } else {
            Ok(None)
        }
    }

    /// Drain the recorded losses into the caller's container at the end of
    /// an iteration. Internal state is cleared either way.
    pub(crate) fn update_losses(
        &mut self,
        contains_last_stage: bool,
        losses: Option<&mut Vec<Tensor>>,
    ) -> Result<()> {
        if contains_last_stage {
            if let Some(losses) = losses {
                if self.internal_losses.len() != self.n_microbatches {
                    return Err(ScheduleError::LossCountMismatch {
                        expected: self.n_microbatches,
                        got: self.internal_losses.len(),
                    });
                }
                losses.clear();
                losses.extend(self.internal_losses.iter().cloned());
            }
        }
        self.internal_losses.clear();
        Ok(())
    }

    /// Enforce microbatch counts on pre-split inputs, filling absent lists
    /// with empty per-microbatch values.
    pub(crate) fn check_inputs(
        &self,
        arg_mbs: Option<Vec<Args>>,
        kwarg_mbs: Option<Vec<Kwargs>>,
        target_mbs: Option<&[Tensor]>,
    ) -> Result<(Vec<Args>, Vec<Kwargs>)> {
        let n = self.n_microbatches;

        let arg_mbs = match arg_mbs {
            Some(mbs) if mbs.len() != n => {
                return Err(ConfigError::ChunkCountMismatch {
                    name: "arg microbatches",
                    expected: n,
                    got: mbs.len(),
                }
                .into());
            }
            Some(mbs) => mbs,
            None => vec![Args::new(); n],
        };

        let kwarg_mbs = match kwarg_mbs {
            Some(mbs) if mbs.len() != n => {
                return Err(ConfigError::ChunkCountMismatch {
                    name: "kwarg microbatches",
                    expected: n,
                    got: mbs.len(),
                }
                .into());
            }
            Some(mbs) => mbs,
            None => vec![Kwargs::new(); n],
        };

        if let Some(targets) = target_mbs {
            if targets.len() != n {
                return Err(ConfigError::ChunkCountMismatch {
                    name: "target microbatches",
                    expected: n,
                    got: targets.len(),
                }
                .into());
            }
        }

        Ok((arg_mbs, kwarg_mbs))
    }

    /// Split whole-batch inputs into microbatches. Empty inputs (middle
    /// stages) produce empty per-microbatch pairs.
    pub(crate) fn split_inputs(
        &self,
        args: Args,
        kwargs: Kwargs,
    ) -> Result<(Vec<Args>, Vec<Kwargs>)> {
        if args.is_empty() && kwargs.is_empty() {
            return Ok((
                vec![Args::new(); self.n_microbatches],
                vec![Kwargs::new(); self.n_microbatches],
            ));
        }
        let (args_split, kwargs_split) = split_args_kwargs_into_chunks(
            &args,
            &kwargs,
            self.n_microbatches,
            self.args_chunk_spec.as_deref(),
            self.kwargs_chunk_spec.as_ref(),
        )?;
        Ok((args_split, kwargs_split))
    }

    pub(crate) fn split_target(&self, target: Option<Tensor>) -> Result<Option<Vec<Tensor>>> {
        match target {
            Some(target) => Ok(Some(tensor_split(&target, self.n_microbatches, 0)?)),
            None => Ok(None),
        }
    }

    pub(crate) fn merge_outputs(&self, output_chunks: &[Tensor]) -> Result<Tensor> {
        Ok(merge_chunks(output_chunks, self.output_merge_spec)?)
    }
}

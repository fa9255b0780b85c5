//! Deterministic microbatch schedules for pipeline-parallel training.
//!
//! A model whose layers are partitioned across a group of peer workers
//! ("ranks") is driven one microbatch at a time by a schedule, which decides
//! for every rank and every discrete time step which computation to run and
//! which point-to-point messages to post with neighbouring ranks. Four
//! schedules are provided:
//!
//! - [`ScheduleGPipe`]: single stage per rank, fill-drain;
//! - [`Schedule1F1B`]: single stage per rank, one-forward-one-backward
//!   steady state with send/recv coalescing;
//! - [`ScheduleLoopedBFS`]: multiple stages per rank, breadth-first
//!   all-forwards-then-all-backwards;
//! - [`ScheduleInterleaved1F1B`]: multiple stages per rank, executing a
//!   precomputed per-rank timeline with neighbour-peek send/recv inference.
//!
//! The per-stage compute kernels and the wire transport are supplied by the
//! caller through the [`PipelineStage`] and [`Transport`] traits.

pub mod comm;
pub mod error;
pub mod interleaved;
pub mod looped_bfs;
pub mod microbatch;
pub mod schedule;
pub mod single;
pub mod stage;
pub mod transport;

pub use comm::{batch_p2p, sorted_batch_p2p};
pub use error::{
    ChunkError, ConfigError, Result, ScheduleError, StageError, TransportError,
};
pub use interleaved::{interleaved_pipeline_order, Action, ScheduleInterleaved1F1B};
pub use looped_bfs::ScheduleLoopedBFS;
pub use microbatch::{
    merge_chunks, split_args_kwargs_into_chunks, tensor_split, Args, ChunkSpec, Kwargs, Tensor,
};
pub use schedule::{ComputationType, LossFn};
pub use single::{one_f_one_b_counts, Schedule1F1B, ScheduleGPipe, StepCounts};
pub use stage::PipelineStage;
pub use transport::{P2pKind, P2pOp, Transport, WorkHandle};

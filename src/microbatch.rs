use std::collections::BTreeMap;

use ndarray::{concatenate, ArrayD, Axis, Slice};

use crate::error::ChunkError;

/// Activation, gradient, and loss payloads exchanged through the pipeline.
pub type Tensor = ArrayD<f32>;

/// Positional arguments for one microbatch.
pub type Args = Vec<Tensor>;

/// Keyword arguments for one microbatch.
pub type Kwargs = BTreeMap<String, Tensor>;

/// How to split one argument into microbatches (and merge outputs back).
///
/// The default splits along axis 0, the batch dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpec {
    pub axis: usize,
}

impl Default for ChunkSpec {
    fn default() -> Self {
        Self { axis: 0 }
    }
}

impl ChunkSpec {
    pub const fn along(axis: usize) -> Self {
        Self { axis }
    }
}

/// Split a tensor into `n` chunks along `axis`.
///
/// The first `len % n` chunks are one element longer than the rest, so the
/// split is defined for any length, including lengths smaller than `n`
/// (trailing chunks come out empty).
pub fn tensor_split(tensor: &Tensor, n: usize, axis: usize) -> Result<Vec<Tensor>, ChunkError> {
    if n == 0 {
        return Err(ChunkError::ZeroChunks);
    }
    let ndim = tensor.ndim();
    if axis >= ndim {
        return Err(ChunkError::AxisOutOfBounds { axis, ndim });
    }

    let len = tensor.len_of(Axis(axis));
    let base = len / n;
    let remainder = len % n;

    let mut chunks = Vec::with_capacity(n);
    let mut start = 0;
    for i in 0..n {
        let size = base + usize::from(i < remainder);
        let end = start + size;
        chunks.push(
            tensor
                .slice_axis(Axis(axis), Slice::from(start..end))
                .to_owned(),
        );
        start = end;
    }
    Ok(chunks)
}

/// Split whole-batch `(args, kwargs)` into `n_chunks` microbatch pairs.
///
/// `args_chunk_spec`, when present, must have one entry per positional
/// argument. `kwargs_chunk_spec` may cover any subset of the keys; uncovered
/// keys split along axis 0.
pub fn split_args_kwargs_into_chunks(
    args: &Args,
    kwargs: &Kwargs,
    n_chunks: usize,
    args_chunk_spec: Option<&[ChunkSpec]>,
    kwargs_chunk_spec: Option<&BTreeMap<String, ChunkSpec>>,
) -> Result<(Vec<Args>, Vec<Kwargs>), ChunkError> {
    if let Some(spec) = args_chunk_spec {
        if spec.len() != args.len() {
            return Err(ChunkError::SpecArityMismatch {
                expected: args.len(),
                got: spec.len(),
            });
        }
    }

    let mut args_split: Vec<Args> = (0..n_chunks).map(|_| Args::new()).collect();
    for (pos, tensor) in args.iter().enumerate() {
        let axis = args_chunk_spec.map_or(0, |spec| spec[pos].axis);
        for (chunk, piece) in args_split.iter_mut().zip(tensor_split(tensor, n_chunks, axis)?) {
            chunk.push(piece);
        }
    }

    let mut kwargs_split: Vec<Kwargs> = (0..n_chunks).map(|_| Kwargs::new()).collect();
    for (key, tensor) in kwargs {
        let axis = kwargs_chunk_spec
            .and_then(|spec| spec.get(key))
            .map_or(0, |s| s.axis);
        for (chunk, piece) in kwargs_split
            .iter_mut()
            .zip(tensor_split(tensor, n_chunks, axis)?)
        {
            chunk.insert(key.clone(), piece);
        }
    }

    Ok((args_split, kwargs_split))
}

/// Merge output chunks back into a whole-batch tensor.
pub fn merge_chunks(chunks: &[Tensor], spec: Option<ChunkSpec>) -> Result<Tensor, ChunkError> {
    if chunks.is_empty() {
        return Err(ChunkError::EmptyMerge);
    }
    let axis = spec.unwrap_or_default().axis;
    let views: Vec<_> = chunks.iter().map(|c| c.view()).collect();
    Ok(concatenate(Axis(axis), &views)?)
}

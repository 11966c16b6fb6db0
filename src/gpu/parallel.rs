//! Multi-device partitioning: tensor splits and pipeline splits.
//!
//! These are pure data-partitioning plans. A compute backend supplies the
//! per-shard or per-stage work; the plans decide who gets which slice and how
//! the pieces go back together.

use crate::config::{ParallelConfig, ParallelismStrategy};
use rayon::prelude::*;
use serde::Serialize;
use std::ops::Range;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PartitionError {
    #[error("cannot partition into zero parts")]
    ZeroParts,

    #[error("cannot split {len} items into {parts} non-empty parts")]
    TooManyParts { len: usize, parts: usize },

    #[error("no devices to place partitions on")]
    NoDevices,

    #[error("expected {expected} elements, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("shard {index} produced {actual_rows}x{actual_cols}, expected {expected_rows}x{expected_cols}")]
    ShardShape {
        index: usize,
        expected_rows: usize,
        expected_cols: usize,
        actual_rows: usize,
        actual_cols: usize,
    },
}

/// Split `len` items into `parts` contiguous ranges of `len / parts` items,
/// with the remainder appended to the final range.
pub fn contiguous_split(len: usize, parts: usize) -> Result<Vec<Range<usize>>, PartitionError> {
    if parts == 0 {
        return Err(PartitionError::ZeroParts);
    }
    if len < parts {
        return Err(PartitionError::TooManyParts { len, parts });
    }
    let base = len / parts;
    Ok((0..parts)
        .map(|i| {
            let start = i * base;
            let end = if i + 1 == parts { len } else { start + base };
            start..end
        })
        .collect())
}

/// Row-major `[rows, cols]` block of activations.
///
/// Only built through [`FeatureBlock::new`], so `data` always holds exactly
/// `rows * cols` elements.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureBlock {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl FeatureBlock {
    pub fn new(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self, PartitionError> {
        if data.len() != rows * cols {
            return Err(PartitionError::LengthMismatch {
                expected: rows * cols,
                actual: data.len(),
            });
        }
        Ok(Self { rows, cols, data })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    pub fn row(&self, r: usize) -> &[f32] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }
}

/// Concatenate blocks along the feature (column) axis.
pub fn concat_features(blocks: &[FeatureBlock]) -> Result<FeatureBlock, PartitionError> {
    let rows = blocks.first().map(|b| b.rows).unwrap_or(0);
    if let Some(block) = blocks.iter().find(|b| b.rows != rows) {
        return Err(PartitionError::LengthMismatch {
            expected: rows,
            actual: block.rows,
        });
    }
    let cols: usize = blocks.iter().map(|b| b.cols).sum();
    let mut data = Vec::with_capacity(rows * cols);
    for r in 0..rows {
        for block in blocks {
            data.extend_from_slice(block.row(r));
        }
    }
    Ok(FeatureBlock { rows, cols, data })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Shard {
    pub index: usize,
    pub device: u32,
    /// Output-dimension rows of the weight matrix held by this shard
    pub rows: Range<usize>,
}

impl Shard {
    pub fn width(&self) -> usize {
        self.rows.len()
    }
}

/// Output-dimension split of a weight matrix across devices.
#[derive(Debug, Clone, Serialize)]
pub struct TensorSplit {
    pub out_features: usize,
    pub shards: Vec<Shard>,
}

impl TensorSplit {
    /// Uses the first `min(tensor_parallel_size, devices.len())` devices.
    pub fn new(
        out_features: usize,
        devices: &[u32],
        tensor_parallel_size: usize,
    ) -> Result<Self, PartitionError> {
        if devices.is_empty() {
            return Err(PartitionError::NoDevices);
        }
        let parts = tensor_parallel_size.min(devices.len());
        let shards = contiguous_split(out_features, parts)?
            .into_iter()
            .zip(devices)
            .enumerate()
            .map(|(index, (rows, device))| Shard {
                index,
                device: *device,
                rows,
            })
            .collect();
        Ok(Self {
            out_features,
            shards,
        })
    }

    /// Slice a row-major `[out_features, in_features]` weight into per-shard views.
    pub fn split_weight<'a, T>(
        &self,
        weight: &'a [T],
        in_features: usize,
    ) -> Result<Vec<&'a [T]>, PartitionError> {
        let expected = self.out_features * in_features;
        if weight.len() != expected {
            return Err(PartitionError::LengthMismatch {
                expected,
                actual: weight.len(),
            });
        }
        Ok(self
            .shards
            .iter()
            .map(|s| &weight[s.rows.start * in_features..s.rows.end * in_features])
            .collect())
    }

    /// Run every shard in parallel and reassemble `[batch, out_features]`.
    ///
    /// Each shard must return `[batch, shard.width()]`.
    pub fn execute<F>(&self, batch: usize, run_shard: F) -> Result<FeatureBlock, PartitionError>
    where
        F: Fn(&Shard) -> FeatureBlock + Sync,
    {
        let outputs: Vec<FeatureBlock> = self.shards.par_iter().map(&run_shard).collect();
        for (shard, out) in self.shards.iter().zip(&outputs) {
            if out.rows != batch || out.cols != shard.width() {
                return Err(PartitionError::ShardShape {
                    index: shard.index,
                    expected_rows: batch,
                    expected_cols: shard.width(),
                    actual_rows: out.rows,
                    actual_cols: out.cols,
                });
            }
        }
        concat_features(&outputs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageGroup {
    pub index: usize,
    pub device: u32,
    /// Indices into the ordered stage list
    pub stages: Range<usize>,
}

/// Contiguous grouping of computation stages, one group per device.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSplit {
    pub num_stages: usize,
    pub groups: Vec<StageGroup>,
}

/// Result of streaming micro-batches through a pipeline.
#[derive(Debug)]
pub struct PipelineRun<T> {
    pub outputs: Vec<T>,
    /// Device-boundary transfers performed, `groups - 1` per micro-batch
    pub transfers: usize,
}

impl PipelineSplit {
    /// Uses the first `min(pipeline_parallel_size, devices.len())` devices.
    pub fn new(
        num_stages: usize,
        devices: &[u32],
        pipeline_parallel_size: usize,
    ) -> Result<Self, PartitionError> {
        if devices.is_empty() {
            return Err(PartitionError::NoDevices);
        }
        let parts = pipeline_parallel_size.min(devices.len());
        let groups = contiguous_split(num_stages, parts)?
            .into_iter()
            .zip(devices)
            .enumerate()
            .map(|(index, (stages, device))| StageGroup {
                index,
                device: *device,
                stages,
            })
            .collect();
        Ok(Self { num_stages, groups })
    }

    /// Stream each micro-batch through groups 1..P in device order.
    ///
    /// Micro-batches are processed in order and outputs keep that order.
    pub fn forward<T, E, F>(&self, micro_batches: Vec<T>, mut run_group: F) -> Result<PipelineRun<T>, E>
    where
        F: FnMut(&StageGroup, T) -> Result<T, E>,
    {
        let mut outputs = Vec::with_capacity(micro_batches.len());
        let mut transfers = 0;
        for micro_batch in micro_batches {
            let mut current = micro_batch;
            for (i, group) in self.groups.iter().enumerate() {
                if i > 0 {
                    transfers += 1;
                }
                current = run_group(group, current)?;
            }
            outputs.push(current);
        }
        Ok(PipelineRun { outputs, transfers })
    }
}

/// Split a batch of `len` rows into at most `micro_batches` contiguous chunks.
pub fn split_micro_batches(len: usize, micro_batches: usize) -> Vec<Range<usize>> {
    if len == 0 {
        return Vec::new();
    }
    contiguous_split(len, micro_batches.clamp(1, len)).unwrap_or_else(|_| vec![0..len])
}

/// Which devices take part in tensor and pipeline groups under a config.
#[derive(Debug, Clone, Serialize)]
pub struct ParallelLayout {
    pub strategy: ParallelismStrategy,
    pub tensor_devices: Vec<u32>,
    pub pipeline_devices: Vec<u32>,
}

impl ParallelLayout {
    pub fn describe(config: &ParallelConfig, gpu_ids: &[u32]) -> Self {
        let take = |n: usize| gpu_ids.iter().take(n).copied().collect::<Vec<_>>();
        let (tensor_devices, pipeline_devices) = match config.strategy {
            ParallelismStrategy::Data => (Vec::new(), Vec::new()),
            ParallelismStrategy::Tensor => (take(config.tensor_parallel_size), Vec::new()),
            ParallelismStrategy::Pipeline => (Vec::new(), take(config.pipeline_parallel_size)),
            ParallelismStrategy::Hybrid => (
                take(config.tensor_parallel_size),
                take(config.pipeline_parallel_size),
            ),
        };
        Self {
            strategy: config.strategy,
            tensor_devices,
            pipeline_devices,
        }
    }
}

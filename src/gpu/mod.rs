//! Device bookkeeping: metrics, load balancing and multi-device partitioning.

pub mod load_balancer;
pub mod manager;
pub mod parallel;

pub use load_balancer::{adaptive_score, Assignment, ImbalanceReport, LoadBalancer, LoadBalancerStats};
pub use manager::{GpuManager, GpuSnapshot, FULL_LOAD_QUEUE_DEPTH};
pub use parallel::{
    concat_features, contiguous_split, split_micro_batches, FeatureBlock, ParallelLayout,
    PartitionError, PipelineRun, PipelineSplit, Shard, StageGroup, TensorSplit,
};

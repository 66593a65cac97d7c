//! Resource requirements and their aggregation across execution units.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// GPU model, ordered by a fixed capability ranking.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum GpuType {
    /// NVIDIA H100.
    H100,
    /// NVIDIA A100.
    A100,
    /// NVIDIA L40S.
    L40S,
    /// NVIDIA A10G.
    A10G,
    /// NVIDIA L4.
    L4,
    /// NVIDIA V100.
    V100,
    /// NVIDIA T4.
    T4,
    /// Any other named accelerator. Ranked below all known types.
    Other(String),
}

impl GpuType {
    /// Capability rank; higher wins when units are aggregated.
    #[must_use]
    pub fn rank(&self) -> u8 {
        match self {
            Self::H100 => 7,
            Self::A100 => 6,
            Self::L40S => 5,
            Self::A10G => 4,
            Self::L4 => 3,
            Self::V100 => 2,
            Self::T4 => 1,
            Self::Other(_) => 0,
        }
    }

    /// Returns the more capable of two GPU types. Ties keep `self`.
    #[must_use]
    pub fn most_capable(self, other: Self) -> Self {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

impl From<&str> for GpuType {
    fn from(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "H100" => Self::H100,
            "A100" => Self::A100,
            "L40S" => Self::L40S,
            "A10G" => Self::A10G,
            "L4" => Self::L4,
            "V100" => Self::V100,
            "T4" => Self::T4,
            _ => Self::Other(raw.trim().to_string()),
        }
    }
}

impl From<String> for GpuType {
    fn from(raw: String) -> Self {
        Self::from(raw.as_str())
    }
}

impl From<GpuType> for String {
    fn from(gpu: GpuType) -> Self {
        gpu.to_string()
    }
}

impl fmt::Display for GpuType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::H100 => write!(f, "H100"),
            Self::A100 => write!(f, "A100"),
            Self::L40S => write!(f, "L40S"),
            Self::A10G => write!(f, "A10G"),
            Self::L4 => write!(f, "L4"),
            Self::V100 => write!(f, "V100"),
            Self::T4 => write!(f, "T4"),
            Self::Other(name) => write!(f, "{name}"),
        }
    }
}

/// Compute resources a step (or a whole execution unit) needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirement {
    /// CPU cores.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f64>,
    /// Memory in MiB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    /// Scratch storage in MiB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_mb: Option<u64>,
    /// Number of GPUs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_count: Option<u32>,
    /// GPU model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_type: Option<GpuType>,
    /// Memory per GPU in MiB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_memory_mb: Option<u64>,
    /// Node affinity: label key to the set of acceptable values.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_affinity: BTreeMap<String, BTreeSet<String>>,
}

impl ResourceRequirement {
    /// Creates an empty requirement.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the CPU core count.
    #[must_use]
    pub fn with_cpu(mut self, cpu: f64) -> Self {
        self.cpu = Some(cpu);
        self
    }

    /// Sets the memory in MiB.
    #[must_use]
    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        self.memory_mb = Some(memory_mb);
        self
    }

    /// Sets the storage in MiB.
    #[must_use]
    pub fn with_storage_mb(mut self, storage_mb: u64) -> Self {
        self.storage_mb = Some(storage_mb);
        self
    }

    /// Sets GPU count and type.
    #[must_use]
    pub fn with_gpu(mut self, count: u32, gpu_type: impl Into<GpuType>) -> Self {
        self.gpu_count = Some(count);
        self.gpu_type = Some(gpu_type.into());
        self
    }

    /// Sets the memory per GPU in MiB.
    #[must_use]
    pub fn with_gpu_memory_mb(mut self, gpu_memory_mb: u64) -> Self {
        self.gpu_memory_mb = Some(gpu_memory_mb);
        self
    }

    /// Adds an acceptable value for a node label.
    #[must_use]
    pub fn with_node_affinity(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.node_affinity
            .entry(key.into())
            .or_default()
            .insert(value.into());
        self
    }

    /// Returns true if nothing is requested.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Combines two requirements so the result satisfies both.
    ///
    /// Scalars take the maximum, the GPU type is the most capable of the two
    /// and node-affinity constraints are unioned.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        let mut node_affinity = self.node_affinity.clone();
        for (key, values) in &other.node_affinity {
            node_affinity
                .entry(key.clone())
                .or_default()
                .extend(values.iter().cloned());
        }

        Self {
            cpu: max_option(self.cpu, other.cpu, f64::max),
            memory_mb: max_option(self.memory_mb, other.memory_mb, u64::max),
            storage_mb: max_option(self.storage_mb, other.storage_mb, u64::max),
            gpu_count: max_option(self.gpu_count, other.gpu_count, u32::max),
            gpu_type: match (self.gpu_type.clone(), other.gpu_type.clone()) {
                (Some(a), Some(b)) => Some(a.most_capable(b)),
                (a, b) => a.or(b),
            },
            gpu_memory_mb: max_option(self.gpu_memory_mb, other.gpu_memory_mb, u64::max),
            node_affinity,
        }
    }

    /// Aggregates any number of requirements.
    pub fn aggregate<'a>(requirements: impl IntoIterator<Item = &'a Self>) -> Self {
        requirements
            .into_iter()
            .fold(Self::default(), |acc, req| acc.merge(req))
    }
}

fn max_option<T: Copy>(a: Option<T>, b: Option<T>, max: fn(T, T) -> T) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(max(a, b)),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_gpu_rank_ordering() {
        assert!(GpuType::H100.rank() > GpuType::A100.rank());
        assert!(GpuType::T4.rank() > GpuType::Other("tpu".into()).rank());
        assert_eq!(GpuType::T4.most_capable(GpuType::A100), GpuType::A100);
        assert_eq!(GpuType::A100.most_capable(GpuType::T4), GpuType::A100);
    }

    #[test]
    fn test_gpu_parse_case_insensitive() {
        assert_eq!(GpuType::from("a100"), GpuType::A100);
        assert_eq!(GpuType::from("MI300"), GpuType::Other("MI300".into()));
    }

    #[test]
    fn test_gpu_serializes_as_string() {
        let json = serde_json::to_string(&GpuType::L40S).unwrap();
        assert_eq!(json, r#""L40S""#);
        let parsed: GpuType = serde_json::from_str(r#""v100""#).unwrap();
        assert_eq!(parsed, GpuType::V100);
    }

    #[test]
    fn test_merge_takes_componentwise_max() {
        let a = ResourceRequirement::new()
            .with_cpu(2.0)
            .with_memory_mb(4096)
            .with_gpu(1, "T4")
            .with_node_affinity("zone", "us-east-1a");
        let b = ResourceRequirement::new()
            .with_cpu(1.0)
            .with_memory_mb(8192)
            .with_storage_mb(100)
            .with_gpu(2, "A100")
            .with_gpu_memory_mb(40_000)
            .with_node_affinity("zone", "us-east-1b")
            .with_node_affinity("pool", "gpu");

        let merged = a.merge(&b);

        assert_eq!(merged.cpu, Some(2.0));
        assert_eq!(merged.memory_mb, Some(8192));
        assert_eq!(merged.storage_mb, Some(100));
        assert_eq!(merged.gpu_count, Some(2));
        assert_eq!(merged.gpu_type, Some(GpuType::A100));
        assert_eq!(merged.gpu_memory_mb, Some(40_000));
        assert_eq!(merged.node_affinity["zone"].len(), 2);
        assert!(merged.node_affinity["pool"].contains("gpu"));
    }

    #[test]
    fn test_aggregate_empty_is_empty() {
        let aggregated = ResourceRequirement::aggregate(std::iter::empty());
        assert!(aggregated.is_empty());
    }

    #[test]
    fn test_gpu_type_priority_is_not_positional() {
        let reqs = [
            ResourceRequirement::new().with_gpu(1, "H100"),
            ResourceRequirement::new().with_gpu(4, "T4"),
        ];
        let aggregated = ResourceRequirement::aggregate(reqs.iter());
        assert_eq!(aggregated.gpu_type, Some(GpuType::H100));
        assert_eq!(aggregated.gpu_count, Some(4));
    }
}

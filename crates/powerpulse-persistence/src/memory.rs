//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Persistence abstractions and storage bindings."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use async_trait::async_trait;
use parking_lot::RwLock;
use powerpulse_msg::{FinishedSample, SourceKind};

use crate::{newest_first, Result, SampleStore};

/// Volatile store used in tests and when `store.backend = "memory"`.
#[derive(Debug, Default)]
pub struct MemorySampleStore {
    samples: RwLock<Vec<FinishedSample>>,
}

impl MemorySampleStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored samples.
    pub fn len(&self) -> usize {
        self.samples.read().len()
    }

    /// True when nothing has been stored.
    pub fn is_empty(&self) -> bool {
        self.samples.read().is_empty()
    }

    /// Copy of every stored sample in append order.
    pub fn snapshot(&self) -> Vec<FinishedSample> {
        self.samples.read().clone()
    }
}

#[async_trait]
impl SampleStore for MemorySampleStore {
    async fn append(&self, sample: &FinishedSample) -> Result<u64> {
        let mut samples = self.samples.write();
        samples.push(sample.clone());
        let sequence = samples
            .iter()
            .filter(|stored| stored.source == sample.source)
            .count();
        Ok(sequence as u64)
    }

    async fn recent(
        &self,
        source: Option<SourceKind>,
        limit: usize,
    ) -> Result<Vec<FinishedSample>> {
        let matching: Vec<_> = self
            .samples
            .read()
            .iter()
            .filter(|sample| source.map_or(true, |kind| sample.source == kind))
            .cloned()
            .collect();
        Ok(newest_first(matching, limit))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

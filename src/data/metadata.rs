//! Sample annotations used to build model designs

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Result, TransformError};

/// Categorical annotations per sample (column name -> value for each sample)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleMetadata {
    sample_ids: Vec<String>,
    conditions: HashMap<String, Vec<String>>,
}

impl SampleMetadata {
    /// Create new sample metadata
    pub fn new(sample_ids: Vec<String>) -> Self {
        {
            let mut seen = std::collections::HashSet::new();
            for id in &sample_ids {
                if !seen.insert(id) {
                    log::warn!("Duplicate sample ID detected: '{}'. Sample IDs should be unique.", id);
                }
            }
        }
        Self {
            sample_ids,
            conditions: HashMap::new(),
        }
    }

    /// Add a condition column (categorical factor)
    pub fn add_condition(&mut self, name: &str, values: Vec<String>) -> Result<()> {
        if values.len() != self.sample_ids.len() {
            return Err(TransformError::DimensionMismatch {
                expected: format!("{} values", self.sample_ids.len()),
                got: format!("{} values", values.len()),
            });
        }
        self.conditions.insert(name.to_string(), values);
        Ok(())
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    pub fn n_samples(&self) -> usize {
        self.sample_ids.len()
    }

    /// Values of a condition column
    pub fn condition(&self, name: &str) -> Option<&Vec<String>> {
        self.conditions.get(name)
    }

    /// Unique levels of a condition, sorted
    pub fn levels(&self, name: &str) -> Result<Vec<String>> {
        self.conditions
            .get(name)
            .map(|values| {
                let mut unique: Vec<String> = values.clone();
                unique.sort();
                unique.dedup();
                unique
            })
            .ok_or_else(|| TransformError::InvalidInput {
                reason: format!("condition '{}' not found", name),
            })
    }

    /// Reorder rows to follow `sample_ids` (the count matrix column order)
    pub fn align_to(&self, sample_ids: &[String]) -> Result<Self> {
        let order: Vec<usize> = sample_ids
            .iter()
            .map(|id| {
                self.sample_ids
                    .iter()
                    .position(|s| s == id)
                    .ok_or_else(|| TransformError::InvalidInput {
                        reason: format!("sample '{}' missing from metadata", id),
                    })
            })
            .collect::<Result<_>>()?;

        let mut aligned = SampleMetadata::new(sample_ids.to_vec());
        for (name, values) in &self.conditions {
            aligned.add_condition(name, order.iter().map(|&i| values[i].clone()).collect())?;
        }
        Ok(aligned)
    }
}

//! Dataset sinks: where accepted samples go.
//!
//! Records use the Alpaca-style `instruction` / `input` / `output` layout,
//! extended with provenance fields so a dataset can be traced back to the
//! pattern and bindings that produced each row.

pub mod jsonl;

pub use jsonl::{existing_fingerprints, JsonlSink};

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SinkError;
use crate::generator::CandidateSample;
use crate::pattern::PatternMetadata;
use crate::validation::Violation;

/// One dataset row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub instruction: String,
    /// Always empty; kept for compatibility with instruction-tuning loaders.
    #[serde(default)]
    pub input: String,
    /// The validated source.
    pub output: String,
    pub pattern_id: String,
    pub category: String,
    pub complexity: u8,
    pub bindings: BTreeMap<String, String>,
    pub fingerprint: String,
    /// Deep-analysis findings recorded under the advisory policy.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub advisories: Vec<Violation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<PatternMetadata>,
    pub generated_at: DateTime<Utc>,
}

impl DatasetRecord {
    /// Builds a record from an accepted candidate.
    pub fn from_candidate(
        candidate: &CandidateSample,
        advisories: Vec<Violation>,
        metadata: Option<PatternMetadata>,
    ) -> Self {
        Self {
            instruction: candidate.instruction.clone(),
            input: String::new(),
            output: candidate.source.clone(),
            pattern_id: candidate.pattern_id.clone(),
            category: candidate.category.clone(),
            complexity: candidate.complexity,
            bindings: candidate.assignment.as_map().clone(),
            fingerprint: candidate.fingerprint.clone(),
            advisories,
            metadata,
            generated_at: Utc::now(),
        }
    }
}

/// Destination for accepted records.
///
/// A write error is fatal to the run; the orchestrator flushes and stops.
#[async_trait]
pub trait DatasetSink: Send {
    async fn write(&mut self, record: &DatasetRecord) -> Result<(), SinkError>;

    /// Makes everything written so far durable.
    async fn flush(&mut self) -> Result<(), SinkError>;
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Vec<DatasetRecord>,
    flushes: usize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[DatasetRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<DatasetRecord> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of times the sink was flushed.
    pub fn flushes(&self) -> usize {
        self.flushes
    }
}

#[async_trait]
impl DatasetSink for MemorySink {
    async fn write(&mut self, record: &DatasetRecord) -> Result<(), SinkError> {
        self.records.push(record.clone());
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        self.flushes += 1;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Accepts a fixed number of writes, then fails.
    #[derive(Debug)]
    pub struct FailingSink {
        pub inner: MemorySink,
        pub fail_after: usize,
    }

    impl FailingSink {
        pub fn new(fail_after: usize) -> Self {
            Self {
                inner: MemorySink::new(),
                fail_after,
            }
        }
    }

    #[async_trait]
    impl DatasetSink for FailingSink {
        async fn write(&mut self, record: &DatasetRecord) -> Result<(), SinkError> {
            if self.inner.len() >= self.fail_after {
                return Err(SinkError::Write("disk full".to_string()));
            }
            self.inner.write(record).await
        }

        async fn flush(&mut self) -> Result<(), SinkError> {
            self.inner.flush().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::{source_fingerprint, BindingAssignment};

    fn candidate() -> CandidateSample {
        let mut assignment = BindingAssignment::new();
        assignment.insert("factor", "2.0");
        let source = "import math\n\n\ndef area(r):\n    return 2.0 * math.pi * r ** 2\n";
        CandidateSample {
            pattern_id: "circle_area".to_string(),
            category: "geometry".to_string(),
            complexity: 1,
            assignment,
            source: source.to_string(),
            checks: vec!["assert area(1) > 0".to_string()],
            instruction: "Write area(r).".to_string(),
            fingerprint: source_fingerprint(source),
        }
    }

    #[test]
    fn test_record_from_candidate() {
        let c = candidate();
        let record = DatasetRecord::from_candidate(&c, Vec::new(), None);
        assert_eq!(record.instruction, "Write area(r).");
        assert_eq!(record.input, "");
        assert_eq!(record.output, c.source);
        assert_eq!(record.bindings.get("factor").map(String::as_str), Some("2.0"));

        let json = serde_json::to_value(&record).expect("serialize");
        assert!(json.get("advisories").is_none());
        assert!(json.get("metadata").is_none());
        assert_eq!(json["input"], "");
    }

    #[tokio::test]
    async fn test_memory_sink() {
        let mut sink = MemorySink::new();
        let record = DatasetRecord::from_candidate(&candidate(), Vec::new(), None);
        sink.write(&record).await.expect("write");
        sink.flush().await.expect("flush");
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.flushes(), 1);
    }

    #[tokio::test]
    async fn test_failing_sink() {
        let mut sink = testing::FailingSink::new(1);
        let record = DatasetRecord::from_candidate(&candidate(), Vec::new(), None);
        assert!(sink.write(&record).await.is_ok());
        assert!(matches!(sink.write(&record).await, Err(SinkError::Write(_))));
    }
}

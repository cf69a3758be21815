//! In-memory sink for tests and debugging.

use std::collections::VecDeque;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::cdr::ExternalRecord;

use super::{Backend, BackendError};

/// Keeps the most recent records in memory, oldest evicted first.
#[derive(Debug)]
pub struct MemoryBackend {
    records: RwLock<VecDeque<ExternalRecord>>,
    max_records: usize,
}

impl MemoryBackend {
    pub fn new(max_records: usize) -> Self {
        Self {
            records: RwLock::new(VecDeque::with_capacity(max_records)),
            max_records,
        }
    }

    /// Everything currently held, oldest first.
    pub fn posted(&self) -> Vec<ExternalRecord> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// The most recent `count` records, newest first.
    pub fn recent(&self, count: usize) -> Vec<ExternalRecord> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .rev()
            .take(count)
            .cloned()
            .collect()
    }

    /// Records where `channel` is either party.
    pub fn by_channel(&self, channel: &str) -> Vec<ExternalRecord> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.channel == channel || r.dstchannel == channel)
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.records.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn clear(&self) {
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn post(&self, record: &ExternalRecord) -> Result<(), BackendError> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        if records.len() >= self.max_records {
            records.pop_front();
        }
        records.push_back(record.clone());
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cdr::{Disposition, Variables};

    pub(crate) fn sample_record() -> ExternalRecord {
        ExternalRecord {
            clid: "\"Alice\" <100>".into(),
            src: "100".into(),
            dst: "200".into(),
            dcontext: "default".into(),
            channel: "SIP/alice-1".into(),
            dstchannel: "SIP/bob-1".into(),
            lastapp: "Dial".into(),
            lastdata: "SIP/bob".into(),
            start: Some(chrono::Utc::now()),
            answer: None,
            end: Some(chrono::Utc::now()),
            duration: 0,
            billsec: 0,
            disposition: Disposition::Answered,
            amaflags: 0,
            accountcode: String::new(),
            peeraccount: String::new(),
            uniqueid: "uid-a".into(),
            linkedid: "lid".into(),
            userfield: String::new(),
            sequence: 0,
            variables: Variables::new(),
            disabled: false,
        }
    }

    #[tokio::test]
    async fn test_eviction_at_capacity() {
        let backend = MemoryBackend::new(2);
        for i in 0..3 {
            let mut record = sample_record();
            record.sequence = i;
            backend.post(&record).await.unwrap();
        }
        assert_eq!(backend.count(), 2);
        let recent = backend.recent(10);
        assert_eq!(recent[0].sequence, 2);
        assert_eq!(recent[1].sequence, 1);
    }

    #[tokio::test]
    async fn test_by_channel_matches_either_party() {
        let backend = MemoryBackend::new(10);
        backend.post(&sample_record()).await.unwrap();
        assert_eq!(backend.by_channel("SIP/alice-1").len(), 1);
        assert_eq!(backend.by_channel("SIP/bob-1").len(), 1);
        assert!(backend.by_channel("SIP/carol-1").is_empty());
    }
}

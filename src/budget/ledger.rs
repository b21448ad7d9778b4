//! Append-only usage ledger.
//!
//! One JSONL file per UTC day under the usage directory. Appends are
//! serialized through the ledger's write lock; reads scan the day
//! buckets in range through an in-memory cache that is invalidated by
//! appends to the same bucket. Malformed lines are skipped with a
//! warning — a corrupt entry must not hide the rest of the day.

use crate::models::UsageRecord;
use crate::Result;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

#[derive(Clone)]
pub struct UsageLedger {
    dir: PathBuf,
    /// Serializes appends so records land in wall-clock order.
    append_lock: Arc<Mutex<()>>,
    cache: Arc<RwLock<HashMap<NaiveDate, Arc<Vec<UsageRecord>>>>>,
}

impl UsageLedger {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            append_lock: Arc::new(Mutex::new(())),
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn bucket_path(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}.log", date.format("%Y-%m-%d")))
    }

    /// Append one record to its day bucket.
    pub async fn append(&self, record: &UsageRecord) -> Result<()> {
        let _guard = self.append_lock.lock().await;
        tokio::fs::create_dir_all(&self.dir).await?;

        let date = record.ts.date_naive();
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.bucket_path(date))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        self.cache.write().await.remove(&date);
        debug!(
            "[UsageLedger] Appended record for {} ({} in / {} out)",
            record.agent_id, record.input_tokens, record.output_tokens
        );
        Ok(())
    }

    /// All records with `ts` in `[from, to]`, in file order.
    pub async fn records_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<UsageRecord>> {
        let mut records = Vec::new();
        let mut date = from.date_naive();
        let last = to.date_naive();
        while date <= last {
            let bucket = self.load_bucket(date).await?;
            records.extend(
                bucket
                    .iter()
                    .filter(|r| r.ts >= from && r.ts <= to)
                    .cloned(),
            );
            date = match date.succ_opt() {
                Some(next) => next,
                None => break,
            };
        }
        Ok(records)
    }

    /// Records for one agent in `[from, to]`.
    pub async fn records_for_agent(
        &self,
        agent_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<UsageRecord>> {
        Ok(self
            .records_between(from, to)
            .await?
            .into_iter()
            .filter(|r| r.agent_id == agent_id)
            .collect())
    }

    async fn load_bucket(&self, date: NaiveDate) -> Result<Arc<Vec<UsageRecord>>> {
        if let Some(bucket) = self.cache.read().await.get(&date) {
            return Ok(bucket.clone());
        }

        let path = self.bucket_path(date);
        let records = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents
                .lines()
                .filter(|l| !l.trim().is_empty())
                .filter_map(|line| match serde_json::from_str::<UsageRecord>(line) {
                    Ok(record) => Some(record),
                    Err(e) => {
                        warn!(
                            "[UsageLedger] Skipping malformed line in {}: {}",
                            path.display(),
                            e
                        );
                        None
                    }
                })
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let bucket = Arc::new(records);
        self.cache.write().await.insert(date, bucket.clone());
        Ok(bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SessionRef;

    fn record(agent: &str, ts: DateTime<Utc>, input: u64, output: u64) -> UsageRecord {
        UsageRecord {
            agent_id: agent.to_string(),
            session: SessionRef::new("s1"),
            project_path: "/repo".to_string(),
            ts,
            input_tokens: input,
            output_tokens: output,
            model: "claude-sonnet-4".to_string(),
            operation: "continuation".to_string(),
            task_id: None,
        }
    }

    #[tokio::test]
    async fn test_append_and_scan() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = UsageLedger::new(dir.path().to_path_buf());
        let now = Utc::now();

        ledger.append(&record("a1", now, 100, 50)).await.unwrap();
        ledger.append(&record("a2", now, 10, 5)).await.unwrap();
        ledger.append(&record("a1", now, 200, 80)).await.unwrap();

        let all = ledger
            .records_between(now - chrono::Duration::hours(1), now)
            .await
            .unwrap();
        assert_eq!(all.len(), 3);

        let a1 = ledger
            .records_for_agent("a1", now - chrono::Duration::hours(1), now)
            .await
            .unwrap();
        assert_eq!(a1.len(), 2);
        assert_eq!(a1[0].input_tokens, 100);
        assert_eq!(a1[1].input_tokens, 200);
    }

    #[tokio::test]
    async fn test_day_bucketing() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = UsageLedger::new(dir.path().to_path_buf());
        let today = Utc::now();
        let yesterday = today - chrono::Duration::days(1);

        ledger.append(&record("a1", yesterday, 10, 1)).await.unwrap();
        ledger.append(&record("a1", today, 20, 2)).await.unwrap();

        // Two bucket files exist
        let mut files: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        files.sort();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with(".log"));

        // A day-scoped scan only sees today's record
        let midnight = today
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc();
        let todays = ledger.records_between(midnight, today).await.unwrap();
        assert_eq!(todays.len(), 1);
        assert_eq!(todays[0].input_tokens, 20);
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = UsageLedger::new(dir.path().to_path_buf());
        let now = Utc::now();
        ledger.append(&record("a1", now, 10, 1)).await.unwrap();

        // Corrupt the bucket by hand
        let path = dir
            .path()
            .join(format!("{}.log", now.date_naive().format("%Y-%m-%d")));
        let mut contents = std::fs::read_to_string(&path).unwrap();
        contents.push_str("{not json}\n");
        std::fs::write(&path, contents).unwrap();

        let all = ledger
            .records_between(now - chrono::Duration::hours(1), Utc::now())
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_cache_invalidated_by_append() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = UsageLedger::new(dir.path().to_path_buf());
        let now = Utc::now();

        ledger.append(&record("a1", now, 10, 1)).await.unwrap();
        let first = ledger
            .records_between(now - chrono::Duration::hours(1), Utc::now())
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        ledger.append(&record("a1", now, 20, 2)).await.unwrap();
        let second = ledger
            .records_between(now - chrono::Duration::hours(1), Utc::now())
            .await
            .unwrap();
        assert_eq!(second.len(), 2);
    }
}

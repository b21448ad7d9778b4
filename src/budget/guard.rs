//! Budget guard: usage accounting, threshold detection, and pause
//! signaling.
//!
//! The guard never throws on overuse — it records, emits signals, and
//! flags the agent for pause; the continuation engine consults
//! `is_within_budget` before every prompt injection. Cost is derived
//! from the rate table at read time, so repricing the table reprices
//! history.

use super::config::BudgetsConfig;
use super::ledger::UsageLedger;
use crate::models::UsageRecord;
use crate::notify::{NotificationKind, NotificationRecord, Notifier};
use crate::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Query period for usage summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsagePeriod {
    /// Since UTC midnight.
    Day,
    /// The last 7 day buckets.
    Week,
    /// The last 30 day buckets.
    Month,
}

impl UsagePeriod {
    fn window(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let midnight = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .expect("midnight is valid")
            .and_utc();
        let from = match self {
            UsagePeriod::Day => midnight,
            UsagePeriod::Week => midnight - Duration::days(6),
            UsagePeriod::Month => midnight - Duration::days(29),
        };
        (from, now)
    }
}

/// Aggregated usage for one agent over a period.
#[derive(Debug, Clone, Default)]
pub struct UsageSummary {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cost: f64,
    pub operation_breakdown: HashMap<String, f64>,
    pub model_breakdown: HashMap<String, f64>,
    pub record_count: usize,
}

/// Point-in-time budget status for one agent.
#[derive(Debug, Clone)]
pub struct BudgetStatus {
    pub within_budget: bool,
    pub daily_used: f64,
    pub daily_limit: Option<f64>,
    pub percent_used: f64,
    pub estimated_runway: String,
}

#[derive(Clone)]
pub struct BudgetGuard {
    ledger: UsageLedger,
    config: Arc<BudgetsConfig>,
    notifier: Arc<dyn Notifier>,
    /// Agents flagged for pause after exceeding their budget.
    paused: Arc<RwLock<HashSet<String>>>,
    /// Agents currently above the warning threshold (signal fires once
    /// per crossing).
    warned: Arc<RwLock<HashSet<String>>>,
}

impl BudgetGuard {
    pub fn new(ledger: UsageLedger, config: BudgetsConfig, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            ledger,
            config: Arc::new(config),
            notifier,
            paused: Arc::new(RwLock::new(HashSet::new())),
            warned: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    /// Derived cost of one record under the current rate table.
    pub fn cost_of(&self, record: &UsageRecord) -> f64 {
        let rates = self.config.rates_for(&record.model);
        (record.input_tokens as f64 * rates.input_rate
            + record.output_tokens as f64 * rates.output_rate)
            / 1_000_000.0
    }

    /// Append a record, then run threshold detection for its agent.
    pub async fn record_usage(&self, record: UsageRecord) -> Result<()> {
        self.ledger.append(&record).await?;
        if let Some(task_id) = &record.task_id {
            self.check_task_token_cap(&record, task_id).await?;
        }
        self.check_thresholds(&record.agent_id, &record.project_path)
            .await
    }

    /// Per-task token cap: a single runaway task pauses its agent even
    /// when the daily dollar budget still has room.
    async fn check_task_token_cap(&self, record: &UsageRecord, task_id: &str) -> Result<()> {
        let effective = self
            .config
            .effective(&record.agent_id, &record.project_path);
        let Some(cap) = effective.max_tokens_per_task else {
            return Ok(());
        };

        let (from, to) = UsagePeriod::Month.window(Utc::now());
        let task_tokens: u64 = self
            .ledger
            .records_for_agent(&record.agent_id, from, to)
            .await?
            .iter()
            .filter(|r| r.task_id.as_deref() == Some(task_id))
            .map(|r| r.input_tokens + r.output_tokens)
            .sum();

        if task_tokens > cap {
            let newly_paused = self.paused.write().await.insert(record.agent_id.clone());
            if newly_paused {
                warn!(
                    "[BudgetGuard] Task {} used {} tokens (cap {}), pausing agent {}",
                    task_id, task_tokens, cap, record.agent_id
                );
                self.notifier
                    .notify(NotificationRecord::new(
                        NotificationKind::BudgetExceeded,
                        format!(
                            "task {task_id} exceeded its token cap: {task_tokens} of {cap}"
                        ),
                    ))
                    .await?;
            }
        }
        Ok(())
    }

    /// Aggregate usage for an agent over a period.
    pub async fn get_usage(&self, agent_id: &str, period: UsagePeriod) -> Result<UsageSummary> {
        let (from, to) = period.window(Utc::now());
        let records = self.ledger.records_for_agent(agent_id, from, to).await?;

        let mut summary = UsageSummary::default();
        for record in &records {
            let cost = self.cost_of(record);
            summary.input_tokens += record.input_tokens;
            summary.output_tokens += record.output_tokens;
            summary.cost += cost;
            *summary
                .operation_breakdown
                .entry(record.operation.clone())
                .or_insert(0.0) += cost;
            *summary
                .model_breakdown
                .entry(record.model.clone())
                .or_insert(0.0) += cost;
        }
        summary.total_tokens = summary.input_tokens + summary.output_tokens;
        summary.record_count = records.len();
        Ok(summary)
    }

    /// Current status against the agent's effective daily limit.
    pub async fn check_budget(&self, agent_id: &str, project_path: &str) -> Result<BudgetStatus> {
        let effective = self.config.effective(agent_id, project_path);
        let daily = self.get_usage(agent_id, UsagePeriod::Day).await?;

        let (percent_used, within_budget) = match effective.daily_limit {
            Some(limit) if limit > 0.0 => {
                let percent = daily.cost / limit;
                (percent, percent < 1.0)
            }
            _ => (0.0, true),
        };

        let estimated_runway = match effective.daily_limit {
            None => "unlimited".to_string(),
            Some(limit) if daily.cost >= limit => "Budget exceeded".to_string(),
            Some(limit) => {
                if daily.record_count == 0 || daily.cost == 0.0 {
                    "unlimited".to_string()
                } else {
                    let avg = daily.cost / daily.record_count as f64;
                    let remaining = ((limit - daily.cost) / avg).floor() as u64;
                    format!("{remaining} operations remaining")
                }
            }
        };

        Ok(BudgetStatus {
            within_budget,
            daily_used: daily.cost,
            daily_limit: effective.daily_limit,
            percent_used,
            estimated_runway,
        })
    }

    /// Whether the engine may inject prompts for this agent.
    pub async fn is_within_budget(&self, agent_id: &str, project_path: &str) -> Result<bool> {
        if self.paused.read().await.contains(agent_id) {
            return Ok(false);
        }
        Ok(self.check_budget(agent_id, project_path).await?.within_budget)
    }

    pub async fn is_paused(&self, agent_id: &str) -> bool {
        self.paused.read().await.contains(agent_id)
    }

    /// Owner override: clear the pause flag and re-arm the warning.
    pub async fn clear_pause(&self, agent_id: &str) {
        self.paused.write().await.remove(agent_id);
        self.warned.write().await.remove(agent_id);
    }

    async fn check_thresholds(&self, agent_id: &str, project_path: &str) -> Result<()> {
        let effective = self.config.effective(agent_id, project_path);
        let Some(limit) = effective.daily_limit else {
            return Ok(());
        };
        if limit <= 0.0 {
            return Ok(());
        }

        let daily = self.get_usage(agent_id, UsagePeriod::Day).await?;
        let percent = daily.cost / limit;

        if percent >= 1.0 {
            let newly_paused = self.paused.write().await.insert(agent_id.to_string());
            if newly_paused {
                warn!(
                    "[BudgetGuard] Agent {} exceeded daily budget ({:.2}/{:.2})",
                    agent_id, daily.cost, limit
                );
                self.notifier
                    .notify(NotificationRecord::new(
                        NotificationKind::BudgetExceeded,
                        format!(
                            "agent {agent_id} exceeded daily budget: ${:.2} of ${:.2}",
                            daily.cost, limit
                        ),
                    ))
                    .await?;
            }
        } else if percent >= effective.warning_threshold {
            let newly_warned = self.warned.write().await.insert(agent_id.to_string());
            if newly_warned {
                info!(
                    "[BudgetGuard] Agent {} at {:.0}% of daily budget",
                    agent_id,
                    percent * 100.0
                );
                self.notifier
                    .notify(NotificationRecord::new(
                        NotificationKind::BudgetWarning,
                        format!(
                            "agent {agent_id} at {:.0}% of daily budget",
                            percent * 100.0
                        ),
                    ))
                    .await?;
            }
        } else {
            // Dropped back below the threshold (new day); re-arm
            self.warned.write().await.remove(agent_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SessionRef;
    use crate::notify::InMemoryNotifier;

    fn record(agent: &str, input: u64, output: u64, model: &str) -> UsageRecord {
        UsageRecord {
            agent_id: agent.to_string(),
            session: SessionRef::new("s1"),
            project_path: "/repo".to_string(),
            ts: Utc::now(),
            input_tokens: input,
            output_tokens: output,
            model: model.to_string(),
            operation: "continuation".to_string(),
            task_id: None,
        }
    }

    fn guard_with_limit(
        dir: &std::path::Path,
        daily_limit: f64,
    ) -> (BudgetGuard, Arc<InMemoryNotifier>) {
        let yaml = format!(
            "agents:\n  a1:\n    dailyLimit: {daily_limit}\n    warningThreshold: 0.8\nrates:\n  default:\n    inputRate: 1000000.0\n    outputRate: 1000000.0\n"
        );
        let config: BudgetsConfig = serde_yaml::from_str(&yaml).unwrap();
        let notifier = Arc::new(InMemoryNotifier::new());
        let guard = BudgetGuard::new(
            UsageLedger::new(dir.to_path_buf()),
            config,
            notifier.clone(),
        );
        (guard, notifier)
    }

    #[tokio::test]
    async fn test_cost_derived_from_rate_table() {
        let dir = tempfile::tempdir().unwrap();
        let (guard, _) = guard_with_limit(dir.path(), 100.0);
        // 1 input token at $1M/MTok = $1
        let cost = guard.cost_of(&record("a1", 1, 2, "unknown-model"));
        assert!((cost - 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_usage_summary_breakdowns() {
        let dir = tempfile::tempdir().unwrap();
        let (guard, _) = guard_with_limit(dir.path(), 1000.0);

        guard
            .record_usage(record("a1", 1, 0, "model-a"))
            .await
            .unwrap();
        guard
            .record_usage(record("a1", 0, 2, "model-b"))
            .await
            .unwrap();

        let summary = guard.get_usage("a1", UsagePeriod::Day).await.unwrap();
        assert_eq!(summary.input_tokens, 1);
        assert_eq!(summary.output_tokens, 2);
        assert_eq!(summary.total_tokens, 3);
        assert_eq!(summary.model_breakdown.len(), 2);
        assert_eq!(summary.operation_breakdown.len(), 1);
    }

    #[tokio::test]
    async fn test_budget_exceeded_flags_pause() {
        // S3: a daily limit, usage just under it, one more record
        // crosses the line
        let dir = tempfile::tempdir().unwrap();
        let (guard, notifier) = guard_with_limit(dir.path(), 5.0);

        // $4 of a $5 limit (each token costs $1 under the test rates)
        guard
            .record_usage(record("a1", 4, 0, "default"))
            .await
            .unwrap();
        assert!(guard.is_within_budget("a1", "/repo").await.unwrap());

        // +$1 reaches the limit
        guard
            .record_usage(record("a1", 0, 1, "default"))
            .await
            .unwrap();

        assert!(guard.is_paused("a1").await);
        assert!(!guard.is_within_budget("a1", "/repo").await.unwrap());

        let kinds: Vec<NotificationKind> = notifier
            .records()
            .await
            .iter()
            .map(|r| r.kind)
            .collect();
        assert!(kinds.contains(&NotificationKind::BudgetExceeded));

        let status = guard.check_budget("a1", "/repo").await.unwrap();
        assert!(!status.within_budget);
        assert_eq!(status.estimated_runway, "Budget exceeded");
    }

    #[tokio::test]
    async fn test_warning_fires_once_per_crossing() {
        let dir = tempfile::tempdir().unwrap();
        let (guard, notifier) = guard_with_limit(dir.path(), 10.0);

        // 8.0 of 10.0 crosses the 0.8 threshold
        guard
            .record_usage(record("a1", 8, 0, "default"))
            .await
            .unwrap();
        guard
            .record_usage(record("a1", 1, 0, "default"))
            .await
            .unwrap();

        let warnings = notifier
            .records()
            .await
            .iter()
            .filter(|r| r.kind == NotificationKind::BudgetWarning)
            .count();
        assert_eq!(warnings, 1);
    }

    #[tokio::test]
    async fn test_clear_pause_restores_injection() {
        let dir = tempfile::tempdir().unwrap();
        let (guard, _) = guard_with_limit(dir.path(), 1.0);
        guard
            .record_usage(record("a1", 2, 0, "default"))
            .await
            .unwrap();
        assert!(guard.is_paused("a1").await);

        guard.clear_pause("a1").await;
        assert!(!guard.is_paused("a1").await);
        // Still over the daily limit though
        assert!(!guard.is_within_budget("a1", "/repo").await.unwrap());
    }

    #[tokio::test]
    async fn test_max_tokens_per_task_pauses_agent() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = "agents:\n  a1:\n    maxTokensPerTask: 100\n";
        let config: BudgetsConfig = serde_yaml::from_str(yaml).unwrap();
        let notifier = Arc::new(InMemoryNotifier::new());
        let guard = BudgetGuard::new(
            UsageLedger::new(dir.path().to_path_buf()),
            config,
            notifier.clone(),
        );

        let mut r = record("a1", 60, 0, "claude-sonnet-4");
        r.task_id = Some("t-1".to_string());
        guard.record_usage(r.clone()).await.unwrap();
        assert!(!guard.is_paused("a1").await);

        // Second record pushes the task over 100 tokens
        let mut r2 = record("a1", 60, 0, "claude-sonnet-4");
        r2.task_id = Some("t-1".to_string());
        guard.record_usage(r2).await.unwrap();
        assert!(guard.is_paused("a1").await);
        assert!(notifier
            .records()
            .await
            .iter()
            .any(|n| n.kind == NotificationKind::BudgetExceeded));
    }

    #[tokio::test]
    async fn test_runway_estimate() {
        let dir = tempfile::tempdir().unwrap();
        let (guard, _) = guard_with_limit(dir.path(), 10.0);
        guard
            .record_usage(record("a1", 2, 0, "default"))
            .await
            .unwrap();

        let status = guard.check_budget("a1", "/repo").await.unwrap();
        // $2 used over 1 operation, $8 left -> 4 operations
        assert_eq!(status.estimated_runway, "4 operations remaining");
        assert!(status.within_budget);
        assert!((status.percent_used - 0.2).abs() < 1e-9);
    }
}

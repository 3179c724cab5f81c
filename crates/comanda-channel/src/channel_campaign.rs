//! Bulk campaign orchestration: one message, many recipients.
//!
//! Small recipient sets fan out concurrently and return their results
//! synchronously. Larger sets get a [`BulkSendJob`] handle and a spawned
//! task that sends strictly one recipient at a time with a fixed pacing
//! delay, so the provider never sees a burst. Cancellation is cooperative:
//! the flag is observed only at the per-recipient checkpoint, and an
//! in-flight result is still counted before cancellation takes effect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use comanda_core::current_unix_timestamp_ms;

use crate::channel_send::{OutboundSender, SendResult};

const DEFAULT_CAMPAIGN_FAN_OUT_MAX: usize = 5;
const DEFAULT_CAMPAIGN_PACING_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `BulkSendJobStatus` values.
pub enum BulkSendJobStatus {
    Running,
    Completed,
    Cancelled,
    Error,
}

impl BulkSendJobStatus {
    /// Returns the stable snake_case wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, Copy)]
/// Tunables for the dispatch-strategy threshold and pacing delay.
pub struct CampaignConfig {
    pub fan_out_max: usize,
    pub pacing_ms: u64,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            fan_out_max: DEFAULT_CAMPAIGN_FAN_OUT_MAX,
            pacing_ms: DEFAULT_CAMPAIGN_PACING_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
/// Point-in-time view of a bulk job, safe to hand to the panel layer.
pub struct BulkSendJobSnapshot {
    pub status: BulkSendJobStatus,
    pub total: usize,
    pub sent: usize,
    pub failed: usize,
    pub started_unix_ms: u64,
    pub cancel_requested: bool,
}

#[derive(Debug)]
struct BulkSendJobCounters {
    status: BulkSendJobStatus,
    sent: usize,
    failed: usize,
}

#[derive(Debug)]
/// Shared handle for one running campaign. The runner is the only writer of
/// the counters; external readers observe through [`BulkSendJob::snapshot`]
/// and request cancellation only through [`BulkSendJob::cancel`].
pub struct BulkSendJob {
    total: usize,
    started_unix_ms: u64,
    cancelled: AtomicBool,
    counters: Mutex<BulkSendJobCounters>,
}

impl BulkSendJob {
    fn new(total: usize) -> Arc<Self> {
        Arc::new(Self {
            total,
            started_unix_ms: current_unix_timestamp_ms(),
            cancelled: AtomicBool::new(false),
            counters: Mutex::new(BulkSendJobCounters {
                status: BulkSendJobStatus::Running,
                sent: 0,
                failed: 0,
            }),
        })
    }

    /// Requests cooperative cancellation. The loop observes the flag before
    /// its next send; in-flight work is not aborted.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> BulkSendJobSnapshot {
        let counters = self
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        BulkSendJobSnapshot {
            status: counters.status,
            total: self.total,
            sent: counters.sent,
            failed: counters.failed,
            started_unix_ms: self.started_unix_ms,
            cancel_requested: self.cancel_requested(),
        }
    }

    fn record_attempt(&self, success: bool) -> Result<()> {
        let mut counters = self
            .counters
            .lock()
            .map_err(|_| anyhow!("bulk job counter lock poisoned"))?;
        counters.sent = counters.sent.saturating_add(1);
        if !success {
            counters.failed = counters.failed.saturating_add(1);
        }
        Ok(())
    }

    fn finish(&self, status: BulkSendJobStatus) {
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !counters.status.is_terminal() {
            counters.status = status;
        }
    }
}

/// Outcome of [`CampaignRunner::run`]: either the synchronous fan-out results
/// or a job handle for the paced sequential path.
pub enum CampaignOutcome {
    Immediate(Vec<SendResult>),
    Job(Arc<BulkSendJob>),
}

/// Drives one logical send of the same message to many recipients.
pub struct CampaignRunner {
    sender: Arc<dyn OutboundSender + Send + Sync>,
    config: CampaignConfig,
}

impl CampaignRunner {
    pub fn new(sender: Arc<dyn OutboundSender + Send + Sync>, config: CampaignConfig) -> Self {
        Self { sender, config }
    }

    /// Deduplicates recipients, then dispatches: at most `fan_out_max`
    /// recipients go out concurrently with the results returned in place; a
    /// larger set spawns the paced sequential loop and returns the job
    /// handle immediately.
    pub async fn run(
        &self,
        recipients: &[String],
        content: &str,
        media_url: Option<&str>,
    ) -> CampaignOutcome {
        let recipients = dedupe_recipients(recipients);
        if recipients.len() <= self.config.fan_out_max {
            let sends = recipients
                .iter()
                .map(|recipient| self.sender.send(recipient, content, media_url));
            let results = futures_util::future::join_all(sends).await;
            return CampaignOutcome::Immediate(results);
        }

        let job = BulkSendJob::new(recipients.len());
        let task_job = Arc::clone(&job);
        let sender = Arc::clone(&self.sender);
        let pacing = Duration::from_millis(self.config.pacing_ms);
        let content = content.to_string();
        let media_url = media_url.map(str::to_string);
        tokio::spawn(async move {
            let outcome = run_paced_campaign(
                sender.as_ref(),
                &task_job,
                &recipients,
                &content,
                media_url.as_deref(),
                pacing,
            )
            .await;
            if let Err(error) = outcome {
                task_job.finish(BulkSendJobStatus::Error);
                tracing::warn!(error = %error, "bulk campaign task failed");
            }
        });
        CampaignOutcome::Job(job)
    }
}

async fn run_paced_campaign(
    sender: &(dyn OutboundSender + Send + Sync),
    job: &BulkSendJob,
    recipients: &[String],
    content: &str,
    media_url: Option<&str>,
    pacing: Duration,
) -> Result<()> {
    let last_index = recipients.len().saturating_sub(1);
    for (index, recipient) in recipients.iter().enumerate() {
        if job.cancel_requested() {
            job.finish(BulkSendJobStatus::Cancelled);
            return Ok(());
        }
        let result = sender.send(recipient, content, media_url).await;
        job.record_attempt(result.success)?;
        if index < last_index {
            tokio::time::sleep(pacing).await;
        }
    }
    job.finish(BulkSendJobStatus::Completed);
    Ok(())
}

/// Order-preserving dedupe; blank entries are dropped.
fn dedupe_recipients(recipients: &[String]) -> Vec<String> {
    let mut seen = std::collections::BTreeSet::new();
    let mut deduped = Vec::with_capacity(recipients.len());
    for recipient in recipients {
        let trimmed = recipient.trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.to_string()) {
            deduped.push(trimmed.to_string());
        }
    }
    deduped
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::{
        dedupe_recipients, BulkSendJob, BulkSendJobStatus, CampaignConfig, CampaignOutcome,
        CampaignRunner,
    };
    use crate::channel_send::{OutboundSender, SendResult};

    /// Scripted sender: pops one outcome per send, records dispatch order.
    struct ScriptedSender {
        outcomes: Mutex<VecDeque<bool>>,
        dispatched: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
    }

    impl ScriptedSender {
        fn new(outcomes: Vec<bool>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into_iter().collect()),
                dispatched: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                delay,
            })
        }

        fn dispatched(&self) -> Vec<String> {
            self.dispatched.lock().expect("dispatched lock").clone()
        }
    }

    #[async_trait]
    impl OutboundSender for ScriptedSender {
        async fn send(
            &self,
            recipient: &str,
            _content: &str,
            _media_url: Option<&str>,
        ) -> SendResult {
            let concurrent = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(concurrent, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.dispatched
                .lock()
                .expect("dispatched lock")
                .push(recipient.to_string());
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            let success = self
                .outcomes
                .lock()
                .expect("outcomes lock")
                .pop_front()
                .unwrap_or(true);
            if success {
                SendResult::delivered()
            } else {
                SendResult::failed("scripted failure")
            }
        }
    }

    fn recipients(count: usize) -> Vec<String> {
        (1..=count).map(|index| format!("+5550{index:03}")).collect()
    }

    async fn wait_for_terminal(job: &BulkSendJob) -> super::BulkSendJobSnapshot {
        for _ in 0..400 {
            let snapshot = job.snapshot();
            if snapshot.status.is_terminal() {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job never reached a terminal status: {:?}", job.snapshot());
    }

    #[tokio::test]
    async fn small_sets_fan_out_without_a_job() {
        let sender = ScriptedSender::new(vec![true, false, true], Duration::from_millis(20));
        let runner = CampaignRunner::new(sender.clone(), CampaignConfig::default());
        let outcome = runner.run(&recipients(3), "hi", None).await;
        let results = match outcome {
            CampaignOutcome::Immediate(results) => results,
            CampaignOutcome::Job(_) => panic!("3 recipients must not create a job"),
        };
        assert_eq!(results.len(), 3);
        assert_eq!(results.iter().filter(|result| !result.success).count(), 1);
        // The fan-out path overlaps sends.
        assert!(sender.max_in_flight.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn boundary_of_five_recipients_stays_synchronous() {
        let sender = ScriptedSender::new(Vec::new(), Duration::ZERO);
        let runner = CampaignRunner::new(sender.clone(), CampaignConfig::default());
        match runner.run(&recipients(5), "hi", None).await {
            CampaignOutcome::Immediate(results) => assert_eq!(results.len(), 5),
            CampaignOutcome::Job(_) => panic!("5 recipients must not create a job"),
        }
    }

    #[tokio::test]
    async fn six_recipients_create_a_sequential_job() {
        let sender = ScriptedSender::new(Vec::new(), Duration::from_millis(1));
        let runner = CampaignRunner::new(
            sender.clone(),
            CampaignConfig {
                fan_out_max: 5,
                pacing_ms: 1,
            },
        );
        let job = match runner.run(&recipients(6), "hi", None).await {
            CampaignOutcome::Job(job) => job,
            CampaignOutcome::Immediate(_) => panic!("6 recipients must create a job"),
        };
        let snapshot = wait_for_terminal(&job).await;
        assert_eq!(snapshot.status, BulkSendJobStatus::Completed);
        assert_eq!(snapshot.total, 6);
        assert_eq!(snapshot.sent, 6);
        assert_eq!(snapshot.failed, 0);
        // Sequential path: never more than one send in flight, in order.
        assert_eq!(sender.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(sender.dispatched(), recipients(6));
    }

    #[tokio::test]
    async fn totals_use_the_deduplicated_count() {
        let sender = ScriptedSender::new(Vec::new(), Duration::ZERO);
        let runner = CampaignRunner::new(
            sender.clone(),
            CampaignConfig {
                fan_out_max: 5,
                pacing_ms: 1,
            },
        );
        let mut list = recipients(7);
        list.push("+5550001".to_string());
        list.push("  +5550002 ".to_string());
        list.push("   ".to_string());
        let job = match runner.run(&list, "hi", None).await {
            CampaignOutcome::Job(job) => job,
            CampaignOutcome::Immediate(_) => panic!("expected a job"),
        };
        let snapshot = wait_for_terminal(&job).await;
        assert_eq!(snapshot.total, 7);
        assert_eq!(snapshot.sent, 7);
    }

    #[tokio::test]
    async fn counting_invariants_hold_at_every_snapshot() {
        let sender = ScriptedSender::new(
            vec![true, false, true, false, true, true, false],
            Duration::ZERO,
        );
        let runner = CampaignRunner::new(
            sender,
            CampaignConfig {
                fan_out_max: 5,
                pacing_ms: 2,
            },
        );
        let job = match runner.run(&recipients(7), "hi", None).await {
            CampaignOutcome::Job(job) => job,
            CampaignOutcome::Immediate(_) => panic!("expected a job"),
        };
        loop {
            let snapshot = job.snapshot();
            assert!(snapshot.sent <= snapshot.total);
            assert!(snapshot.failed <= snapshot.sent);
            if snapshot.status.is_terminal() {
                assert_eq!(snapshot.status, BulkSendJobStatus::Completed);
                assert_eq!(snapshot.sent, 7);
                assert_eq!(snapshot.failed, 3);
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn cancellation_freezes_counts_and_skips_the_rest() {
        // Recipient #4 fails; the user cancels once #5 has completed.
        let sender = ScriptedSender::new(vec![true, true, true, false, true], Duration::ZERO);
        let runner = CampaignRunner::new(
            sender.clone(),
            CampaignConfig {
                fan_out_max: 5,
                pacing_ms: 80,
            },
        );
        let job = match runner.run(&recipients(7), "hi", None).await {
            CampaignOutcome::Job(job) => job,
            CampaignOutcome::Immediate(_) => panic!("expected a job"),
        };
        for _ in 0..400 {
            if job.snapshot().sent >= 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(job.snapshot().sent, 5, "cancel point not reached");
        job.cancel();
        let snapshot = wait_for_terminal(&job).await;
        assert_eq!(snapshot.status, BulkSendJobStatus::Cancelled);
        assert_eq!(snapshot.total, 7);
        assert_eq!(snapshot.sent, 5);
        assert_eq!(snapshot.failed, 1);
        assert!(snapshot.cancel_requested);
        // Recipients #6 and #7 were never attempted.
        assert_eq!(sender.dispatched().len(), 5);
    }

    #[tokio::test]
    async fn cancel_before_first_send_sends_nothing() {
        let sender = ScriptedSender::new(Vec::new(), Duration::ZERO);
        let runner = CampaignRunner::new(
            sender.clone(),
            CampaignConfig {
                fan_out_max: 5,
                pacing_ms: 30,
            },
        );
        let job = match runner.run(&recipients(6), "hi", None).await {
            CampaignOutcome::Job(job) => job,
            CampaignOutcome::Immediate(_) => panic!("expected a job"),
        };
        job.cancel();
        let snapshot = wait_for_terminal(&job).await;
        assert_eq!(snapshot.status, BulkSendJobStatus::Cancelled);
        // At most the first send slipped in before the flag was observed.
        assert!(snapshot.sent <= 1, "sent {} after cancel", snapshot.sent);
        assert!(snapshot.failed <= snapshot.sent);
    }

    #[test]
    fn dedupe_preserves_first_occurrence_order() {
        let input = vec![
            "b".to_string(),
            "a".to_string(),
            "b".to_string(),
            " a ".to_string(),
            "c".to_string(),
        ];
        assert_eq!(dedupe_recipients(&input), vec!["b", "a", "c"]);
    }

    #[test]
    fn terminal_status_is_sticky() {
        let job = BulkSendJob::new(6);
        job.finish(BulkSendJobStatus::Cancelled);
        job.finish(BulkSendJobStatus::Completed);
        assert_eq!(job.snapshot().status, BulkSendJobStatus::Cancelled);
    }
}

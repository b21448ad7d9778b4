//! Periodic checker: scheduled check-ins, commit reminders, and
//! continuation triggers per session.
//!
//! The checker never talks to the engine directly — it emits
//! `ScheduledCheck` events into the engine's queue and writes plain
//! check-in messages through the session port. That keeps the
//! checker/engine/assigner triangle acyclic.

use crate::engine::events::EngineEvent;
use crate::models::{ContinuationEvent, ContinuationTrigger, SessionRef};
use crate::scheduler::{ActivityLevel, AdaptiveConfig, AdaptiveInterval, Scheduler, TimerHandle};
use crate::session::SessionPort;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const CHECK_IN_MESSAGE: &str =
    "Status check: please post a one-paragraph summary of progress on the current task.\n";
const COMMIT_REMINDER_MESSAGE: &str =
    "Reminder: commit completed work in progress with a descriptive message before continuing.\n";

#[derive(Debug, Clone)]
pub struct CheckerConfig {
    pub initial_check_delay: Duration,
    pub progress_interval: Duration,
    pub commit_reminder_interval: Duration,
    pub continuation_interval: Duration,
    /// Adapt the progress cadence to observed session activity.
    pub adaptive: bool,
    pub adaptive_config: AdaptiveConfig,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            initial_check_delay: Duration::from_secs(crate::constants::INITIAL_CHECK_DELAY_SECS),
            progress_interval: Duration::from_secs(crate::constants::PROGRESS_CHECK_INTERVAL_SECS),
            commit_reminder_interval: Duration::from_secs(
                crate::constants::COMMIT_REMINDER_INTERVAL_SECS,
            ),
            continuation_interval: Duration::from_secs(10 * 60),
            adaptive: false,
            adaptive_config: AdaptiveConfig::default(),
        }
    }
}

#[derive(Default)]
struct SessionTimers {
    timers: Vec<TimerHandle>,
    adaptive_loop: Option<JoinHandle<()>>,
}

#[derive(Clone)]
pub struct PeriodicChecker {
    port: Arc<dyn SessionPort>,
    scheduler: Scheduler,
    engine_tx: mpsc::Sender<EngineEvent>,
    config: CheckerConfig,
    sessions: Arc<Mutex<HashMap<SessionRef, SessionTimers>>>,
}

impl PeriodicChecker {
    pub fn new(
        port: Arc<dyn SessionPort>,
        scheduler: Scheduler,
        engine_tx: mpsc::Sender<EngineEvent>,
        config: CheckerConfig,
    ) -> Self {
        Self {
            port,
            scheduler,
            engine_tx,
            config,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Install this session's schedules. Replaces any existing ones.
    pub async fn start_session(&self, session: &SessionRef) {
        self.stop_session(session).await;
        let mut timers = SessionTimers::default();

        // One-shot initial check-in
        {
            let port = self.port.clone();
            let session = session.clone();
            timers.timers.push(
                self.scheduler
                    .after(self.config.initial_check_delay, move || async move {
                        if let Err(e) = port.write_input(&session, CHECK_IN_MESSAGE).await {
                            warn!("[Checker] Initial check-in failed for {}: {}", session, e);
                        }
                    })
                    .await,
            );
        }

        // Recurring progress check (fixed or adaptive cadence)
        if self.config.adaptive {
            timers.adaptive_loop = Some(self.spawn_adaptive_progress(session.clone()));
        } else {
            let port = self.port.clone();
            let session_clone = session.clone();
            timers.timers.push(
                self.scheduler
                    .every(self.config.progress_interval, move || {
                        let port = port.clone();
                        let session = session_clone.clone();
                        async move {
                            if let Err(e) = port.write_input(&session, CHECK_IN_MESSAGE).await {
                                warn!("[Checker] Progress check failed for {}: {}", session, e);
                            }
                        }
                    })
                    .await,
            );
        }

        // Recurring commit reminder
        {
            let port = self.port.clone();
            let session_clone = session.clone();
            timers.timers.push(
                self.scheduler
                    .every(self.config.commit_reminder_interval, move || {
                        let port = port.clone();
                        let session = session_clone.clone();
                        async move {
                            if let Err(e) =
                                port.write_input(&session, COMMIT_REMINDER_MESSAGE).await
                            {
                                warn!("[Checker] Commit reminder failed for {}: {}", session, e);
                            }
                        }
                    })
                    .await,
            );
        }

        // Continuation trigger: an event through the engine, not a
        // message into the session
        {
            let tx = self.engine_tx.clone();
            let session_clone = session.clone();
            timers.timers.push(
                self.scheduler
                    .every(self.config.continuation_interval, move || {
                        let tx = tx.clone();
                        let session = session_clone.clone();
                        async move {
                            let event = ContinuationEvent::new(
                                session.clone(),
                                ContinuationTrigger::ScheduledCheck,
                            );
                            if tx.send(event.into()).await.is_err() {
                                warn!("[Checker] Engine queue closed for {}", session);
                            }
                        }
                    })
                    .await,
            );
        }

        info!("[Checker] Schedules installed for {}", session);
        self.sessions.lock().await.insert(session.clone(), timers);
    }

    /// Cancel this session's schedules.
    pub async fn stop_session(&self, session: &SessionRef) {
        if let Some(timers) = self.sessions.lock().await.remove(session) {
            for handle in timers.timers {
                self.scheduler.cancel(handle).await;
            }
            if let Some(adaptive) = timers.adaptive_loop {
                adaptive.abort();
            }
            debug!("[Checker] Schedules cancelled for {}", session);
        }
    }

    pub async fn stop_all(&self) {
        let sessions: Vec<SessionRef> = self.sessions.lock().await.keys().cloned().collect();
        for session in sessions {
            self.stop_session(&session).await;
        }
    }

    fn spawn_adaptive_progress(&self, session: SessionRef) -> JoinHandle<()> {
        let port = self.port.clone();
        let mut interval =
            AdaptiveInterval::new(self.config.progress_interval, self.config.adaptive_config.clone());
        tokio::spawn(async move {
            loop {
                let wait = interval.current();
                tokio::time::sleep(wait).await;

                if let Err(e) = port.write_input(&session, CHECK_IN_MESSAGE).await {
                    warn!("[Checker] Adaptive check failed for {}: {}", session, e);
                }

                // Idle assistants get longer gaps, busy ones shorter
                let activity = match port.is_assistant_idle(&session).await {
                    Ok(true) => ActivityLevel::Idle,
                    Ok(false) => ActivityLevel::HighlyActive,
                    Err(_) => ActivityLevel::Normal,
                };
                interval.next_interval(activity);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ScriptedSessionPort;

    fn short_config() -> CheckerConfig {
        CheckerConfig {
            initial_check_delay: Duration::from_secs(5),
            progress_interval: Duration::from_secs(30),
            commit_reminder_interval: Duration::from_secs(25),
            continuation_interval: Duration::from_secs(10),
            adaptive: false,
            adaptive_config: AdaptiveConfig::default(),
        }
    }

    async fn checker(
        config: CheckerConfig,
    ) -> (
        PeriodicChecker,
        Arc<ScriptedSessionPort>,
        mpsc::Receiver<EngineEvent>,
    ) {
        let port = Arc::new(ScriptedSessionPort::new());
        let (tx, rx) = mpsc::channel(16);
        let checker = PeriodicChecker::new(port.clone(), Scheduler::new(), tx, config);
        (checker, port, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_check_fires_once() {
        let (checker, port, _rx) = checker(short_config()).await;
        let session = SessionRef::new("s1");
        port.register(&session).await;
        checker.start_session(&session).await;

        tokio::time::sleep(Duration::from_secs(6)).await;
        let writes = port.written_inputs(&session).await;
        assert_eq!(
            writes
                .iter()
                .filter(|w| w.contains("Status check"))
                .count(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_reminders_recur() {
        let (checker, port, _rx) = checker(short_config()).await;
        let session = SessionRef::new("s1");
        port.register(&session).await;
        checker.start_session(&session).await;

        tokio::time::sleep(Duration::from_secs(51)).await;
        let writes = port.written_inputs(&session).await;
        let reminders = writes
            .iter()
            .filter(|w| w.contains("commit completed work"))
            .count();
        assert_eq!(reminders, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuation_trigger_emits_events_not_messages() {
        let (checker, port, mut rx) = checker(short_config()).await;
        let session = SessionRef::new("s1");
        port.register(&session).await;
        checker.start_session(&session).await;

        tokio::time::sleep(Duration::from_secs(11)).await;
        let event = rx.try_recv().expect("scheduled check event");
        assert_eq!(event.event.trigger, ContinuationTrigger::ScheduledCheck);
        assert_eq!(event.event.session, session);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_session_cancels_everything() {
        let (checker, port, mut rx) = checker(short_config()).await;
        let session = SessionRef::new("s1");
        port.register(&session).await;
        checker.start_session(&session).await;
        checker.stop_session(&session).await;

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(port.written_inputs(&session).await.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_adaptive_progress_runs() {
        let mut config = short_config();
        config.adaptive = true;
        config.adaptive_config = AdaptiveConfig {
            min: Duration::from_secs(10),
            max: Duration::from_secs(120),
            factor: 2.0,
            jitter: 0.0,
        };
        let (checker, port, _rx) = checker(config).await;
        let session = SessionRef::new("s1");
        port.register(&session).await;
        // Busy assistant: intervals shrink toward the minimum
        port.set_assistant_idle(&session, false).await;
        checker.start_session(&session).await;

        tokio::time::sleep(Duration::from_secs(100)).await;
        let checks = port
            .written_inputs(&session)
            .await
            .iter()
            .filter(|w| w.contains("Status check"))
            .count();
        // 30s, then 15s, then 10s floors: strictly more than the
        // fixed cadence would deliver
        assert!(checks >= 3, "expected >=3 adaptive checks, got {checks}");
    }
}

//! Promotion orchestrator and the long-lived worker loop
//!
//! A cycle runs several generations, keeps the best winner as the champion,
//! and compares it against the Sharpe of the currently promoted model:
//!
//! 1. drawdown worse than the floor: reject, persist nothing
//! 2. relative improvement above the delta: persist `v<epoch>`, notify, signal reload
//! 3. otherwise: persist `c<epoch>` as a non-promoted candidate
//!
//! The worker repeats cycles forever, backing off exponentially after failures.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::api::{Notifier, ReloadSignal};
use crate::evolution::{
    apply_param_set, evolve_generation, params_fingerprint, CandidateResult, EvolutionError,
    EvolutionSettings,
};
use crate::store::{ConfigStore, EvolutionJournal, ModelStore, StoreError};
use crate::synthetic::BarSource;
use crate::types::PerformanceMetrics;

/// Guards the relative improvement against a zero baseline
const IMPROVEMENT_EPSILON: f64 = 1e-9;

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("evolution failed: {0}")]
    Evolution(#[from] EvolutionError),

    #[error("no generations configured")]
    NoGenerations,
}

/// Thresholds of the promotion decision
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PromotionPolicy {
    /// Minimum relative Sharpe improvement over the baseline
    pub promote_delta: f64,
    /// Drawdown floor (negative); anything strictly below is rejected
    pub max_drawdown_limit: f64,
}

impl Default for PromotionPolicy {
    fn default() -> Self {
        Self {
            promote_delta: 0.02,
            max_drawdown_limit: -0.35,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PromotionDecision {
    Reject { max_drawdown: f64 },
    Promote { improvement: f64 },
    Hold { improvement: f64 },
}

/// (champion - baseline) / (|baseline| + eps)
pub fn relative_improvement(champion_sharpe: f64, baseline_sharpe: f64) -> f64 {
    (champion_sharpe - baseline_sharpe) / (baseline_sharpe.abs() + IMPROVEMENT_EPSILON)
}

/// Apply the policy; the drawdown gate wins over any improvement
pub fn decide(champion: &PerformanceMetrics, baseline_sharpe: f64, policy: &PromotionPolicy) -> PromotionDecision {
    let improvement = relative_improvement(champion.sharpe, baseline_sharpe);
    if champion.max_drawdown < policy.max_drawdown_limit {
        PromotionDecision::Reject {
            max_drawdown: champion.max_drawdown,
        }
    } else if improvement > policy.promote_delta {
        PromotionDecision::Promote { improvement }
    } else {
        PromotionDecision::Hold { improvement }
    }
}

/// Document stored with a model version: `{"params": {...}, <metrics>}`
pub fn model_payload(candidate: &CandidateResult) -> Value {
    let mut doc = serde_json::Map::new();
    doc.insert("params".to_string(), json!(candidate.params));
    if let Ok(Value::Object(metrics)) = serde_json::to_value(candidate.metrics) {
        doc.extend(metrics);
    }
    Value::Object(doc)
}

/// What one cycle did
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub baseline_sharpe: f64,
    pub champion: CandidateResult,
    pub decision: PromotionDecision,
    /// Label of the persisted record; `None` on rejection
    pub version: Option<String>,
}

/// Collaborators the orchestrator talks to
#[derive(Clone)]
pub struct Collaborators {
    pub config: Arc<dyn ConfigStore>,
    pub models: Arc<dyn ModelStore>,
    pub journal: Arc<dyn EvolutionJournal>,
    pub notifier: Arc<dyn Notifier>,
    pub reload: Arc<dyn ReloadSignal>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrchestratorSettings {
    pub evolution: EvolutionSettings,
    pub generations: u32,
    pub policy: PromotionPolicy,
    pub adopt_promoted: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            evolution: EvolutionSettings::default(),
            generations: 2,
            policy: PromotionPolicy::default(),
            adopt_promoted: false,
        }
    }
}

type EpochClock = Arc<dyn Fn() -> i64 + Send + Sync>;

pub struct PromotionOrchestrator {
    collaborators: Collaborators,
    source: Arc<dyn BarSource>,
    settings: OrchestratorSettings,
    clock: EpochClock,
}

impl PromotionOrchestrator {
    pub fn new(collaborators: Collaborators, source: Arc<dyn BarSource>, settings: OrchestratorSettings) -> Self {
        Self {
            collaborators,
            source,
            settings,
            clock: Arc::new(|| Utc::now().timestamp()),
        }
    }

    /// Replace the Unix-seconds clock used for version labels
    pub fn with_clock(mut self, clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.collaborators.notifier
    }

    /// One evolve-and-promote cycle. Seeds are offset by `cycle`.
    pub async fn run_cycle(&self, cycle: u64) -> Result<CycleReport, CycleError> {
        let c = &self.collaborators;

        let params = c.config.get().await?;
        let baseline_sharpe = c.models.get_best().await?.map(|m| m.sharpe()).unwrap_or(0.0);
        info!(cycle, baseline_sharpe, "Starting evolution cycle");

        let evolution = EvolutionSettings {
            base_seed: self.settings.evolution.base_seed.wrapping_add(cycle),
            ..self.settings.evolution
        };

        let mut champion: Option<CandidateResult> = None;
        for generation in 0..self.settings.generations {
            let result = evolve_generation(&params, generation, &evolution, self.source.as_ref())?;
            let winner = result.winner;
            info!(
                generation,
                sharpe = winner.metrics.sharpe,
                max_drawdown = winner.metrics.max_drawdown,
                params = ?winner.params,
                "Generation candidate"
            );
            self.journal(
                &format!("generation {generation} winner"),
                &model_payload(&winner),
                Some(&params_fingerprint(&winner.params)),
            )
            .await;

            if champion
                .as_ref()
                .map_or(true, |best| winner.metrics.sharpe > best.metrics.sharpe)
            {
                champion = Some(winner);
            }
        }
        let champion = champion.ok_or(CycleError::NoGenerations)?;

        let decision = decide(&champion.metrics, baseline_sharpe, &self.settings.policy);
        let payload = model_payload(&champion);
        let epoch = (self.clock)();

        let version = match decision {
            PromotionDecision::Reject { max_drawdown } => {
                warn!(
                    max_drawdown,
                    limit = self.settings.policy.max_drawdown_limit,
                    "Rejected: drawdown below limit"
                );
                None
            }
            PromotionDecision::Promote { improvement } => {
                let version = format!("v{epoch}");
                let record = c.models.append(&version, &payload, true).await?;
                info!(version = %version, improvement_pct = improvement * 100.0, "Promoted champion");

                c.notifier.send(&format!("Promoted {version}"), &record.metrics).await;
                if let Err(e) = c.reload.reload(&version).await {
                    warn!(version = %version, error = %e, "Failed to notify serving layer");
                }
                if self.settings.adopt_promoted {
                    let adopted = apply_param_set(&params, &champion.params);
                    if let Err(e) = c.config.put(&adopted).await {
                        warn!(error = %e, "Failed to adopt promoted parameters");
                    }
                }
                Some(version)
            }
            PromotionDecision::Hold { improvement } => {
                let version = format!("c{epoch}");
                c.models.append(&version, &payload, false).await?;
                info!(
                    version = %version,
                    improvement_pct = improvement * 100.0,
                    delta_pct = self.settings.policy.promote_delta * 100.0,
                    "Not promoted"
                );
                Some(version)
            }
        };

        self.journal(
            &format!("cycle {cycle} decision"),
            &json!({ "decision": decision, "version": version, "baseline_sharpe": baseline_sharpe }),
            Some(&params_fingerprint(&champion.params)),
        )
        .await;

        Ok(CycleReport {
            cycle,
            baseline_sharpe,
            champion,
            decision,
            version,
        })
    }

    async fn journal(&self, message: &str, data: &Value, params_hash: Option<&str>) {
        if let Err(e) = self.collaborators.journal.record(message, data, params_hash).await {
            warn!(message, error = %e, "Failed to write evolution journal");
        }
    }
}

/// Sleep cadence of the worker
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Pause after a successful cycle
    pub interval: Duration,
    pub floor: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            floor: Duration::from_secs(5),
            cap: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    Backoff(Duration),
}

impl WorkerState {
    pub fn on_success(self) -> Self {
        WorkerState::Running
    }

    /// Double the delay (starting from the floor), capped
    pub fn on_failure(self, policy: &BackoffPolicy) -> Self {
        let current = match self {
            WorkerState::Running => policy.floor,
            WorkerState::Backoff(delay) => delay,
        };
        WorkerState::Backoff(current.saturating_mul(2).min(policy.cap))
    }

    pub fn pause(&self, policy: &BackoffPolicy) -> Duration {
        match self {
            WorkerState::Running => policy.interval,
            WorkerState::Backoff(delay) => *delay,
        }
    }
}

/// Run cycles until `max_cycles` is reached (forever when `None`).
/// Returns the final state.
pub async fn run_worker(
    orchestrator: &PromotionOrchestrator,
    policy: BackoffPolicy,
    max_cycles: Option<u64>,
) -> WorkerState {
    let mut state = WorkerState::Running;
    let mut cycle = 0u64;

    info!(?max_cycles, interval_secs = policy.interval.as_secs(), "Worker started");

    loop {
        match orchestrator.run_cycle(cycle).await {
            Ok(report) => {
                state = state.on_success();
                debug!(cycle, version = ?report.version, "Cycle complete");
            }
            Err(e) => {
                error!(cycle, error = %e, "Worker error");
                orchestrator
                    .notifier()
                    .send("Worker error", &json!({ "error": e.to_string(), "cycle": cycle }))
                    .await;
                state = state.on_failure(&policy);
            }
        }

        cycle += 1;
        if max_cycles.is_some_and(|max| cycle >= max) {
            break;
        }

        let pause = state.pause(&policy);
        debug!(?state, pause_ms = pause.as_millis() as u64, "Worker sleeping");
        tokio::time::sleep(pause).await;
    }

    info!(cycles = cycle, ?state, "Worker stopped");
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ReloadError;
    use crate::store::InMemoryStores;
    use crate::synthetic::StaticSource;
    use crate::types::{Bar, StrategyParameters};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        messages: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, message: &str, payload: &Value) {
            self.messages.lock().unwrap().push((message.to_string(), payload.clone()));
        }
    }

    #[derive(Default)]
    struct RecordingReload {
        versions: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl ReloadSignal for RecordingReload {
        async fn reload(&self, version: &str) -> Result<(), ReloadError> {
            self.versions.lock().unwrap().push(version.to_string());
            if self.fail {
                return Err(ReloadError::InvalidEndpoint {
                    endpoint: "test".into(),
                    reason: "down".into(),
                });
            }
            Ok(())
        }
    }

    struct Harness {
        stores: Arc<InMemoryStores>,
        notifier: Arc<RecordingNotifier>,
        reload: Arc<RecordingReload>,
        orchestrator: PromotionOrchestrator,
    }

    fn rising_bars(n: usize) -> Vec<Bar> {
        (0..n)
            .map(|i| {
                let close = 100.0 + i as f64;
                Bar::new(close - 0.5, close + 0.5, close - 0.5, close, 1000.0 + 10.0 * i as f64)
            })
            .collect()
    }

    fn harness(policy: PromotionPolicy, reload_fails: bool) -> Harness {
        harness_with(InMemoryStores::new(), policy, reload_fails, false)
    }

    fn harness_with(
        stores: InMemoryStores,
        policy: PromotionPolicy,
        reload_fails: bool,
        adopt_promoted: bool,
    ) -> Harness {
        let stores = Arc::new(stores);
        let notifier = Arc::new(RecordingNotifier::default());
        let reload = Arc::new(RecordingReload {
            fail: reload_fails,
            ..Default::default()
        });
        let collaborators = Collaborators {
            config: stores.clone(),
            models: stores.clone(),
            journal: stores.clone(),
            notifier: notifier.clone(),
            reload: reload.clone(),
        };
        let settings = OrchestratorSettings {
            evolution: EvolutionSettings {
                population: 3,
                ..Default::default()
            },
            generations: 2,
            policy,
            adopt_promoted,
        };
        let ticks = AtomicI64::new(1_700_000_000);
        let orchestrator = PromotionOrchestrator::new(collaborators, Arc::new(StaticSource(rising_bars(80))), settings)
            .with_clock(move || ticks.fetch_add(1, Ordering::Relaxed));

        Harness {
            stores,
            notifier,
            reload,
            orchestrator,
        }
    }

    fn metrics(sharpe: f64, max_drawdown: f64) -> PerformanceMetrics {
        PerformanceMetrics {
            sharpe,
            max_drawdown,
            ..Default::default()
        }
    }

    #[test]
    fn test_drawdown_gate_beats_improvement() {
        let policy = PromotionPolicy::default();
        let decision = decide(&metrics(10.0, -0.9), 0.0, &policy);
        assert_eq!(decision, PromotionDecision::Reject { max_drawdown: -0.9 });

        // Exactly at the floor is not below it
        assert!(matches!(decide(&metrics(10.0, -0.35), 0.0, &policy), PromotionDecision::Promote { .. }));
    }

    #[test]
    fn test_zero_baseline_promotes_any_gain() {
        let decision = decide(&metrics(1.0, -0.1), 0.0, &PromotionPolicy::default());
        match decision {
            PromotionDecision::Promote { improvement } => assert!(improvement > 1e8),
            other => panic!("expected promotion, got {other:?}"),
        }
    }

    #[test]
    fn test_small_gain_is_held() {
        let decision = decide(&metrics(1.01, -0.1), 1.0, &PromotionPolicy::default());
        assert!(matches!(decision, PromotionDecision::Hold { .. }));
        assert!((relative_improvement(1.01, 1.0) - 0.01).abs() < 1e-6);
    }

    #[test]
    fn test_payload_merges_params_and_metrics() {
        let candidate = CandidateResult {
            params: [("risk_per_trade".to_string(), 0.02)].into(),
            metrics: PerformanceMetrics {
                sharpe: 1.5,
                sample_len: 99,
                ..Default::default()
            },
        };
        let payload = model_payload(&candidate);
        assert_eq!(payload["params"]["risk_per_trade"], 0.02);
        assert_eq!(payload["sharpe"], 1.5);
        assert_eq!(payload["len"], 99);
    }

    #[test]
    fn test_backoff_state_machine() {
        let policy = BackoffPolicy::default();
        let mut state = WorkerState::Running;
        assert_eq!(state.pause(&policy), Duration::from_secs(60));

        let mut delays = Vec::new();
        for _ in 0..7 {
            state = state.on_failure(&policy);
            delays.push(state.pause(&policy).as_secs());
        }
        assert_eq!(delays, vec![10, 20, 40, 80, 160, 300, 300]);

        state = state.on_success();
        assert_eq!(state, WorkerState::Running);
        assert_eq!(state.on_failure(&policy), WorkerState::Backoff(Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn test_first_cycle_promotes_on_rising_series() {
        let h = harness(PromotionPolicy::default(), false);
        let report = h.orchestrator.run_cycle(0).await.unwrap();

        assert!(report.champion.metrics.sharpe > 0.0);
        assert!(matches!(report.decision, PromotionDecision::Promote { .. }));
        let version = report.version.unwrap();
        assert!(version.starts_with('v'));

        let versions = h.stores.versions();
        assert_eq!(versions.len(), 1);
        assert!(versions[0].promoted);
        assert!(versions[0].metrics.get("params").is_some());

        let messages = h.notifier.messages.lock().unwrap().clone();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, format!("Promoted {version}"));
        assert_eq!(*h.reload.versions.lock().unwrap(), vec![version]);

        // Adoption is opt-in: the stored configuration is left alone
        assert_eq!(h.stores.current_config(), Some(StrategyParameters::default()));

        // One entry per generation plus the decision
        assert_eq!(h.stores.journal().len(), 3);
        assert!(h.stores.journal().iter().all(|e| e.params_hash.is_some()));
    }

    #[tokio::test]
    async fn test_rejection_persists_nothing() {
        // The rising series never draws down, so a positive floor rejects every champion
        let policy = PromotionPolicy {
            max_drawdown_limit: 0.1,
            ..Default::default()
        };
        let h = harness(policy, false);
        let report = h.orchestrator.run_cycle(0).await.unwrap();

        assert_eq!(report.champion.metrics.max_drawdown, 0.0);
        assert!(matches!(report.decision, PromotionDecision::Reject { .. }));
        assert!(report.version.is_none());
        assert!(h.stores.versions().is_empty());
        assert!(h.notifier.messages.lock().unwrap().is_empty());
        assert!(h.reload.versions.lock().unwrap().is_empty());
        assert_eq!(h.stores.current_config(), Some(StrategyParameters::default()));

        // Only the evolution journal hears about it
        let journal = h.stores.journal();
        assert_eq!(journal.len(), 3);
        let decision = journal.last().unwrap();
        assert_eq!(decision.message, "cycle 0 decision");
        assert_eq!(decision.data["decision"]["decision"], "reject");
        assert!(decision.data["version"].is_null());
    }

    #[tokio::test]
    async fn test_promotion_adopts_champion_when_enabled() {
        let start = StrategyParameters {
            confidence_threshold: 0.55,
            ..Default::default()
        };
        let h = harness_with(
            InMemoryStores::with_config(start.clone()),
            PromotionPolicy::default(),
            false,
            true,
        );
        assert!(h.orchestrator.settings().adopt_promoted);

        let report = h.orchestrator.run_cycle(0).await.unwrap();
        assert!(matches!(report.decision, PromotionDecision::Promote { .. }));

        let adopted = h.stores.current_config().unwrap();
        assert_eq!(adopted.risk_per_trade, report.champion.params["risk_per_trade"]);
        assert_eq!(adopted.atr_stop_mult, report.champion.params["atr_stop_mult"]);
        assert_eq!(adopted.confidence_threshold, start.confidence_threshold);
    }

    #[tokio::test]
    async fn test_strong_baseline_records_candidate() {
        let h = harness(PromotionPolicy::default(), false);
        h.stores
            .append("v1", &json!({"sharpe": 1e12}), true)
            .await
            .unwrap();

        let report = h.orchestrator.run_cycle(0).await.unwrap();
        assert!(matches!(report.decision, PromotionDecision::Hold { .. }));

        let versions = h.stores.versions();
        assert_eq!(versions.len(), 2);
        assert!(versions[1].version.starts_with('c'));
        assert!(!versions[1].promoted);
        assert!(h.notifier.messages.lock().unwrap().is_empty());
        assert_eq!(h.stores.current_config(), Some(StrategyParameters::default()));
    }

    #[tokio::test]
    async fn test_reload_failure_does_not_fail_cycle() {
        let h = harness(PromotionPolicy::default(), true);
        let report = h.orchestrator.run_cycle(0).await.unwrap();

        assert!(matches!(report.decision, PromotionDecision::Promote { .. }));
        assert_eq!(h.stores.versions().len(), 1);
        assert_eq!(h.reload.versions.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cycles_are_deterministic() {
        let a = harness(PromotionPolicy::default(), false);
        let b = harness(PromotionPolicy::default(), false);
        let ra = a.orchestrator.run_cycle(3).await.unwrap();
        let rb = b.orchestrator.run_cycle(3).await.unwrap();
        assert_eq!(ra.champion, rb.champion);
        assert_eq!(ra.decision, rb.decision);
    }

    #[tokio::test]
    async fn test_worker_backs_off_and_notifies() {
        let h = harness(PromotionPolicy::default(), false);
        h.stores.set_unavailable(true);
        let policy = BackoffPolicy {
            interval: Duration::ZERO,
            floor: Duration::from_millis(1),
            cap: Duration::from_millis(3),
        };

        let state = run_worker(&h.orchestrator, policy, Some(3)).await;
        assert_eq!(state, WorkerState::Backoff(Duration::from_millis(3)));

        let messages = h.notifier.messages.lock().unwrap().clone();
        assert_eq!(messages.len(), 3);
        assert!(messages.iter().all(|(m, p)| m == "Worker error" && p["error"].is_string()));
    }

    #[tokio::test]
    async fn test_worker_recovers_after_success() {
        let h = harness(PromotionPolicy::default(), false);
        let policy = BackoffPolicy {
            interval: Duration::ZERO,
            floor: Duration::from_millis(1),
            cap: Duration::from_millis(4),
        };

        let state = run_worker(&h.orchestrator, policy, Some(2)).await;
        assert_eq!(state, WorkerState::Running);
        // Every successful cycle appends either a promotion or a candidate
        assert_eq!(h.stores.versions().len(), 2);
    }
}

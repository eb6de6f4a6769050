//! Rebuild scheduling.
//!
//! The per-horizon schedule (`HorizonSchedule`) is a plain value with
//! injected timestamps, so the Idle -> Building -> Validating -> Deploying
//! cycle and the failure/cooldown policy are unit-testable without timers.
//! The async driver (`RebuildScheduler::run`) selects over an interval
//! tick, a manual-command channel, and a shutdown watch, spawning one
//! pipeline task per due horizon; horizons rebuild in parallel, serialized
//! only by the builder's and deployer's own per-key locks.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{info, instrument, warn};
use ulid::Ulid;

use crate::config::SchedulerConfig;
use crate::index::IndexFile;
use crate::lifecycle::builder::IndexBuilder;
use crate::lifecycle::deployer::{AtomicDeployer, DeployOutcome};
use crate::lifecycle::layout::INDEX_FILE;
use crate::lifecycle::validator::IndexValidator;
use crate::types::{Horizon, StagedGeneration, Strategy};

/// Where a horizon's pipeline currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idle,
    Building,
    Validating,
    Deploying,
    CoolingDown,
}

/// Pure per-horizon schedule state.
#[derive(Debug, Clone, Serialize)]
pub struct HorizonSchedule {
    pub stage: Stage,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub next_due: DateTime<Utc>,
    pub cooling_until: Option<DateTime<Utc>>,
}

impl HorizonSchedule {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            stage: Stage::Idle,
            consecutive_failures: 0,
            last_success: None,
            next_due: now,
            cooling_until: None,
        }
    }

    /// Whether a scheduled rebuild should start now. Expires cooldown as a
    /// side effect.
    pub fn due(&mut self, now: DateTime<Utc>) -> bool {
        if self.stage == Stage::CoolingDown {
            match self.cooling_until {
                Some(until) if now >= until => {
                    self.stage = Stage::Idle;
                    self.cooling_until = None;
                }
                _ => return false,
            }
        }
        self.stage == Stage::Idle && now >= self.next_due
    }

    /// Whether a manual trigger may start now. Manual requests bypass the
    /// cooldown (an operator asked explicitly) but not an in-flight run.
    pub fn manual_allowed(&mut self) -> bool {
        if self.stage == Stage::CoolingDown {
            self.stage = Stage::Idle;
            self.cooling_until = None;
        }
        self.stage == Stage::Idle
    }

    pub fn record_success(&mut self, now: DateTime<Utc>, interval: std::time::Duration) {
        self.stage = Stage::Idle;
        self.consecutive_failures = 0;
        self.last_success = Some(now);
        self.next_due = now + ChronoDuration::from_std(interval).unwrap_or(ChronoDuration::zero());
    }

    /// Record a pipeline failure. Returns the cooldown deadline if this
    /// failure tripped the threshold.
    pub fn record_failure(
        &mut self,
        now: DateTime<Utc>,
        max_consecutive: u32,
        cooldown: std::time::Duration,
    ) -> Option<DateTime<Utc>> {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= max_consecutive {
            let until =
                now + ChronoDuration::from_std(cooldown).unwrap_or(ChronoDuration::zero());
            self.stage = Stage::CoolingDown;
            self.cooling_until = Some(until);
            Some(until)
        } else {
            self.stage = Stage::Idle;
            self.next_due = now;
            None
        }
    }
}

/// Manual requests accepted by the driver loop.
#[derive(Debug, Clone)]
pub enum RebuildCommand {
    RebuildNow { horizon: Option<Horizon> },
}

/// Structured transition events, mirrored to tracing and metrics.
#[derive(Debug, Clone)]
pub enum RebuildEvent {
    Started { horizon: Horizon },
    Built { horizon: Horizon, generations: usize },
    Validated { horizon: Horizon },
    Deployed { horizon: Horizon, strategy: Strategy, generation_id: Ulid },
    RolledBack { horizon: Horizon, strategy: Strategy, reason: String },
    Failed { horizon: Horizon, stage: &'static str, error: String },
    CooldownEntered { horizon: Horizon, until: DateTime<Utc> },
}

pub struct RebuildScheduler {
    cfg: SchedulerConfig,
    horizons: Vec<Horizon>,
    builder: Arc<IndexBuilder>,
    validator: Arc<IndexValidator>,
    deployer: Arc<AtomicDeployer>,
    schedules: Arc<DashMap<Horizon, HorizonSchedule>>,
    events: broadcast::Sender<RebuildEvent>,
}

impl RebuildScheduler {
    pub fn new(
        cfg: SchedulerConfig,
        horizons: Vec<Horizon>,
        builder: Arc<IndexBuilder>,
        validator: Arc<IndexValidator>,
        deployer: Arc<AtomicDeployer>,
    ) -> Self {
        let now = Utc::now();
        let schedules = Arc::new(DashMap::new());
        for &h in &horizons {
            // Bootstrap already republished whatever is live; the first
            // scheduled rebuild waits a full interval.
            let mut schedule = HorizonSchedule::new(now);
            schedule.next_due =
                now + ChronoDuration::from_std(cfg.interval()).unwrap_or(ChronoDuration::zero());
            schedules.insert(h, schedule);
        }
        let (events, _) = broadcast::channel(256);
        Self {
            cfg,
            horizons,
            builder,
            validator,
            deployer,
            schedules,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RebuildEvent> {
        self.events.subscribe()
    }

    /// Per-horizon schedule snapshot for the health summary.
    pub fn schedules(&self) -> Vec<(Horizon, HorizonSchedule)> {
        self.schedules
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    /// Drive the scheduler until shutdown flips.
    pub async fn run(
        self: Arc<Self>,
        mut commands: mpsc::Receiver<RebuildCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        // Tick fast enough to notice cooldown expiry even with long rebuild
        // intervals.
        let tick_period = std::time::Duration::from_secs(self.cfg.interval_secs.clamp(1, 60));
        let mut tick = tokio::time::interval(tick_period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(horizons = self.horizons.len(), "rebuild scheduler running");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("rebuild scheduler shutting down");
                        return;
                    }
                }
                cmd = commands.recv() => {
                    match cmd {
                        Some(RebuildCommand::RebuildNow { horizon }) => {
                            self.handle_manual(horizon);
                        }
                        None => return,
                    }
                }
                _ = tick.tick() => {
                    let now = Utc::now();
                    for &h in &self.horizons {
                        let start = self
                            .schedules
                            .get_mut(&h)
                            .map(|mut s| {
                                let due = s.due(now);
                                if due {
                                    s.stage = Stage::Building;
                                }
                                due
                            })
                            .unwrap_or(false);
                        if start {
                            self.spawn_pipeline(h);
                        }
                    }
                }
            }
        }
    }

    fn handle_manual(&self, horizon: Option<Horizon>) {
        let targets: Vec<Horizon> = match horizon {
            Some(h) => vec![h],
            None => self.horizons.clone(),
        };
        for h in targets {
            let Some(mut entry) = self.schedules.get_mut(&h) else {
                self.emit(RebuildEvent::Failed {
                    horizon: h,
                    stage: "trigger",
                    error: "horizon not managed by this scheduler".into(),
                });
                continue;
            };
            if entry.manual_allowed() {
                entry.stage = Stage::Building;
                drop(entry);
                self.spawn_pipeline(h);
            } else {
                self.emit(RebuildEvent::Failed {
                    horizon: h,
                    stage: "trigger",
                    error: "rebuild already in progress".into(),
                });
            }
        }
    }

    fn spawn_pipeline(&self, horizon: Horizon) {
        let builder = self.builder.clone();
        let validator = self.validator.clone();
        let deployer = self.deployer.clone();
        let schedules = self.schedules.clone();
        let events = self.events.clone();
        let cfg = self.cfg.clone();
        tokio::spawn(async move {
            let succeeded = run_pipeline(
                horizon,
                &builder,
                &validator,
                &deployer,
                &schedules,
                &events,
            )
            .await;

            let now = Utc::now();
            let status = if succeeded { "success" } else { "failure" };
            crate::metrics::REBUILDS_TOTAL
                .with_label_values(&[&horizon.to_string(), status])
                .inc();

            if let Some(mut s) = schedules.get_mut(&horizon) {
                if succeeded {
                    s.record_success(now, cfg.interval());
                } else if let Some(until) =
                    s.record_failure(now, cfg.max_consecutive_failures, cfg.cooldown())
                {
                    warn!(%horizon, %until, "entering rebuild cooldown");
                    let _ = events.send(RebuildEvent::CooldownEntered { horizon, until });
                }
            }
        });
    }

    /// Run one horizon's pipeline inline, updating the schedule exactly as
    /// the background loop would. Returns whether every strategy deployed.
    pub async fn rebuild_now(&self, horizon: Horizon) -> bool {
        let allowed = self
            .schedules
            .get_mut(&horizon)
            .map(|mut s| {
                let ok = s.manual_allowed();
                if ok {
                    s.stage = Stage::Building;
                }
                ok
            })
            .unwrap_or(false);
        if !allowed {
            self.emit(RebuildEvent::Failed {
                horizon,
                stage: "trigger",
                error: "rebuild already in progress or horizon unmanaged".into(),
            });
            return false;
        }

        let succeeded = run_pipeline(
            horizon,
            &self.builder,
            &self.validator,
            &self.deployer,
            &self.schedules,
            &self.events,
        )
        .await;

        let now = Utc::now();
        crate::metrics::REBUILDS_TOTAL
            .with_label_values(&[&horizon.to_string(), if succeeded { "success" } else { "failure" }])
            .inc();
        if let Some(mut s) = self.schedules.get_mut(&horizon) {
            if succeeded {
                s.record_success(now, self.cfg.interval());
            } else if let Some(until) =
                s.record_failure(now, self.cfg.max_consecutive_failures, self.cfg.cooldown())
            {
                warn!(%horizon, %until, "entering rebuild cooldown");
                let _ = self.events.send(RebuildEvent::CooldownEntered { horizon, until });
            }
        }
        succeeded
    }

    fn emit(&self, event: RebuildEvent) {
        let _ = self.events.send(event);
    }
}

/// One full build -> validate -> deploy run for a horizon. Returns whether
/// every requested strategy ended up deployed.
#[instrument(skip_all, fields(horizon = %horizon))]
async fn run_pipeline(
    horizon: Horizon,
    builder: &Arc<IndexBuilder>,
    validator: &Arc<IndexValidator>,
    deployer: &Arc<AtomicDeployer>,
    schedules: &Arc<DashMap<Horizon, HorizonSchedule>>,
    events: &broadcast::Sender<RebuildEvent>,
) -> bool {
    let set_stage = |stage: Stage| {
        if let Some(mut s) = schedules.get_mut(&horizon) {
            s.stage = stage;
        }
    };
    let _ = events.send(RebuildEvent::Started { horizon });

    // Build.
    set_stage(Stage::Building);
    let strategies = builder.default_strategies().to_vec();
    let staged = match builder.build(horizon, &strategies).await {
        Ok(staged) => staged,
        Err(e) => {
            warn!(error = %e, "build failed");
            let _ = events.send(RebuildEvent::Failed {
                horizon,
                stage: "build",
                error: e.to_string(),
            });
            return false;
        }
    };
    let _ = events.send(RebuildEvent::Built {
        horizon,
        generations: staged.len(),
    });

    // Validate and deploy on the blocking pool; both are filesystem and
    // CPU work.
    set_stage(Stage::Validating);
    let validator = validator.clone();
    let deployer = deployer.clone();
    let events_inner = events.clone();
    let schedules_inner = schedules.clone();
    let result = tokio::task::spawn_blocking(move || {
        validate_and_deploy(
            horizon,
            staged,
            &validator,
            &deployer,
            &schedules_inner,
            &events_inner,
        )
    })
    .await;

    match result {
        Ok(succeeded) => succeeded,
        Err(e) => {
            let _ = events.send(RebuildEvent::Failed {
                horizon,
                stage: "pipeline",
                error: format!("pipeline task panicked: {e}"),
            });
            false
        }
    }
}

fn validate_and_deploy(
    horizon: Horizon,
    staged: Vec<StagedGeneration>,
    validator: &IndexValidator,
    deployer: &AtomicDeployer,
    schedules: &DashMap<Horizon, HorizonSchedule>,
    events: &broadcast::Sender<RebuildEvent>,
) -> bool {
    let sweep = |staged: &[StagedGeneration]| {
        for s in staged {
            if s.dir.exists() {
                let _ = std::fs::remove_dir_all(&s.dir);
            }
        }
    };
    let fail = |stage: &'static str, error: String| {
        warn!(%horizon, stage, error, "rebuild pipeline failed");
        let _ = events.send(RebuildEvent::Failed {
            horizon,
            stage,
            error,
        });
    };

    // Exact first: it is both a deliverable and the recall baseline.
    let mut ordered: Vec<&StagedGeneration> = staged.iter().collect();
    ordered.sort_by_key(|s| match s.generation.strategy {
        Strategy::Exact => 0,
        Strategy::Approximate => 1,
    });

    let baseline = ordered
        .iter()
        .find(|s| s.generation.strategy == Strategy::Exact)
        .and_then(|s| IndexFile::read(&s.dir.join(INDEX_FILE)).ok())
        .map(|f| f.payload.into_index());

    // Validate everything before deploying anything: a horizon run is
    // all-or-nothing across its strategies.
    let mut reports = Vec::with_capacity(ordered.len());
    for s in &ordered {
        let baseline_ref = match s.generation.strategy {
            Strategy::Exact => None,
            Strategy::Approximate => baseline.as_deref(),
        };
        match validator.validate(s, baseline_ref) {
            Ok(report) if report.passed => reports.push(report),
            Ok(report) => {
                let reasons: Vec<String> = report
                    .failed_checks()
                    .map(|c| format!("{}: {}", c.name, c.detail))
                    .collect();
                fail("validation", reasons.join("; "));
                sweep(&staged);
                return false;
            }
            Err(e) => {
                fail("validation", e.to_string());
                sweep(&staged);
                return false;
            }
        }
    }
    let _ = events.send(RebuildEvent::Validated { horizon });

    if let Some(mut s) = schedules.get_mut(&horizon) {
        s.stage = Stage::Deploying;
    }
    let mut all_deployed = true;
    for (s, report) in ordered.iter().zip(reports.iter()) {
        match deployer.deploy(s, report) {
            Ok(DeployOutcome::Deployed(generation)) => {
                let _ = events.send(RebuildEvent::Deployed {
                    horizon,
                    strategy: generation.strategy,
                    generation_id: generation.id,
                });
            }
            Ok(DeployOutcome::RolledBack { attempted, reason }) => {
                let _ = events.send(RebuildEvent::RolledBack {
                    horizon,
                    strategy: attempted.strategy,
                    reason,
                });
                all_deployed = false;
            }
            Err(e) => {
                fail("deploy", e.to_string());
                all_deployed = false;
            }
        }
    }
    sweep(&staged);
    all_deployed
}

//! Reconciliation controller
//!
//! One cycle reports every local status record, acts on the control plane's
//! answer and keeps reporting until the control plane has nothing more to say.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use ping_protocol::{DeployGoal, DeployType, OpCode, PingRequest, PingResponse, ProtocolError, Stage, Status};
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::client::ControlPlane;
use crate::deploy::cleanup;
use crate::deploy::executor::StageMachine;
use crate::deploy::hooks::write_script_config;
use crate::deploy::stager::Stager;
use crate::deploy::StageContext;
use crate::errors::AgentError;
use crate::process::cancel::{cancel_pair, CancelToken};
use crate::storage::settings::Settings;
use crate::storage::status::{validate_env_name, DeployStatusRecord};
use crate::telemetry::{HostIdentity, MetricsSink};
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Controller tuning
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub agent_version: String,
    pub heartbeat_interval: Duration,
    /// Sleep after a `WAIT` that names no duration
    pub wait_backoff: Duration,
    /// Responses handled back to back in one cycle
    pub max_steps: u32,
    pub num_builds_to_retain: usize,
}

impl ControllerOptions {
    pub fn new(settings: &Settings, agent_version: &str) -> Self {
        Self {
            agent_version: agent_version.to_string(),
            heartbeat_interval: Duration::from_secs(settings.reconcile.heartbeat_interval_secs),
            wait_backoff: Duration::from_secs(settings.reconcile.wait_backoff_secs),
            max_steps: settings.reconcile.max_steps_per_cycle.max(1),
            num_builds_to_retain: settings.stages.num_builds_to_retain,
        }
    }
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self::new(&Settings::default(), env!("CARGO_PKG_VERSION"))
    }
}

/// Controller state across cycles
#[derive(Debug, Clone)]
pub struct CycleState {
    pub last_attempted_at: DateTime<Utc>,
    pub last_completed_at: DateTime<Utc>,
    pub cooldown_ends_at: DateTime<Utc>,
    pub err_streak: u32,
}

impl Default for CycleState {
    fn default() -> Self {
        Self {
            last_attempted_at: DateTime::<Utc>::MIN_UTC,
            last_completed_at: DateTime::<Utc>::MIN_UTC,
            cooldown_ends_at: DateTime::<Utc>::MIN_UTC,
            err_streak: 0,
        }
    }
}

impl CycleState {
    pub fn is_in_cooldown(&self) -> bool {
        Utc::now() < self.cooldown_ends_at
    }
}

/// Why a cycle stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleEnd {
    /// `NOOP`
    Idle,
    /// `WAIT`
    Wait,
    /// A stage failed or the deploy is out of retries
    Failed,
    /// The last response changed nothing locally
    Stalled,
    /// The control plane could not be reached
    Unreachable,
    /// The response could not be acted on
    Rejected,
    /// Skipped, the control plane is in cooldown
    CoolingDown,
    /// Storage or I/O failure while handling a response
    Faulted,
    StepLimit,
}

impl CycleEnd {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleEnd::Idle => "idle",
            CycleEnd::Wait => "wait",
            CycleEnd::Failed => "failed",
            CycleEnd::Stalled => "stalled",
            CycleEnd::Unreachable => "unreachable",
            CycleEnd::Rejected => "rejected",
            CycleEnd::CoolingDown => "cooling_down",
            CycleEnd::Faulted => "faulted",
            CycleEnd::StepLimit => "step_limit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleOutcome {
    pub end: CycleEnd,
    /// Responses dispatched
    pub steps: u32,
    /// Requested delay before the next cycle
    pub wait: Option<Duration>,
}

impl CycleOutcome {
    fn new(end: CycleEnd, steps: u32) -> Self {
        Self { end, steps, wait: None }
    }
}

/// Result of dispatching one response
#[derive(Debug)]
enum Step {
    Idle,
    Wait(Duration),
    Advanced,
    Stalled,
    Failed,
    /// A heartbeat brought a response that replaces the running goal
    Preempted(PingResponse),
}

type Fingerprint = Option<(String, Stage, Status, u32)>;

fn fingerprint(record: Option<&DeployStatusRecord>) -> Fingerprint {
    record.map(|r| (r.deploy_id.clone(), r.current_stage, r.status, r.retry_count))
}

pub struct Controller {
    control_plane: Arc<dyn ControlPlane>,
    machine: Arc<StageMachine>,
    identity: HostIdentity,
    metrics: Arc<dyn MetricsSink>,
    options: ControllerOptions,
    state: RwLock<CycleState>,
    cooldown_options: CooldownOptions,
}

impl Controller {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        machine: Arc<StageMachine>,
        identity: HostIdentity,
        metrics: Arc<dyn MetricsSink>,
        options: ControllerOptions,
    ) -> Self {
        Self {
            control_plane,
            machine,
            identity,
            metrics,
            options,
            state: RwLock::new(CycleState::default()),
            cooldown_options: CooldownOptions::default(),
        }
    }

    pub fn with_cooldown(mut self, cooldown_options: CooldownOptions) -> Self {
        self.cooldown_options = cooldown_options;
        self
    }

    pub async fn state(&self) -> CycleState {
        self.state.read().await.clone()
    }

    pub fn machine(&self) -> &StageMachine {
        &self.machine
    }

    /// Run one reconciliation cycle. Only internal invariant failures are
    /// returned as errors; everything else ends the cycle and is reported.
    pub async fn run_cycle(&self) -> Result<CycleOutcome, AgentError> {
        {
            let state = self.state.read().await;
            if state.is_in_cooldown() {
                debug!("Control plane in cooldown until {}, skipping cycle", state.cooldown_ends_at);
                return Ok(CycleOutcome::new(CycleEnd::CoolingDown, 0));
            }
        }
        self.state.write().await.last_attempted_at = Utc::now();
        let started = Instant::now();

        let mut response = match self.ping().await {
            Ok(response) => response,
            Err(e) => {
                self.enter_cooldown(&e).await;
                return Ok(CycleOutcome::new(CycleEnd::Unreachable, 0));
            }
        };

        let mut steps = 0;
        let mut wait = None;
        let end = loop {
            if let Err(e) = check_response(&response) {
                warn!("Ignoring {} response: {}", response.op_code, e);
                break CycleEnd::Rejected;
            }
            if steps >= self.options.max_steps {
                warn!("Handled {} responses this cycle, deferring the rest", steps);
                break CycleEnd::StepLimit;
            }
            steps += 1;

            let step = match self.dispatch(&response).await {
                Ok(step) => step,
                Err(e) if e.is_fatal() => {
                    error!("Fatal error handling {}: {}", response.op_code, e);
                    return Err(e);
                }
                Err(e) => {
                    error!("Handling {} failed: {}", response.op_code, e);
                    break CycleEnd::Faulted;
                }
            };
            match step {
                Step::Idle => break CycleEnd::Idle,
                Step::Wait(delay) => {
                    wait = Some(delay);
                    break CycleEnd::Wait;
                }
                Step::Failed => break CycleEnd::Failed,
                Step::Stalled => break CycleEnd::Stalled,
                Step::Preempted(next) => {
                    response = next;
                    continue;
                }
                Step::Advanced => {}
            }

            response = match self.ping().await {
                Ok(next) => next,
                Err(e) => {
                    self.enter_cooldown(&e).await;
                    break CycleEnd::Unreachable;
                }
            };
        };

        self.remove_stale_builds().await;

        if end != CycleEnd::Unreachable {
            let mut state = self.state.write().await;
            state.last_completed_at = Utc::now();
            state.err_streak = 0;
        }
        self.metrics
            .timing("cycle.duration", started.elapsed(), &[("end", end.as_str())]);
        debug!("Cycle ended {} after {} steps", end.as_str(), steps);
        Ok(CycleOutcome { end, steps, wait })
    }

    async fn ping(&self) -> Result<PingResponse, AgentError> {
        let reports = self
            .machine
            .store()
            .load_all()
            .await
            .values()
            .map(DeployStatusRecord::to_report)
            .collect();
        let request = PingRequest {
            host_id: self.identity.host_id.clone(),
            host_name: self.identity.host_name.clone(),
            host_ip: self.identity.host_ip.clone(),
            groups: self.identity.groups.clone(),
            agent_version: self.options.agent_version.clone(),
            reports,
        };

        let started = Instant::now();
        let result = self.control_plane.send_reports(&request).await;
        self.metrics.timing("ping.duration", started.elapsed(), &[]);
        match &result {
            Ok(response) => debug!("Control plane answered {}", response.op_code),
            Err(_) => self.metrics.increment("ping.failed", &[]),
        }
        result
    }

    async fn enter_cooldown(&self, err: &AgentError) {
        let mut state = self.state.write().await;
        state.err_streak += 1;
        let cooldown = calc_exp_backoff(&self.cooldown_options, state.err_streak);
        state.cooldown_ends_at =
            Utc::now() + chrono::Duration::from_std(cooldown).unwrap_or_else(|_| chrono::Duration::zero());
        error!(
            "Ping failed (attempt {}), cooldown until {}: {}",
            state.err_streak, state.cooldown_ends_at, err
        );
    }

    async fn dispatch(&self, response: &PingResponse) -> Result<Step, AgentError> {
        let op_code = response.op_code;
        let goal = match (op_code, &response.deploy_goal) {
            (OpCode::Noop, _) => return Ok(Step::Idle),
            (OpCode::Wait, _) => {
                let delay = response
                    .wait_seconds
                    .map(Duration::from_secs)
                    .unwrap_or(self.options.wait_backoff);
                info!("Control plane asked to wait {:?}", delay);
                return Ok(Step::Wait(delay));
            }
            (_, Some(goal)) => goal,
            (_, None) => return Err(ProtocolError::MissingGoal(op_code).into()),
        };

        match op_code {
            OpCode::Delete => self.delete(goal).await,
            OpCode::Terminate => self.terminate(goal).await,
            OpCode::Update => {
                write_script_config(self.machine.layout(), &goal.env_name, &goal.script_variables).await?;
                self.update(goal).await
            }
            _ => {
                write_script_config(self.machine.layout(), &goal.env_name, &goal.script_variables).await?;
                self.run_goal(response, op_code, goal).await
            }
        }
    }

    /// Record for `goal`, reusing the stored one when it belongs to the same
    /// deploy and deploy type
    async fn record_for(
        &self,
        goal: &DeployGoal,
        op_code: OpCode,
        deploy_type: DeployType,
    ) -> (DeployStatusRecord, Fingerprint) {
        let existing = self.machine.store().load(&goal.env_name).await;
        let before = fingerprint(existing.as_ref());
        let mut record = match existing {
            Some(record) if record.deploy_id == goal.deploy_id && record.deploy_type == deploy_type => record,
            replaced => fresh_record(goal, op_code, deploy_type, replaced.as_ref()),
        };
        record.op_code = op_code;
        if goal.env_id.is_some() {
            record.env_id = goal.env_id.clone();
        }
        (record, before)
    }

    async fn run_goal(&self, response: &PingResponse, op_code: OpCode, goal: &DeployGoal) -> Result<Step, AgentError> {
        let deploy_type = goal.deploy_type_for(op_code);
        let (record, before) = self.record_for(goal, op_code, deploy_type).await;

        let started = Instant::now();
        let (record, preempted) = self.execute_with_heartbeat(response, goal, op_code, record).await?;
        let tags = [
            ("env", record.env_name.as_str()),
            ("stage", record.current_stage.name()),
            ("status", record.status.name()),
        ];
        self.metrics.timing("deploy.duration", started.elapsed(), &tags);

        if let Some(next) = preempted {
            self.metrics.increment("deploy.preempted", &tags[..1]);
            return Ok(Step::Preempted(next));
        }
        if record.status.is_failure() {
            self.metrics.increment("deploy.failed", &tags);
            return Ok(Step::Failed);
        }
        if fingerprint(Some(&record)) == before {
            return Ok(Step::Stalled);
        }
        if record.is_serving() || record.current_stage == Stage::Stopped {
            self.metrics.increment("deploy.completed", &tags);
        }
        Ok(Step::Advanced)
    }

    /// Run the stage machine while re-reporting on the heartbeat interval. A
    /// heartbeat answer that preempts the running goal cancels it and is
    /// handed back for dispatch.
    async fn execute_with_heartbeat(
        &self,
        current: &PingResponse,
        goal: &DeployGoal,
        op_code: OpCode,
        record: DeployStatusRecord,
    ) -> Result<(DeployStatusRecord, Option<PingResponse>), AgentError> {
        let (handle, token) = cancel_pair();
        let execution = self.machine.execute(goal, op_code, record, &token);
        tokio::pin!(execution);

        let period = self.options.heartbeat_interval.max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut preempted = None;

        loop {
            tokio::select! {
                result = &mut execution => {
                    return result.map(|record| (record, preempted));
                }
                _ = heartbeat.tick(), if preempted.is_none() => {
                    match self.ping().await {
                        Ok(next) if preempts(current, &next) => {
                            info!(
                                "{} {} preempted by {}, cancelling",
                                goal.env_name, current.op_code, next.op_code
                            );
                            handle.cancel();
                            preempted = Some(next);
                        }
                        Ok(_) => debug!("Heartbeat for {} acknowledged", goal.env_name),
                        Err(e) => warn!("Heartbeat for {} failed: {}", goal.env_name, e),
                    }
                }
            }
        }
    }

    async fn update(&self, goal: &DeployGoal) -> Result<Step, AgentError> {
        let deploy_type = goal.deploy_type_for(OpCode::Update);
        let (mut record, before) = self.record_for(goal, OpCode::Update, deploy_type).await;
        let stage = goal
            .deploy_stage
            .or_else(|| self.machine.plan(&record).terminal())
            .ok_or_else(|| AgentError::InvariantError(format!("empty stage plan for {}", deploy_type)))?;

        record.mark(stage, Status::Succeeded);
        self.machine.store().save(&record).await?;
        info!("{} marked {} {} without running it", record.env_name, stage, Status::Succeeded);

        if fingerprint(Some(&record)) == before {
            Ok(Step::Stalled)
        } else {
            Ok(Step::Advanced)
        }
    }

    /// Local environment a goal refers to. Removal goals may name it by id only.
    async fn resolve_env(&self, goal: &DeployGoal) -> Option<String> {
        if !goal.env_name.is_empty() {
            return Some(goal.env_name.clone());
        }
        let env_id = goal.env_id.as_deref()?;
        self.machine
            .store()
            .load_all()
            .await
            .into_values()
            .find(|r| r.env_id.as_deref() == Some(env_id))
            .map(|r| r.env_name)
    }

    async fn delete(&self, goal: &DeployGoal) -> Result<Step, AgentError> {
        let Some(env_name) = self.resolve_env(goal).await else {
            warn!("Nothing to delete for environment id {:?}", goal.env_id);
            return Ok(Step::Stalled);
        };
        let store = self.machine.store();
        let existed = store.load(&env_name).await.is_some();

        self.machine.fetcher().remove_partials(&env_name).await?;
        store.delete(&env_name).await?;
        self.machine.layout().script_config_file(&env_name).delete().await?;
        info!("Deleted status of {}", env_name);
        self.metrics.increment("env.deleted", &[("env", env_name.as_str())]);

        Ok(if existed { Step::Advanced } else { Step::Stalled })
    }

    async fn terminate(&self, goal: &DeployGoal) -> Result<Step, AgentError> {
        let Some(env_name) = self.resolve_env(goal).await else {
            warn!("Nothing to terminate for environment id {:?}", goal.env_id);
            return Ok(Step::Stalled);
        };
        let mut goal = goal.clone();
        goal.env_name = env_name.clone();

        let store = self.machine.store();
        let record = store.load(&env_name).await;
        let build = record.as_ref().and_then(|r| r.build.as_ref());
        let ctx = StageContext::new(&goal, OpCode::Terminate, DeployType::Stop, build, self.machine.layout());

        match self.machine.run_hooks(Stage::Stopping, &ctx, &CancelToken::never()).await {
            Ok(()) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!("Stop action for {} failed, terminating anyway: {}", env_name, e),
        }

        let fetcher = self.machine.fetcher();
        fetcher.remove_partials(&env_name).await?;
        store.delete(&env_name).await?;
        fetcher.remove_all(&env_name).await?;
        Stager::unstage(&ctx.target).await?;
        self.machine.layout().script_config_file(&env_name).delete().await?;
        info!("Terminated {}", env_name);
        self.metrics.increment("env.terminated", &[("env", env_name.as_str())]);

        Ok(if record.is_some() { Step::Advanced } else { Step::Stalled })
    }

    /// Trim every environment's builds, keeping the ones its record refers to
    async fn remove_stale_builds(&self) {
        let layout = self.machine.layout();
        for record in self.machine.store().load_all().await.values() {
            let env_dir = layout.env_builds_dir(&record.env_name);
            if !env_dir.exists().await {
                continue;
            }
            let protected: Vec<&str> = [record.build.as_ref(), record.previous_build.as_ref()]
                .into_iter()
                .flatten()
                .map(|b| b.build_id.as_str())
                .collect();
            match cleanup::remove_stale_builds(&env_dir, self.options.num_builds_to_retain, &protected).await {
                Ok(removed) if !removed.is_empty() => {
                    debug!("Removed {} stale builds of {}", removed.len(), record.env_name)
                }
                Ok(_) => {}
                Err(e) => warn!("Unable to clean builds of {}: {}", record.env_name, e),
            }
        }
    }
}

fn fresh_record(
    goal: &DeployGoal,
    op_code: OpCode,
    deploy_type: DeployType,
    replaced: Option<&DeployStatusRecord>,
) -> DeployStatusRecord {
    let mut record = DeployStatusRecord::for_goal(goal, op_code, deploy_type, replaced);
    if record.build.is_none() {
        record.build = match deploy_type {
            DeployType::Rollback => replaced.and_then(|r| r.previous_build.clone()),
            DeployType::Restart | DeployType::Stop => replaced.and_then(|r| r.build.clone()),
            _ => None,
        };
    }
    info!(
        "New {} deploy {} for {} (build {})",
        deploy_type,
        record.deploy_id,
        record.env_name,
        record.build.as_ref().map(|b| b.build_id.as_str()).unwrap_or("none")
    );
    record
}

/// A response is only acted on when it is well formed and names a usable
/// environment
fn check_response(response: &PingResponse) -> Result<(), AgentError> {
    response.validate()?;
    if let Some(goal) = &response.deploy_goal {
        if !goal.env_name.is_empty() {
            validate_env_name(&goal.env_name)?;
        }
    }
    Ok(())
}

/// Whether `next` replaces the goal `current` is running: same environment,
/// different op code or deploy
fn preempts(current: &PingResponse, next: &PingResponse) -> bool {
    if check_response(next).is_err() || !current.plan_changed(next) {
        return false;
    }
    let (Some(running), Some(incoming)) = (&current.deploy_goal, &next.deploy_goal) else {
        return false;
    };
    let same_env = (!incoming.env_name.is_empty() && incoming.env_name == running.env_name)
        || (incoming.env_id.is_some() && incoming.env_id == running.env_id);
    same_env && (current.op_code != next.op_code || running.deploy_id != incoming.deploy_id)
}

//! Fakes shared by the integration tests

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use deployd::client::ControlPlane;
use deployd::deploy::executor::StageMachine;
use deployd::download::artifact::ArtifactFetcher;
use deployd::download::local::LocalDownloader;
use deployd::download::{Downloader, DownloaderFactory};
use deployd::errors::AgentError;
use deployd::process::cancel::CancelToken;
use deployd::process::runner::{CommandOutput, CommandSpec, ProcessRunner};
use deployd::reconcile::{Controller, ControllerOptions};
use deployd::storage::layout::StorageLayout;
use deployd::storage::settings::{DownloadSettings, StageSettings};
use deployd::storage::status::{DeployStatusRecord, StatusStore};
use deployd::telemetry::{HostIdentity, NoopSink};
use ping_protocol::{Build, DeployGoal, PingRequest, PingResponse, ScriptHook, Stage};
use tempfile::TempDir;

/// Records the `DEPLOY_STEP` of every script and fails the configured stages
#[derive(Default)]
pub struct FakeRunner {
    steps: Mutex<Vec<String>>,
    failing: Mutex<BTreeSet<String>>,
}

impl FakeRunner {
    pub fn fail_stage(&self, stage: Stage) {
        self.failing.lock().unwrap().insert(stage.name().to_string());
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub fn clear_steps(&self) {
        self.steps.lock().unwrap().clear();
    }

    pub fn steps(&self) -> Vec<String> {
        self.steps.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessRunner for FakeRunner {
    async fn run(&self, spec: &CommandSpec, _cancel: &CancelToken) -> Result<CommandOutput, AgentError> {
        let step = spec
            .env
            .get("DEPLOY_STEP")
            .cloned()
            .unwrap_or_else(|| spec.program.clone());
        let failing = self.failing.lock().unwrap().contains(&step);
        self.steps.lock().unwrap().push(step);
        Ok(CommandOutput {
            exit_code: Some(if failing { 1 } else { 0 }),
            stderr: if failing { "boom".to_string() } else { String::new() },
            ..Default::default()
        })
    }
}

/// Local copies that count as network transfers
#[derive(Default)]
pub struct CountingFactory {
    downloads: Arc<AtomicU32>,
}

impl CountingFactory {
    pub fn downloads(&self) -> u32 {
        self.downloads.load(Ordering::SeqCst)
    }
}

struct CountingDownloader {
    downloads: Arc<AtomicU32>,
}

#[async_trait]
impl Downloader for CountingDownloader {
    fn name(&self) -> &'static str {
        "counting"
    }

    async fn download(&self, url: &str, dest: &Path, cancel: &CancelToken) -> Result<(), AgentError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        LocalDownloader.download(url, dest, cancel).await
    }
}

impl DownloaderFactory for CountingFactory {
    fn create(&self, _url: &str) -> Result<Arc<dyn Downloader>, AgentError> {
        Ok(Arc::new(CountingDownloader {
            downloads: self.downloads.clone(),
        }))
    }
}

/// Answers every ping with the same response until told otherwise
pub struct FixedPlane {
    response: Mutex<PingResponse>,
    requests: Mutex<Vec<PingRequest>>,
}

impl FixedPlane {
    pub fn set(&self, response: PingResponse) {
        *self.response.lock().unwrap() = response;
    }

    pub fn last_request(&self) -> Option<PingRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

impl Default for FixedPlane {
    fn default() -> Self {
        Self {
            response: Mutex::new(PingResponse::noop()),
            requests: Mutex::default(),
        }
    }
}

#[async_trait]
impl ControlPlane for FixedPlane {
    async fn send_reports(&self, request: &PingRequest) -> Result<PingResponse, AgentError> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(self.response.lock().unwrap().clone())
    }
}

pub fn identity() -> HostIdentity {
    HostIdentity {
        host_id: "host-1".to_string(),
        host_name: "host-1".to_string(),
        host_ip: Some("10.0.0.1".to_string()),
        groups: vec!["web".to_string()],
    }
}

/// A controller wired to fakes under a temporary directory
pub struct Harness {
    pub tmp: TempDir,
    pub layout: StorageLayout,
    pub runner: Arc<FakeRunner>,
    pub factory: Arc<CountingFactory>,
    pub plane: Arc<FixedPlane>,
    pub controller: Arc<Controller>,
}

impl Harness {
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(tmp.path());
        let runner = Arc::new(FakeRunner::default());
        let factory = Arc::new(CountingFactory::default());
        let plane = Arc::new(FixedPlane::default());

        let fetcher = Arc::new(ArtifactFetcher::new(
            factory.clone(),
            runner.clone(),
            layout.clone(),
            DownloadSettings::default(),
        ));
        let machine = StageMachine::new(
            StatusStore::new(layout.status_dir()),
            fetcher,
            runner.clone(),
            layout.clone(),
            StageSettings::default(),
        );
        let controller = Arc::new(Controller::new(
            plane.clone(),
            Arc::new(machine),
            identity(),
            Arc::new(NoopSink),
            ControllerOptions::default(),
        ));

        Self {
            tmp,
            layout,
            runner,
            factory,
            plane,
            controller,
        }
    }

    /// Publish an artifact and describe it as a build
    pub fn build(&self, build_id: &str, contents: &[u8]) -> Build {
        let dir = self.tmp.path().join("artifacts");
        std::fs::create_dir_all(&dir).unwrap();
        let artifact = dir.join(format!("{}-service.bin", build_id));
        std::fs::write(&artifact, contents).unwrap();
        Build {
            build_id: build_id.to_string(),
            artifact_url: Some(url::Url::from_file_path(&artifact).unwrap().to_string()),
            ..Default::default()
        }
    }

    /// Goal for `web` with a script for every stage that runs one
    pub fn goal(&self, deploy_id: &str, build: Option<Build>) -> DeployGoal {
        let hook = vec![ScriptHook {
            command: "./step.sh".to_string(),
            accepted_exit_codes: None,
            timeout_secs: None,
        }];
        let script_hooks: BTreeMap<Stage, Vec<ScriptHook>> = [
            Stage::PreDownload,
            Stage::PostDownload,
            Stage::PreRestart,
            Stage::Restarting,
            Stage::PostRestart,
            Stage::ServingBuild,
            Stage::Stopping,
            Stage::Stopped,
        ]
        .into_iter()
        .map(|stage| (stage, hook.clone()))
        .collect();

        DeployGoal {
            deploy_id: deploy_id.to_string(),
            env_id: Some("env-web".to_string()),
            env_name: "web".to_string(),
            stage_name: Some("prod".to_string()),
            build,
            script_hooks,
            ..Default::default()
        }
    }

    pub async fn record(&self) -> Option<DeployStatusRecord> {
        self.controller.machine().store().load("web").await
    }

    pub fn target(&self) -> PathBuf {
        self.layout.default_target("web")
    }

    pub fn build_dir(&self, build_id: &str) -> PathBuf {
        self.layout.builds_dir.join("web").join(build_id)
    }
}

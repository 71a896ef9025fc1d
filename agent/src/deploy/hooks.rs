//! Stage scripts: resolution, environment and execution

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ping_protocol::Stage;
use tracing::{debug, info};

use crate::deploy::StageContext;
use crate::errors::AgentError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::process::cancel::CancelToken;
use crate::process::runner::{CommandSpec, ProcessRunner};
use crate::storage::layout::StorageLayout;
use crate::storage::settings::StageSettings;

/// Directory inside a build holding its stage scripts
pub const SCRIPT_DIR_NAME: &str = "deployd";

/// A resolved script together with the exit codes that count as success
#[derive(Debug, Clone)]
pub struct StageCommand {
    pub spec: CommandSpec,
    pub accepted_exit_codes: Vec<i32>,
}

/// Runs the scripts configured for a stage
pub struct HookRunner {
    runner: Arc<dyn ProcessRunner>,
    settings: StageSettings,
    layout: StorageLayout,
}

impl HookRunner {
    pub fn new(runner: Arc<dyn ProcessRunner>, settings: StageSettings, layout: StorageLayout) -> Self {
        Self {
            runner,
            settings,
            layout,
        }
    }

    /// Run every script of `stage` in order, stopping at the first failure
    pub async fn run(&self, stage: Stage, ctx: &StageContext<'_>, cancel: &CancelToken) -> Result<(), AgentError> {
        let commands = self.resolve(stage, ctx).await?;
        if commands.is_empty() {
            if stage == Stage::Restarting && self.settings.require_restart_script {
                return Err(AgentError::ConfigError(format!(
                    "no {} script found for {}",
                    stage,
                    ctx.env_name()
                )));
            }
            debug!("No scripts for {} in {}", stage, ctx.env_name());
            return Ok(());
        }

        for command in commands {
            info!("Running {} script for {}: {}", stage, ctx.env_name(), command.spec.display());
            let output = self.runner.run(&command.spec, cancel).await?;
            output.check(&command.spec, &command.accepted_exit_codes)?;
        }
        Ok(())
    }

    /// Goal hooks win over scripts shipped with the build
    pub async fn resolve(&self, stage: Stage, ctx: &StageContext<'_>) -> Result<Vec<StageCommand>, AgentError> {
        let env = self.script_env(stage, ctx);
        let cwd = Dir::new(ctx.target.clone());
        let cwd = if cwd.exists().await {
            Some(cwd.path().to_path_buf())
        } else {
            None
        };

        if let Some(hooks) = ctx.goal.script_hooks.get(&stage).filter(|h| !h.is_empty()) {
            return Ok(hooks
                .iter()
                .map(|hook| {
                    let timeout = hook
                        .timeout_secs
                        .map(Duration::from_secs)
                        .unwrap_or_else(|| self.settings.timeout_for(stage));
                    let mut spec = CommandSpec::shell(&hook.command, timeout).envs(&env);
                    if let Some(cwd) = &cwd {
                        spec = spec.cwd(cwd);
                    }
                    StageCommand {
                        spec,
                        accepted_exit_codes: hook
                            .accepted_exit_codes
                            .clone()
                            .unwrap_or_else(|| self.settings.accepted_exit_codes.clone()),
                    }
                })
                .collect());
        }

        // Before staging a host may have never had a build; afterwards the
        // build must ship its script directory.
        let Some(script_dir) = script_dir(&ctx.target, ctx.env_name()).await else {
            if stage.is_pre_staging() {
                debug!("No script directory under {:?} yet", ctx.target);
                return Ok(Vec::new());
            }
            return Err(AgentError::ConfigError(format!(
                "no {} directory under {:?} in step {}",
                SCRIPT_DIR_NAME, ctx.target, stage
            )));
        };

        for name in script_names(stage) {
            let script = File::new(script_dir.join(name));
            if !script.exists().await {
                continue;
            }
            ensure_executable(&script).await?;
            let spec = CommandSpec::new(script.path().to_string_lossy(), self.settings.timeout_for(stage))
                .cwd(&script_dir)
                .envs(&env);
            return Ok(vec![StageCommand {
                spec,
                accepted_exit_codes: self.settings.accepted_exit_codes.clone(),
            }]);
        }
        Ok(Vec::new())
    }

    /// Variables exported to stage scripts. Script variables from the goal
    /// come first so the agent's own values cannot be shadowed.
    pub fn script_env(&self, stage: Stage, ctx: &StageContext<'_>) -> BTreeMap<String, String> {
        let goal = ctx.goal;
        let mut env = goal.script_variables.clone();
        let build = ctx.build;
        let opt = |value: Option<&String>| value.cloned().unwrap_or_default();

        env.insert("DEPLOY_ID".to_string(), goal.deploy_id.clone());
        env.insert("DEPLOY_STEP".to_string(), stage.name().to_string());
        env.insert("ENV_NAME".to_string(), goal.env_name.clone());
        env.insert("STAGE_NAME".to_string(), opt(goal.stage_name.as_ref()));
        env.insert("OPCODE".to_string(), ctx.op_code.name().to_string());
        env.insert("DEPLOY_TYPE".to_string(), ctx.deploy_type.name().to_string());
        env.insert(
            "BUILD_ID".to_string(),
            build.map(|b| b.build_id.clone()).unwrap_or_default(),
        );
        env.insert("BUILD_NAME".to_string(), opt(build.and_then(|b| b.build_name.as_ref())));
        env.insert("BUILD_URL".to_string(), opt(build.and_then(|b| b.artifact_url.as_ref())));
        env.insert("BUILD_COMMIT".to_string(), opt(build.and_then(|b| b.scm_commit.as_ref())));
        env.insert("BUILD_REPO".to_string(), opt(build.and_then(|b| b.scm_repo.as_ref())));
        env.insert("BUILD_BRANCH".to_string(), opt(build.and_then(|b| b.scm_branch.as_ref())));
        env.insert(
            "BUILDS_DIR".to_string(),
            self.layout
                .env_builds_dir(ctx.env_name())
                .path()
                .to_string_lossy()
                .to_string(),
        );
        env.insert("TARGET".to_string(), ctx.target.to_string_lossy().to_string());
        env.insert("FIRST_DEPLOY".to_string(), goal.first_deploy.to_string());
        env
    }
}

/// `<target>/deployd/<env>` when present, else `<target>/deployd`
pub async fn script_dir(target: &Path, env_name: &str) -> Option<PathBuf> {
    let base = Dir::new(target.join(SCRIPT_DIR_NAME));
    let per_env = base.subdir(env_name);
    if per_env.exists().await {
        return Some(per_env.path().to_path_buf());
    }
    if base.exists().await {
        return Some(base.path().to_path_buf());
    }
    None
}

/// File names a stage script may use; builds packaged for older agents name
/// POST_DOWNLOAD after its legacy alias.
fn script_names(stage: Stage) -> Vec<&'static str> {
    match stage {
        Stage::PostDownload => vec![stage.name(), "DOWNLOAD_COMPLETE"],
        _ => vec![stage.name()],
    }
}

async fn ensure_executable(script: &File) -> Result<(), AgentError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = tokio::fs::metadata(script.path()).await?.permissions().mode();
        if mode & 0o100 == 0 {
            script.set_mode(mode | 0o100).await?;
        }
    }
    #[cfg(not(unix))]
    let _ = script;
    Ok(())
}

/// Write the goal's script variables to `<agent_dir>/<env>_SCRIPT_CONFIG` as
/// `KEY=value` lines, or remove the file when there are none
pub async fn write_script_config(
    layout: &StorageLayout,
    env_name: &str,
    variables: &BTreeMap<String, String>,
) -> Result<(), AgentError> {
    let file = layout.script_config_file(env_name);
    if variables.is_empty() {
        return file.delete().await;
    }
    let contents: String = variables
        .iter()
        .map(|(key, value)| format!("{}={}\n", key, value))
        .collect();
    file.write_atomic(contents.as_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::runner::SystemRunner;
    use ping_protocol::{Build, DeployGoal, DeployType, OpCode, ScriptHook};

    fn goal(target: &Path) -> DeployGoal {
        let mut goal = DeployGoal {
            deploy_id: "d-1".to_string(),
            env_name: "web".to_string(),
            stage_name: Some("prod".to_string()),
            build: Some(Build {
                build_id: "b1".to_string(),
                scm_commit: Some("abc123".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        goal.agent_configs
            .insert("target".to_string(), target.to_string_lossy().to_string());
        goal.script_variables
            .insert("DEPLOY_ID".to_string(), "spoofed".to_string());
        goal.script_variables
            .insert("REGION".to_string(), "us-east-1".to_string());
        goal
    }

    fn hooks(base: &Path) -> HookRunner {
        HookRunner::new(
            Arc::new(SystemRunner::default()),
            StageSettings::default(),
            StorageLayout::new(base),
        )
    }

    #[test]
    fn test_script_env() {
        let tmp = tempfile::tempdir().unwrap();
        let goal = goal(&tmp.path().join("target"));
        let layout = StorageLayout::new(tmp.path());
        let ctx = StageContext::new(&goal, OpCode::Deploy, DeployType::Regular, goal.build.as_ref(), &layout);

        let env = hooks(tmp.path()).script_env(Stage::PreRestart, &ctx);
        assert_eq!(env["DEPLOY_ID"], "d-1");
        assert_eq!(env["DEPLOY_STEP"], "PRE_RESTART");
        assert_eq!(env["STAGE_NAME"], "prod");
        assert_eq!(env["BUILD_ID"], "b1");
        assert_eq!(env["BUILD_COMMIT"], "abc123");
        assert_eq!(env["REGION"], "us-east-1");
        assert_eq!(env["FIRST_DEPLOY"], "false");
    }

    #[tokio::test]
    async fn test_goal_hooks_take_precedence() {
        let tmp = tempfile::tempdir().unwrap();
        let mut goal = goal(&tmp.path().join("target"));
        goal.script_hooks.insert(
            Stage::PreRestart,
            vec![ScriptHook {
                command: "exit 2".to_string(),
                accepted_exit_codes: Some(vec![0, 2]),
                timeout_secs: Some(5),
            }],
        );
        let layout = StorageLayout::new(tmp.path());
        let ctx = StageContext::new(&goal, OpCode::Deploy, DeployType::Regular, goal.build.as_ref(), &layout);

        let runner = hooks(tmp.path());
        let commands = runner.resolve(Stage::PreRestart, &ctx).await.unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].accepted_exit_codes, vec![0, 2]);
        assert_eq!(commands[0].spec.timeout, Duration::from_secs(5));
        runner
            .run(Stage::PreRestart, &ctx, &CancelToken::never())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_build_scripts_prefer_env_subdir() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("target");
        let env_scripts = target.join("deployd").join("web");
        std::fs::create_dir_all(&env_scripts).unwrap();
        std::fs::write(target.join("deployd").join("RESTARTING"), "#!/bin/sh\nexit 1\n").unwrap();
        std::fs::write(env_scripts.join("RESTARTING"), "#!/bin/sh\necho \"$DEPLOY_STEP\" > \"$TARGET/ran\"\n")
            .unwrap();

        let goal = goal(&target);
        let layout = StorageLayout::new(tmp.path());
        let ctx = StageContext::new(&goal, OpCode::Deploy, DeployType::Regular, goal.build.as_ref(), &layout);
        hooks(tmp.path())
            .run(Stage::Restarting, &ctx, &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(target.join("ran")).unwrap().trim(), "RESTARTING");
    }

    #[tokio::test]
    async fn test_missing_restart_script_is_config_error() {
        let tmp = tempfile::tempdir().unwrap();
        let goal = goal(&tmp.path().join("target"));
        let layout = StorageLayout::new(tmp.path());
        let ctx = StageContext::new(&goal, OpCode::Deploy, DeployType::Regular, goal.build.as_ref(), &layout);

        std::fs::create_dir_all(tmp.path().join("target").join("deployd")).unwrap();

        let runner = hooks(tmp.path());
        runner
            .run(Stage::PreRestart, &ctx, &CancelToken::never())
            .await
            .unwrap();
        let err = runner
            .run(Stage::Restarting, &ctx, &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ConfigError(_)));
    }

    #[tokio::test]
    async fn test_missing_script_dir_fails_after_staging() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("target");
        std::fs::create_dir_all(&target).unwrap();
        let mut goal = goal(&target);
        let layout = StorageLayout::new(tmp.path());
        let runner = hooks(tmp.path());

        {
            let ctx = StageContext::new(&goal, OpCode::Deploy, DeployType::Regular, goal.build.as_ref(), &layout);
            for stage in [Stage::PreDownload, Stage::PostDownload] {
                runner.run(stage, &ctx, &CancelToken::never()).await.unwrap();
            }
            for stage in [Stage::PreRestart, Stage::PostRestart, Stage::ServingBuild] {
                let err = runner.run(stage, &ctx, &CancelToken::never()).await.unwrap_err();
                assert_eq!(err.status(), ping_protocol::Status::AgentFailed, "{}", stage);
            }
        }

        // A goal hook does not need the build's scripts
        goal.script_hooks.insert(
            Stage::PostRestart,
            vec![ScriptHook {
                command: "true".to_string(),
                accepted_exit_codes: None,
                timeout_secs: None,
            }],
        );
        let ctx = StageContext::new(&goal, OpCode::Deploy, DeployType::Regular, goal.build.as_ref(), &layout);
        runner
            .run(Stage::PostRestart, &ctx, &CancelToken::never())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_script_config_written_and_removed() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(tmp.path());
        let mut vars = BTreeMap::new();
        vars.insert("B".to_string(), "2".to_string());
        vars.insert("A".to_string(), "1".to_string());

        write_script_config(&layout, "web", &vars).await.unwrap();
        let file = layout.script_config_file("web");
        assert_eq!(file.read_string().await.unwrap(), "A=1\nB=2\n");

        write_script_config(&layout, "web", &BTreeMap::new()).await.unwrap();
        assert!(!file.exists().await);
    }
}

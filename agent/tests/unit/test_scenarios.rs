use deployd::deploy::stager::Stager;
use deployd::reconcile::CycleEnd;
use deployd::storage::status::DeployStatusRecord;
use ping_protocol::{DeployType, OpCode, PingResponse, Stage, Status};
use tokio_test::assert_ok;

use crate::common::Harness;

const HOOKED_DEPLOY_STEPS: &[&str] = &[
    "PRE_DOWNLOAD",
    "POST_DOWNLOAD",
    "PRE_RESTART",
    "RESTARTING",
    "POST_RESTART",
    "SERVING_BUILD",
];

#[tokio::test]
async fn test_first_deploy_reaches_serving_build() {
    let h = Harness::new();
    let build = h.build("b1", b"v1");
    h.plane
        .set(PingResponse::with_goal(OpCode::Deploy, h.goal("d1", Some(build))));

    let outcome = assert_ok!(h.controller.run_cycle().await);
    // The second answer repeats the finished goal
    assert_eq!(outcome.end, CycleEnd::Stalled);
    assert_eq!(outcome.steps, 2);
    assert_eq!(h.runner.steps(), HOOKED_DEPLOY_STEPS);
    assert_eq!(h.factory.downloads(), 1);

    let record = h.record().await.unwrap();
    assert!(record.is_serving());
    assert_eq!(record.deploy_id, "d1");
    assert_eq!(record.env_id.as_deref(), Some("env-web"));
    assert_eq!(Stager::enabled_build(&h.target()).await, Some(h.build_dir("b1")));
    assert!(h.build_dir("b1").join("b1-service.bin").is_file());

    let request = h.plane.last_request().unwrap();
    assert_eq!(request.host_id, "host-1");
    assert_eq!(request.reports.len(), 1);
    assert_eq!(request.reports[0].deploy_stage, Stage::ServingBuild);
    assert_eq!(request.reports[0].status, Status::Succeeded);
}

#[tokio::test]
async fn test_rollback_restores_previous_build_without_download() {
    let h = Harness::new();
    let b1 = h.build("b1", b"v1");
    let b2 = h.build("b2", b"v2");

    h.plane
        .set(PingResponse::with_goal(OpCode::Deploy, h.goal("d1", Some(b1))));
    assert_ok!(h.controller.run_cycle().await);
    h.plane
        .set(PingResponse::with_goal(OpCode::Deploy, h.goal("d2", Some(b2))));
    assert_ok!(h.controller.run_cycle().await);
    assert_eq!(Stager::enabled_build(&h.target()).await, Some(h.build_dir("b2")));
    assert_eq!(h.factory.downloads(), 2);

    h.runner.clear_steps();
    h.plane
        .set(PingResponse::with_goal(OpCode::Rollback, h.goal("d3", None)));
    let outcome = assert_ok!(h.controller.run_cycle().await);
    assert_eq!(outcome.end, CycleEnd::Stalled);

    let record = h.record().await.unwrap();
    assert_eq!(record.deploy_type, DeployType::Rollback);
    assert!(record.is_serving());
    assert_eq!(record.build.as_ref().map(|b| b.build_id.as_str()), Some("b1"));
    assert_eq!(Stager::enabled_build(&h.target()).await, Some(h.build_dir("b1")));
    assert_eq!(h.factory.downloads(), 2);
    assert_eq!(h.runner.steps(), HOOKED_DEPLOY_STEPS);
}

#[tokio::test]
async fn test_rollback_to_named_build() {
    let h = Harness::new();
    let b1 = h.build("b1", b"v1");
    let b0 = h.build("b0", b"v0");
    h.plane
        .set(PingResponse::with_goal(OpCode::Deploy, h.goal("d1", Some(b1))));
    assert_ok!(h.controller.run_cycle().await);

    let mut goal = h.goal("d2", Some(b0));
    goal.deploy_type = Some(DeployType::Rollback);
    h.plane.set(PingResponse::with_goal(OpCode::Deploy, goal));
    let outcome = assert_ok!(h.controller.run_cycle().await);
    assert_eq!(outcome.end, CycleEnd::Stalled);

    let record = h.record().await.unwrap();
    assert!(record.is_serving());
    assert_eq!(record.deploy_type, DeployType::Rollback);
    assert_eq!(record.build.as_ref().map(|b| b.build_id.as_str()), Some("b0"));
    assert_eq!(
        record.previous_build.as_ref().map(|b| b.build_id.as_str()),
        Some("b1")
    );
    assert_eq!(Stager::enabled_build(&h.target()).await, Some(h.build_dir("b0")));
}

#[tokio::test]
async fn test_stop_runs_stop_stages_only() {
    let h = Harness::new();
    let build = h.build("b1", b"v1");
    h.plane
        .set(PingResponse::with_goal(OpCode::Deploy, h.goal("d1", Some(build))));
    assert_ok!(h.controller.run_cycle().await);

    h.runner.clear_steps();
    h.plane
        .set(PingResponse::with_goal(OpCode::Stop, h.goal("d2", None)));
    let outcome = assert_ok!(h.controller.run_cycle().await);
    assert_eq!(outcome.end, CycleEnd::Stalled);
    assert_eq!(h.runner.steps(), vec!["STOPPING", "STOPPED"]);
    assert_eq!(h.factory.downloads(), 1);

    let record = h.record().await.unwrap();
    assert_eq!(record.current_stage, Stage::Stopped);
    assert_eq!(record.status, Status::Succeeded);
    assert_eq!(record.deploy_type, DeployType::Stop);
    assert_eq!(record.build.as_ref().map(|b| b.build_id.as_str()), Some("b1"));
    // Stopping leaves the installed build in place
    assert_eq!(Stager::enabled_build(&h.target()).await, Some(h.build_dir("b1")));
}

#[tokio::test]
async fn test_retries_exhaust_until_new_deploy() {
    let h = Harness::new();
    let build = h.build("b1", b"v1");
    h.runner.fail_stage(Stage::PreRestart);
    h.plane.set(PingResponse::with_goal(
        OpCode::Deploy,
        h.goal("d1", Some(build.clone())),
    ));

    let mut statuses = Vec::new();
    for _ in 0..3 {
        let outcome = assert_ok!(h.controller.run_cycle().await);
        assert_eq!(outcome.end, CycleEnd::Failed);
        let record = h.record().await.unwrap();
        assert_eq!(record.current_stage, Stage::PreRestart);
        statuses.push((record.status, record.retry_count));
    }
    assert_eq!(
        statuses,
        vec![
            (Status::ScriptFailed, 1),
            (Status::ScriptFailed, 2),
            (Status::TooManyRetry, 3),
        ]
    );
    assert_eq!(h.factory.downloads(), 1);

    // Halted: the same goal runs nothing
    h.runner.heal();
    h.runner.clear_steps();
    assert_ok!(h.controller.run_cycle().await);
    assert!(h.runner.steps().is_empty());
    assert_eq!(h.record().await.unwrap().status, Status::TooManyRetry);

    // A new deploy starts over
    h.plane
        .set(PingResponse::with_goal(OpCode::Deploy, h.goal("d2", Some(build))));
    let outcome = assert_ok!(h.controller.run_cycle().await);
    assert_eq!(outcome.end, CycleEnd::Stalled);
    let record = h.record().await.unwrap();
    assert_eq!(record.deploy_id, "d2");
    assert!(record.is_serving());
    assert_eq!(record.retry_count, 0);
    assert_eq!(h.runner.steps(), HOOKED_DEPLOY_STEPS);
    assert_eq!(h.factory.downloads(), 1);
}

#[tokio::test]
async fn test_restart_after_crash_resumes_after_staging() {
    let h = Harness::new();
    let build = h.build("b1", b"v1");
    let goal = h.goal("d1", Some(build));

    // The agent went down right after staging
    let mut record = DeployStatusRecord::for_goal(&goal, OpCode::Deploy, DeployType::Regular, None);
    record.mark(Stage::Staging, Status::Succeeded);
    assert_ok!(h.controller.machine().store().save(&record).await);

    h.plane.set(PingResponse::with_goal(OpCode::Deploy, goal));
    let outcome = assert_ok!(h.controller.run_cycle().await);
    assert_eq!(outcome.end, CycleEnd::Stalled);
    assert_eq!(
        h.runner.steps(),
        vec!["PRE_RESTART", "RESTARTING", "POST_RESTART", "SERVING_BUILD"]
    );
    assert_eq!(h.factory.downloads(), 0);
    assert!(h.record().await.unwrap().is_serving());
}

#[tokio::test]
async fn test_terminate_removes_everything() {
    let h = Harness::new();
    let build = h.build("b1", b"v1");
    let mut goal = h.goal("d1", Some(build));
    goal.script_variables.insert("PORT".to_string(), "8080".to_string());
    h.plane.set(PingResponse::with_goal(OpCode::Deploy, goal));
    assert_ok!(h.controller.run_cycle().await);
    let config = assert_ok!(h.layout.script_config_file("web").read_string().await);
    assert_eq!(config, "PORT=8080\n");

    h.runner.clear_steps();
    let mut goal = h.goal("d2", None);
    goal.env_name = String::new();
    h.plane.set(PingResponse::with_goal(OpCode::Terminate, goal));
    let outcome = assert_ok!(h.controller.run_cycle().await);
    // The follow-up terminate finds nothing left
    assert_eq!(outcome.end, CycleEnd::Stalled);
    assert_eq!(h.runner.steps(), vec!["STOPPING"]);

    assert!(h.record().await.is_none());
    assert!(!h.layout.builds_dir.join("web").exists());
    assert!(Stager::enabled_build(&h.target()).await.is_none());
    assert!(!h.layout.script_config_file("web").exists().await);
}

use std::time::Duration;

use deployd::download::checksum::{compute, Algorithm};
use deployd::reconcile::CycleEnd;
use ping_protocol::{OpCode, PingResponse, Stage, Status};
use tokio_test::assert_ok;

use crate::common::Harness;

#[tokio::test]
async fn test_checksum_mismatch_leaves_no_artifact() {
    let h = Harness::new();
    let build = h.build("b1", b"v1");
    let mut goal = h.goal("d1", Some(build));
    goal.artifact_checksum = Some(format!("sha256:{}", "0".repeat(64)));
    h.plane.set(PingResponse::with_goal(OpCode::Deploy, goal));

    let outcome = assert_ok!(h.controller.run_cycle().await);
    assert_eq!(outcome.end, CycleEnd::Failed);

    let record = h.record().await.unwrap();
    assert_eq!(record.current_stage, Stage::Downloading);
    assert_eq!(record.status, Status::RetryableAgentFailed);
    assert_eq!(record.retry_count, 1);
    assert!(record.error_message.is_some());

    let env_dir = h.layout.builds_dir.join("web");
    let leftovers: Vec<_> = std::fs::read_dir(&env_dir)
        .map(|entries| entries.filter_map(Result::ok).map(|e| e.file_name()).collect())
        .unwrap_or_default();
    assert!(leftovers.is_empty(), "unexpected files: {:?}", leftovers);
    assert_eq!(h.runner.steps(), vec!["PRE_DOWNLOAD"]);
}

#[tokio::test]
async fn test_matching_checksum_deploys() {
    let h = Harness::new();
    let build = h.build("b1", b"v1");
    let artifact = h.tmp.path().join("artifacts").join("b1-service.bin");
    let digest = assert_ok!(compute(&artifact, Algorithm::Sha256).await);

    let mut goal = h.goal("d1", Some(build));
    goal.artifact_checksum = Some(digest);
    h.plane.set(PingResponse::with_goal(OpCode::Deploy, goal));

    assert_ok!(h.controller.run_cycle().await);
    assert!(h.record().await.unwrap().is_serving());
    assert!(h.layout.builds_dir.join("web").join("b1.bin").is_file());
}

#[tokio::test]
async fn test_redeploying_a_build_skips_the_download() {
    let h = Harness::new();
    let build = h.build("b1", b"v1");

    h.plane.set(PingResponse::with_goal(
        OpCode::Deploy,
        h.goal("d1", Some(build.clone())),
    ));
    assert_ok!(h.controller.run_cycle().await);
    h.plane
        .set(PingResponse::with_goal(OpCode::Deploy, h.goal("d2", Some(build))));
    let outcome = assert_ok!(h.controller.run_cycle().await);

    assert_eq!(outcome.end, CycleEnd::Stalled);
    assert_eq!(h.factory.downloads(), 1);
    let record = h.record().await.unwrap();
    assert_eq!(record.deploy_id, "d2");
    assert!(record.is_serving());
}

#[tokio::test]
async fn test_stale_builds_are_trimmed() {
    let h = Harness::new();
    for (index, build_id) in ["b1", "b2", "b3", "b4"].iter().enumerate() {
        let build = h.build(build_id, build_id.as_bytes());
        let deploy_id = format!("d{}", index + 1);
        h.plane
            .set(PingResponse::with_goal(OpCode::Deploy, h.goal(&deploy_id, Some(build))));
        assert_ok!(h.controller.run_cycle().await);
        // Builds are ranked by modification time
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert!(h.build_dir("b4").is_dir());
    assert!(h.build_dir("b3").is_dir());
    assert!(!h.build_dir("b2").exists());
    assert!(!h.build_dir("b1").exists());
    assert!(!h.layout.builds_dir.join("web").join("b1.bin").exists());
}

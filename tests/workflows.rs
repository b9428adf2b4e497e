use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde_json::json;

use comic_worker::{
    clients::PollOutcome,
    stages::NarrativeParameters,
    store::{
        dao::WorkflowRunDao,
        models::{
            ExecutionStatus, JobKind, JobRecord, JobStatus, NewJobRecord, NewWorkflowRun,
            WorkflowKind, WorkflowStage,
        },
    },
    test_support::{FailPoint, Harness, ScriptedProvider, Step},
    workflow::{
        AvatarWorkflowInput, EngineError, EngineSettings, SceneWorkflowInput, WorkflowEngine,
    },
};

const SCENE_OUTPUT: &str = "https://replicate.delivery/out/scene.png";
const VIDEO_OUTPUT: &str = "https://replicate.delivery/out/video.mp4";

fn scene_input(avatar: &JobRecord) -> SceneWorkflowInput {
    SceneWorkflowInput {
        avatar_id: avatar.id,
        owner_id: avatar.owner_id.clone(),
        avatar_url: avatar.result_url.clone().expect("completed avatar has a URL"),
        theme: "city".into(),
        narrative: NarrativeParameters {
            duration_seconds: 6,
            prompt: Some("walking through neon streets".into()),
        },
    }
}

async fn start_scene(h: &Harness, settings: EngineSettings) -> (WorkflowEngine, String, JobRecord) {
    let engine = h.engine(settings);
    let avatar = h.completed_avatar("u1");
    let id = engine
        .start_scene(scene_input(&avatar))
        .await
        .expect("scene workflow starts");
    (engine, id, avatar)
}

#[tokio::test(start_paused = true)]
async fn avatar_workflow_completes_with_avatar_url() {
    let h = Harness::new(
        ScriptedProvider::succeeding("avatar", "https://replicate.delivery/out/avatar.png"),
        ScriptedProvider::pending_forever("scene"),
        ScriptedProvider::pending_forever("animation"),
    );
    let engine = h.engine(EngineSettings::default());
    let record = h.dao.insert_record(
        NewJobRecord::new(JobKind::Avatar, "u1").with_input_url("https://uploads.example.com/a.jpg"),
    );

    let id = engine
        .start_avatar(AvatarWorkflowInput {
            avatar_id: record.id,
            owner_id: "u1".into(),
            original_url: "https://uploads.example.com/a.jpg".into(),
        })
        .await
        .expect("avatar workflow starts");
    assert_eq!(id, format!("avatar-{}", record.id));

    let description = engine.wait(&id).await.expect("workflow closes");
    assert_eq!(description.status, ExecutionStatus::Completed);
    assert_eq!(description.current_stage.as_deref(), Some("COMPLETED"));

    let stored = h.dao.record(JobKind::Avatar, record.id).expect("record");
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(
        description.result,
        Some(json!({ "avatarUrl": stored.result_url.clone().expect("url") }))
    );
    assert_eq!(engine.live_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn concurrent_avatar_workflows_run_independently() {
    let h = Harness::new(
        ScriptedProvider::new(
            "avatar",
            vec![
                Step::Outcome(PollOutcome::Succeeded(json!(
                    "https://replicate.delivery/out/avatar.png"
                )));
                3
            ],
        ),
        ScriptedProvider::pending_forever("scene"),
        ScriptedProvider::pending_forever("animation"),
    );
    let engine = h.engine(EngineSettings::default());

    let mut ids = Vec::new();
    for owner in ["u1", "u2", "u3"] {
        let record = h.dao.insert_record(NewJobRecord::new(JobKind::Avatar, owner));
        let id = engine
            .start_avatar(AvatarWorkflowInput {
                avatar_id: record.id,
                owner_id: owner.into(),
                original_url: "https://uploads.example.com/a.jpg".into(),
            })
            .await
            .expect("avatar workflow starts");
        ids.push(id);
    }
    assert_eq!(engine.live_count(), 3);

    let descriptions = join_all(ids.iter().map(|id| engine.wait(id))).await;
    for description in descriptions {
        assert_eq!(
            description.expect("workflow closes").status,
            ExecutionStatus::Completed
        );
    }
    let mut keys = h.assets.puts();
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), 3);
    assert_eq!(h.avatar.start_count(), 3);
    assert_eq!(engine.live_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn duplicate_avatar_workflow_is_rejected() {
    let h = Harness::new(
        ScriptedProvider::pending_forever("avatar"),
        ScriptedProvider::pending_forever("scene"),
        ScriptedProvider::pending_forever("animation"),
    );
    let engine = h.engine(EngineSettings::default());
    let record = h.dao.insert_record(NewJobRecord::new(JobKind::Avatar, "u1"));
    let input = AvatarWorkflowInput {
        avatar_id: record.id,
        owner_id: "u1".into(),
        original_url: "https://uploads.example.com/a.jpg".into(),
    };

    engine.start_avatar(input.clone()).await.expect("first start");
    let err = engine.start_avatar(input).await.expect_err("second start");
    assert!(matches!(err, EngineError::AlreadyExists(_)));
}

#[tokio::test(start_paused = true)]
async fn failed_avatar_generation_fails_workflow_and_record() {
    let h = Harness::new(
        ScriptedProvider::new(
            "avatar",
            vec![Step::Outcome(PollOutcome::Failed(
                "NSFW content detected".into(),
            ))],
        ),
        ScriptedProvider::pending_forever("scene"),
        ScriptedProvider::pending_forever("animation"),
    );
    let engine = h.engine(EngineSettings::default());
    let record = h.dao.insert_record(NewJobRecord::new(JobKind::Avatar, "u1"));

    let id = engine
        .start_avatar(AvatarWorkflowInput {
            avatar_id: record.id,
            owner_id: "u1".into(),
            original_url: "https://uploads.example.com/a.jpg".into(),
        })
        .await
        .expect("avatar workflow starts");
    let description = engine.wait(&id).await.expect("workflow closes");

    assert_eq!(description.status, ExecutionStatus::Failed);
    assert_eq!(description.current_stage.as_deref(), Some("FAILED"));
    assert_eq!(
        description.error.as_deref(),
        Some("Workflow FAILED: generation failed: NSFW content detected")
    );
    let stored = h.dao.record(JobKind::Avatar, record.id).expect("record");
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(h.avatar.start_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn scene_workflow_produces_scene_and_video() {
    let h = Harness::new(
        ScriptedProvider::pending_forever("avatar"),
        ScriptedProvider::succeeding("scene", SCENE_OUTPUT),
        ScriptedProvider::succeeding("animation", VIDEO_OUTPUT),
    );
    let (engine, id, avatar) = start_scene(&h, EngineSettings::default()).await;
    assert!(id.starts_with(&format!("scene-{}-city-", avatar.id)));

    let mut stages = engine.watch_stage(&id).expect("workflow is live");
    let observer = tokio::spawn(async move {
        let mut seen = vec![*stages.borrow()];
        while stages.changed().await.is_ok() {
            seen.push(*stages.borrow_and_update());
        }
        seen.push(*stages.borrow());
        seen
    });

    let description = engine.wait(&id).await.expect("workflow closes");
    assert_eq!(description.status, ExecutionStatus::Completed);
    let result = description.result.expect("result");

    let scenes = h.dao.records(JobKind::Scene);
    let animations = h.dao.records(JobKind::Animation);
    assert_eq!(scenes.len(), 1);
    assert_eq!(animations.len(), 1);
    assert_eq!(scenes[0].parent_id, Some(avatar.id));
    assert_eq!(animations[0].parent_id, Some(scenes[0].id));
    assert_eq!(result["sceneUrl"], json!(scenes[0].result_url));
    assert_eq!(result["finalVideoUrl"], json!(animations[0].result_url));

    let seen = observer.await.expect("observer finishes");
    assert!(seen.windows(2).all(|pair| pair[0].rank() <= pair[1].rank()));
    assert_eq!(seen.last(), Some(&WorkflowStage::Completed));
    assert!(h.assets.deletes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn animation_timeout_compensates_scene_and_avatar() {
    let h = Harness::new(
        ScriptedProvider::pending_forever("avatar"),
        ScriptedProvider::succeeding("scene", SCENE_OUTPUT),
        ScriptedProvider::pending_forever("animation"),
    );
    let (engine, id, avatar) = start_scene(&h, EngineSettings::default()).await;

    let description = engine.wait(&id).await.expect("workflow closes");
    assert_eq!(description.status, ExecutionStatus::Failed);
    assert_eq!(description.current_stage.as_deref(), Some("FAILED"));
    assert_eq!(
        description.error.as_deref(),
        Some("Workflow FAILED: animation generation timed out after 600s")
    );

    let scene = &h.dao.records(JobKind::Scene)[0];
    let animation = &h.dao.records(JobKind::Animation)[0];
    assert_eq!(scene.status, JobStatus::Completed);
    assert_eq!(animation.status, JobStatus::Failed);

    let deletes = h.assets.deletes();
    assert_eq!(deletes.len(), 2);
    assert_eq!(
        deletes[0],
        format!("assets/u1/{}/scene.png", scene.id),
        "scene asset is removed first"
    );
    assert_eq!(deletes[1], format!("assets/u1/{}/avatar.png", avatar.id));
    assert_eq!(h.animation.start_count(), 1);

    assert_eq!(
        engine.query_stage(&id).await.expect("stage"),
        WorkflowStage::Failed
    );
    let scene_writes_after_completion = h
        .dao
        .transitions()
        .into_iter()
        .filter(|t| t.id == scene.id && t.from == JobStatus::Completed)
        .count();
    assert_eq!(scene_writes_after_completion, 0);
    assert!(scene.result_url.as_deref().is_some_and(|url| url.ends_with("/scene.png")));
}

#[tokio::test(start_paused = true)]
async fn avatar_asset_is_kept_when_configured() {
    let h = Harness::new(
        ScriptedProvider::pending_forever("avatar"),
        ScriptedProvider::succeeding("scene", SCENE_OUTPUT),
        ScriptedProvider::pending_forever("animation"),
    );
    let settings = EngineSettings {
        delete_avatar_on_failure: false,
        ..EngineSettings::default()
    };
    let (engine, id, _) = start_scene(&h, settings).await;

    engine.wait(&id).await.expect("workflow closes");
    let deletes = h.assets.deletes();
    assert_eq!(deletes.len(), 1);
    assert!(deletes[0].ends_with("/scene.png"));
}

#[tokio::test(start_paused = true)]
async fn scene_failure_marks_scene_record_and_removes_avatar() {
    let h = Harness::new(
        ScriptedProvider::pending_forever("avatar"),
        ScriptedProvider::new(
            "scene",
            vec![Step::Outcome(PollOutcome::Canceled("operator".into()))],
        ),
        ScriptedProvider::pending_forever("animation"),
    );
    let (engine, id, avatar) = start_scene(&h, EngineSettings::default()).await;

    let description = engine.wait(&id).await.expect("workflow closes");
    assert_eq!(description.status, ExecutionStatus::Failed);
    let scene = &h.dao.records(JobKind::Scene)[0];
    assert_eq!(scene.status, JobStatus::Failed);
    assert!(h.dao.records(JobKind::Animation).is_empty());
    assert_eq!(
        h.assets.deletes(),
        vec![format!("assets/u1/{}/avatar.png", avatar.id)]
    );
    assert_eq!(h.animation.start_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_runs_compensation_and_closes_canceled() {
    let h = Harness::new(
        ScriptedProvider::pending_forever("avatar"),
        ScriptedProvider::succeeding("scene", SCENE_OUTPUT),
        ScriptedProvider::pending_forever("animation"),
    );
    let (engine, id, _) = start_scene(&h, EngineSettings::default()).await;

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(
        engine.query_stage(&id).await.expect("stage"),
        WorkflowStage::GeneratingAnimation
    );

    engine.cancel(&id).await.expect("cancel accepted");
    let description = engine.wait(&id).await.expect("workflow closes");
    assert_eq!(description.status, ExecutionStatus::Canceled);
    assert_eq!(description.current_stage.as_deref(), Some("CANCELED"));

    let animation = &h.dao.records(JobKind::Animation)[0];
    assert_eq!(animation.status, JobStatus::Failed);
    assert_eq!(animation.error_text.as_deref(), Some("workflow was canceled"));
    assert_eq!(h.assets.deletes().len(), 2);

    let err = engine.cancel(&id).await.expect_err("already closed");
    assert!(matches!(err, EngineError::Closed(_)));
}

#[tokio::test(start_paused = true)]
async fn cancel_during_retry_backoff_leaves_no_scene_asset() {
    let h = Harness::new(
        ScriptedProvider::pending_forever("avatar"),
        ScriptedProvider::succeeding("scene", SCENE_OUTPUT),
        ScriptedProvider::pending_forever("animation"),
    );
    h.dao.fail_next(FailPoint::MarkCompleted, 1);
    let (engine, id, avatar) = start_scene(&h, EngineSettings::default()).await;

    tokio::time::sleep(Duration::from_millis(3_500)).await;
    engine.cancel(&id).await.expect("cancel accepted");
    let description = engine.wait(&id).await.expect("workflow closes");
    assert_eq!(description.status, ExecutionStatus::Canceled);

    let scene = &h.dao.records(JobKind::Scene)[0];
    assert_eq!(scene.status, JobStatus::Failed);
    let scene_key = format!("assets/u1/{}/scene.png", scene.id);
    assert_eq!(h.assets.puts(), vec![scene_key.clone()]);
    assert!(h.assets.object(&scene_key).is_none());

    let deletes = h.assets.deletes();
    assert!(deletes.contains(&scene_key));
    assert_eq!(
        deletes.last().map(String::as_str),
        Some(format!("assets/u1/{}/avatar.png", avatar.id).as_str())
    );
    assert!(h.dao.records(JobKind::Animation).is_empty());
}

#[tokio::test(start_paused = true)]
async fn terminate_skips_compensation() {
    let h = Harness::new(
        ScriptedProvider::pending_forever("avatar"),
        ScriptedProvider::succeeding("scene", SCENE_OUTPUT),
        ScriptedProvider::pending_forever("animation"),
    );
    let (engine, id, _) = start_scene(&h, EngineSettings::default()).await;

    tokio::time::sleep(Duration::from_secs(30)).await;
    engine
        .terminate(&id, Some("operator request".into()))
        .await
        .expect("terminated");

    let description = engine.wait(&id).await.expect("workflow closed");
    assert_eq!(description.status, ExecutionStatus::Terminated);
    assert_eq!(description.current_stage.as_deref(), Some("TERMINATED"));
    assert_eq!(description.error.as_deref(), Some("operator request"));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(h.assets.deletes().is_empty());
    let animation = &h.dao.records(JobKind::Animation)[0];
    assert_eq!(animation.status, JobStatus::Processing);
    assert_eq!(engine.live_count(), 0);

    let err = engine.terminate(&id, None).await.expect_err("already closed");
    assert!(matches!(err, EngineError::Closed(_)));
    let err = engine
        .terminate("scene-missing", None)
        .await
        .expect_err("unknown workflow");
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test(start_paused = true)]
async fn execution_timeout_closes_timed_out() {
    let h = Harness::new(
        ScriptedProvider::pending_forever("avatar"),
        ScriptedProvider::succeeding("scene", SCENE_OUTPUT),
        ScriptedProvider::pending_forever("animation"),
    );
    let settings = EngineSettings {
        execution_timeout: Duration::from_secs(120),
        ..EngineSettings::default()
    };
    let (engine, id, _) = start_scene(&h, settings).await;

    let description = engine.wait(&id).await.expect("workflow closes");
    assert_eq!(description.status, ExecutionStatus::TimedOut);
    assert_eq!(description.current_stage.as_deref(), Some("FAILED"));
    assert_eq!(
        description.error.as_deref(),
        Some("Workflow TIMED_OUT: workflow execution exceeded 120s")
    );
    assert_eq!(h.assets.deletes().len(), 2);
    let animation = &h.dao.records(JobKind::Animation)[0];
    assert_eq!(animation.status, JobStatus::Failed);
}

async fn seed_checkpointed_run(h: &Harness, id: &str) -> (JobRecord, SceneWorkflowInput) {
    let avatar = h.completed_avatar("u1");
    let input = scene_input(&avatar);

    let mut scene = h.dao.insert_record(
        NewJobRecord::new(JobKind::Scene, "u1")
            .with_parent(avatar.id)
            .with_idempotency_key(format!("{id}:scene")),
    );
    let scene_url = format!("https://cdn.example.com/comics/assets/u1/{}/scene.png", scene.id);
    scene.status = JobStatus::Completed;
    scene.result_url = Some(scene_url.clone());
    h.dao.overwrite_record(scene.clone());

    h.dao
        .insert_run(NewWorkflowRun {
            id: id.to_string(),
            kind: WorkflowKind::SceneAnimation,
            input: serde_json::to_value(&input).expect("input serializes"),
        })
        .await
        .expect("run inserted");
    h.dao
        .record_stage(
            id,
            WorkflowStage::GeneratingAnimation,
            &json!({ "sceneRecordId": scene.id, "sceneUrl": scene_url }),
        )
        .await
        .expect("checkpoint recorded");
    (scene, input)
}

#[tokio::test(start_paused = true)]
async fn resumed_workflow_continues_after_checkpoint() {
    let h = Harness::new(
        ScriptedProvider::pending_forever("avatar"),
        ScriptedProvider::succeeding("scene", SCENE_OUTPUT),
        ScriptedProvider::succeeding("animation", VIDEO_OUTPUT),
    );
    let id = "scene-resume-city-1";
    let (scene, _) = seed_checkpointed_run(&h, id).await;
    let engine = h.engine(EngineSettings::default());

    assert_eq!(engine.resume_incomplete().await.expect("resume"), 1);
    assert_eq!(
        engine.query_stage(id).await.expect("stage"),
        WorkflowStage::GeneratingAnimation
    );

    let description = engine.wait(id).await.expect("workflow closes");
    assert_eq!(description.status, ExecutionStatus::Completed);
    assert_eq!(h.scene.start_count(), 0);
    assert_eq!(h.animation.start_count(), 1);
    let animation = &h.dao.records(JobKind::Animation)[0];
    assert_eq!(animation.parent_id, Some(scene.id));
    assert_eq!(animation.status, JobStatus::Completed);

    assert_eq!(engine.resume_incomplete().await.expect("resume"), 0);
}

#[tokio::test(start_paused = true)]
async fn resumed_workflow_keeps_original_deadline() {
    let h = Harness::new(
        ScriptedProvider::pending_forever("avatar"),
        ScriptedProvider::pending_forever("scene"),
        ScriptedProvider::pending_forever("animation"),
    );
    let id = "scene-late-city-1";
    seed_checkpointed_run(&h, id).await;
    h.dao
        .backdate_run(id, Utc::now() - chrono::Duration::minutes(28));
    let engine = h.engine(EngineSettings::default());

    let started = tokio::time::Instant::now();
    assert_eq!(engine.resume_incomplete().await.expect("resume"), 1);
    let description = engine.wait(id).await.expect("workflow closes");

    assert_eq!(description.status, ExecutionStatus::TimedOut);
    assert!(started.elapsed() <= Duration::from_secs(125));
}

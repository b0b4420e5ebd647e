use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use replay_coach::gateway::{InvokeRequest, InvokeResponse, ModelGateway, ProviderError};
use replay_coach::pipeline::{AnalysisStatus, CoachingPipeline, PipelineConfig, Stage};
use replay_coach::tips::RejectionStage;
use replay_coach::validator::{NOTHING_TO_VERIFY_SUMMARY, VERIFICATION_FAILED_SUMMARY};
use replay_coach::{ReplayDataset, VideoReference};

type Handler = Box<dyn Fn(usize, &InvokeRequest) -> Result<InvokeResponse, ProviderError> + Send + Sync>;

/// Gateway double that records every request and answers through `handler`.
struct FakeGateway {
    handler: Handler,
    delay: Option<Duration>,
    requests: Mutex<Vec<InvokeRequest>>,
}

impl FakeGateway {
    fn new(
        handler: impl Fn(usize, &InvokeRequest) -> Result<InvokeResponse, ProviderError>
            + Send
            + Sync
            + 'static,
    ) -> Arc<Self> {
        Self::delayed(None, handler)
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Self::delayed(Some(delay), |_, _| Ok(InvokeResponse::text("{}", 0)))
    }

    fn delayed(
        delay: Option<Duration>,
        handler: impl Fn(usize, &InvokeRequest) -> Result<InvokeResponse, ProviderError>
            + Send
            + Sync
            + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            delay,
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<InvokeRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelGateway for FakeGateway {
    async fn invoke(&self, req: InvokeRequest) -> Result<InvokeResponse, ProviderError> {
        let n = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(req.clone());
            requests.len() - 1
        };
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.handler)(n, &req)
    }
}

/// Three 60 s rounds at 64 ticks/s; the subject dies 45 s into round 2 (video 1:45).
fn dataset() -> ReplayDataset {
    ReplayDataset::from_json(
        r#"{
          "game": "cs2",
          "map": "de_mirage",
          "subject": "hero",
          "players": [
            {"name": "hero", "starting_side": "CT", "stats": {"kills": 2, "deaths": 1}},
            {"name": "villain", "starting_side": "T", "stats": {"kills": 1}}
          ],
          "rounds": [
            {"number": 1, "start_tick": 0, "end_tick": 3840, "winner": "CT"},
            {"number": 2, "start_tick": 3840, "end_tick": 7680, "winner": "T"},
            {"number": 3, "start_tick": 7680, "end_tick": 11520, "winner": "CT"}
          ],
          "events": [
            {"kind": "kill", "round": 1, "tick": 1920, "actor": "hero", "target": "villain", "detail": "ak47", "headshot": true},
            {"kind": "kill", "round": 2, "tick": 6720, "actor": "villain", "target": "hero", "detail": "awp"},
            {"kind": "kill", "round": 3, "tick": 9600, "actor": "hero", "target": "villain", "detail": "m4a1"}
          ],
          "clock": {"mode": "ticks", "tick_rate": 64}
        }"#,
    )
    .unwrap()
}

fn video() -> VideoReference {
    VideoReference::new("files/match-1", "match-1")
}

const OBSERVER_TEXT: &str = r#"```json
{"tips": [
  {"id": "tip_001", "timestamp": {"video_seconds": 30, "display": "0:30"}, "category": "aim",
   "severity": "important", "observation": "Pre-aimed the long angle at head height.",
   "why_it_matters": "Won the duel instantly.", "fix": "Keep doing it on every angle."},
  {"id": "tip_002", "timestamp": {"video_seconds": 110, "display": "1:50"}, "category": "positioning",
   "severity": "critical", "observation": "Stood in the open on B site.",
   "why_it_matters": "Easy pick.", "fix": "Hold from cover."},
  {"id": "tip_003", "timestamp": {"video_seconds": 150, "display": "2:30"}, "category": "utility",
   "severity": "minor", "observation": "Did not flash before peeking.",
   "why_it_matters": "Fair fights are coin flips.", "fix": "Pop-flash for yourself."}
]}
```"#;

const VALIDATOR_TEXT: &str = r#"{
  "verified_tips": [
    {"id": "tip_001", "timestamp": {"video_seconds": 30, "display": "0:30"}, "category": "aim",
     "severity": "important", "tip_text": "Your crosshair was already on the head at 0:30; keep that habit.",
     "confidence": 9, "verification_notes": "Kill with ak47 at 0:30 matches.", "source": "observer"},
    {"id": "tip_003", "confidence": 6, "verification_notes": "Flash not clearly visible."}
  ],
  "removed_tips": [],
  "summary_text": "Strong crosshair discipline in round one. Keep pre-aiming common angles and the rest of your duels will follow."
}"#;

fn config() -> PipelineConfig {
    PipelineConfig {
        retry_base_delay_ms: 0,
        ..PipelineConfig::default()
    }
}

fn observer_then_validator(validator_text: &'static str) -> Arc<FakeGateway> {
    FakeGateway::new(move |n, req| match n {
        0 => Ok(InvokeResponse::text(OBSERVER_TEXT, 0).with_interaction("obs-1")),
        _ => {
            assert_eq!(req.attribution.caller, "validator");
            Ok(InvokeResponse::text(validator_text, 0).with_interaction("val-1"))
        }
    })
}

#[tokio::test]
async fn full_run_verifies_filters_and_reports() {
    let gateway = observer_then_validator(VALIDATOR_TEXT);
    let pipeline = CoachingPipeline::new(gateway.clone(), config()).unwrap();

    let result = pipeline.analyze(&dataset(), &video()).await;

    assert_eq!(result.status, AnalysisStatus::Completed);
    let ids: Vec<&str> = result.verified_tips.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["tip_001"]);
    assert_eq!(result.verified_tips[0].confidence, 9);
    assert!(result.summary_text.starts_with("Strong crosshair discipline"));
    let len = result.summary_text.chars().count();
    assert!((100..=300).contains(&len));

    let meta = &result.metadata;
    assert_eq!(meta.stage_reached, Stage::Done);
    assert_eq!(meta.observer_tips_count, 3);
    assert_eq!(meta.prefiltered_count, 1);
    assert_eq!(meta.validator_removed_count, 1);
    assert_eq!(meta.final_tips_count, 1);
    assert!(meta.validator_called);
    assert_eq!(meta.observer_raw_output, OBSERVER_TEXT);
    assert_eq!(meta.timeline.as_ref().unwrap().windows.len(), 3);

    // Scenario: a tip 50 s into round 2 lands after the 45 s death.
    let prefiltered = meta
        .removed_tips
        .iter()
        .find(|r| r.id == "tip_002")
        .unwrap();
    assert_eq!(prefiltered.stage, RejectionStage::Prefilter);
    assert_eq!(prefiltered.confidence, 0);
    assert!(prefiltered.reason.contains("Round 2"), "{}", prefiltered.reason);
    assert!(prefiltered.reason.contains("1:45"), "{}", prefiltered.reason);
    let low = meta.removed_tips.iter().find(|r| r.id == "tip_003").unwrap();
    assert_eq!(low.stage, RejectionStage::Validator);
    assert_eq!(low.confidence, 6);

    let requests = gateway.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].attribution.caller, "observer");
    assert!(requests[0].sends_video());
    assert!(requests[0].system.contains("<game_knowledge game=\"cs2\">"));
    assert!(requests[1].system.contains("<game_knowledge game=\"cs2\">"));
    assert_eq!(requests[0].attribution.analysis_id, Some(meta.analysis_id));
    let chain = requests[1].chain.as_ref().unwrap();
    assert_eq!(chain.interaction_id, "obs-1");
    assert!(requests[1].prompt.contains("### tip_001 [0:30]"));
    assert!(requests[1].prompt.contains("### tip_003 [2:30]"));
    assert!(!requests[1].prompt.contains("### tip_002"));
}

#[tokio::test]
async fn unparsable_validator_output_yields_no_tips_and_fallback_summary() {
    let gateway = observer_then_validator("I'm sorry, I couldn't review the clip this time.");
    let pipeline = CoachingPipeline::new(gateway, config()).unwrap();

    let result = pipeline.analyze(&dataset(), &video()).await;

    assert!(result.is_completed());
    assert!(result.verified_tips.is_empty());
    assert_eq!(result.summary_text, VERIFICATION_FAILED_SUMMARY);
    assert_eq!(result.metadata.final_tips_count, 0);
}

#[tokio::test]
async fn validator_is_skipped_when_nothing_survives_prefilter() {
    let gateway = FakeGateway::new(|_, _| {
        Ok(InvokeResponse::text(
            r#"[{"id": "late", "timestamp": "1:50", "observation": "Over-peeked after dying."}]"#,
            0,
        ))
    });
    let pipeline = CoachingPipeline::new(gateway.clone(), config()).unwrap();

    let result = pipeline.analyze(&dataset(), &video()).await;

    assert!(result.is_completed());
    assert_eq!(gateway.requests().len(), 1);
    assert!(!result.metadata.validator_called);
    assert_eq!(result.metadata.prefiltered_count, 1);
    assert_eq!(result.summary_text, NOTHING_TO_VERIFY_SUMMARY);
}

#[tokio::test]
async fn exhausted_credentials_fail_the_analysis_without_retry() {
    let gateway = FakeGateway::new(|_, _| Err(ProviderError::exhausted(2, None)));
    let pipeline = CoachingPipeline::new(gateway.clone(), config()).unwrap();

    let result = pipeline.analyze(&dataset(), &video()).await;

    match &result.status {
        AnalysisStatus::Failed { stage, code, .. } => {
            assert_eq!(*stage, Stage::Observing);
            assert_eq!(code, "all_providers_exhausted");
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(gateway.requests().len(), 1);
    assert!(result.verified_tips.is_empty());
    assert!(result.metadata.timeline.is_some());
    let len = result.summary_text.chars().count();
    assert!((100..=300).contains(&len));
}

#[tokio::test]
async fn transient_observer_failure_is_retried_once() {
    let gateway = FakeGateway::new(|n, _| match n {
        0 => Err(ProviderError::provider("gemini", "502 bad gateway", true)),
        1 => Ok(InvokeResponse::text(OBSERVER_TEXT, 0).with_interaction("obs-1")),
        _ => Ok(InvokeResponse::text(VALIDATOR_TEXT, 0)),
    });
    let pipeline = CoachingPipeline::new(gateway.clone(), config()).unwrap();

    let result = pipeline.analyze(&dataset(), &video()).await;

    assert!(result.is_completed(), "{:?}", result.status);
    assert_eq!(gateway.requests().len(), 3);
    assert_eq!(result.verified_tips.len(), 1);
}

#[tokio::test]
async fn repeated_transient_failure_surfaces_after_retries() {
    let gateway = FakeGateway::new(|_, _| Err(ProviderError::provider("gemini", "503", true)));
    let pipeline = CoachingPipeline::new(gateway.clone(), config()).unwrap();

    let result = pipeline.analyze(&dataset(), &video()).await;

    match &result.status {
        AnalysisStatus::Failed { stage, code, .. } => {
            assert_eq!(*stage, Stage::Observing);
            assert_eq!(code, "provider_error");
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(gateway.requests().len(), 2);
}

#[tokio::test]
async fn cancelled_analysis_makes_no_calls_and_leaves_pipeline_usable() {
    let gateway = observer_then_validator(VALIDATOR_TEXT);
    let pipeline = CoachingPipeline::new(gateway.clone(), config()).unwrap();
    let cancel_flag = AtomicBool::new(true);

    let result = pipeline
        .analyze_with_cancel(&dataset(), &video(), Some(&cancel_flag))
        .await;

    match &result.status {
        AnalysisStatus::Failed { stage, code, .. } => {
            assert_eq!(*stage, Stage::BuildingTimeline);
            assert_eq!(code, "cancelled");
        }
        other => panic!("expected cancellation, got {other:?}"),
    }
    assert!(gateway.requests().is_empty());

    let later = pipeline.analyze(&dataset(), &video()).await;
    assert!(later.is_completed(), "{:?}", later.status);
}

#[tokio::test(start_paused = true)]
async fn cancelling_one_spawned_run_leaves_its_sibling_running() {
    let gateway = FakeGateway::delayed(Some(Duration::from_secs(5)), |_, req| {
        match req.attribution.caller {
            "observer" => Ok(InvokeResponse::text(OBSERVER_TEXT, 0).with_interaction("obs")),
            _ => Ok(InvokeResponse::text(VALIDATOR_TEXT, 0)),
        }
    });
    let pipeline = Arc::new(CoachingPipeline::new(gateway, config()).unwrap());

    let doomed = pipeline.spawn(dataset(), video());
    let sibling = pipeline.spawn(dataset(), video());
    doomed.cancel();

    let doomed = doomed.join().await.unwrap();
    let sibling = sibling.join().await.unwrap();

    match &doomed.status {
        AnalysisStatus::Failed { code, .. } => assert_eq!(code, "cancelled"),
        other => panic!("expected cancellation, got {other:?}"),
    }
    assert!(sibling.is_completed(), "{:?}", sibling.status);
    assert_eq!(sibling.verified_tips.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn deadline_bounds_a_hung_stage() {
    let gateway = FakeGateway::slow(Duration::from_secs(3_600));
    let pipeline = CoachingPipeline::new(
        gateway,
        PipelineConfig {
            deadline_seconds: Some(30),
            ..config()
        },
    )
    .unwrap();

    let result = pipeline.analyze(&dataset(), &video()).await;

    match &result.status {
        AnalysisStatus::Failed { stage, code, .. } => {
            assert_eq!(*stage, Stage::Observing);
            assert_eq!(code, "deadline_exceeded");
        }
        other => panic!("expected deadline failure, got {other:?}"),
    }
}

#[tokio::test]
async fn unrepresentable_deadline_means_no_deadline() {
    let pipeline = CoachingPipeline::new(
        observer_then_validator(VALIDATOR_TEXT),
        PipelineConfig {
            deadline_seconds: Some(u64::MAX),
            ..config()
        },
    )
    .unwrap();

    let result = pipeline.analyze(&dataset(), &video()).await;
    assert!(result.is_completed(), "{:?}", result.status);
}

#[tokio::test]
async fn spawned_and_batched_runs_complete_independently() {
    let gateway = FakeGateway::new(|_, req| match req.attribution.caller {
        "observer" => Ok(InvokeResponse::text(OBSERVER_TEXT, 0).with_interaction("obs")),
        _ => Ok(InvokeResponse::text(VALIDATOR_TEXT, 0)),
    });
    let pipeline = Arc::new(CoachingPipeline::new(gateway.clone(), config()).unwrap());

    let spawned = pipeline.spawn(dataset(), video()).join().await.unwrap();
    assert!(spawned.is_completed());

    let jobs = vec![(dataset(), video()), (dataset(), video()), (dataset(), video())];
    let results = pipeline.analyze_batch(&jobs, 2, None).await;
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.is_completed()));
    assert!(results.iter().all(|r| r.verified_tips.len() == 1));

    let mut ids: Vec<_> = results.iter().map(|r| r.metadata.analysis_id).collect();
    ids.push(spawned.metadata.analysis_id);
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 4);
    assert_eq!(gateway.requests().len(), 8);
}

#[tokio::test]
async fn result_serializes_with_status_and_metadata() {
    let pipeline = CoachingPipeline::new(observer_then_validator(VALIDATOR_TEXT), config()).unwrap();
    let result = pipeline.analyze(&dataset(), &video()).await;

    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["status"]["state"], "completed");
    assert_eq!(json["metadata"]["stage_reached"], "done");
    assert_eq!(json["verified_tips"][0]["timestamp"]["display"], "0:30");
    assert_eq!(json["verified_tips"][0]["timestamp"]["video_seconds"], serde_json::json!(30));
    assert!(json["verified_tips"][0]["timestamp"]["video_seconds"].is_u64());
    assert!(json["metadata"]["removed_tips"].as_array().unwrap().len() == 2);
}

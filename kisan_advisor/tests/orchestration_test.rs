//! End-to-end coordination behaviour against the scripted engine.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use kisan_advisor::{
    capability::InvocationPolicy,
    catalog::names::{self, keys},
    coordinator::{
        self,
        critic::REJECTION_MESSAGE,
        parallel::{kisan_parallel, market_and_scheme},
        pipeline::kisan_sequential,
        CapabilitySet, Gate, GateDecision, SelfCritic,
    },
    engine::{InvocationResult, ScriptedEngine},
    tool::ToolAdapter,
    Catalog, ExecutionEngine, Orchestrator, Media, OrchestrationError, Query, Settings,
};
use proptest::prelude::*;
use tracing_test::traced_test;

fn capabilities(engine: &Arc<ScriptedEngine>) -> CapabilitySet {
    let engine: Arc<dyn ExecutionEngine> = engine.clone();
    CapabilitySet::new(&Catalog::builtin(), engine, InvocationPolicy::default())
}

fn orchestrator(engine: &Arc<ScriptedEngine>, strategy: &str) -> Orchestrator {
    let mut settings = Settings::offline();
    settings.orchestrator.strategy = strategy.to_string();
    Orchestrator::with_engine(&settings, engine.clone()).unwrap()
}

#[tokio::test]
#[traced_test]
async fn sequential_steps_only_see_earlier_outputs() {
    let engine = Arc::new(ScriptedEngine::offline_demo());
    let pipeline = kisan_sequential(&capabilities(&engine)).unwrap();
    let run = pipeline.run(&Query::text("My tomato leaves have brown spots")).await.unwrap();

    let mut available: HashSet<String> = HashSet::from([keys::QUERY.to_string()]);
    for record in &run.steps {
        for key in &record.visible_keys {
            assert!(available.contains(key), "{} saw {} before it was written", record.step, key);
        }
        if let Some(key) = &record.wrote {
            available.insert(key.clone());
        }
    }
    assert_eq!(run.steps[0].visible_keys, [keys::QUERY]);
    assert!(run.failed.is_empty());
}

#[tokio::test]
#[traced_test]
async fn failed_branch_does_not_sink_the_fan_out() {
    let engine = Arc::new(
        ScriptedEngine::offline_demo()
            .on(names::SCHEME, |_| vec![InvocationResult::error("quota exceeded")]),
    );
    let caps = capabilities(&engine);

    let outcome = market_and_scheme(&caps)
        .unwrap()
        .run(Query::text("tomato"))
        .await
        .unwrap();
    assert_eq!(outcome.failed(), [names::SCHEME]);
    assert!(outcome.succeeded()[names::MARKET].contains("Hold"));
    match outcome.into_result() {
        Err(OrchestrationError::PartialFailure { failed, succeeded }) => {
            assert_eq!(failed, [names::SCHEME]);
            assert!(succeeded.contains_key(names::MARKET));
        }
        other => panic!("expected partial failure, got {:?}", other),
    }

    let run = kisan_parallel(&caps).unwrap().run(&Query::text("tomato")).await.unwrap();
    assert_eq!(run.failed, [names::SCHEME]);
    let scheme = run.session.get(keys::SCHEME_JSON).unwrap();
    assert!(scheme.starts_with("Error from SchemeNavigatorAgent"));
    assert!(run.output.contains("Hold"));
}

#[tokio::test]
#[traced_test]
async fn failing_tool_becomes_text_for_the_caller() {
    let engine = Arc::new(
        ScriptedEngine::new().on(names::MARKET, |_| vec![InvocationResult::error("upstream 503")]),
    );
    let adapter = ToolAdapter::new(names::tools::MARKET, capabilities(&engine).get(names::MARKET).unwrap());

    for _ in 0..3 {
        let text = adapter.invoke(Query::text("onion price")).await;
        assert!(text.contains("Error from MarketAnalysisAgent"));
        assert!(text.contains("upstream 503"));
    }
    let sessions: HashSet<_> = engine.calls(names::MARKET).into_iter().map(|r| r.session_id).collect();
    assert_eq!(sessions.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_runs_keep_their_sessions_apart() {
    let engine = Arc::new(
        ScriptedEngine::new()
            .on(names::STEP_DIAGNOSE, |req| {
                vec![InvocationResult::final_text(format!("diag{}", req.user_text()))]
            })
            .on(names::STEP_MARKET, |req| {
                vec![InvocationResult::final_text(format!("market[{}]", req.instruction))]
            })
            .on(names::STEP_SUMMARIZE, |req| {
                vec![InvocationResult::final_text(req.instruction.clone())]
            })
            .with_latency(names::STEP_DIAGNOSE, Duration::from_millis(20)),
    );
    let pipeline = Arc::new(kisan_sequential(&capabilities(&engine)).unwrap());

    let runs = (0..12).map(|i| {
        let pipeline = pipeline.clone();
        async move {
            let query = Query::text(format!("<q-{}|>", i));
            (i, pipeline.run(&query).await.unwrap())
        }
    });
    for (i, run) in join_all(runs).await {
        assert!(run.output.contains(&format!("<q-{}|>", i)));
        for j in (0..12).filter(|j| *j != i) {
            assert!(!run.output.contains(&format!("<q-{}|>", j)), "run {} leaked {}", i, j);
        }
    }
}

#[tokio::test]
#[traced_test]
async fn price_question_goes_to_market_only() {
    let engine = Arc::new(ScriptedEngine::offline_demo());
    let answer = orchestrator(&engine, "dispatcher")
        .handle(Query::text("What is the tomato price in Hubli?"))
        .await
        .unwrap();

    assert_eq!(engine.call_count(names::MARKET), 1);
    assert_eq!(engine.call_count(names::DIAGNOSIS), 0);
    assert_eq!(engine.call_count(names::SCHEME), 0);
    assert!(answer.contains("Hold") || answer.contains("Sell"));
    assert!(!answer.trim_start().starts_with('{'));
}

#[tokio::test]
#[traced_test]
async fn photo_is_described_before_diagnosis() {
    let engine = Arc::new(ScriptedEngine::offline_demo());
    let query = Query::media(Media::new("image/jpeg", vec![0xFF, 0xD8, 0xFF]));
    let answer = orchestrator(&engine, "dispatcher").handle(query).await.unwrap();

    let coordinator_calls = engine.calls(names::ORCHESTRATOR);
    assert!(coordinator_calls[0].has_media());

    let diagnosis_calls = engine.calls(names::DIAGNOSIS);
    assert_eq!(diagnosis_calls.len(), 1);
    assert!(!diagnosis_calls[0].has_media());
    assert!(diagnosis_calls[0].user_text().contains("concentric rings"));

    assert!(answer.contains("Early blight"));
    assert!(serde_json::from_str::<serde_json::Value>(&answer).is_err());
}

#[tokio::test]
#[traced_test]
async fn failed_review_withholds_the_summary() {
    let engine = Arc::new(ScriptedEngine::offline_demo().reply(names::REVIEWER, "fail"));
    let critic = SelfCritic::kisan(&capabilities(&engine)).unwrap();
    let query = Query::text("Tomato leaves yellowing, also what's the price in Mandya?");

    let (session, decision) = critic.evaluate(&query).await.unwrap();
    assert_eq!(decision, GateDecision::Rejected);
    assert_eq!(session.get(keys::REVIEW_STATUS), Some("fail"));
    let summary = session.get(keys::SUMMARY).unwrap().to_string();
    assert!(!summary.is_empty());

    let message = orchestrator(&engine, "self_critic").handle(query).await.unwrap();
    assert_eq!(message, REJECTION_MESSAGE);
    assert!(!message.contains(&summary));
}

#[tokio::test]
async fn every_strategy_answers_offline() {
    for strategy in ["dispatcher", "sequential", "parallel", "self_critic"] {
        let engine = Arc::new(ScriptedEngine::offline_demo());
        let settings = Settings::offline();
        let caps = capabilities(&engine);
        let coordinator = coordinator::build(strategy.parse().unwrap(), &caps, &settings).unwrap();
        let answer = coordinator.handle(Query::text("tomato blight")).await.unwrap();
        assert!(!answer.is_empty(), "{} gave an empty answer", strategy);
    }
}

proptest! {
    #[test]
    fn gate_accepts_only_an_exact_pass(verdict in "\\PC{0,12}", summary in "[a-z ]{0,24}") {
        let state: HashMap<String, String> = [
            (keys::REVIEW_STATUS.to_string(), verdict.clone()),
            (keys::SUMMARY.to_string(), summary.clone()),
        ]
        .into_iter()
        .collect();

        let first = Gate::decide(&state);
        prop_assert_eq!(&first, &Gate::decide(&state));
        if verdict == "pass" {
            prop_assert_eq!(first, GateDecision::Accepted(summary));
        } else {
            prop_assert_eq!(first, GateDecision::Rejected);
        }
    }
}

#[cfg(test)]
mod integration_tests {
    use crate::config::{PipelineConfig, PoolConfig, StageDefinition};
    use crate::errors::{PipelineError, PoolError};
    use crate::pipeline::{
        Pipeline, PipelineEvent, PipelineOptions, PipelineStatus, StageConfig, StageStatus, TimelineKind,
    };
    use crate::pool::{TaskScope, WorkerPool};
    use crate::protocol::Progress;
    use crate::traits::{from_async_fn, from_fn, FunctionError};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn number(x: &Value) -> Result<i64, FunctionError> {
        x.as_i64().ok_or_else(|| FunctionError::new("expected an integer"))
    }

    fn pool() -> WorkerPool {
        let pool = WorkerPool::new(PoolConfig::default().with_max_workers(2)).unwrap();
        pool.register("add_one", from_fn(|x: Value| Ok(json!(number(&x)? + 1))));
        pool.register("double", from_fn(|x: Value| Ok(json!(number(&x)? * 2))));
        pool.register("fail", from_fn(|_x: Value| Err(FunctionError::new("stage exploded"))));
        pool.register(
            "slow_add_one",
            from_async_fn(|x: Value, _scope: TaskScope| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, FunctionError>(json!(number(&x)? + 1))
            }),
        );
        pool
    }

    fn options(stop_on_error: bool) -> PipelineOptions {
        PipelineOptions {
            name: "test".to_string(),
            stop_on_error,
        }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Test that each stage's output feeds the next
    #[tokio::test]
    async fn test_sequencing() {
        let stages = (1..=3).map(|i| StageConfig::new(format!("inc{}", i), "add_one")).collect();
        let pipeline = Pipeline::new(pool(), stages, options(true));

        let result = pipeline.run(json!(0)).await.unwrap();

        assert_eq!(result.output, json!(3));
        assert_eq!(result.stage_results, vec![json!(1), json!(2), json!(3)]);
        assert!(result.failed_stages.is_empty());
        assert_eq!(pipeline.status(), PipelineStatus::Completed);
        assert_eq!(pipeline.stage_results(), vec![json!(1), json!(2), json!(3)]);
        assert_eq!(pipeline.output(), Some(json!(3)));
        assert_eq!(pipeline.progress(), 1.0);
        assert!(pipeline.stages().iter().all(|s| s.status == StageStatus::Completed));
    }

    /// Test that a stage failing once then succeeding completes with one retry recorded
    #[tokio::test]
    async fn test_retry_then_succeed() {
        let pool = pool();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        pool.register(
            "flaky",
            from_fn(move |x: Value| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(FunctionError::new("first call fails"))
                } else {
                    Ok(x)
                }
            }),
        );
        let stages = vec![StageConfig::new("flaky", "flaky").with_retries(2, Duration::from_millis(10))];
        let pipeline = Pipeline::new(pool, stages, options(true));

        let result = pipeline.run(json!("payload")).await.unwrap();

        assert_eq!(result.output, json!("payload"));
        assert_eq!(pipeline.status(), PipelineStatus::Completed);
        let stage = &pipeline.stages()[0];
        assert_eq!(stage.status, StageStatus::Completed);
        assert_eq!(stage.retry_count, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(pipeline
            .report()
            .timeline
            .iter()
            .any(|event| event.kind == TimelineKind::Retrying));
    }

    /// Test that exhausting retries fails the run with the stage error
    #[tokio::test]
    async fn test_stop_on_error() {
        let stages = vec![
            StageConfig::new("inc", "add_one"),
            StageConfig::new("boom", "fail").with_retries(1, Duration::from_millis(5)),
            StageConfig::new("dbl", "double"),
        ];
        let pipeline = Pipeline::new(pool(), stages, options(true));

        let error = pipeline.run(json!(1)).await.unwrap_err();

        match &error {
            PipelineError::StageFailure {
                stage_id,
                attempts,
                source,
            } => {
                assert_eq!(stage_id, "boom");
                assert_eq!(*attempts, 2);
                assert!(matches!(source, PoolError::TaskExecution { message, .. } if message == "stage exploded"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(pipeline.status(), PipelineStatus::Failed);
        assert_eq!(pipeline.error(), Some(error));
        let stages = pipeline.stages();
        assert_eq!(stages[1].status, StageStatus::Failed);
        assert_eq!(stages[1].retry_count, 1);
        assert_eq!(stages[2].status, StageStatus::Pending);
        assert_eq!(pipeline.stage_results(), vec![json!(2)]);
    }

    /// Test that a tolerated failure carries the last produced value forward
    #[tokio::test]
    async fn test_continue_on_error() {
        let stages = vec![
            StageConfig::new("inc", "add_one"),
            StageConfig::new("boom", "fail"),
            StageConfig::new("dbl", "double"),
        ];
        let pipeline = Pipeline::new(pool(), stages, options(false));

        let result = pipeline.run(json!(1)).await.unwrap();

        assert_eq!(result.output, json!(4));
        assert_eq!(result.stage_results, vec![json!(2), json!(4)]);
        assert_eq!(result.failed_stages, vec!["boom".to_string()]);
        assert_eq!(pipeline.status(), PipelineStatus::Completed);
        assert_eq!(pipeline.stages()[1].status, StageStatus::Failed);
        assert_eq!(pipeline.stages()[2].input, Some(json!(2)));
    }

    /// Test that a skipped stage passes the previous output through
    #[tokio::test]
    async fn test_skip_carries_forward() {
        let stages = vec![
            StageConfig::new("inc", "add_one"),
            StageConfig::new("skipped", "double").skip_when(|carry, _previous| carry.as_i64() == Some(6)),
            StageConfig::new("inc2", "add_one"),
        ];
        let pipeline = Pipeline::new(pool(), stages, options(true));

        let result = pipeline.run(json!(5)).await.unwrap();

        assert_eq!(result.stage_results, vec![json!(6), json!(6), json!(7)]);
        assert_eq!(result.output, json!(7));
        let stages = pipeline.stages();
        assert_eq!(stages[1].status, StageStatus::Skipped);
        assert_eq!(stages[1].output, Some(json!(6)));
        assert_eq!(stages[2].input, Some(json!(6)));
    }

    /// Test input and output transforms around a stage
    #[tokio::test]
    async fn test_transforms() {
        let stages = vec![
            StageConfig::new("inc", "add_one"),
            StageConfig::new("sum", "double")
                .transform_input(|carry, previous| json!(carry.as_i64().unwrap_or(0) + previous.len() as i64))
                .transform_output(|output| json!({ "value": output })),
        ];
        let pipeline = Pipeline::new(pool(), stages, options(true));

        let result = pipeline.run(json!(1)).await.unwrap();

        // (2 + 1 previous result) * 2
        assert_eq!(result.output, json!({ "value": 6 }));
        assert_eq!(pipeline.stages()[1].input, Some(json!(3)));
    }

    /// Test that cancel stops the run in flight
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_running_stage() {
        let stages = vec![StageConfig::new("slow", "slow_add_one"), StageConfig::new("dbl", "double")];
        let pipeline = Pipeline::new(pool(), stages, options(true));

        let run = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.run(json!(1)).await })
        };
        wait_for(|| pipeline.current_stage() == Some(0)).await;
        pipeline.cancel();

        assert_eq!(run.await.unwrap().unwrap_err(), PipelineError::PipelineCancelled);
        assert_eq!(pipeline.status(), PipelineStatus::Cancelled);
        assert_eq!(pipeline.stages()[1].status, StageStatus::Pending);
        assert!(pipeline.stage_results().is_empty());
    }

    /// Test that a new run supersedes the one in progress
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_new_run_cancels_previous() {
        let stages = vec![StageConfig::new("slow", "slow_add_one")];
        let pipeline = Pipeline::new(pool(), stages, options(true));

        let first = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.run(json!(1)).await })
        };
        wait_for(|| pipeline.current_stage() == Some(0)).await;

        let second = pipeline.run(json!(10)).await.unwrap();

        assert_eq!(first.await.unwrap().unwrap_err(), PipelineError::PipelineCancelled);
        assert_eq!(second.output, json!(11));
        assert_eq!(pipeline.status(), PipelineStatus::Completed);
        assert_eq!(pipeline.stage_results(), vec![json!(11)]);
    }

    /// Test that pause holds the next stage until resume
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pause_and_resume() {
        let stages = vec![StageConfig::new("slow", "slow_add_one"), StageConfig::new("dbl", "double")];
        let pipeline = Pipeline::new(pool(), stages, options(true));

        let run = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.run(json!(1)).await })
        };
        wait_for(|| pipeline.current_stage() == Some(0)).await;
        pipeline.pause();
        assert_eq!(pipeline.status(), PipelineStatus::Paused);

        // The running stage finishes, the next one waits at the gate
        wait_for(|| pipeline.stages()[0].status == StageStatus::Completed).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pipeline.stages()[1].status, StageStatus::Pending);

        pipeline.resume();
        let result = run.await.unwrap().unwrap();
        assert_eq!(result.output, json!(4));
        assert_eq!(pipeline.status(), PipelineStatus::Completed);
    }

    /// Test that cancelling a paused run does not deadlock
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_while_paused() {
        let stages = vec![StageConfig::new("slow", "slow_add_one"), StageConfig::new("dbl", "double")];
        let pipeline = Pipeline::new(pool(), stages, options(true));

        let run = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.run(json!(1)).await })
        };
        wait_for(|| pipeline.current_stage() == Some(0)).await;
        pipeline.pause();
        wait_for(|| pipeline.stages()[0].status == StageStatus::Completed).await;

        pipeline.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(2), run).await.unwrap().unwrap();
        assert_eq!(outcome.unwrap_err(), PipelineError::PipelineCancelled);
        assert_eq!(pipeline.status(), PipelineStatus::Cancelled);
    }

    /// Test resuming from the first failed stage
    #[tokio::test]
    async fn test_retry_from_failed_stage() {
        let pool = pool();
        let healthy = Arc::new(AtomicU32::new(0));
        let flag = healthy.clone();
        pool.register(
            "gated",
            from_fn(move |x: Value| {
                if flag.load(Ordering::SeqCst) == 0 {
                    Err(FunctionError::new("not yet"))
                } else {
                    Ok(json!(number(&x)? * 10))
                }
            }),
        );
        let stages = vec![
            StageConfig::new("inc", "add_one"),
            StageConfig::new("gated", "gated"),
            StageConfig::new("dbl", "double"),
        ];
        let pipeline = Pipeline::new(pool, stages, options(true));

        assert!(pipeline.run(json!(1)).await.is_err());
        assert_eq!(pipeline.retry().await.unwrap_err().to_string(), "Stage 'gated' failed after 1 attempt(s): Task 'gated' failed: not yet");

        healthy.store(1, Ordering::SeqCst);
        let result = pipeline.retry().await.unwrap();

        assert_eq!(result.output, json!(40));
        assert_eq!(result.stage_results, vec![json!(2), json!(20), json!(40)]);
        assert_eq!(pipeline.status(), PipelineStatus::Completed);
        assert_eq!(pipeline.retry().await.unwrap_err(), PipelineError::NothingToRetry);
    }

    /// Test that retry is refused while a run is active
    #[tokio::test]
    async fn test_retry_while_running() {
        let stages = vec![StageConfig::new("slow", "slow_add_one")];
        let pipeline = Pipeline::new(pool(), stages, options(true));

        let run = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.run(json!(1)).await })
        };
        wait_for(|| pipeline.current_stage() == Some(0)).await;

        assert_eq!(pipeline.retry().await.unwrap_err(), PipelineError::AlreadyRunning);
        run.await.unwrap().unwrap();
    }

    /// Test that progress reported by a function reaches the overall pipeline progress
    #[tokio::test]
    async fn test_progress_events() {
        let pool = pool();
        pool.register(
            "halfway",
            from_async_fn(|x: Value, scope: TaskScope| async move {
                scope.report_progress(Progress::percent(50.0));
                Ok::<_, FunctionError>(x)
            }),
        );
        let stages = vec![StageConfig::new("inc", "add_one"), StageConfig::new("half", "halfway")];
        let pipeline = Pipeline::new(pool, stages, options(true));
        let mut events = pipeline.subscribe();

        pipeline.run(json!(1)).await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(matches!(seen.first(), Some(PipelineEvent::RunStarted { start_index: 0, .. })));
        assert!(seen.iter().any(|e| matches!(
            e,
            PipelineEvent::StageProgress { index: 1, overall, .. } if (*overall - 0.75).abs() < 1e-9
        )));
        assert!(matches!(
            seen.last(),
            Some(PipelineEvent::RunFinished {
                status: PipelineStatus::Completed,
                ..
            })
        ));
    }

    /// Test the report projection after a run
    #[tokio::test]
    async fn test_report() {
        let stages = vec![
            StageConfig::new("inc", "add_one").named("Increment"),
            StageConfig::new("skip", "double").skip_when(|_, _| true),
            StageConfig::new("dbl", "double"),
        ];
        let pipeline = Pipeline::new(pool(), stages, options(true));
        pipeline.run(json!(1)).await.unwrap();

        let report = pipeline.report();

        assert_eq!(report.name, "test");
        assert_eq!(report.status, PipelineStatus::Completed);
        assert_eq!(report.stages.len(), 3);
        assert_eq!(report.stages[0].name, "Increment");
        assert_eq!(report.stages[1].status, StageStatus::Skipped);
        let kinds: Vec<TimelineKind> = report.timeline.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TimelineKind::Started,
                TimelineKind::Completed,
                TimelineKind::Skipped,
                TimelineKind::Started,
                TimelineKind::Completed,
            ]
        );
        assert_eq!(report.insights.total_retries, 0);
        assert!(report.insights.slowest_stage.is_some());
        assert!(serde_json::to_string(&report).is_ok());
    }

    /// Test building a pipeline from configuration
    #[tokio::test]
    async fn test_from_config() {
        let config = PipelineConfig {
            name: "configured".to_string(),
            stop_on_error: true,
            stages: vec![
                StageDefinition {
                    id: "inc".into(),
                    name: None,
                    function: "add_one".into(),
                    max_retries: 0,
                    retry_delay_ms: 0,
                    timeout_ms: Some(5_000),
                    priority: Some(7),
                },
                StageDefinition {
                    id: "dbl".into(),
                    name: Some("Double".into()),
                    function: "double".into(),
                    max_retries: 1,
                    retry_delay_ms: 10,
                    timeout_ms: None,
                    priority: None,
                },
            ],
        };
        let pipeline = Pipeline::from_config(pool(), &config);

        let result = pipeline.run(json!(5)).await.unwrap();

        assert_eq!(pipeline.name(), "configured");
        assert_eq!(result.stage_results, vec![json!(6), json!(12)]);
        assert_eq!(result.output, json!(12));
    }
}

pub mod diff;
pub mod handlers;
pub mod task_context;
pub mod tools;
pub mod worker;

pub use handlers::{ExecuteError, HandlerError, HeartbeatFn, TaskRunner};
pub use task_context::{Step, TaskContext, WEB_BLOCKED_USER_MESSAGE};
pub use tools::{build_catalog_from_settings, ToolCatalog, ToolRuntime};
pub use worker::{generate_worker_id, StoreHeartbeat, Worker, WorkerConfig};

#[cfg(test)]
mod scenario_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use ferrite_providers::StubLlm;
    use ferrite_store::Store;
    use ferrite_types::{RunCreate, RunStatus};

    use crate::handlers::TaskRunner;
    use crate::worker::{Worker, WorkerConfig};

    async fn worker_for(store: Store) -> Worker {
        let runner = Arc::new(TaskRunner::new(
            store.clone(),
            None,
            Arc::new(StubLlm),
            json!({}),
            std::env::temp_dir(),
        ));
        Worker::new(store, runner, WorkerConfig::default())
    }

    /// Research report against the stub backends, end to end through the
    /// worker: search, two fetches, extract/dedupe/report, all ok.
    #[tokio::test]
    async fn research_report_end_to_end_with_stub_backend() {
        let store = Store::open_in_memory().await.unwrap();
        let worker = worker_for(store.clone()).await;
        let run = store
            .create_run(RunCreate {
                run_type: "research_report".to_string(),
                title: None,
                conversation_id: None,
                input: json!({"query": "x", "max_sources": 2, "settings_snapshot": {}}),
                parent_run_id: None,
            })
            .await
            .unwrap();
        worker.run_once().await.unwrap();
        let done = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(done.status, RunStatus::Succeeded);
        let output = done.output.unwrap();
        assert_eq!(output["ok"], true);
        let steps = output["steps"].as_array().unwrap();
        assert_eq!(steps[0]["name"], "tool.web.search");
        let fetch_count = steps
            .iter()
            .filter(|s| s["name"] == "tool.web.fetch")
            .count();
        assert_eq!(fetch_count, 2);
        let names: Vec<&str> = steps.iter().map(|s| s["name"].as_str().unwrap()).collect();
        assert_eq!(
            &names[names.len() - 3..],
            &["extract", "dedupe_rank", "write_report"]
        );
        let sources = output["artifacts"]["sources"].as_array().unwrap();
        assert_eq!(sources.len(), 2);
        assert!(sources.iter().all(|s| s["provider"] == "stub"));
        for evidence in output["artifacts"]["evidence"].as_array().unwrap() {
            let idx = evidence["source_index"].as_u64().unwrap();
            assert!(idx < 2);
        }
    }

    /// Worker A sits on an expired lease; worker B reclaims and completes;
    /// A's heartbeat fails and A never writes a terminal state.
    #[tokio::test]
    async fn heartbeat_preemption_scenario() {
        let store = Store::open_in_memory().await.unwrap();
        let run = store
            .create_run(RunCreate {
                run_type: "sleep".to_string(),
                title: None,
                conversation_id: None,
                input: json!({"seconds": 0}),
                parent_run_id: None,
            })
            .await
            .unwrap();
        // A claims with an instantly-expiring lease and goes silent
        store.claim_next("worker-a", 0).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        // B's claim loop promotes the expired run and bumps attempt
        let reclaimed = store.claim_next("worker-b", 60).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, run.id);
        assert_eq!(reclaimed.attempt, 2);

        // A wakes up: heartbeat false, so A abandons without any terminal
        // write (the worker loop treats this as lease-lost)
        assert!(!store.heartbeat(&run.id, "worker-a", 60).await.unwrap());
        // B finishes normally
        assert!(store
            .complete_success(&run.id, &json!({"ok": true}))
            .await
            .unwrap());
        let done = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(done.status, RunStatus::Succeeded);
    }
}

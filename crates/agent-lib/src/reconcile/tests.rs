//! Cycle-level tests against the in-memory runtime
//!
//! These tests verify:
//! - The web/db/cache scenario in grouped and rolling modes
//! - Single-flight and token release
//! - Rollback and failure isolation

use super::*;
use crate::error::{LockBusyError, RuntimeError};
use crate::models::{Action, ContainerFilter, ContainerRecord, CycleResult};
use crate::runtime::{LogStream, MemoryContainer, MemoryRuntime, RuntimeGateway};
use crate::service::CreateDirective;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn test_config() -> EngineConfig {
    EngineConfig {
        read_retry_delay: Duration::from_millis(1),
        ..Default::default()
    }
}

fn engine_with(runtime: &MemoryRuntime, config: EngineConfig) -> ReconciliationEngine {
    let runtime = Arc::new(runtime.clone());
    ReconciliationEngine::builder(runtime.clone(), runtime)
        .config(config)
        .build()
}

/// Seed a container whose registry digest is `old` and publish `latest`
fn seed(runtime: &MemoryRuntime, container: MemoryContainer, image: &str, latest: &str) {
    runtime.add_container(container.digest("sha256:old"));
    runtime.set_latest(image, latest);
}

fn index_of(calls: &[String], call: &str) -> usize {
    calls
        .iter()
        .position(|c| c == call)
        .unwrap_or_else(|| panic!("missing call {call} in {calls:?}"))
}

/// web (stale), db (fresh), cache (stale, depends on db)
fn scenario(db_latest: &str) -> MemoryRuntime {
    let runtime = MemoryRuntime::new();
    seed(&runtime, MemoryContainer::new("web", "nginx:1.25"), "nginx:1.25", "sha256:web-new");
    seed(&runtime, MemoryContainer::new("db", "postgres:16"), "postgres:16", db_latest);
    seed(
        &runtime,
        MemoryContainer::new("cache", "redis:7").depends_on(["db"]),
        "redis:7",
        "sha256:cache-new",
    );
    runtime
}

mod scenario_tests {
    use super::*;

    #[tokio::test]
    async fn test_end_to_end_scenario() {
        let runtime = scenario("sha256:old");
        let engine = engine_with(&runtime, test_config());

        let result = engine.run_cycle(CycleRequest::update()).await.unwrap();

        assert_eq!(result.scanned, 3);
        assert_eq!(result.updated, 2);
        assert_eq!(result.failed, 0);
        assert_eq!(result.skipped, 1);
        assert_eq!(result.stale, vec!["web", "cache"]);
        assert!(!result.is_fault());

        let calls = runtime.calls();
        assert!(!calls.contains(&"stop:db".to_string()));
        assert_eq!(
            runtime.container("web").unwrap().current_digest.as_deref(),
            Some("sha256:web-new")
        );
        assert_eq!(
            result.actions_for("cache"),
            vec![Action::Pull, Action::Stop, Action::Recreate, Action::Start]
        );
    }

    #[tokio::test]
    async fn test_rolling_restarts_db_before_cache_stops() {
        let runtime = scenario("sha256:db-new");
        let engine = engine_with(
            &runtime,
            EngineConfig {
                rolling_restart: true,
                ..test_config()
            },
        );

        let result = engine.run_cycle(CycleRequest::update()).await.unwrap();

        assert_eq!(result.scanned, 3);
        assert_eq!(result.updated, 3);
        assert_eq!(result.failed, 0);

        let calls = runtime.calls();
        assert!(index_of(&calls, "start:db") < index_of(&calls, "stop:cache"));
    }

    #[tokio::test]
    async fn test_grouped_ordering_follows_dependencies() {
        let runtime = MemoryRuntime::new();
        seed(
            &runtime,
            MemoryContainer::new("b", "app-b:1").depends_on(["a"]),
            "app-b:1",
            "sha256:b-new",
        );
        seed(&runtime, MemoryContainer::new("a", "app-a:1"), "app-a:1", "sha256:a-new");
        let engine = engine_with(&runtime, test_config());

        let result = engine.run_cycle(CycleRequest::update()).await.unwrap();
        assert_eq!(result.updated, 2);

        let calls = runtime.calls();
        assert!(index_of(&calls, "stop:b") < index_of(&calls, "stop:a"));
        assert!(index_of(&calls, "start:a") < index_of(&calls, "start:b"));
    }

    #[tokio::test]
    async fn test_fresh_dependent_is_restarted() {
        let runtime = MemoryRuntime::new();
        seed(&runtime, MemoryContainer::new("db", "postgres:16"), "postgres:16", "sha256:new");
        seed(
            &runtime,
            MemoryContainer::new("api", "api:2").depends_on(["db"]),
            "api:2",
            "sha256:old",
        );
        let engine = engine_with(&runtime, test_config());

        let result = engine.run_cycle(CycleRequest::update()).await.unwrap();
        assert_eq!(result.updated, 1);

        let calls = runtime.calls();
        assert!(index_of(&calls, "stop:api") < index_of(&calls, "stop:db"));
        assert!(index_of(&calls, "start:db") < index_of(&calls, "start:api"));
        assert!(!calls.contains(&"create:api".to_string()));
    }

    #[tokio::test]
    async fn test_agent_container_is_never_touched() {
        let runtime = MemoryRuntime::new();
        seed(
            &runtime,
            MemoryContainer::new("fleet-agent", "fleet/agent:1").agent(),
            "fleet/agent:1",
            "sha256:new",
        );
        let engine = engine_with(&runtime, test_config());

        let result = engine.run_cycle(CycleRequest::update()).await.unwrap();

        assert_eq!(result.updated, 0);
        assert_eq!(result.skipped, 1);
        assert_eq!(result.actions_for("fleet-agent"), vec![Action::Skip]);
        assert_eq!(runtime.calls(), vec!["list"]);
    }

    #[tokio::test]
    async fn test_disabled_containers_are_not_scanned() {
        let runtime = scenario("sha256:old");
        let engine = engine_with(
            &runtime,
            EngineConfig {
                disabled_containers: vec!["web".into()],
                ..test_config()
            },
        );

        let result = engine.run_cycle(CycleRequest::update()).await.unwrap();
        assert_eq!(result.scanned, 2);
        assert_eq!(result.updated, 1);
    }

    #[tokio::test]
    async fn test_filter_limits_batch_to_image() {
        let runtime = scenario("sha256:old");
        let engine = engine_with(&runtime, test_config());

        let request = CycleRequest::update().with_filter(ContainerFilter {
            images: vec!["nginx".into()],
            ..Default::default()
        });
        let result = engine.run_cycle(request).await.unwrap();
        assert_eq!(result.scanned, 1);
        assert_eq!(result.updated, 1);
    }
}

mod mode_tests {
    use super::*;

    #[tokio::test]
    async fn test_monitor_only_reports_without_acting() {
        let runtime = scenario("sha256:old");
        let engine = engine_with(
            &runtime,
            EngineConfig {
                monitor_only: true,
                ..test_config()
            },
        );

        let result = engine.run_cycle(CycleRequest::update()).await.unwrap();

        assert_eq!(result.stale, vec!["web", "cache"]);
        assert_eq!(result.updated, 0);
        assert_eq!(result.skipped, 3);
        assert_eq!(runtime.calls(), vec!["list"]);
    }

    #[tokio::test]
    async fn test_download_pulls_without_recreating() {
        let runtime = scenario("sha256:old");
        let engine = engine_with(&runtime, test_config());

        let result = engine.run_cycle(CycleRequest::download()).await.unwrap();

        assert_eq!(result.updated, 2);
        let calls = runtime.calls();
        assert!(calls.contains(&"pull:nginx:1.25".to_string()));
        assert!(calls.iter().all(|c| !c.starts_with("stop:")));
        assert_eq!(
            runtime.container("web").unwrap().current_digest.as_deref(),
            Some("sha256:old")
        );
    }
}

mod failure_tests {
    use super::*;

    fn single_web() -> MemoryRuntime {
        let runtime = MemoryRuntime::new();
        seed(&runtime, MemoryContainer::new("web", "nginx:1.25"), "nginx:1.25", "sha256:new");
        runtime
    }

    #[tokio::test]
    async fn test_stop_failure_leaves_container_untouched() {
        let runtime = single_web();
        let before = runtime.container("web").unwrap();
        runtime.fail_once("stop", "web");
        let engine = engine_with(&runtime, test_config());

        let result = engine.run_cycle(CycleRequest::update()).await.unwrap();

        assert_eq!(result.failed, 1);
        assert_eq!(result.updated, 0);
        let calls = runtime.calls();
        assert!(!calls.contains(&"remove:web".to_string()));
        assert!(!calls.contains(&"create:web".to_string()));
        assert_eq!(runtime.container("web").unwrap().id, before.id);
    }

    #[tokio::test]
    async fn test_failed_pull_leaves_dependents_running() {
        let runtime = MemoryRuntime::new();
        seed(&runtime, MemoryContainer::new("db", "postgres:16"), "postgres:16", "sha256:new");
        seed(
            &runtime,
            MemoryContainer::new("api", "api:2").depends_on(["db"]),
            "api:2",
            "sha256:old",
        );
        runtime.fail_once("pull", "postgres:16");
        let engine = engine_with(&runtime, test_config());

        let result = engine.run_cycle(CycleRequest::update()).await.unwrap();

        assert_eq!(result.failed, 1);
        assert_eq!(result.updated, 0);
        let calls = runtime.calls();
        assert!(!calls.contains(&"stop:api".to_string()), "calls: {calls:?}");
        assert!(!calls.contains(&"start:api".to_string()), "calls: {calls:?}");
        assert!(!calls.contains(&"stop:db".to_string()));
        assert_eq!(
            runtime.container("api").unwrap().status,
            crate::models::ContainerStatus::Running
        );
    }

    #[tokio::test]
    async fn test_dependent_restarts_when_one_dependency_is_replaced() {
        let runtime = MemoryRuntime::new();
        seed(&runtime, MemoryContainer::new("db", "postgres:16"), "postgres:16", "sha256:new");
        seed(&runtime, MemoryContainer::new("auth", "auth:1"), "auth:1", "sha256:new");
        seed(
            &runtime,
            MemoryContainer::new("api", "api:2").depends_on(["db", "auth"]),
            "api:2",
            "sha256:old",
        );
        runtime.fail_once("pull", "auth:1");
        let engine = engine_with(
            &runtime,
            EngineConfig {
                rolling_restart: true,
                ..test_config()
            },
        );

        let result = engine.run_cycle(CycleRequest::update()).await.unwrap();

        assert_eq!(result.updated, 1);
        assert_eq!(result.failed, 1);
        let calls = runtime.calls();
        assert!(index_of(&calls, "start:db") < index_of(&calls, "stop:api"));
        assert!(index_of(&calls, "stop:api") < index_of(&calls, "start:api"));
    }

    #[tokio::test]
    async fn test_create_failure_rolls_back_to_previous_image() {
        let runtime = single_web();
        let before = runtime.container("web").unwrap();
        runtime.fail_once("create", "web");
        let engine = engine_with(&runtime, test_config());

        let result = engine.run_cycle(CycleRequest::update()).await.unwrap();

        assert_eq!(result.failed, 1);
        assert_eq!(result.updated, 0);
        assert!(result.actions_for("web").contains(&Action::Rollback));
        let rollback = result
            .steps
            .iter()
            .find(|s| s.action == Action::Rollback)
            .unwrap();
        assert!(rollback.ok);

        let restored = runtime.container("web").unwrap();
        assert_eq!(restored.image_id, before.image_id);
        assert_eq!(restored.status, crate::models::ContainerStatus::Running);
        assert_eq!(
            runtime.last_directive("web").unwrap().process.image,
            before.image_id
        );
    }

    #[tokio::test]
    async fn test_start_failure_removes_new_container_and_restores() {
        let runtime = single_web();
        runtime.fail_once("start", "web");
        let engine = engine_with(&runtime, test_config());

        let result = engine.run_cycle(CycleRequest::update()).await.unwrap();

        assert_eq!(result.failed, 1);
        let calls = runtime.calls();
        let tail: Vec<_> = calls.iter().rev().take(4).rev().cloned().collect();
        assert_eq!(tail, vec!["start:web", "remove:web", "create:web", "start:web"]);
        assert_eq!(
            runtime.container("web").unwrap().status,
            crate::models::ContainerStatus::Running
        );
    }

    #[tokio::test]
    async fn test_remove_failure_restarts_old_container() {
        let runtime = single_web();
        let before = runtime.container("web").unwrap();
        runtime.fail_once("remove", "web");
        let engine = engine_with(&runtime, test_config());

        let result = engine.run_cycle(CycleRequest::update()).await.unwrap();

        assert_eq!(result.failed, 1);
        let after = runtime.container("web").unwrap();
        assert_eq!(after.id, before.id);
        assert_eq!(after.status, crate::models::ContainerStatus::Running);
    }

    #[tokio::test]
    async fn test_registry_error_skips_container_and_continues() {
        let runtime = scenario("sha256:old");
        runtime.fail_registry("nginx:1.25");
        let engine = engine_with(&runtime, test_config());

        let result = engine.run_cycle(CycleRequest::update()).await.unwrap();

        assert_eq!(result.failed, 0);
        assert_eq!(result.updated, 1);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].container, "web");
        assert_eq!(result.actions_for("web"), vec![Action::Skip]);
    }

    #[tokio::test]
    async fn test_list_failure_aborts_and_releases_token() {
        let runtime = scenario("sha256:old");
        runtime.fail_list(10);
        let engine = engine_with(&runtime, test_config());

        let result = engine.run_cycle(CycleRequest::update()).await.unwrap();

        assert!(result.is_fault());
        assert_eq!(result.scanned, 0);
        assert_eq!(result.updated, 0);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(runtime.calls().iter().filter(|c| *c == "list").count(), 3);
        assert!(!engine.token().is_busy());
        assert_eq!(engine.token().releases(), 1);
    }

    #[tokio::test]
    async fn test_list_is_retried() {
        let runtime = scenario("sha256:old");
        runtime.fail_list(2);
        let engine = engine_with(&runtime, test_config());

        let result = engine.run_cycle(CycleRequest::update()).await.unwrap();
        assert!(!result.is_fault());
        assert_eq!(result.scanned, 3);
    }

    #[tokio::test]
    async fn test_dependency_cycle_aborts() {
        let runtime = MemoryRuntime::new();
        seed(
            &runtime,
            MemoryContainer::new("a", "app-a:1").depends_on(["b"]),
            "app-a:1",
            "sha256:new",
        );
        seed(
            &runtime,
            MemoryContainer::new("b", "app-b:1").depends_on(["a"]),
            "app-b:1",
            "sha256:new",
        );
        let engine = engine_with(&runtime, test_config());

        let result = engine.run_cycle(CycleRequest::update()).await.unwrap();

        assert!(result.is_fault());
        assert_eq!(result.scanned, 0);
        assert!(result.fault.unwrap().contains("dependency cycle"));
        assert_eq!(runtime.calls(), vec!["list"]);
    }
}

mod single_flight_tests {
    use super::*;

    #[tokio::test]
    async fn test_second_cycle_is_rejected_while_executing() {
        let runtime = MemoryRuntime::new();
        seed(&runtime, MemoryContainer::new("web", "nginx:1.25"), "nginx:1.25", "sha256:new");
        let gate = runtime.hold_stops();
        let engine = engine_with(&runtime, test_config());
        let mut phase = engine.subscribe_phase();

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run_cycle(CycleRequest::update()).await })
        };
        tokio::time::timeout(
            Duration::from_secs(2),
            phase.wait_for(|p| *p == CyclePhase::Executing),
        )
        .await
        .unwrap()
        .unwrap();

        let second = engine.run_cycle(CycleRequest::update()).await;
        assert_eq!(second.unwrap_err(), LockBusyError);
        assert!(engine.token().is_busy());

        gate.notify_one();
        let result = first.await.unwrap().unwrap();
        assert_eq!(result.updated, 1);
        assert_eq!(engine.token().releases(), 1);
        assert_eq!(engine.phase(), CyclePhase::Idle);
    }

    #[tokio::test]
    async fn test_token_released_when_caller_is_dropped() {
        let runtime = MemoryRuntime::new();
        seed(&runtime, MemoryContainer::new("web", "nginx:1.25"), "nginx:1.25", "sha256:new");
        let gate = runtime.hold_stops();
        let engine = engine_with(&runtime, test_config());
        let mut phase = engine.subscribe_phase();

        let caller = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run_cycle(CycleRequest::update()).await })
        };
        phase
            .wait_for(|p| *p == CyclePhase::Executing)
            .await
            .unwrap();
        caller.abort();

        // The cycle keeps running on its own task
        assert!(engine.token().is_busy());
        gate.notify_one();
        tokio::time::timeout(Duration::from_secs(2), engine.token().wait_idle())
            .await
            .unwrap();
        assert_eq!(engine.token().releases(), 1);
    }

    struct PanickingRuntime;

    #[async_trait]
    impl RuntimeGateway for PanickingRuntime {
        async fn list_containers(
            &self,
            _filter: &ContainerFilter,
        ) -> Result<Vec<ContainerRecord>, RuntimeError> {
            panic!("engine socket exploded")
        }
        async fn inspect(&self, id: &str) -> Result<ContainerRecord, RuntimeError> {
            Err(RuntimeError::NotFound(id.to_string()))
        }
        async fn stream_logs(
            &self,
            id: &str,
            _follow: bool,
            _tail: &str,
        ) -> Result<LogStream, RuntimeError> {
            Err(RuntimeError::NotFound(id.to_string()))
        }
        async fn stop(&self, _id: &str, _grace: Duration) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn remove(&self, _id: &str) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn create(
            &self,
            name: &str,
            _directive: &CreateDirective,
        ) -> Result<String, RuntimeError> {
            Ok(name.to_string())
        }
        async fn start(&self, _id: &str) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn pull_image(&self, _image: &str) -> Result<(), RuntimeError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_panic_becomes_fault_and_releases_token() {
        let engine = ReconciliationEngine::builder(
            Arc::new(PanickingRuntime),
            Arc::new(MemoryRuntime::new()),
        )
        .build();

        let result = engine.run_cycle(CycleRequest::update()).await.unwrap();

        assert!(result.is_fault());
        assert_eq!(result.scanned, 0);
        assert_eq!(engine.token().releases(), 1);
        assert!(engine.run_cycle(CycleRequest::update()).await.is_ok());
    }
}

mod control_tests {
    use super::*;
    use crate::error::ControlError;
    use crate::models::ContainerStatus;

    #[tokio::test]
    async fn test_stop_then_start_by_name() {
        let runtime = scenario("sha256:old");
        let engine = engine_with(&runtime, test_config());

        let stopped = engine.stop_container("db").await.unwrap();
        assert_eq!(stopped.status, ContainerStatus::Stopped);
        let started = engine.start_container("db").await.unwrap();
        assert_eq!(started.status, ContainerStatus::Running);

        let calls = runtime.calls();
        assert!(index_of(&calls, "stop:db") < index_of(&calls, "start:db"));
        assert_eq!(engine.token().releases(), 2);
    }

    #[tokio::test]
    async fn test_unknown_container_is_not_found() {
        let engine = engine_with(&MemoryRuntime::new(), test_config());
        let err = engine.start_container("ghost").await.unwrap_err();
        assert!(matches!(err, ControlError::Runtime(e) if e.is_not_found()));
    }

    #[tokio::test]
    async fn test_agent_refuses_to_stop_itself() {
        let runtime = MemoryRuntime::new();
        runtime.add_container(MemoryContainer::new("agent", "fleet/agent:1").agent());
        let engine = engine_with(&runtime, test_config());

        let err = engine.stop_container("agent").await.unwrap_err();
        assert!(matches!(err, ControlError::SelfContainer(name) if name == "agent"));
        assert!(!runtime.calls().iter().any(|c| c.starts_with("stop:")));
    }

    #[tokio::test]
    async fn test_manual_action_waits_for_no_cycle() {
        let runtime = scenario("sha256:old");
        let engine = engine_with(&runtime, test_config());

        let guard = engine.token().try_acquire().unwrap();
        assert!(matches!(
            engine.stop_container("web").await,
            Err(ControlError::Busy(LockBusyError))
        ));
        drop(guard);
        assert!(engine.stop_container("web").await.is_ok());
    }
}

mod observer_tests {
    use super::*;

    #[derive(Default)]
    struct CountingObserver {
        calls: AtomicUsize,
        last_updated: AtomicUsize,
    }

    impl CycleObserver for CountingObserver {
        fn on_cycle_complete(&self, result: &CycleResult) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.last_updated.store(result.updated, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_observers_see_each_cycle_once() {
        let runtime = scenario("sha256:old");
        let observer = Arc::new(CountingObserver::default());
        let shared = Arc::new(runtime.clone());
        let engine = ReconciliationEngine::builder(shared.clone(), shared)
            .config(test_config())
            .observer(observer.clone())
            .build();

        engine.run_cycle(CycleRequest::update()).await.unwrap();
        engine.run_cycle(CycleRequest::update()).await.unwrap();

        assert_eq!(observer.calls.load(Ordering::SeqCst), 2);
        // Second pass finds everything fresh
        assert_eq!(observer.last_updated.load(Ordering::SeqCst), 0);
    }
}

mod scheduler_tests {
    use super::*;
    use tokio::sync::broadcast;

    #[tokio::test]
    async fn test_scheduler_drops_ticks_while_busy() {
        let runtime = MemoryRuntime::new();
        seed(&runtime, MemoryContainer::new("web", "nginx:1.25"), "nginx:1.25", "sha256:new");
        let gate = runtime.hold_stops();
        let engine = engine_with(&runtime, test_config());

        let scheduler = UpdateScheduler::new(
            engine.clone(),
            SchedulerConfig {
                interval: Duration::from_millis(20),
                update_on_startup: true,
            },
        );
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(scheduler.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(runtime.calls().iter().filter(|c| *c == "list").count(), 1);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();

        gate.notify_one();
        tokio::time::timeout(Duration::from_secs(2), engine.token().wait_idle())
            .await
            .unwrap();
        assert_eq!(engine.token().releases(), 1);
    }
}

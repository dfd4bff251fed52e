//! Integration tests for the scheduler.
//!
//! The cluster is replaced by in-memory doubles; the live kubectl test at
//! the bottom needs a reachable cluster.
//!
//! Run the live test with: `cargo test -p runwave-core -- --ignored`

use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;
use runwave_core::{
    Allocator, ClusterError, CoreError, Dispatcher, ExecFailure, HealthReporter, Kubectl, PodApi,
    PodEventStream, PodLabels, PodObject, PodPhase, PoolStore, RemoteExec, RetryPolicy,
    ServiceConfig,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

// ============================================================================
// Doubles
// ============================================================================

#[derive(Default)]
struct FakeCluster {
    labels: Mutex<Vec<(String, String, String)>>,
    deleted: Mutex<Vec<String>>,
    fail_labels: AtomicBool,
    delete_delay: Mutex<Duration>,
    /// Store the pods were claimed from, checked when a delete is issued.
    store: OnceLock<Arc<PoolStore>>,
    claimed_at_delete: Mutex<Vec<bool>>,
}

impl FakeCluster {
    /// Names passed to `delete`, recorded when the call starts.
    fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    fn claimed_at_delete(&self) -> Vec<bool> {
        self.claimed_at_delete.lock().unwrap().clone()
    }

    fn label_writes(&self) -> usize {
        self.labels.lock().unwrap().len()
    }
}

#[async_trait]
impl PodApi for FakeCluster {
    async fn list(&self) -> Result<Vec<PodObject>, ClusterError> {
        Ok(Vec::new())
    }

    async fn watch(&self) -> Result<PodEventStream, ClusterError> {
        Ok(stream::empty().boxed())
    }

    async fn set_label(&self, pod: &str, key: &str, value: &str) -> Result<(), ClusterError> {
        if self.fail_labels.load(Ordering::SeqCst) {
            return Err(ClusterError::Rejected(format!("cannot label {pod}")));
        }
        self.labels
            .lock()
            .unwrap()
            .push((pod.to_owned(), key.to_owned(), value.to_owned()));
        Ok(())
    }

    async fn delete(&self, pod: &str) -> Result<(), ClusterError> {
        let claimed = self.store.get().is_some_and(|store| store.is_in_use(pod));
        self.claimed_at_delete.lock().unwrap().push(claimed);
        self.deleted.lock().unwrap().push(pod.to_owned());

        let delay = *self.delete_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

#[derive(Clone)]
enum Behavior {
    Echo,
    Sleep(Duration),
    Fail(&'static str, &'static str),
    Panic,
}

struct FakeExec {
    behavior: Behavior,
    calls: AtomicUsize,
    last_argv: Mutex<Vec<String>>,
}

impl FakeExec {
    fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            calls: AtomicUsize::new(0),
            last_argv: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl RemoteExec for FakeExec {
    async fn exec(&self, pod: &str, argv: &[String]) -> Result<String, ExecFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_argv.lock().unwrap() = argv.to_vec();
        match &self.behavior {
            Behavior::Echo => Ok(format!("{pod}: {}", argv.last().cloned().unwrap_or_default())),
            Behavior::Sleep(d) => {
                tokio::time::sleep(*d).await;
                Ok("late".into())
            }
            Behavior::Fail(message, output) => Err(ExecFailure::new(*message, *output)),
            Behavior::Panic => panic!("exec transport exploded"),
        }
    }
}

struct Harness {
    store: Arc<PoolStore>,
    cluster: Arc<FakeCluster>,
    exec: Arc<FakeExec>,
    allocator: Arc<Allocator>,
    dispatcher: Dispatcher,
}

fn harness(config: ServiceConfig, behavior: Behavior) -> Harness {
    let config = Arc::new(config);
    let store = Arc::new(PoolStore::new(config.labels.clone()));
    let cluster = Arc::new(FakeCluster::default());
    let _ = cluster.store.set(Arc::clone(&store));
    let exec = Arc::new(FakeExec::new(behavior));
    let allocator = Arc::new(Allocator::new(
        Arc::clone(&store),
        cluster.clone(),
        RetryPolicy::from(&*config),
    ));
    let dispatcher = Dispatcher::new(config, Arc::clone(&allocator), exec.clone());
    Harness {
        store,
        cluster,
        exec,
        allocator,
        dispatcher,
    }
}

fn fast_config() -> ServiceConfig {
    ServiceConfig::builder()
        .retry_backoff(Duration::from_millis(10))
        .timeout(Duration::from_millis(100))
        .build()
        .expect("valid config")
}

fn standby(store: &PoolStore, name: &str, language: &str) {
    store.reconcile_add(
        &PodObject::new(name, PodPhase::Running)
            .with_label("language", language)
            .with_label("app", "standby-pod"),
    );
}

// ============================================================================
// Claiming
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_hand_out_one_pod_once() {
    let h = harness(fast_config(), Behavior::Echo);
    standby(&h.store, "py-1", "python");

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let allocator = Arc::clone(&h.allocator);
            tokio::spawn(async move { allocator.claim_one("python").await })
        })
        .collect();

    let mut claimed = Vec::new();
    let mut missed = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(pod) => claimed.push(pod),
            Err(CoreError::PodNotFound(_)) => missed += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(claimed.len(), 1);
    assert_eq!(missed, 7);
    assert_eq!(claimed[0].name(), "py-1");
    for pod in claimed {
        pod.release_and_delete().await;
    }
}

#[tokio::test]
async fn test_claims_are_fifo_and_persist_role_label() {
    let h = harness(fast_config(), Behavior::Echo);
    for name in ["py-1", "py-2", "py-3"] {
        standby(&h.store, name, "python");
    }

    let first = h.allocator.claim_one("python").await.unwrap();
    let second = h.allocator.claim_one("python").await.unwrap();
    assert_eq!(first.name(), "py-1");
    assert_eq!(second.name(), "py-2");

    let writes = h.cluster.labels.lock().unwrap().clone();
    assert_eq!(
        writes[0],
        ("py-1".to_owned(), "app".to_owned(), "in-use-pod".to_owned())
    );

    first.release_and_delete().await;
    second.release_and_delete().await;
}

#[tokio::test]
async fn test_duplicate_add_does_not_double_enqueue() {
    let h = harness(fast_config(), Behavior::Echo);
    standby(&h.store, "py-1", "python");
    standby(&h.store, "py-1", "python");

    let pod = h.allocator.claim_one("python").await.unwrap();
    assert!(matches!(
        h.allocator.claim_one("python").await,
        Err(CoreError::PodNotFound(_))
    ));
    pod.release_and_delete().await;
}

#[tokio::test]
async fn test_label_failure_releases_local_claim() {
    let h = harness(fast_config(), Behavior::Echo);
    standby(&h.store, "py-1", "python");
    h.cluster.fail_labels.store(true, Ordering::SeqCst);

    let err = h.allocator.claim_one("python").await.unwrap_err();
    assert!(matches!(err, CoreError::PodUpdateFailed { ref pod, .. } if pod == "py-1"));
    assert!(!h.store.is_in_use("py-1"));
    assert!(h.store.snapshot().in_use.is_empty());
    assert!(h.cluster.deleted().is_empty());
    assert_eq!(h.store.stats().label_failures(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion_sleeps_linear_backoff() {
    let config = ServiceConfig::builder()
        .claim_retries(4)
        .retry_backoff(Duration::from_secs(1))
        .build()
        .unwrap();
    let h = harness(config, Behavior::Echo);

    let start = tokio::time::Instant::now();
    let err = h.allocator.claim_with_retry("python").await.unwrap_err();

    assert!(matches!(err, CoreError::PodNotFound(ref lang) if lang == "python"));
    // 1 + 2 + 3 + 4 units, including the sleep after the last attempt.
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(10), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(11), "elapsed {elapsed:?}");
    assert_eq!(h.store.stats().misses(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_retry_picks_up_pod_that_arrives_later() {
    let config = ServiceConfig::builder()
        .retry_backoff(Duration::from_secs(1))
        .build()
        .unwrap();
    let h = harness(config, Behavior::Echo);

    let store = Arc::clone(&h.store);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        standby(&store, "py-late", "python");
    });

    let pod = h.allocator.claim_with_retry("python").await.unwrap();
    assert_eq!(pod.name(), "py-late");
    pod.release_and_delete().await;
}

#[tokio::test]
async fn test_dropped_guard_tears_down_in_background() {
    let h = harness(fast_config(), Behavior::Echo);
    standby(&h.store, "py-1", "python");

    let pod = h.allocator.claim_one("python").await.unwrap();
    drop(pod);
    assert!(!h.store.is_in_use("py-1"));

    for _ in 0..10 {
        if !h.cluster.deleted().is_empty() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(h.cluster.deleted(), vec!["py-1"]);
    assert_eq!(h.cluster.claimed_at_delete(), vec![false]);
}

#[tokio::test]
async fn test_release_happens_before_delete() {
    let h = harness(fast_config(), Behavior::Echo);
    standby(&h.store, "py-1", "python");
    standby(&h.store, "py-2", "python");

    let pod = h.allocator.claim_one("python").await.unwrap();
    assert!(h.store.is_in_use("py-1"));
    pod.release_and_delete().await;

    let name = h.store.claim("python").unwrap();
    assert!(h.store.is_in_use(&name));
    h.allocator.release_and_delete(&name).await;

    assert_eq!(h.cluster.deleted(), vec!["py-1", "py-2"]);
    assert_eq!(h.cluster.claimed_at_delete(), vec![false, false]);
}

#[tokio::test(start_paused = true)]
async fn test_health_omits_pod_while_delete_is_pending() {
    let h = harness(fast_config(), Behavior::Echo);
    *h.cluster.delete_delay.lock().unwrap() = Duration::from_millis(200);
    standby(&h.store, "py-1", "python");

    let pod = h.allocator.claim_one("python").await.unwrap();
    let teardown = tokio::spawn(pod.release_and_delete());

    while h.cluster.deleted().is_empty() {
        tokio::task::yield_now().await;
    }
    let report = HealthReporter::new(Arc::clone(&h.store)).report();
    assert!(report.in_use_pods.is_empty());
    assert!(!teardown.is_finished());

    teardown.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_delete_tears_down_once() {
    let h = harness(fast_config(), Behavior::Echo);
    *h.cluster.delete_delay.lock().unwrap() = Duration::from_millis(200);
    standby(&h.store, "py-1", "python");

    let result =
        tokio::time::timeout(Duration::from_millis(50), h.dispatcher.execute("1", "python")).await;
    assert!(result.is_err(), "execute should still be deleting");

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(h.cluster.deleted(), vec!["py-1"]);
    assert_eq!(h.store.stats().teardowns(), 1);
    assert_eq!(h.store.stats().delete_failures(), 0);
    assert!(!h.store.is_in_use("py-1"));
    assert_eq!(h.store.snapshot().total(), 0);
}

// ============================================================================
// Execution
// ============================================================================

#[tokio::test]
async fn test_execute_success_tears_down_pod() {
    let h = harness(fast_config(), Behavior::Echo);
    standby(&h.store, "py-1", "python");

    let output = h.dispatcher.execute("print(1)", "python").await.unwrap();

    assert_eq!(output, "py-1: print(1)");
    assert_eq!(
        *h.exec.last_argv.lock().unwrap(),
        vec!["python", "-c", "print(1)"]
    );
    let snapshot = h.store.snapshot();
    assert!(snapshot.in_use.is_empty());
    assert_eq!(snapshot.standby_count(), 0);
    assert_eq!(h.cluster.deleted(), vec!["py-1"]);
}

#[tokio::test]
async fn test_unsupported_language_claims_nothing() {
    let h = harness(fast_config(), Behavior::Echo);
    standby(&h.store, "rb-1", "ruby");

    let err = h.dispatcher.execute("puts 1", "ruby").await.unwrap_err();

    assert!(matches!(err, CoreError::UnsupportedLanguage(ref lang) if lang == "ruby"));
    assert_eq!(h.store.stats().claims(), 0);
    assert_eq!(h.store.stats().misses(), 0);
    assert_eq!(h.cluster.label_writes(), 0);
    assert_eq!(h.exec.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_deletes_pod_exactly_once() {
    let h = harness(
        fast_config(),
        Behavior::Sleep(Duration::from_millis(500)),
    );
    standby(&h.store, "py-1", "python");

    let err = h.dispatcher.execute("while True: pass", "python").await.unwrap_err();

    assert!(matches!(err, CoreError::Timeout(d) if d == Duration::from_millis(100)));
    assert_eq!(h.cluster.deleted(), vec!["py-1"]);
    let snapshot = h.store.snapshot();
    assert!(snapshot.in_use.is_empty());
    assert_eq!(snapshot.standby_count(), 0);
    assert_eq!(h.store.stats().timeouts(), 1);
}

#[tokio::test]
async fn test_execution_failure_carries_output() {
    let h = harness(
        fast_config(),
        Behavior::Fail("exit status 1", "NameError: name 'x' is not defined"),
    );
    standby(&h.store, "py-1", "python");

    let err = h.dispatcher.execute("x", "python").await.unwrap_err();

    match &err {
        CoreError::ExecutionFailed { message, output } => {
            assert_eq!(message, "exit status 1");
            assert!(output.contains("NameError"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("NameError"));
    assert_eq!(h.cluster.deleted(), vec!["py-1"]);
}

#[tokio::test]
async fn test_exec_panic_is_contained_and_pod_torn_down() {
    let h = harness(fast_config(), Behavior::Panic);
    standby(&h.store, "py-1", "python");

    let err = h.dispatcher.execute("1", "python").await.unwrap_err();

    assert!(matches!(err, CoreError::Internal(ref msg) if msg.contains("exploded")));
    assert_eq!(h.cluster.deleted(), vec!["py-1"]);
    assert!(h.store.snapshot().in_use.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_empty_pool_exhausts_then_reports_not_found() {
    let h = harness(fast_config(), Behavior::Echo);

    let err = h.dispatcher.execute("1", "javascript").await.unwrap_err();

    assert!(matches!(err, CoreError::PodNotFound(_)));
    assert_eq!(h.exec.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.store.stats().misses(), 4);
}

#[tokio::test]
async fn test_pods_are_never_reused() {
    let h = harness(fast_config(), Behavior::Echo);
    standby(&h.store, "js-1", "javascript");
    standby(&h.store, "js-2", "javascript");

    h.dispatcher.execute("1", "javascript").await.unwrap();
    h.dispatcher.execute("2", "javascript").await.unwrap();

    assert_eq!(h.cluster.deleted(), vec!["js-1", "js-2"]);
    assert_eq!(h.store.snapshot().total(), 0);
}

// ============================================================================
// Live cluster
// ============================================================================

/// Lists sandbox pods through a real kubectl.
#[tokio::test]
#[ignore = "requires kubectl and a reachable cluster"]
async fn test_kubectl_list_live() {
    let namespace =
        std::env::var("RUNWAVE_NAMESPACE").unwrap_or_else(|_| "code-exec-system".to_string());
    let kubectl = Kubectl::new("kubectl", namespace);

    let pods = kubectl.list().await.expect("Failed to list pods");
    let labels = PodLabels::default();
    for pod in &pods {
        assert!(pod.label(&labels.language_key).is_some());
    }
}

//! The resource test pool: batches resources and has bridgestrap test them.
//!
//! Resources arrive on an inbox channel, keyed by their canonical string.
//! The first resource entering an empty pool arms a flush timer; filling the
//! pool flushes immediately.  A flush spawns a task that talks to the
//! tester and writes the results back into the collection, guarded by an
//! in-progress set so that a resource is never queued twice concurrently.

use async_trait::async_trait;
use chrono::Utc;
use ferry_api::bridgestrap::{TesterRequest, TesterResponse};
use ferry_core::{BackendResources, OnAddHook, Resource, TestRecord, TestState};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How long after the first resource enters an empty pool we flush.
pub const FLUSH_TIMEOUT: Duration = Duration::from_secs(60);
/// The pool size at which we flush immediately.
pub const MAX_RESOURCES: usize = 25;

#[derive(Debug, Error)]
pub enum TesterError {
    #[error("tester request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("tester returned HTTP status {0}")]
    Status(u16),
}

/// The seam to the external reachability tester.
#[async_trait]
pub trait ResourceTester: Send + Sync + 'static {
    async fn test(&self, request: TesterRequest) -> Result<TesterResponse, TesterError>;
}

/// Talks to a bridgestrap instance over HTTP.
pub struct Bridgestrap {
    endpoint: String,
    client: reqwest::Client,
}

impl Bridgestrap {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ResourceTester for Bridgestrap {
    async fn test(&self, request: TesterRequest) -> Result<TesterResponse, TesterError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TesterError::Status(response.status().as_u16()));
        }
        Ok(response.json().await?)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct TestPoolConfig {
    pub flush_timeout: Duration,
    pub max_resources: usize,
}

impl Default for TestPoolConfig {
    fn default() -> Self {
        Self {
            flush_timeout: FLUSH_TIMEOUT,
            max_resources: MAX_RESOURCES,
        }
    }
}

/// A pool to which resources are added until it is time to send them to the
/// tester.
pub struct TestPool {
    config: TestPoolConfig,
    tester: Arc<dyn ResourceTester>,
    inbox: UnboundedSender<Box<dyn Resource>>,
    rx: UnboundedReceiver<Box<dyn Resource>>,
}

impl TestPool {
    pub fn new(config: TestPoolConfig, tester: Arc<dyn ResourceTester>) -> Self {
        let (inbox, rx) = mpsc::unbounded_channel();
        Self {
            config,
            tester,
            inbox,
            rx,
        }
    }

    /// The hook to thread through the backend's hashrings.  Every resource
    /// the collection deems worth testing lands in our inbox.
    pub fn hook(&self) -> OnAddHook {
        let inbox = self.inbox.clone();
        Arc::new(move |r| {
            let _ = inbox.send(r);
        })
    }

    /// Consumes the pool and starts its dispatcher.
    pub fn spawn(
        self,
        resources: Arc<BackendResources>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(dispatch(
            self.rx,
            self.config,
            self.tester,
            resources,
            shutdown,
        ))
    }
}

async fn dispatch(
    mut rx: UnboundedReceiver<Box<dyn Resource>>,
    config: TestPoolConfig,
    tester: Arc<dyn ResourceTester>,
    resources: Arc<BackendResources>,
    shutdown: CancellationToken,
) {
    tracing::info!("starting resource test pool");

    let mut buffer: HashMap<String, Box<dyn Resource>> = HashMap::new();
    let in_progress: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("shutting down resource test pool");
                return;
            }
            received = rx.recv() => {
                let Some(r) = received else { return };
                let key = r.to_string();
                if in_progress.lock().await.contains(&key) {
                    tracing::debug!(resource = %key, "already being tested; dropping");
                    continue;
                }
                if buffer.is_empty() {
                    deadline = Some(Instant::now() + config.flush_timeout);
                }
                buffer.insert(key, r);
                if buffer.len() >= config.max_resources {
                    deadline = None;
                    flush(&mut buffer, &tester, &resources, &in_progress);
                }
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                if deadline.is_some() =>
            {
                deadline = None;
                flush(&mut buffer, &tester, &resources, &in_progress);
            }
        }
    }
}

/// Empties the pool and tests its contents in a background task, so that the
/// dispatcher keeps accepting resources while the tester works.
fn flush(
    buffer: &mut HashMap<String, Box<dyn Resource>>,
    tester: &Arc<dyn ResourceTester>,
    resources: &Arc<BackendResources>,
    in_progress: &Arc<Mutex<HashSet<String>>>,
) {
    if buffer.is_empty() {
        return;
    }
    let batch = std::mem::take(buffer);
    let tester = tester.clone();
    let resources = resources.clone();
    let in_progress = in_progress.clone();

    tokio::spawn(async move {
        let keys: Vec<String> = batch.keys().cloned().collect();
        in_progress.lock().await.extend(keys.iter().cloned());

        test_batch(batch, tester, resources).await;

        let mut guard = in_progress.lock().await;
        for key in &keys {
            guard.remove(key);
        }
    });
}

async fn test_batch(
    batch: HashMap<String, Box<dyn Resource>>,
    tester: Arc<dyn ResourceTester>,
    resources: Arc<BackendResources>,
) {
    let request = TesterRequest {
        bridge_lines: batch.keys().cloned().collect(),
    };

    let response = match tester.test(request).await {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(%err, "tester request failed; dropping batch");
            return;
        }
    };
    if let Some(err) = response.error {
        tracing::warn!(%err, "tester reported an error; dropping batch");
        return;
    }

    let mut num_functional = 0usize;
    let mut num_dysfunctional = 0usize;
    for (bridge_line, result) in response.bridge_results {
        let Some(r) = batch.get(&bridge_line) else {
            tracing::warn!(%bridge_line, "bug: tested bridge line not in our pool");
            continue;
        };

        let state = if result.functional {
            num_functional += 1;
            TestState::Functional
        } else {
            num_dysfunctional += 1;
            TestState::Dysfunctional
        };
        let record = TestRecord {
            state,
            last_tested: result.last_tested.or_else(|| Some(Utc::now())),
            error: result.error,
        };
        resources
            .update_test_record(r.type_tag(), r.uid(), record)
            .await;
    }

    tracing::info!(
        tested = num_functional + num_dysfunctional,
        functional = num_functional,
        dysfunctional = num_dysfunctional,
        "tested resources",
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_api::bridgestrap::TesterResult;
    use ferry_core::dummy::Dummy;
    use ferry_core::{Interval, Stencil};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubTester {
        calls: AtomicUsize,
        delay: Duration,
        functional: bool,
    }

    impl StubTester {
        fn new(functional: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                functional,
            })
        }
    }

    #[async_trait]
    impl ResourceTester for StubTester {
        async fn test(&self, request: TesterRequest) -> Result<TesterResponse, TesterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let mut response = TesterResponse::default();
            for line in request.bridge_lines {
                response.bridge_results.insert(
                    line,
                    TesterResult {
                        functional: self.functional,
                        last_tested: Some(Utc::now()),
                        error: if self.functional {
                            None
                        } else {
                            Some("timed out".to_string())
                        },
                    },
                );
            }
            Ok(response)
        }
    }

    fn collection() -> Arc<BackendResources> {
        let mut stencil = Stencil::new();
        stencil.add_interval(Interval::new(0, 0, "https"));
        Arc::new(BackendResources::new(
            &["dummy".to_string()],
            stencil,
            None,
        ))
    }

    async fn wait_for_calls(tester: &StubTester, num: usize) {
        for _ in 0..100 {
            if tester.calls.load(Ordering::SeqCst) == num {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("tester was not called {num} times in time");
    }

    async fn wait_until_tested(resources: &BackendResources) {
        for _ in 0..100 {
            let all = resources.get_all("dummy").await;
            if !all.is_empty() && all.iter().all(|r| r.test().last_tested.is_some()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("resources were not tested in time");
    }

    #[tokio::test]
    async fn full_pool_flushes_immediately() {
        let resources = collection();
        let tester = StubTester::new(true);
        let shutdown = CancellationToken::new();

        let pool = TestPool::new(
            TestPoolConfig {
                flush_timeout: Duration::from_secs(3600),
                max_resources: 2,
            },
            tester.clone(),
        );
        let hook = pool.hook();
        let handle = pool.spawn(resources.clone(), shutdown.clone());

        for uid in 0..2u64 {
            resources.add(Box::new(Dummy::new(uid, uid))).await;
            hook(Box::new(Dummy::new(uid, uid)));
        }

        wait_for_calls(&tester, 1).await;
        wait_until_tested(&resources).await;
        assert!(resources
            .get_all("dummy")
            .await
            .iter()
            .all(|r| r.test().state == TestState::Functional));

        shutdown.cancel();
        handle.await.expect("clean shutdown");
    }

    #[tokio::test]
    async fn timer_flushes_partial_pool() {
        let resources = collection();
        resources.add(Box::new(Dummy::new(1, 1))).await;
        let tester = StubTester::new(false);
        let shutdown = CancellationToken::new();

        let pool = TestPool::new(
            TestPoolConfig {
                flush_timeout: Duration::from_millis(50),
                max_resources: 25,
            },
            tester.clone(),
        );
        let hook = pool.hook();
        let handle = pool.spawn(resources.clone(), shutdown.clone());

        hook(Box::new(Dummy::new(1, 1)));

        wait_for_calls(&tester, 1).await;
        wait_until_tested(&resources).await;
        let all = resources.get_all("dummy").await;
        assert_eq!(all[0].test().state, TestState::Dysfunctional);
        assert_eq!(all[0].test().error.as_deref(), Some("timed out"));

        shutdown.cancel();
        handle.await.expect("clean shutdown");
    }

    #[tokio::test]
    async fn in_flight_resources_are_not_requeued() {
        let resources = collection();
        let shutdown = CancellationToken::new();
        let tester = Arc::new(StubTester {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(200),
            functional: true,
        });

        let pool = TestPool::new(
            TestPoolConfig {
                flush_timeout: Duration::from_secs(3600),
                max_resources: 1,
            },
            tester.clone(),
        );
        let hook = pool.hook();
        let handle = pool.spawn(resources.clone(), shutdown.clone());

        // The first submission flushes immediately and is now in flight;
        // duplicate submissions while in flight are dropped silently.
        hook(Box::new(Dummy::new(1, 1)));
        wait_for_calls(&tester, 1).await;
        hook(Box::new(Dummy::new(1, 1)));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(tester.calls.load(Ordering::SeqCst), 1);

        shutdown.cancel();
        handle.await.expect("clean shutdown");
    }
}

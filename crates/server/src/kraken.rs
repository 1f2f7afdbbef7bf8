//! The resource kraken: a long-lived task that periodically reloads bridge
//! descriptors, prunes expired resources, and reports per-type test-state
//! fractions.

use crate::descriptors::parse_extrainfo;
use ferry_core::{BackendResources, TestState};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub const KRAKEN_TICK_INTERVAL: Duration = Duration::from_secs(60);

/// Spawns the kraken.  The returned receiver fires once the initial
/// descriptor reload is done; the join handle resolves after shutdown.
pub fn spawn(
    extrainfo_file: PathBuf,
    resources: Arc<BackendResources>,
    shutdown: CancellationToken,
) -> (oneshot::Receiver<()>, JoinHandle<()>) {
    let (ready_tx, ready_rx) = oneshot::channel();
    let handle = tokio::spawn(run(extrainfo_file, resources, shutdown, ready_tx));
    (ready_rx, handle)
}

async fn run(
    extrainfo_file: PathBuf,
    resources: Arc<BackendResources>,
    shutdown: CancellationToken,
    ready: oneshot::Sender<()>,
) {
    tracing::info!("initialising resource kraken");

    // Parse bridge descriptors right away and let the caller know once
    // we are done.
    reload_bridge_descriptors(&extrainfo_file, &resources).await;
    let _ = ready.send(());

    let mut ticker = tokio::time::interval(KRAKEN_TICK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("kraken shut down");
                return;
            }
            _ = ticker.tick() => {
                reload_bridge_descriptors(&extrainfo_file, &resources).await;
                resources.prune().await;
                log_tested_resources(&resources).await;
                let summary = resources.summary().await;
                tracing::info!(resources = %summary, "backend resources");
            }
        }
    }
}

/// Reloads bridge descriptors from the given cached-extrainfo file and its
/// corresponding cached-extrainfo.new.  A failure on one file does not keep
/// us from trying the other.
async fn reload_bridge_descriptors(extrainfo_file: &Path, resources: &BackendResources) {
    let sibling = {
        let mut name = extrainfo_file.as_os_str().to_os_string();
        name.push(".new");
        PathBuf::from(name)
    };

    for filename in [extrainfo_file, sibling.as_path()] {
        let doc = match tokio::fs::read_to_string(filename).await {
            Ok(doc) => doc,
            Err(err) => {
                tracing::warn!(file = %filename.display(), %err, "failed to read descriptor file");
                continue;
            }
        };
        let transports = match parse_extrainfo(&doc) {
            Ok(transports) => transports,
            Err(err) => {
                tracing::warn!(file = %filename.display(), %err, "failed to reload bridge descriptors");
                continue;
            }
        };

        tracing::info!(
            num = transports.len(),
            file = %filename.display(),
            "adding resources",
        );
        for transport in transports {
            resources.add(Box::new(transport)).await;
        }
    }
}

/// Logs the fraction of each test state per resource type, e.g. that among
/// all obfs4 bridges, 0.2 are untested, 0.7 functional, and 0.1
/// dysfunctional.
async fn log_tested_resources(resources: &BackendResources) {
    for type_tag in resources.resource_types() {
        let all = resources.get_all(&type_tag).await;
        if all.is_empty() {
            continue;
        }

        let mut untested = 0usize;
        let mut functional = 0usize;
        let mut dysfunctional = 0usize;
        for r in &all {
            match r.test().state {
                TestState::Untested => untested += 1,
                TestState::Functional => functional += 1,
                TestState::Dysfunctional => dysfunctional += 1,
            }
        }

        let total = all.len() as f64;
        tracing::info!(
            %type_tag,
            untested = untested as f64 / total,
            functional = functional as f64 / total,
            dysfunctional = dysfunctional as f64 / total,
            "test-state fractions",
        );
    }
}

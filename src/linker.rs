//! Fans corrective commits out to a fixed pool of workers, each tracing
//! defects through its own repository replica, and merges what they find.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Barrier, Mutex};
use tokio::task::{JoinHandle, JoinSet};

use crate::cache::CacheStore;
use crate::classifier::Classifier;
use crate::git::{Replica, Vcs};
use crate::models::{BugLinks, Commit};
use crate::persistence::{Persistence, ReportLinker};
use crate::szz;

/// Services shared by every worker.
pub struct LinkContext {
    pub cache: Arc<CacheStore>,
    pub classifier: Arc<dyn Classifier>,
    pub reports: Option<Arc<dyn ReportLinker>>,
    pub persistence: Option<Arc<dyn Persistence>>,
    pub repository_id: String,
}

#[derive(Debug, Clone, Copy)]
pub struct LinkSettings {
    pub workers: usize,
    pub timeout: Duration,
}

/// Result of linking one corrective commit.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkOutcome {
    Linked { hash: String, origins: BTreeSet<String> },
    /// The pair of sub-tasks did not finish in time; the commit stays unlinked.
    TimedOut { hash: String },
}

type Job = (usize, Commit);

pub struct Coordinator {
    ctx: Arc<LinkContext>,
    settings: LinkSettings,
}

impl Coordinator {
    pub fn new(ctx: LinkContext, settings: LinkSettings) -> Self {
        Self {
            ctx: Arc::new(ctx),
            settings,
        }
    }

    /// Start the worker pool over `correctives`. Outcomes arrive on the
    /// returned channel; the handle completes once replicas are torn down.
    pub fn spawn(
        &self,
        primary: Arc<dyn Vcs>,
        correctives: Vec<Commit>,
    ) -> (mpsc::Receiver<LinkOutcome>, JoinHandle<()>) {
        let workers = self.settings.workers.max(1);
        let timeout = self.settings.timeout;
        let total = correctives.len();
        let ctx = Arc::clone(&self.ctx);

        let (job_tx, job_rx) = mpsc::channel::<Job>(workers * 2);
        let jobs = Arc::new(Mutex::new(job_rx));
        let (result_tx, result_rx) = mpsc::channel(workers * 2);
        let barrier = Arc::new(Barrier::new(workers));

        let handle = tokio::spawn(async move {
            let mut pool = JoinSet::new();
            for index in 0..workers {
                pool.spawn(worker(
                    index,
                    Arc::clone(&primary),
                    Arc::clone(&ctx),
                    Arc::clone(&barrier),
                    Arc::clone(&jobs),
                    result_tx.clone(),
                    total,
                    timeout,
                ));
            }
            drop(result_tx);

            for job in correctives.into_iter().enumerate() {
                if job_tx.send(job).await.is_err() {
                    tracing::warn!("All linking workers stopped, abandoning queue");
                    break;
                }
            }
            drop(job_tx);

            let mut teardown = JoinSet::new();
            while let Some(joined) = pool.join_next().await {
                match joined {
                    Ok(Some(replica)) => {
                        teardown.spawn_blocking(move || remove_replica(replica));
                    }
                    Ok(None) => {}
                    Err(e) => tracing::error!("Linking worker failed: {}", e),
                }
            }
            while let Some(removed) = teardown.join_next().await {
                if let Err(e) = removed {
                    tracing::warn!("Replica teardown task failed: {}", e);
                }
            }
            tracing::debug!("Linking pool shut down");
        });

        (result_rx, handle)
    }

    /// Link every corrective commit in `commits`, then mark linked
    /// correctives and annotate origins in place.
    pub async fn link_commits(&self, primary: Arc<dyn Vcs>, commits: &mut [Commit]) -> BugLinks {
        let correctives: Vec<Commit> = commits
            .iter()
            .filter(|c| c.is_corrective())
            .cloned()
            .collect();
        let total = correctives.len();
        tracing::info!(
            "Linking {} corrective commits with {} workers",
            total,
            self.settings.workers.max(1)
        );

        let (mut results, handle) = self.spawn(primary, correctives);

        let mut links = BugLinks::new();
        let mut linked = HashSet::new();
        let mut timed_out = 0;
        while let Some(outcome) = results.recv().await {
            match outcome {
                LinkOutcome::Linked { hash, origins } => {
                    links.merge(&hash, &origins);
                    linked.insert(hash);
                }
                LinkOutcome::TimedOut { .. } => timed_out += 1,
            }
        }
        if let Err(e) = handle.await {
            tracing::error!("Linking coordinator failed: {}", e);
        }

        for commit in commits.iter_mut() {
            if linked.contains(&commit.hash) {
                commit.linked = true;
            }
        }
        let buggy = links.annotate(commits);

        tracing::info!(
            "Linked {}/{} corrective commits ({} timed out), {} bug-introducing commits",
            linked.len(),
            total,
            timed_out,
            buggy
        );
        links
    }
}

fn remove_replica(replica: Replica) {
    let Replica { vcs, dir } = replica;
    drop(vcs);
    if let Some(dir) = dir {
        let path = dir.path().to_path_buf();
        match dir.close() {
            Ok(()) => tracing::debug!("Removed replica {:?}", path),
            Err(e) => tracing::warn!("Failed to remove replica {:?}: {}", path, e),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker(
    index: usize,
    primary: Arc<dyn Vcs>,
    ctx: Arc<LinkContext>,
    barrier: Arc<Barrier>,
    jobs: Arc<Mutex<mpsc::Receiver<Job>>>,
    results: mpsc::Sender<LinkOutcome>,
    total: usize,
    timeout: Duration,
) -> Option<Replica> {
    let replica = match primary.replicate(index).await {
        Ok(replica) => Some(replica),
        Err(e) => {
            tracing::warn!(
                "Worker {} could not provision a replica, using {:?}: {}",
                index,
                primary.location(),
                e
            );
            None
        }
    };
    let vcs = replica
        .as_ref()
        .map(|r| Arc::clone(&r.vcs))
        .unwrap_or_else(|| Arc::clone(&primary));

    barrier.wait().await;

    loop {
        let job = jobs.lock().await.recv().await;
        let Some((position, commit)) = job else {
            break;
        };

        let outcome = link_one(vcs.as_ref(), &ctx, &commit, timeout).await;
        let done = position + 1;
        let percent = done as f64 * 100.0 / total.max(1) as f64;
        match &outcome {
            LinkOutcome::Linked { origins, .. } => tracing::debug!(
                "Worker {} linked {} to {} origins ({}/{}, {:.1}%)",
                index,
                commit.short_hash(),
                origins.len(),
                done,
                total,
                percent
            ),
            LinkOutcome::TimedOut { .. } => tracing::warn!(
                "Worker {} timed out on {} after {:?} ({}/{}, {:.1}%)",
                index,
                commit.short_hash(),
                timeout,
                done,
                total,
                percent
            ),
        }

        if results.send(outcome).await.is_err() {
            break;
        }
    }

    replica
}

/// Trace one corrective commit and sync its fix reports, both bounded by a
/// single timeout.
async fn link_one(vcs: &dyn Vcs, ctx: &LinkContext, commit: &Commit, timeout: Duration) -> LinkOutcome {
    let trace = async {
        let regions = szz::modified_regions(vcs, &ctx.cache, ctx.classifier.as_ref(), commit).await;
        szz::annotate(vcs, &ctx.cache, &regions, commit).await
    };
    let reports = sync_reports(ctx, commit);

    match tokio::time::timeout(timeout, async { tokio::join!(trace, reports) }).await {
        Ok((origins, ())) => LinkOutcome::Linked {
            hash: commit.hash.clone(),
            origins,
        },
        Err(_) => LinkOutcome::TimedOut {
            hash: commit.hash.clone(),
        },
    }
}

async fn sync_reports(ctx: &LinkContext, commit: &Commit) {
    let Some(linker) = &ctx.reports else {
        return;
    };

    let mut reports = Vec::new();
    for id in &commit.fixes {
        match linker.fetch(id).await {
            Ok(report) => reports.push(report),
            Err(e) => tracing::warn!("Could not fetch {} from {}: {}", id, linker.db_name(), e),
        }
    }

    if reports.is_empty() {
        return;
    }
    if let Some(persistence) = &ctx.persistence {
        if let Err(e) = persistence
            .sync_reports(&reports, &ctx.repository_id, &commit.hash)
            .await
        {
            tracing::warn!("Could not sync reports of {}: {}", commit.short_hash(), e);
        }
    }
}

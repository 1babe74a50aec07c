use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cache;
mod classifier;
mod config;
mod error;
mod git;
mod linker;
mod models;
mod persistence;
mod stats;
mod szz;

use cache::CacheStore;
use classifier::{Classifier, KeywordClassifier};
use config::Config;
use git::{GitCli, Vcs};
use linker::{Coordinator, LinkContext, LinkSettings};
use models::ScanState;
use persistence::{JsonlStore, Persistence};
use stats::CommitParser;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub job_id: String,
    pub status: String,
    pub total_commits: usize,
    pub corrective_commits: usize,
    pub buggy_commits: usize,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub cache: Arc<CacheStore>,
    pub classifier: Arc<dyn Classifier>,
    pub parser: Arc<CommitParser>,
    pub store: Arc<dyn Persistence>,
    pub jobs: Arc<RwLock<HashMap<String, JobRecord>>>,
}

impl AppState {
    fn update_job(&self, job_id: &str, update: impl FnOnce(&mut JobRecord)) {
        if let Some(job) = self.jobs.write().get_mut(job_id) {
            update(job);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    std::fs::create_dir_all(&config.work_dir)?;

    let cache = CacheStore::with_persistence(&config.log_dir)?;
    let warmed = cache.warmup(&config.log_dir)?;
    tracing::info!("Loaded {} cached entries from {:?}", warmed, cache.persist_dir());

    let classifier: Arc<dyn Classifier> = match &config.classifier_dir {
        Some(dir) => Arc::new(KeywordClassifier::from_dir(dir)?),
        None => Arc::new(KeywordClassifier::with_defaults()),
    };
    let parser = CommitParser::new(&config.fix_pattern, &config.review_pattern)?;
    let store = JsonlStore::open(&config.output_dir).await?;
    tracing::info!("Writing results to {:?}", store.dir());

    let addr = config.bind_address.clone();
    let state = AppState {
        config: Arc::new(config),
        cache: Arc::new(cache),
        classifier,
        parser: Arc::new(parser),
        store: Arc::new(store),
        jobs: Arc::new(RwLock::new(HashMap::new())),
    };

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Commit miner listening on {}", addr);

    axum::serve(listener, router(state)).await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/analyze", post(analyze_repository))
        .route("/jobs/:id", get(job_status))
        .route("/cache/stats", get(cache_stats))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeRequest {
    pub job_id: Option<String>,
    pub repo_path: String,
    pub last_commit: Option<String>,
    pub repository_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeResponse {
    pub job_id: String,
    pub status: String,
    pub message: String,
}

async fn analyze_repository(
    State(state): State<AppState>,
    Json(request): Json<AnalyzeRequest>,
) -> Result<Json<AnalyzeResponse>, (StatusCode, String)> {
    let job_id = request
        .job_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    if let Some(since) = request.last_commit.as_deref() {
        git::validate_revision(since).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    }

    {
        let mut jobs = state.jobs.write();
        if jobs.get(&job_id).is_some_and(|j| j.completed_at.is_none()) {
            return Err((StatusCode::CONFLICT, format!("Job {} is already running", job_id)));
        }
        jobs.insert(
            job_id.clone(),
            JobRecord {
                job_id: job_id.clone(),
                status: "SCANNING".to_string(),
                total_commits: 0,
                corrective_commits: 0,
                buggy_commits: 0,
                error: None,
                started_at: Utc::now(),
                completed_at: None,
            },
        );
    }

    tracing::info!("Starting analysis for job: {}", job_id);
    tracing::info!("Repo path: {}, since: {:?}", request.repo_path, request.last_commit);

    let state_clone = state.clone();
    let job_id_for_task = job_id.clone();
    tokio::spawn(async move {
        if let Err(e) = process_analysis(&state_clone, &job_id_for_task, request).await {
            tracing::error!("Analysis failed: {:#}", e);
            state_clone.update_job(&job_id_for_task, |job| {
                job.status = "FAILED".to_string();
                job.error = Some(format!("{:#}", e));
                job.completed_at = Some(Utc::now());
            });
        }
    });

    Ok(Json(AnalyzeResponse {
        job_id,
        status: "PROCESSING".to_string(),
        message: "Analysis started in background".to_string(),
    }))
}

async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobRecord>, (StatusCode, String)> {
    state
        .jobs
        .read()
        .get(&job_id)
        .cloned()
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Unknown job {}", job_id)))
}

async fn cache_stats(State(state): State<AppState>) -> impl IntoResponse {
    let stats: Vec<_> = [cache::DIFF_BUCKET, cache::FILE_LIST_BUCKET, cache::BLAME_BUCKET]
        .iter()
        .map(|bucket| state.cache.stats(bucket))
        .collect();
    Json(stats)
}

async fn process_analysis(state: &AppState, job_id: &str, request: AnalyzeRequest) -> Result<()> {
    let repo_path = request.repo_path.clone();
    let work_dir = state.config.work_dir.clone();
    let git = tokio::task::spawn_blocking(move || GitCli::open(repo_path, work_dir)).await??;
    let name = git.name();
    let repository_id = request.repository_id.clone().unwrap_or_else(|| name.clone());

    mine(state, job_id, Arc::new(git), &name, &repository_id, request.last_commit.as_deref()).await
}

/// Scan the history, link corrective commits and persist the results.
async fn mine(
    state: &AppState,
    job_id: &str,
    vcs: Arc<dyn Vcs>,
    name: &str,
    repository_id: &str,
    since: Option<&str>,
) -> Result<()> {
    tracing::info!("Reading history of {:?}", vcs.location());
    let raw = git::read_log(vcs.as_ref(), &state.config.log_dir, name, since)
        .await
        .context("Failed to read commit history")?;

    let records = stats::split_log(&raw);
    let mut scan_state = ScanState::default();
    let mut commits = stats::scan(&records, &mut scan_state, &state.parser, state.classifier.as_ref());
    for commit in commits.iter_mut() {
        commit.repository_id = repository_id.to_string();
    }

    if let (Some(first), Some(last)) = (
        commits.first().and_then(|c| c.authored_at()),
        commits.last().and_then(|c| c.authored_at()),
    ) {
        tracing::info!("Scanned {} commits from {} to {}", commits.len(), first, last);
    }

    let correctives = commits.iter().filter(|c| c.is_corrective()).count();
    state.update_job(job_id, |job| {
        job.status = "LINKING".to_string();
        job.total_commits = commits.len();
        job.corrective_commits = correctives;
    });

    let coordinator = Coordinator::new(
        LinkContext {
            cache: Arc::clone(&state.cache),
            classifier: Arc::clone(&state.classifier),
            reports: None,
            persistence: Some(Arc::clone(&state.store)),
            repository_id: repository_id.to_string(),
        },
        LinkSettings {
            workers: state.config.workers,
            timeout: state.config.link_timeout,
        },
    );
    let links = coordinator.link_commits(vcs, &mut commits).await;
    if links.is_empty() {
        tracing::info!("No bug-introducing commits traced for job {}", job_id);
    } else {
        tracing::info!("Traced {} bug-introducing commits for job {}", links.len(), job_id);
    }

    let mut buggy = 0;
    for (idx, commit) in commits.iter().enumerate() {
        state.store.sync_commit(commit).await?;
        if commit.contains_bug {
            state.store.is_buggy(commit, repository_id).await?;
            buggy += 1;
        }
        if commit.linked {
            state.store.is_linked(commit, repository_id).await?;
        }
        tracing::debug!("Persisted commit {} ({}/{})", commit.short_hash(), idx + 1, commits.len());
    }

    state.update_job(job_id, |job| {
        job.status = "COMPLETED".to_string();
        job.buggy_commits = buggy;
        job.completed_at = Some(Utc::now());
    });

    tracing::info!(
        "Analysis completed for job {}: {} commits, {} corrective, {} bug-introducing",
        job_id,
        commits.len(),
        correctives,
        buggy
    );
    for bucket in [cache::DIFF_BUCKET, cache::BLAME_BUCKET] {
        let s = state.cache.stats(bucket);
        tracing::info!("Cache {}: {} elements, {} hits, {} misses", s.name, s.elements, s.hits, s.misses);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::{FIELD_DELIMITER, START_PRETTY, STOP_PRETTY};
    use crate::szz::tests::{FakeVcs, APP_DIFF};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn test_state(dir: &std::path::Path) -> AppState {
        let config = Config::from_lookup(|name| match name {
            "MINER_WORK_DIR" => Some(dir.to_string_lossy().to_string()),
            "MINER_WORKERS" => Some("2".to_string()),
            "MINER_LINK_TIMEOUT_SECS" => Some("5".to_string()),
            _ => None,
        })
        .unwrap();
        let store = JsonlStore::open(&config.output_dir).await.unwrap();
        AppState {
            cache: Arc::new(CacheStore::new()),
            classifier: Arc::new(KeywordClassifier::with_defaults()),
            parser: Arc::new(CommitParser::new(&config.fix_pattern, &config.review_pattern).unwrap()),
            store: Arc::new(store),
            jobs: Arc::new(RwLock::new(HashMap::new())),
            config: Arc::new(config),
        }
    }

    fn log_entry(parents: &str, hash: &str, ts: i64, message: &str, stats: &str) -> String {
        let d = FIELD_DELIMITER;
        format!(
            "{START_PRETTY}{parents}{d}{hash}{d}Dev{d}dev@x.io{d}date{d}{ts}{d}{message}{STOP_PRETTY}\n{stats}\n\n"
        )
    }

    #[tokio::test]
    async fn test_mine_links_history() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        state.jobs.write().insert(
            "job".to_string(),
            JobRecord {
                job_id: "job".to_string(),
                status: "SCANNING".to_string(),
                total_commits: 0,
                corrective_commits: 0,
                buggy_commits: 0,
                error: None,
                started_at: Utc::now(),
                completed_at: None,
            },
        );

        let mut vcs = FakeVcs::default();
        vcs.log = [
            log_entry("", "a1b2c3d4", 0, "initial import", "120\t0\tapp.go"),
            log_entry("a1b2c3d4", "C2", 86400, "@fix(BUG-42) fix crash in main", "1\t3\tapp.go"),
        ]
        .concat();
        vcs.diffs.insert("C2".into(), APP_DIFF.into());
        vcs.files.insert("C2".into(), vec!["app.go".into()]);
        for line in 101..=103 {
            vcs.blames.insert(
                ("app.go".into(), line),
                format!("a1b2c3d4 ( Author 2020-01-01 10:00:00 +0000 {}) old code", line),
            );
        }

        mine(&state, "job", Arc::new(vcs), "repo", "repo-1", None).await.unwrap();

        let job = state.jobs.read().get("job").cloned().unwrap();
        assert_eq!(job.status, "COMPLETED");
        assert_eq!(job.total_commits, 2);
        assert_eq!(job.corrective_commits, 1);
        assert_eq!(job.buggy_commits, 1);

        let buggy = std::fs::read_to_string(state.config.output_dir.join("buggy.jsonl")).unwrap();
        assert!(buggy.contains("a1b2c3d4") && buggy.contains("C2"));
        assert!(state.config.log_dir.join("log_repo_all.log").exists());
    }

    #[tokio::test]
    async fn test_health_and_unknown_job() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()).await);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::builder().uri("/jobs/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    fn analyze_request(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/analyze")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_analyze_rejects_running_job_id() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        state.jobs.write().insert(
            "busy".to_string(),
            JobRecord {
                job_id: "busy".to_string(),
                status: "LINKING".to_string(),
                total_commits: 3,
                corrective_commits: 1,
                buggy_commits: 0,
                error: None,
                started_at: Utc::now(),
                completed_at: None,
            },
        );

        let response = router(state.clone())
            .oneshot(analyze_request(serde_json::json!({ "jobId": "busy", "repoPath": "/nowhere" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(state.jobs.read()["busy"].status, "LINKING");
    }

    #[tokio::test]
    async fn test_analyze_rejects_option_like_last_commit() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;

        let response = router(state.clone())
            .oneshot(analyze_request(serde_json::json!({
                "jobId": "inject",
                "repoPath": dir.path().to_string_lossy(),
                "lastCommit": "--output=/tmp/x",
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(state.jobs.read().get("inject").is_none());
    }

    #[tokio::test]
    async fn test_analyze_invalid_repository_fails_job() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;
        let app = router(state.clone());

        let body = serde_json::json!({
            "jobId": "bad",
            "repoPath": dir.path().join("missing").to_string_lossy(),
        });
        let response = app.oneshot(analyze_request(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let mut status = String::new();
        for _ in 0..50 {
            status = state.jobs.read().get("bad").map(|j| j.status.clone()).unwrap_or_default();
            if status == "FAILED" {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(status, "FAILED");
        assert!(state.jobs.read()["bad"]
            .error
            .as_deref()
            .unwrap()
            .contains("Not a git repository"));
    }
}

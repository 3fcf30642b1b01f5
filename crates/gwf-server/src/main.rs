mod routes;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use gwf_core::config::{Config, RepoSettings};
use gwf_core::host::{GitHost, InMemoryHost};
use gwf_core::jobs::{run_worker, JobHandler, JobKind, JobQueue};
use gwf_core::robot::Robot;
use gwf_core::tracker::{InMemoryTracker, IssueTracker};
use tokio::sync::Mutex as TokioMutex;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use routes::RepoHandle;

// ── AppState ──────────────────────────────────────────────────────────────

pub struct AppState {
    pub config: Arc<Config>,
    pub repos: HashMap<String, RepoHandle>,
    pub sessions: routes::Sessions,
}

// ── main ──────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "gwf_server=info,gwf_core=info,tower_http=warn".into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env()?);
    let all_settings = RepoSettings::load(&config.settings_path)?;
    anyhow::ensure!(
        !all_settings.is_empty(),
        "no repositories configured in {}",
        config.settings_path
    );

    std::fs::create_dir_all(&config.data_dir)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let mut repos: HashMap<String, RepoHandle> = HashMap::new();
    let mut queues: Vec<Arc<JobQueue>> = Vec::new();

    for settings in all_settings {
        let repo_key = settings.repo_key();

        // Adapter wiring point: swap in the Bitbucket/GitHub and Jira
        // clients here. The in-process implementations below serve local
        // runs and the end-to-end scenarios.
        let host: Arc<dyn GitHost> = Arc::new(InMemoryHost::new(&settings.robot));
        let tracker: Option<Arc<dyn IssueTracker>> = if settings.tracker_enabled() {
            Some(Arc::new(InMemoryTracker::new()))
        } else {
            None
        };

        let robot = Arc::new(Robot::new(
            Arc::clone(&config),
            settings.clone(),
            Arc::clone(&host),
            tracker,
        )?);

        let (queue, wake) = JobQueue::new();
        let handler: Arc<dyn JobHandler> = Arc::clone(&robot) as Arc<dyn JobHandler>;
        tokio::spawn(run_worker(
            Arc::clone(&queue),
            wake,
            handler,
            Arc::clone(&shutdown),
            config.max_retries,
        ));

        // Periodic scan for events the webhook missed.
        if config.scan_interval_s > 0 {
            let scan_host = Arc::clone(&host);
            let scan_queue = Arc::clone(&queue);
            let scan_shutdown = Arc::clone(&shutdown);
            let interval = Duration::from_secs(config.scan_interval_s);
            let scan_key = repo_key.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    if scan_shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    match scan_host.list_open_pull_requests().await {
                        Ok(prs) => {
                            for pr in prs {
                                scan_queue.enqueue(JobKind::PullRequest { pr_id: pr.id }, None);
                            }
                        }
                        Err(e) => warn!("{scan_key}: periodic scan failed: {e}"),
                    }
                }
            });
        }

        info!("watching {repo_key}");
        queues.push(Arc::clone(&queue));
        repos.insert(repo_key, RepoHandle { settings, queue });
    }

    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        repos,
        sessions: Arc::new(TokioMutex::new(HashMap::new())),
    });

    let app = Router::new()
        .route("/api/auth", get(routes::auth))
        .route("/api/jobs", get(routes::list_jobs))
        .route("/api/jobs/:id", get(routes::get_job))
        .route("/api/pull-requests/:id", post(routes::enqueue_pull_request))
        .route(
            "/api/gwf/branches/*branch",
            post(routes::create_branch).delete(routes::delete_branch),
        )
        .route(
            "/api/gwf/queues",
            post(routes::rebuild_queues)
                .delete(routes::delete_queues)
                .patch(routes::force_merge),
        )
        .route("/webhook", post(routes::webhook))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{}:{}", config.web_bind, config.web_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested; letting running jobs finish");
        })
        .await?;

    shutdown.store(true, Ordering::Release);
    for queue in &queues {
        queue.kick();
    }
    Ok(())
}

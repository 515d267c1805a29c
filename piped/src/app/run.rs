//! Main application run loop

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::AppState;
use crate::config::piped::{PipedConfig, PipedSpec};
use crate::controller::Controller;
use crate::driftdetector;
use crate::errors::PipedError;
use crate::git::CliGitClient;
use crate::http::client::HttpClient;
use crate::planpreview::Handler;
use crate::workers::{controller, drift, planpreview};

/// Run piped until `shutdown_signal` resolves
pub async fn run(
    version: String,
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), PipedError> {
    info!("Initializing piped {}...", version);

    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    if let Err(e) = init(&options, &shutdown_tx, &mut shutdown_manager).await {
        error!("Failed to start piped: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    shutdown_tx: &broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), PipedError> {
    let spec = PipedConfig::load(&options.config_file).await?.spec;
    let app_state = init_app_state(spec).await?;

    init_controller_worker(
        options.controller.clone(),
        app_state.clone(),
        shutdown_manager,
        shutdown_tx.subscribe(),
    )?;

    if options.enable_drift_detection {
        init_drift_detector_workers(
            options.drift_detection.clone(),
            app_state.clone(),
            shutdown_manager,
            shutdown_tx,
        );
    } else {
        info!("Drift detection is disabled");
    }

    if options.enable_plan_preview {
        init_plan_preview_worker(
            options.plan_preview.clone(),
            app_state,
            shutdown_manager,
            shutdown_tx.subscribe(),
        )?;
    }
    Ok(())
}

async fn init_app_state(spec: PipedSpec) -> Result<Arc<AppState>, PipedError> {
    let piped_key = spec.load_piped_key()?;
    let api = Arc::new(HttpClient::new(&spec.api_address, &spec.piped_id, piped_key)?);
    let git_client = Arc::new(CliGitClient::new(&spec.git.username, &spec.git.email)?);
    if let Some(sm) = &spec.secret_management {
        warn!(
            "Secret management {} is not supported, encrypted secrets are left as they are",
            sm.kind
        );
    }
    Ok(Arc::new(AppState::init(spec, api, git_client).await?))
}

fn init_controller_worker(
    options: controller::Options,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), PipedError> {
    info!("Initializing controller worker...");

    let controller_handle = tokio::spawn(async move {
        let controller = Controller::new(app_state);
        controller::run(
            &options,
            &controller,
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_controller_worker_handle(controller_handle)
}

fn init_drift_detector_workers(
    options: drift::Options,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    shutdown_tx: &broadcast::Sender<()>,
) {
    info!("Initializing drift detector workers...");

    for detector in driftdetector::detectors(&app_state) {
        let options = options.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            drift::run(
                &options,
                &detector,
                tokio::time::sleep,
                Box::pin(async move {
                    let _ = shutdown_rx.recv().await;
                }),
            )
            .await;
        });
        shutdown_manager.with_drift_detector_handle(handle);
    }
}

fn init_plan_preview_worker(
    options: planpreview::Options,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), PipedError> {
    info!("Initializing plan-preview worker...");

    let handle = tokio::spawn(async move {
        let handler = Handler::new(app_state);
        planpreview::run(
            &options,
            &handler,
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_plan_preview_worker_handle(handle)
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    controller_worker_handle: Option<JoinHandle<()>>,
    plan_preview_worker_handle: Option<JoinHandle<()>>,
    drift_detector_handles: Vec<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            controller_worker_handle: None,
            plan_preview_worker_handle: None,
            drift_detector_handles: Vec::new(),
        }
    }

    pub fn with_controller_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), PipedError> {
        if self.controller_worker_handle.is_some() {
            return Err(PipedError::Shutdown("controller_handle already set".to_string()));
        }
        self.controller_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_plan_preview_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), PipedError> {
        if self.plan_preview_worker_handle.is_some() {
            return Err(PipedError::Shutdown("plan_preview_handle already set".to_string()));
        }
        self.plan_preview_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_drift_detector_handle(&mut self, handle: JoinHandle<()>) {
        self.drift_detector_handles.push(handle);
    }

    pub async fn shutdown(&mut self) -> Result<(), PipedError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(self.lifecycle_options.max_shutdown_delay, self.shutdown_impl()).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), PipedError> {
        info!("Shutting down piped...");

        // 1. Plan-preview worker
        if let Some(handle) = self.plan_preview_worker_handle.take() {
            handle.await.map_err(|e| PipedError::Shutdown(e.to_string()))?;
        }

        // 2. Drift detectors
        for handle in self.drift_detector_handles.drain(..) {
            handle.await.map_err(|e| PipedError::Shutdown(e.to_string()))?;
        }

        // 3. Controller, which interrupts the running deployments
        if let Some(handle) = self.controller_worker_handle.take() {
            handle.await.map_err(|e| PipedError::Shutdown(e.to_string()))?;
        }

        info!("Shutdown complete");
        Ok(())
    }
}

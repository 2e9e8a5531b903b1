//! Standalone wiring: one store, every controller, the runner for the
//! local node, the ingress and the REST API in a single process.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use strata_activator::Activator;
use strata_api::{build_router, ApiState};
use strata_controllers::{
    DefaultAppController, DefaultRouteController, Deployer, DiskLeaseController, IpAllocator,
    Subnet,
};
use strata_entity::{EntityId, EntityStore};
use strata_ingress::{IngressConfig, IngressState};
use strata_reconcile::Controller;
use strata_runner::{Runner, SandboxDriver};
use strata_scheduler::Scheduler;

use crate::config::DaemonConfig;

/// Open the store the config points at.
pub fn open_store(config: &DaemonConfig) -> anyhow::Result<EntityStore> {
    let store = if config.store.in_memory {
        EntityStore::open_in_memory()?
    } else {
        std::fs::create_dir_all(&config.store.data_dir)?;
        let path = config.store.db_path();
        let store = EntityStore::open(&path)?;
        info!(path = ?path, "entity store opened");
        store
    };
    Ok(store.with_watch_buffer(config.store.watch_buffer))
}

/// A running control plane.
pub struct Daemon {
    store: EntityStore,
    activator: Arc<Activator>,
    node: EntityId,
    api_addr: SocketAddr,
    ingress_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Daemon {
    /// Start every subsystem. Returns once both listeners are bound.
    pub async fn start<D: SandboxDriver>(
        config: &DaemonConfig,
        store: EntityStore,
        driver: Arc<D>,
    ) -> anyhow::Result<Self> {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();
        let retry_base = config.scheduler.retry_base;
        let retry_max = config.scheduler.retry_max;

        // ── Placement ──────────────────────────────────────────────

        let scheduler = Scheduler::new(store.clone(), config.scheduler_config());
        tasks.push(
            Controller::new(store.clone(), scheduler)
                .with_retry(retry_base, retry_max)
                .spawn(shutdown_rx.clone()),
        );
        info!("scheduler started");

        // ── Activator ──────────────────────────────────────────────

        let activator = Arc::new(Activator::new(store.clone(), config.activator_config()));
        tasks.push(Controller::from_arc(store.clone(), activator.clone()).spawn(shutdown_rx.clone()));
        tasks.push(tokio::spawn(activator.clone().run_background(shutdown_rx.clone())));
        info!("activator started");

        // ── Local node ─────────────────────────────────────────────

        let runner = Arc::new(Runner::new(store.clone(), driver, config.runner_config())?);
        runner.register()?;
        let node = runner.node_id().clone();
        tasks.push(
            Controller::from_arc(store.clone(), runner.clone())
                .with_retry(retry_base, retry_max)
                .spawn(shutdown_rx.clone()),
        );
        tasks.push(tokio::spawn(runner.run_heartbeat(shutdown_rx.clone())));
        info!(%node, "runner started");

        // ── Secondary controllers ──────────────────────────────────

        let subnet: Subnet = config.network.service_subnet.parse()?;
        tasks.push(
            Controller::new(store.clone(), IpAllocator::new(store.clone(), subnet))
                .spawn(shutdown_rx.clone()),
        );

        let disks = DiskLeaseController::new(store.clone()).with_retention(config.disk.released_retention);
        let orphans = disks.release_orphans()?;
        if orphans > 0 {
            info!(orphans, "released disk leases of vanished sandboxes");
        }
        tasks.push(Controller::new(store.clone(), disks).spawn(shutdown_rx.clone()));

        tasks.push(
            Controller::new(store.clone(), DefaultAppController::new(store.clone()))
                .spawn(shutdown_rx.clone()),
        );
        tasks.push(
            Controller::new(store.clone(), DefaultRouteController::new(store.clone())?)
                .spawn(shutdown_rx.clone()),
        );
        info!(%subnet, "secondary controllers started");

        // ── HTTP ───────────────────────────────────────────────────

        let api_listener = TcpListener::bind(config.api.addr()).await?;
        let api_addr = api_listener.local_addr()?;
        let router = build_router(ApiState {
            store: store.clone(),
            activator: activator.clone(),
            deployer: Arc::new(Deployer::new(store.clone())),
        });
        let mut api_shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let server = axum::serve(api_listener, router).with_graceful_shutdown(async move {
                let _ = api_shutdown.wait_for(|stop| *stop).await;
            });
            if let Err(e) = server.await {
                error!(error = %e, "api server failed");
            }
        }));
        info!(%api_addr, "API server listening");

        let ingress_listener = TcpListener::bind(config.ingress.addr()).await?;
        let ingress_addr = ingress_listener.local_addr()?;
        let ingress = IngressState {
            store: store.clone(),
            activator: activator.clone(),
            config: IngressConfig::default(),
        };
        let ingress_shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = strata_ingress::serve(ingress, ingress_listener, ingress_shutdown).await {
                error!(error = %e, "ingress server failed");
            }
        }));

        Ok(Self {
            store,
            activator,
            node,
            api_addr,
            ingress_addr,
            shutdown,
            tasks,
        })
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn activator(&self) -> &Arc<Activator> {
        &self.activator
    }

    /// The local node's id.
    pub fn node(&self) -> &EntityId {
        &self.node
    }

    pub fn api_addr(&self) -> SocketAddr {
        self.api_addr
    }

    pub fn ingress_addr(&self) -> SocketAddr {
        self.ingress_addr
    }

    /// Stop every task and wait for them to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        info!("strata daemon stopped");
    }
}

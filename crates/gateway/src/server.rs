use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use pingora::prelude::*;
use pingora::server::RunArgs;
use pingora::server::Server as PingoraServer;
use pingora::server::configuration::Opt;
use pingora::services::background::{BackgroundService, GenBackgroundService};

use crate::configuration::{Config, ConfigReloader, ServerConfig, resolve};
use crate::counter::{MemoryCounterStore, RedisCounterStore, UsageCounterStore};
use crate::directory::SqlitePlanDirectory;
use crate::lb::Gateway;
use crate::limiter::RateLimiter;
use crate::metric::Metrics;

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(60);
const METRICS_RETENTION: Duration = Duration::from_secs(24 * 3600);

fn internal(what: &str, e: impl std::fmt::Display) -> Box<Error> {
    Error::explain(ErrorType::InternalError, format!("{what}: {e}"))
}

/// Background service that drops expired in-process counters and old metrics.
pub struct Housekeeping {
    counters: Option<Arc<MemoryCounterStore>>,
    metrics: Arc<Metrics>,
}

impl Housekeeping {
    pub fn run_once(&self) {
        if let Some(counters) = &self.counters {
            let purged = counters.purge_expired();
            if purged > 0 {
                log::debug!("Purged {} expired usage counters", purged);
            }
        }
        self.metrics.prune(SystemTime::now(), METRICS_RETENTION);
    }
}

#[async_trait]
impl BackgroundService for Housekeeping {
    async fn start(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    return;
                }
                _ = tokio::time::sleep(HOUSEKEEPING_INTERVAL) => {}
            }
            self.run_once();
        }
    }
}

pub struct Server {
    server: PingoraServer,
}

impl Server {
    pub fn new(opt: Option<Opt>) -> Result<Self> {
        let server = PingoraServer::new(opt)?;
        Ok(Server { server })
    }

    /// Wire the stores, limiter and proxy into the Pingora server.
    ///
    /// Relative paths in `server_conf` are resolved against `config_base_path`.
    /// There is no fallback limiter: if the plan directory cannot be opened
    /// the gateway refuses to start instead of serving unmetered traffic.
    pub fn bootstrap(
        &mut self,
        server_conf: ServerConfig,
        config_base_path: &Path,
        metrics: Arc<Metrics>,
    ) -> Result<()> {
        self.server.bootstrap();

        let backend_config_path = resolve(config_base_path, &server_conf.backend);
        let config = Config::from_yaml_file(&backend_config_path)
            .map_err(|e| internal("invalid backend config", e))?;
        let config_arc = Arc::new(RwLock::new(config));

        let reloader = ConfigReloader {
            path: backend_config_path,
            config: config_arc.clone(),
        };
        self.server.add_service(GenBackgroundService::new(
            "config reloader".to_string(),
            Arc::new(reloader),
        ));

        let plan_db_path = resolve(config_base_path, &server_conf.plan_db);
        let directory = SqlitePlanDirectory::open(&plan_db_path)
            .map_err(|e| internal("failed to open plan directory", e))?;
        log::info!("Using plan directory at {:?}", plan_db_path);

        let mut memory_counters = None;
        let counters: Arc<dyn UsageCounterStore> = match server_conf.redis_url.as_deref() {
            Some(url) => {
                let store = RedisCounterStore::open(url)
                    .map_err(|e| internal("invalid redis_url", e))?;
                log::info!("Using Redis usage counters");
                Arc::new(store)
            }
            None => {
                log::warn!(
                    "No redis_url configured, usage counters are local to this instance"
                );
                let store = Arc::new(MemoryCounterStore::new());
                memory_counters = Some(store.clone());
                store
            }
        };

        self.server.add_service(GenBackgroundService::new(
            "housekeeping".to_string(),
            Arc::new(Housekeeping {
                counters: memory_counters,
                metrics: metrics.clone(),
            }),
        ));

        let limiter = RateLimiter::new(Arc::new(directory), counters, server_conf.quota_policy())
            .with_store_timeout(server_conf.store_timeout());

        let mut lb_service = http_proxy_service(
            &self.server.configuration,
            Gateway::new(config_arc, Arc::new(limiter), metrics),
        );
        lb_service.add_tcp(&server_conf.listen);
        self.server.add_service(lb_service);

        Ok(())
    }

    pub fn run_forever(self) {
        self.server.run_forever();
    }

    pub fn run(self, args: RunArgs) {
        self.server.run(args);
    }
}

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use sqlx::postgres::PgPoolOptions;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    api,
    clients::{HttpFetcher, ReplicateAdapter, ReplicateClient},
    config::Config,
    observability::Telemetry,
    stages::{Activities, ProviderSet, StageTimings},
    storage::S3AssetStore,
    store::{
        dao::{JobDao, PgComicDao, WorkflowRunDao},
        models::JobKind,
    },
    workflow::{EngineSettings, WorkflowEngine},
};

#[derive(Clone)]
pub(crate) struct AppState {
    registry: Arc<ComponentRegistry>,
}

pub struct ComponentRegistry {
    config: Arc<Config>,
    telemetry: Telemetry,
    jobs: Arc<dyn JobDao>,
    runs: Arc<dyn WorkflowRunDao>,
    engine: WorkflowEngine,
    pg: Option<PgComicDao>,
}

impl AppState {
    pub(crate) fn new(registry: ComponentRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub(crate) fn telemetry(&self) -> &Telemetry {
        &self.registry.telemetry
    }

    pub(crate) fn config(&self) -> &Config {
        &self.registry.config
    }

    pub(crate) fn jobs(&self) -> Arc<dyn JobDao> {
        Arc::clone(&self.registry.jobs)
    }

    pub(crate) fn engine(&self) -> &WorkflowEngine {
        &self.registry.engine
    }
}

impl ComponentRegistry {
    /// 構成情報から DB プール、ストレージ、プロバイダ、エンジンを組み立てる。
    ///
    /// DB には遅延接続するため、ここでは接続しない。
    ///
    /// # Errors
    /// Telemetry の初期化や HTTP クライアント構築が失敗した場合はエラーを返す。
    pub async fn build(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let telemetry = Telemetry::new(
            config.otel_exporter_endpoint(),
            config.otel_sampling_ratio(),
        )?;

        let pool = PgPoolOptions::new()
            .max_connections(config.comic_db_max_connections())
            .min_connections(config.comic_db_min_connections())
            .acquire_timeout(config.comic_db_acquire_timeout())
            .idle_timeout(Some(config.comic_db_idle_timeout()))
            .max_lifetime(Some(config.comic_db_max_lifetime()))
            .test_before_acquire(true)
            .connect_lazy(config.comic_db_dsn())
            .context("failed to configure comic_db connection pool")?;
        let pg = PgComicDao::new(pool);
        let dao = Arc::new(pg.clone());

        let assets = Arc::new(S3AssetStore::from_config(&config).await?);
        let fetcher = Arc::new(HttpFetcher::new(config.asset_download_timeout())?);

        let replicate = Arc::new(ReplicateClient::new(
            config.replicate_base_url(),
            config.replicate_api_token().map(str::to_string),
            config.provider_request_timeout(),
            config.http_max_retries(),
            config.http_backoff_base_ms(),
            config.http_backoff_cap_ms(),
        )?);
        let openai_key = config.openai_api_key().map(str::to_string);
        let providers = ProviderSet {
            avatar: Arc::new(ReplicateAdapter::new(
                Arc::clone(&replicate),
                JobKind::Avatar,
                config.avatar_model(),
                openai_key.clone(),
            )),
            scene: Arc::new(ReplicateAdapter::new(
                Arc::clone(&replicate),
                JobKind::Scene,
                config.scene_model(),
                openai_key.clone(),
            )),
            animation: Arc::new(ReplicateAdapter::new(
                Arc::clone(&replicate),
                JobKind::Animation,
                config.animation_model(),
                openai_key,
            )),
        };

        let activities = Activities::new(
            dao.clone(),
            assets,
            fetcher,
            providers,
            StageTimings::from_config(&config),
            telemetry.metrics_arc(),
        );
        let runs: Arc<dyn WorkflowRunDao> = dao.clone();
        let engine = WorkflowEngine::new(
            activities,
            Arc::clone(&runs),
            EngineSettings::from_config(&config),
        );

        Ok(Self {
            config,
            telemetry,
            jobs: dao,
            runs,
            engine,
            pg: Some(pg),
        })
    }

    /// 既に組み立てた部品からレジストリを作る（テスト用）。
    #[must_use]
    pub fn from_parts(
        config: Config,
        telemetry: Telemetry,
        jobs: Arc<dyn JobDao>,
        runs: Arc<dyn WorkflowRunDao>,
        engine: WorkflowEngine,
    ) -> Self {
        Self {
            config: Arc::new(config),
            telemetry,
            jobs,
            runs,
            engine,
            pg: None,
        }
    }

    /// 設定で有効な場合にスキーマを適用する。
    ///
    /// # Errors
    /// DDL の実行に失敗した場合はエラーを返す。
    pub async fn migrate(&self) -> Result<()> {
        let Some(pg) = &self.pg else {
            return Ok(());
        };
        if !self.config.comic_db_auto_migrate() {
            info!("automatic schema migration disabled");
            return Ok(());
        }
        pg.ensure_schema().await?;
        info!("comic job schema is up to date");
        Ok(())
    }

    #[must_use]
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    #[must_use]
    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    #[must_use]
    pub fn runs(&self) -> Arc<dyn WorkflowRunDao> {
        Arc::clone(&self.runs)
    }
}

pub fn build_router(registry: ComponentRegistry) -> Router {
    let state = AppState::new(registry);
    api::router(state).layer(TraceLayer::new_for_http())
}

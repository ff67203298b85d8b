use std::sync::Arc;

use ingest_common::cursor::{
    CursorCache, CursorManager, CursorStore, NoopCursorCache, PgCursorStore, RedisCursorCache,
};
use ingest_common::dlq::{DeadLetterQueue, PgDeadLetterStore};
use ingest_common::pipeline::OperationProcessor;
use ingest_common::replay::DlqReplayer;
use ingest_common::sink::{
    CacheInvalidator, FanOutSink, NoopCacheInvalidator, NoopGraphSink, NoopSearchSink,
    PgStorageSink, RedisCacheInvalidator,
};
use ingest_common::transform::{RecordTransformer, SchemaCompatibilityService};
use redis::aio::ConnectionManager;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::config::Config;
use crate::consumer::FirehoseConsumer;
use crate::error::StartupError;
use crate::health::ConsumerHealth;
use crate::router::AdminState;
use crate::transport::FirehoseTransport;

pub struct AppContext {
    pub config: Config,
    pub pool: PgPool,
    pub cursor_store: Arc<dyn CursorStore>,
    pub cursor_cache: Arc<dyn CursorCache>,
    pub dlq: DeadLetterQueue,
    pub processor: Arc<OperationProcessor>,
    pub compat: SchemaCompatibilityService,
    pub health: ConsumerHealth,
}

impl AppContext {
    /// Connect to every durable store up front. Any failure here is fatal.
    pub async fn new(config: Config) -> Result<Self, StartupError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_pg_connections)
            .connect(&config.database_url)
            .await?;

        if config.run_migrations {
            info!("running migrations");
            sqlx::migrate!("../migrations").run(&pool).await?;
        }

        let redis = match &config.redis_url {
            Some(url) => {
                let client = redis::Client::open(url.as_str())?;
                Some(ConnectionManager::new(client).await?)
            }
            None => None,
        };

        let (cursor_cache, invalidator): (Arc<dyn CursorCache>, Arc<dyn CacheInvalidator>) =
            match redis {
                Some(conn) => (
                    Arc::new(RedisCursorCache::new(conn.clone())),
                    Arc::new(RedisCacheInvalidator::new(conn)),
                ),
                None => (Arc::new(NoopCursorCache), Arc::new(NoopCacheInvalidator)),
            };

        let sink = FanOutSink::new(
            Arc::new(PgStorageSink::new(pool.clone())),
            Arc::new(NoopSearchSink),
            Arc::new(NoopGraphSink),
            invalidator,
        );

        let processor = OperationProcessor::new(
            config.event_filter(),
            RecordTransformer::new(&config.collection_namespace),
            Arc::new(sink),
            config.sink_retry(),
        );

        info!(
            namespace = config.collection_namespace,
            strict = processor.filter().is_strict(),
            cache = config.redis_url.is_some(),
            "pipeline configured"
        );

        Ok(Self {
            cursor_store: Arc::new(PgCursorStore::new(pool.clone())),
            cursor_cache,
            dlq: DeadLetterQueue::new(Arc::new(PgDeadLetterStore::new(pool.clone()))),
            processor: Arc::new(processor),
            compat: SchemaCompatibilityService::new(&config.collection_namespace),
            health: ConsumerHealth::new(),
            pool,
            config,
        })
    }

    pub fn cursor_manager(&self) -> CursorManager {
        CursorManager::new(
            &self.config.service_name,
            self.cursor_store.clone(),
            self.cursor_cache.clone(),
            self.config.cursor.settings(),
        )
    }

    pub fn consumer(
        &self,
        transport: Arc<dyn FirehoseTransport>,
        cursor: Arc<CursorManager>,
    ) -> FirehoseConsumer {
        FirehoseConsumer::new(
            transport,
            cursor,
            self.processor.clone(),
            self.dlq.clone(),
            self.config.reconnect.manager(),
            self.config.connect_timeout_ms.0,
            self.health.clone(),
        )
    }

    pub fn replayer(&self) -> DlqReplayer {
        DlqReplayer::new(
            self.dlq.clone(),
            self.processor.clone(),
            self.config.dlq_max_retries,
            self.config.replay_batch_size,
        )
    }

    pub fn admin_state(&self) -> AdminState {
        AdminState {
            dlq: self.dlq.clone(),
            compat: self.compat.clone(),
            health: self.health.clone(),
        }
    }
}

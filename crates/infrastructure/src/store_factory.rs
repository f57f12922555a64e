use std::sync::Arc;
use std::time::Duration;

use crond_core::config::{StoreBackend, StoreConfig};
use crond_core::traits::CoordinationStore;
use crond_core::CronResult;
use tracing::info;

use crate::{InMemoryCoordinationStore, InMemoryStoreConfig, RedisCoordinationStore, RedisStoreConfig};

/// 按配置创建协调存储
pub struct CoordinationStoreFactory;

impl CoordinationStoreFactory {
    pub async fn create(config: &StoreConfig) -> CronResult<Arc<dyn CoordinationStore>> {
        match config.backend {
            StoreBackend::Memory => {
                info!("使用进程内协调存储");
                Ok(Arc::new(InMemoryCoordinationStore::with_config(
                    InMemoryStoreConfig {
                        reap_interval: Duration::from_millis(config.reap_interval_ms),
                        ..InMemoryStoreConfig::default()
                    },
                )))
            }
            StoreBackend::Redis => {
                info!(namespace = %config.namespace, "使用Redis协调存储");
                let store = RedisCoordinationStore::connect(RedisStoreConfig::from(config)).await?;
                Ok(Arc::new(store))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_backend_is_default() {
        let store = CoordinationStoreFactory::create(&StoreConfig::default())
            .await
            .unwrap();
        store.put("a", b"1".to_vec(), None).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().kvs.len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_redis_fails_fast() {
        let config = StoreConfig {
            backend: StoreBackend::Redis,
            url: "redis://127.0.0.1:1".to_string(),
            connect_timeout_ms: 500,
            ..StoreConfig::default()
        };
        let err = CoordinationStoreFactory::create(&config).await.err().unwrap();
        assert!(matches!(err, crond_core::CronError::Store(_)));
    }
}

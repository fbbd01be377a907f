use redis::AsyncCommands;
use std::sync::{Arc, Once};
use taskflow_redis::{RedisBackend, RedisClient, RedisConfig};
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    ContainerAsync, GenericImage, ImageExt,
};
use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("taskflow_redis=debug,taskflow_core=info"));
        let _ = fmt().with_env_filter(filter).with_test_writer().try_init();
    });
}

/// A Redis container shared by the backends of one test. Each backend gets
/// its own key prefix so scenarios in the same container never see each
/// other's rows or indices.
pub struct TestRedis {
    container: Option<ContainerAsync<GenericImage>>,
    url: String,
}

impl TestRedis {
    pub async fn start() -> Self {
        let container = GenericImage::new("redis", "7.2.4")
            .with_exposed_port(6379.tcp())
            .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"))
            .start()
            .await
            .expect("start redis container");
        let port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("redis port");
        let url = format!("redis://127.0.0.1:{port}/");
        tracing::info!(%url, "Redis container ready");
        Self {
            container: Some(container),
            url,
        }
    }

    /// A backend writing under `prefix`.
    pub async fn backend(&self, prefix: &str) -> Arc<RedisBackend> {
        let config = RedisConfig::new(self.url.clone()).with_key_prefix(prefix);
        let client = RedisClient::new(config).await.expect("redis client");
        Arc::new(RedisBackend::new(client))
    }

    async fn conn(&self) -> redis::aio::MultiplexedConnection {
        redis::Client::open(self.url.as_str())
            .expect("redis url")
            .get_multiplexed_async_connection()
            .await
            .expect("redis connection")
    }

    /// Every key stored under `prefix`, sorted.
    pub async fn keys(&self, prefix: &str) -> Vec<String> {
        let mut conn = self.conn().await;
        let mut keys: Vec<String> = conn.keys(format!("{prefix}*")).await.expect("KEYS");
        keys.sort();
        keys
    }

    /// Task ids held by one of the scheduling indices
    /// (`tasks:pending`, `tasks:retrying` or `tasks:running`).
    pub async fn index(&self, prefix: &str, name: &str) -> Vec<String> {
        let mut conn = self.conn().await;
        let key = format!("{prefix}{name}");
        let mut ids: Vec<String> = if name == "tasks:pending" {
            conn.smembers(&key).await.expect("SMEMBERS")
        } else {
            conn.zrange(&key, 0, -1).await.expect("ZRANGE")
        };
        ids.sort();
        ids
    }

    /// Delete every key under `prefix`.
    pub async fn flush_prefix(&self, prefix: &str) {
        let keys = self.keys(prefix).await;
        if keys.is_empty() {
            return;
        }
        let mut conn = self.conn().await;
        let _: () = conn.del(keys).await.expect("DEL");
    }

    pub async fn cleanup(&mut self) {
        if let Some(container) = self.container.take() {
            container.rm().await.expect("remove redis container");
        }
    }
}

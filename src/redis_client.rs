use redis::{aio::MultiplexedConnection, Client};

/// Подключение к Redis, на котором живёт очередь фоновых задач.
/// Мультиплексированное соединение клонируется дёшево и безопасно
/// разделяется между HTTP-обработчиками и воркерами.
#[derive(Clone)]
pub struct RedisClient {
    pub conn: MultiplexedConnection,
}

impl RedisClient {
    pub async fn new(redis_url: &str) -> redis::RedisResult<Self> {
        let client = Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(RedisClient { conn })
    }

    pub async fn ping(&self) -> redis::RedisResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

use anyhow::{Context, Result};
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use trade_capture::AppConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::from_env()?;
    let partitions: i32 = std::env::var("TOPIC_PARTITIONS")
        .unwrap_or_else(|_| "3".to_string())
        .parse()
        .context("TOPIC_PARTITIONS must be a number")?;

    let admin_client: AdminClient<DefaultClientContext> = ClientConfig::new()
        .set("bootstrap.servers", &config.kafka.bootstrap_servers)
        .create()
        .context("Failed to create admin client")?;

    // Both topics are keyed by portfolio, so per-portfolio order holds within a partition.
    let topics = vec![
        NewTopic::new(&config.kafka.ingest_topic, partitions, TopicReplication::Fixed(1)),
        NewTopic::new(&config.kafka.publish_topic, partitions, TopicReplication::Fixed(1)),
    ];

    let results = admin_client
        .create_topics(&topics, &AdminOptions::new())
        .await
        .context("Failed to create topics")?;

    for result in results {
        match result {
            Ok(topic) => println!("Created topic: {}", topic),
            Err((topic, e)) => println!("Failed to create topic {}: {}", topic, e),
        }
    }
    Ok(())
}

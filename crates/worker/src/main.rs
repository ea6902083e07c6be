use std::sync::Arc;

use annotator_core::config::Config;
use annotator_db::store::SharedStore;
use annotator_db::MemoryStore;
use annotator_events::{CallbackBus, EventBus};
use annotator_pipeline::EventProcessor;
use annotator_worker::EventConsumer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "annotator_worker=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let store: SharedStore = Arc::new(MemoryStore::new());
    let bus = Arc::new(EventBus::default());
    let callbacks = Arc::new(CallbackBus::default());
    let processor = Arc::new(
        EventProcessor::new(Arc::clone(&store), config).with_callbacks(Arc::clone(&callbacks)),
    );

    tracing::info!("Worker starting, consuming annotation pipeline events");
    let receiver = bus.subscribe();
    EventConsumer::run(processor, bus, receiver).await;
}

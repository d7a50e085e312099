//! delivery-demo - runs a producer and a consumer through the delivery protocol.
//!
//! ```text
//! delivery-demo --messages 500 --buffer-size 20 --durable
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use ractor::rpc::CallResult;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use tether_core::ResultExt;

use tether_delivery::{
    ConsumerControllerArguments, ConsumerControllerMessage, Delivery, DeliveryError,
    DeliverySettings, InMemoryDurableProducerQueue, ProducerControllerArguments,
    ProducerControllerMessage, ProducerId, ProducerSignal, spawn_consumer_controller,
    spawn_producer_controller,
};

#[derive(Debug, Parser)]
#[command(name = "delivery-demo", version, about = "Reliable delivery demo")]
struct Cli {
    /// Settings file (TOML or JSON). Without it TETHER_DELIVERY_CONFIG is
    /// tried, and an unreadable file there falls back to the defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of messages to send.
    #[arg(long, default_value_t = 100)]
    messages: u64,

    /// Back the producer with the in-memory durable queue.
    #[arg(long)]
    durable: bool,

    /// Overrides both the producer buffer and the consumer window.
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Log directive used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), DeliveryError> {
    let cli = Cli::parse();
    tether_core::telemetry::init_tracing(&cli.log)?;

    let mut settings = match &cli.config {
        Some(path) => DeliverySettings::load(path)?,
        None => DeliverySettings::from_env_or_default().or_default_logged(DeliverySettings::default()),
    };
    if let Some(buffer_size) = cli.buffer_size {
        settings.producer_controller.buffer_size = buffer_size;
        settings.consumer_controller.buffer_size = buffer_size;
    }
    settings.validate()?;

    if cli.messages == 0 {
        info!("Nothing to send");
        return Ok(());
    }

    let (done_tx, done_rx) = oneshot::channel();
    let (consumer, _) = Actor::spawn(None, DemoConsumer, (cli.messages, done_tx))
        .await
        .map_err(|e| DeliveryError::spawn_failed(e.to_string()))?;
    let consumer_controller = spawn_consumer_controller(
        None,
        ConsumerControllerArguments::new()
            .with_settings(settings.consumer_controller.clone())
            .with_consumer(consumer.clone()),
    )
    .await?;

    let (producer, _) = Actor::spawn(None, DemoProducer, cli.messages)
        .await
        .map_err(|e| DeliveryError::spawn_failed(e.to_string()))?;
    let mut args = ProducerControllerArguments::new(ProducerId::generate())
        .with_settings(settings.producer_controller.clone())
        .with_producer(producer.clone());
    if cli.durable {
        args = args.with_durable_queue(Arc::new(InMemoryDurableProducerQueue::new()));
    }
    let producer_controller = spawn_producer_controller(None, args).await?;

    let started = Instant::now();
    consumer_controller.send_message(ConsumerControllerMessage::RegisterToProducerController {
        producer_controller: producer_controller.clone(),
    })?;
    done_rx.await.map_err(|_| DeliveryError::ActorUnavailable)?;
    let elapsed = started.elapsed();

    match producer_controller
        .call(
            |reply| ProducerControllerMessage::GetState { reply },
            Some(Duration::from_secs(5)),
        )
        .await?
    {
        CallResult::Success(snapshot) => info!(
            producer_id = %snapshot.producer_id,
            current_seq_nr = snapshot.current_seq_nr,
            confirmed_seq_nr = snapshot.confirmed_seq_nr,
            unconfirmed = snapshot.unconfirmed.len(),
            "Final producer state"
        ),
        _ => warn!("Could not read producer state"),
    }
    info!(
        messages = cli.messages,
        durable = cli.durable,
        elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        "All messages delivered"
    );

    producer_controller.stop(None);
    consumer_controller.stop(None);
    producer.stop(None);
    consumer.stop(None);
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// DEMO ACTORS
// ═══════════════════════════════════════════════════════════════════════════

struct DemoProducer;

struct DemoProducerState {
    total: u64,
    sent: u64,
}

impl Actor for DemoProducer {
    type Msg = ProducerSignal<String>;
    type State = DemoProducerState;
    type Arguments = u64;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        total: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(DemoProducerState { total, sent: 0 })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            ProducerSignal::RequestNext(next) => {
                if state.sent < state.total {
                    state.sent = state.sent.saturating_add(1);
                    next.send(format!("message-{}", state.sent))?;
                }
            }
            ProducerSignal::Backpressure { message, buffered, capacity } => {
                warn!(%message, buffered, capacity, "Message rejected");
            }
        }
        Ok(())
    }
}

struct DemoConsumer;

struct DemoConsumerState {
    total: u64,
    received: u64,
    done: Option<oneshot::Sender<()>>,
}

impl Actor for DemoConsumer {
    type Msg = Delivery<String>;
    type State = DemoConsumerState;
    type Arguments = (u64, oneshot::Sender<()>);

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        (total, done): Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(DemoConsumerState {
            total,
            received: 0,
            done: Some(done),
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        delivery: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        debug!(seq_nr = delivery.seq_nr, message = %delivery.message, "Consumed");
        delivery.confirm()?;
        state.received = state.received.saturating_add(1);
        if state.received >= state.total {
            if let Some(done) = state.done.take() {
                let _ = done.send(());
            }
        }
        Ok(())
    }
}

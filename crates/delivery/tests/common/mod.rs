//! Helpers shared by the delivery integration tests.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::arithmetic_side_effects)]

use std::marker::PhantomData;
use std::time::Duration;

use ractor::rpc::CallResult;
use ractor::{Actor, ActorProcessingErr, ActorRef, Message, RpcReplyPort};
use tokio::sync::mpsc;

use tether_delivery::messages::{ConsumerControllerMessage, SequencedMessage};
use tether_delivery::{ProducerControllerMessage, ProducerId, SeqNr};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(3);

/// Test actor that forwards everything it receives into a channel.
pub struct Probe<M>(PhantomData<fn() -> M>);

impl<M: Message> Actor for Probe<M> {
    type Msg = M;
    type State = mpsc::UnboundedSender<M>;
    type Arguments = mpsc::UnboundedSender<M>;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        tx: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(tx)
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        tx: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let _ = tx.send(message);
        Ok(())
    }
}

/// Spawn a probe and return its ref with the receiving end.
pub async fn spawn_probe<M: Message>() -> (ActorRef<M>, mpsc::UnboundedReceiver<M>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (probe, _handle) = Actor::spawn(None, Probe(PhantomData), tx)
        .await
        .expect("Failed to spawn probe");
    (probe, rx)
}

/// Next message, failing the test after `RECV_TIMEOUT`.
pub async fn recv<M>(rx: &mut mpsc::UnboundedReceiver<M>) -> M {
    tokio::time::timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("Timed out waiting for message")
        .expect("Probe channel closed")
}

/// Skip messages until `select` picks one.
pub async fn recv_matching<M, T>(
    rx: &mut mpsc::UnboundedReceiver<M>,
    mut select: impl FnMut(M) -> Option<T>,
) -> T {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    loop {
        let message = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .expect("Timed out waiting for a matching message")
            .expect("Probe channel closed");
        if let Some(found) = select(message) {
            return found;
        }
    }
}

/// Everything received within `window`.
pub async fn drain<M>(rx: &mut mpsc::UnboundedReceiver<M>, window: Duration) -> Vec<M> {
    let mut received = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Some(message)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        received.push(message);
    }
    received
}

/// Call an actor and unwrap the reply.
pub async fn call_with_timeout<M: Message, T: Send + 'static>(
    actor: &ActorRef<M>,
    msg_builder: impl FnOnce(RpcReplyPort<T>) -> M,
) -> T {
    let result = actor
        .call(msg_builder, Some(Duration::from_millis(1000)))
        .await
        .expect("Call failed");

    match result {
        CallResult::Success(value) => value,
        CallResult::Timeout => std::panic!("Call timed out"),
        CallResult::SenderError => std::panic!("Sender error"),
    }
}

/// Poll `check` until it holds, failing the test after `RECV_TIMEOUT`.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    std::panic!("Condition never held: {what}");
}

/// A wire message as a ProducerController would send it.
pub fn sequenced(
    producer: &ActorRef<ProducerControllerMessage<String>>,
    producer_id: &str,
    seq_nr: SeqNr,
    first: bool,
) -> ConsumerControllerMessage<String> {
    ConsumerControllerMessage::Sequenced(SequencedMessage {
        producer_id: ProducerId::new(producer_id),
        seq_nr,
        message: format!("m{seq_nr}"),
        first,
        ack: false,
        producer_controller: producer.clone(),
    })
}

//! BDD-style behavioral tests for the ProducerController.
//!
//! Most tests put a probe in place of the ConsumerController and play the
//! consumer side by hand. The end-to-end tests wire a real ConsumerController.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::arithmetic_side_effects)]

mod common;

use std::time::Duration;

use ractor::ActorRef;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use common::{call_with_timeout, drain, eventually, recv, recv_matching, spawn_probe};
use tether_delivery::messages::{ProducerSnapshot, SequencedMessage};
use tether_delivery::{
    ConsumerControllerArguments, ConsumerControllerMessage, ConsumerControllerSettings,
    Delivery, DeliveryError, ProducerControllerArguments, ProducerControllerMessage,
    ProducerControllerSettings, ProducerSignal, RequestNext, spawn_consumer_controller,
    spawn_producer_controller,
};

struct Fixture {
    controller: ActorRef<ProducerControllerMessage<String>>,
    signals: UnboundedReceiver<ProducerSignal<String>>,
    wire: UnboundedReceiver<ConsumerControllerMessage<String>>,
}

async fn setup(buffer_size: usize) -> Fixture {
    let (producer, signals) = spawn_probe::<ProducerSignal<String>>().await;
    let (consumer, wire) = spawn_probe::<ConsumerControllerMessage<String>>().await;
    let controller = spawn_producer_controller(
        None,
        ProducerControllerArguments::new("p")
            .with_settings(ProducerControllerSettings::default().with_buffer_size(buffer_size))
            .with_producer(producer)
            .with_consumer(consumer),
    )
    .await
    .expect("Failed to spawn ProducerController");
    Fixture {
        controller,
        signals,
        wire,
    }
}

async fn next_demand(rx: &mut UnboundedReceiver<ProducerSignal<String>>) -> RequestNext<String> {
    recv_matching(rx, |signal| match signal {
        ProducerSignal::RequestNext(next) => Some(next),
        ProducerSignal::Backpressure { .. } => None,
    })
    .await
}

async fn next_sequenced(
    rx: &mut UnboundedReceiver<ConsumerControllerMessage<String>>,
) -> SequencedMessage<String> {
    recv_matching(rx, |msg| match msg {
        ConsumerControllerMessage::Sequenced(seq) => Some(seq),
        _ => None,
    })
    .await
}

fn grant(
    controller: &ActorRef<ProducerControllerMessage<String>>,
    confirmed_seq_nr: i64,
    requested_seq_nr: i64,
) {
    controller
        .send_message(ProducerControllerMessage::Request {
            confirmed_seq_nr,
            requested_seq_nr,
            support_resend: true,
            via_timeout: false,
        })
        .expect("request");
}

async fn snapshot(controller: &ActorRef<ProducerControllerMessage<String>>) -> ProducerSnapshot {
    call_with_timeout(controller, |reply| ProducerControllerMessage::GetState { reply }).await
}

/// Send `count` messages, each on fresh demand.
async fn produce(fx: &mut Fixture, count: usize) {
    for i in 1..=count {
        let next = next_demand(&mut fx.signals).await;
        next.send(format!("m{i}")).expect("send");
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DEMAND AND CONFIRMATION
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn given_fresh_controllers_when_five_messages_are_confirmed_then_nothing_is_left_unconfirmed() {
    // Given: producer -> ProducerController -> ConsumerController -> consumer
    let (producer, mut signals) = spawn_probe::<ProducerSignal<String>>().await;
    let (consumer, mut deliveries) = spawn_probe::<Delivery<String>>().await;
    let consumer_controller = spawn_consumer_controller(
        None,
        ConsumerControllerArguments::new()
            .with_settings(ConsumerControllerSettings::default().with_buffer_size(10))
            .with_consumer(consumer),
    )
    .await
    .expect("spawn consumer controller");
    let controller = spawn_producer_controller(
        None,
        ProducerControllerArguments::new("p")
            .with_producer(producer)
            .with_consumer(consumer_controller.clone()),
    )
    .await
    .expect("spawn producer controller");

    // When: 1..=5 are sent and the consumer confirms each in order
    let consuming = tokio::spawn(async move {
        let mut seen = Vec::new();
        for _ in 1..=5 {
            let delivery = recv(&mut deliveries).await;
            seen.push(delivery.seq_nr);
            delivery.confirm().expect("confirm");
        }
        seen
    });
    for i in 1..=5 {
        let next = next_demand(&mut signals).await;
        next.send(format!("m{i}")).expect("send");
    }
    let seen = consuming.await.expect("consumer task");

    // Then
    assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    let pc = controller.clone();
    eventually("all five confirmed", move || {
        let pc = pc.clone();
        async move {
            let state = snapshot(&pc).await;
            state.unconfirmed.is_empty() && state.current_seq_nr == 6
        }
    })
    .await;

    controller.stop(None);
    consumer_controller.stop(None);
}

#[tokio::test]
async fn given_window_of_four_when_consumer_stalls_then_outstanding_never_exceeds_demand() {
    // Given
    let (producer, mut signals) = spawn_probe::<ProducerSignal<String>>().await;
    let (consumer, mut deliveries) = spawn_probe::<Delivery<String>>().await;
    let consumer_controller = spawn_consumer_controller(
        None,
        ConsumerControllerArguments::new()
            .with_settings(ConsumerControllerSettings::default().with_buffer_size(4))
            .with_consumer(consumer),
    )
    .await
    .expect("spawn consumer controller");
    let controller = spawn_producer_controller(
        None,
        ProducerControllerArguments::new("p")
            .with_producer(producer)
            .with_consumer(consumer_controller.clone()),
    )
    .await
    .expect("spawn producer controller");

    // When: the producer sends whenever asked, the consumer holds message 1
    for i in 1..=4 {
        let next = next_demand(&mut signals).await;
        next.send(format!("m{i}")).expect("send");
    }
    let held = recv(&mut deliveries).await;

    // Then: no demand beyond the window
    let extra = drain(&mut signals, Duration::from_millis(150)).await;
    assert!(extra.is_empty(), "producer was asked for more: {extra:?}");
    let state = snapshot(&controller).await;
    let outstanding = i64::try_from(state.unconfirmed.len()).expect("fits");
    assert!(outstanding <= state.requested_seq_nr - state.confirmed_seq_nr);
    assert_eq!(state.unconfirmed, vec![1, 2, 3, 4]);

    // When: two confirmations reach the low-water mark
    held.confirm().expect("confirm");
    recv(&mut deliveries).await.confirm().expect("confirm");

    // Then: demand reopens and the bound still holds
    let next = next_demand(&mut signals).await;
    assert_eq!(next.current_seq_nr, 5);
    let state = snapshot(&controller).await;
    let outstanding = i64::try_from(state.unconfirmed.len()).expect("fits");
    assert!(outstanding <= state.requested_seq_nr - state.confirmed_seq_nr);

    controller.stop(None);
    consumer_controller.stop(None);
}

#[tokio::test]
async fn given_unconfirmed_messages_when_same_or_lower_ack_repeats_then_nothing_changes() {
    // Given: 1..=3 sent
    let mut fx = setup(10).await;
    let _ = next_demand(&mut fx.signals).await.send("m1".to_string());
    grant(&fx.controller, 0, 10);
    for i in 2..=3 {
        next_demand(&mut fx.signals)
            .await
            .send(format!("m{i}"))
            .expect("send");
    }
    let pc = fx.controller.clone();
    eventually("three sent", move || {
        let pc = pc.clone();
        async move { snapshot(&pc).await.unconfirmed.len() == 3 }
    })
    .await;

    // When
    fx.controller
        .send_message(ProducerControllerMessage::Ack { confirmed_seq_nr: 2 })
        .expect("ack");
    let after_first = snapshot(&fx.controller).await;
    for confirmed_seq_nr in [2, 1, 2, 0] {
        fx.controller
            .send_message(ProducerControllerMessage::Ack { confirmed_seq_nr })
            .expect("ack");
    }
    let after_repeats = snapshot(&fx.controller).await;

    // Then
    assert_eq!(after_first.confirmed_seq_nr, 2);
    assert_eq!(after_first.unconfirmed, vec![3]);
    assert_eq!(after_repeats, after_first);

    fx.controller.stop(None);
}

#[tokio::test]
async fn given_full_buffer_when_producer_keeps_sending_then_it_gets_backpressure() {
    // Given: capacity 2 and no demand after the first message
    let mut fx = setup(2).await;
    let next = next_demand(&mut fx.signals).await;
    next.send("m1".to_string()).expect("send");
    next.send("m2".to_string()).expect("send");

    // When
    next.send("m3".to_string()).expect("send");
    let asked = next
        .ask("m4".to_string(), &CancellationToken::new())
        .await;

    // Then
    let (message, buffered, capacity) = recv_matching(&mut fx.signals, |signal| match signal {
        ProducerSignal::Backpressure {
            message,
            buffered,
            capacity,
        } => Some((message, buffered, capacity)),
        ProducerSignal::RequestNext(_) => None,
    })
    .await;
    assert_eq!(message, "m3");
    assert_eq!((buffered, capacity), (2, 2));
    assert!(matches!(
        asked,
        Err(DeliveryError::Backpressure {
            buffered: 2,
            capacity: 2
        })
    ));

    let state = snapshot(&fx.controller).await;
    assert_eq!(state.unconfirmed, vec![1]);
    assert_eq!(state.pending, 1);

    fx.controller.stop(None);
}

// ═══════════════════════════════════════════════════════════════════════════════
// RESENDING
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn given_unconfirmed_messages_when_resend_requested_then_tail_is_resent() {
    // Given
    let mut fx = setup(10).await;
    next_demand(&mut fx.signals).await.send("m1".to_string()).expect("send");
    grant(&fx.controller, 0, 10);
    produce(&mut fx, 2).await;
    for expected in 1..=3 {
        assert_eq!(next_sequenced(&mut fx.wire).await.seq_nr, expected);
    }

    // When
    fx.controller
        .send_message(ProducerControllerMessage::Resend { from_seq_nr: 2 })
        .expect("resend");

    // Then
    let two = next_sequenced(&mut fx.wire).await;
    let three = next_sequenced(&mut fx.wire).await;
    assert_eq!((two.seq_nr, two.first), (2, false));
    assert_eq!((three.seq_nr, three.first), (3, false));

    fx.controller.stop(None);
}

#[tokio::test]
async fn given_pruned_head_when_resend_reaches_below_it_then_oldest_retained_is_marked_first() {
    // Given: 1..=3 sent, 1 acked
    let mut fx = setup(10).await;
    next_demand(&mut fx.signals).await.send("m1".to_string()).expect("send");
    grant(&fx.controller, 0, 10);
    produce(&mut fx, 2).await;
    for _ in 1..=3 {
        next_sequenced(&mut fx.wire).await;
    }
    fx.controller
        .send_message(ProducerControllerMessage::Ack { confirmed_seq_nr: 1 })
        .expect("ack");

    // When: the consumer asks for 1, which is gone
    fx.controller
        .send_message(ProducerControllerMessage::Resend { from_seq_nr: 1 })
        .expect("resend");

    // Then
    let two = next_sequenced(&mut fx.wire).await;
    let three = next_sequenced(&mut fx.wire).await;
    assert_eq!((two.seq_nr, two.first), (2, true));
    assert_eq!((three.seq_nr, three.first), (3, false));

    fx.controller.stop(None);
}

#[tokio::test]
async fn given_idle_consumer_when_request_arrives_via_timeout_then_all_unconfirmed_are_resent() {
    let mut fx = setup(10).await;
    next_demand(&mut fx.signals).await.send("m1".to_string()).expect("send");
    grant(&fx.controller, 0, 10);
    produce(&mut fx, 1).await;
    for _ in 1..=2 {
        next_sequenced(&mut fx.wire).await;
    }

    fx.controller
        .send_message(ProducerControllerMessage::Request {
            confirmed_seq_nr: 0,
            requested_seq_nr: 10,
            support_resend: true,
            via_timeout: true,
        })
        .expect("request");

    let one = next_sequenced(&mut fx.wire).await;
    let two = next_sequenced(&mut fx.wire).await;
    assert_eq!((one.seq_nr, one.first), (1, true));
    assert_eq!(two.seq_nr, 2);

    fx.controller.stop(None);
}

#[tokio::test]
async fn given_unconfirmed_head_when_idle_timeout_passes_then_it_is_resent() {
    // Given: a short idle timeout and m1 sent but never confirmed
    let (producer, mut signals) = spawn_probe::<ProducerSignal<String>>().await;
    let (consumer, mut wire) = spawn_probe::<ConsumerControllerMessage<String>>().await;
    let controller = spawn_producer_controller(
        None,
        ProducerControllerArguments::new("p")
            .with_settings(
                ProducerControllerSettings::default()
                    .with_resend_first_unconfirmed_idle_timeout(Duration::from_millis(100)),
            )
            .with_producer(producer)
            .with_consumer(consumer),
    )
    .await
    .expect("spawn");
    next_demand(&mut signals).await.send("m1".to_string()).expect("send");
    let sent = next_sequenced(&mut wire).await;
    assert_eq!(sent.seq_nr, 1);

    // When: the consumer stays silent

    // Then: the head goes out again, still marked first
    let again = next_sequenced(&mut wire).await;
    assert_eq!((again.seq_nr, again.first, again.message.as_str()), (1, true, "m1"));
    assert_eq!(snapshot(&controller).await.unconfirmed, vec![1]);

    controller.stop(None);
}

#[tokio::test]
async fn given_unconfirmed_messages_when_consumer_changes_then_all_are_resent_to_new_consumer() {
    // Given
    let mut fx = setup(10).await;
    next_demand(&mut fx.signals).await.send("m1".to_string()).expect("send");
    grant(&fx.controller, 0, 10);
    produce(&mut fx, 1).await;

    // When
    let (replacement, mut new_wire) = spawn_probe::<ConsumerControllerMessage<String>>().await;
    fx.controller
        .send_message(ProducerControllerMessage::RegisterConsumer {
            consumer_controller: replacement,
        })
        .expect("register");

    // Then
    let one = next_sequenced(&mut new_wire).await;
    let two = next_sequenced(&mut new_wire).await;
    assert_eq!((one.seq_nr, one.first, one.message.as_str()), (1, true, "m1"));
    assert_eq!((two.seq_nr, two.first, two.message.as_str()), (2, false, "m1"));

    fx.controller.stop(None);
}

#[tokio::test]
async fn given_resend_disabled_when_request_arrives_then_retained_messages_are_dropped() {
    let mut fx = setup(10).await;
    next_demand(&mut fx.signals).await.send("m1".to_string()).expect("send");

    fx.controller
        .send_message(ProducerControllerMessage::Request {
            confirmed_seq_nr: 0,
            requested_seq_nr: 10,
            support_resend: false,
            via_timeout: false,
        })
        .expect("request");

    let state = snapshot(&fx.controller).await;
    assert!(!state.support_resend);
    assert!(state.unconfirmed.is_empty());

    fx.controller.stop(None);
}

// ═══════════════════════════════════════════════════════════════════════════════
// ASKS
// ═══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn given_ask_without_durable_queue_when_consumer_acks_then_reply_carries_seq_nr() {
    // Given
    let mut fx = setup(10).await;
    let next = next_demand(&mut fx.signals).await;
    let asking = tokio::spawn(async move {
        next.ask("m1".to_string(), &CancellationToken::new()).await
    });

    // When
    let sent = next_sequenced(&mut fx.wire).await;
    assert!(sent.ack, "ask must request an explicit ack");
    fx.controller
        .send_message(ProducerControllerMessage::Ack { confirmed_seq_nr: 1 })
        .expect("ack");

    // Then
    let reply = asking.await.expect("ask task");
    assert_eq!(reply.expect("confirmed"), 1);

    fx.controller.stop(None);
}

#[tokio::test]
async fn given_pending_ask_when_cancelled_then_caller_stops_waiting_but_message_is_sent() {
    let mut fx = setup(10).await;
    let next = next_demand(&mut fx.signals).await;
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let asking = tokio::spawn(async move { next.ask("m1".to_string(), &token).await });

    let sent = next_sequenced(&mut fx.wire).await;
    cancel.cancel();

    let reply = asking.await.expect("ask task");
    assert!(matches!(reply, Err(DeliveryError::AskCancelled)));
    assert_eq!(sent.seq_nr, 1);

    let state = snapshot(&fx.controller).await;
    assert_eq!(state.unconfirmed, vec![1]);

    fx.controller.stop(None);
}

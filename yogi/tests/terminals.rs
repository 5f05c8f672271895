// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time,
};

use libyogi::{
    gather_flags, Binding, BindingState, ControlFlow, Error, Leaf, LocalConnection, Message,
    Scheduler, Signature, SubscriptionState, Terminal, TerminalKind,
};
use ntest::timeout;

mod support;

use crate::support::wait_until;

const RECV_TIMEOUT: time::Duration = time::Duration::from_secs(5);

fn leaf_pair() -> (Scheduler, Leaf, Leaf) {
    let scheduler = Scheduler::new();
    let leaf_a = Leaf::new(&scheduler);
    let leaf_b = Leaf::new(&scheduler);
    (scheduler, leaf_a, leaf_b)
}

fn expect_message(rx: &crossbeam_channel::Receiver<libyogi::Result<Message>>) -> Message {
    rx.recv_timeout(RECV_TIMEOUT).expect("handler invocation").expect("successful receive")
}

#[test]
#[timeout(30000)]
fn deaf_mute_binding_establishes_and_releases() {
    let (_scheduler, leaf_a, leaf_b) = leaf_pair();

    let dm_a = Terminal::new(&leaf_a, TerminalKind::DeafMute, "DM Terminal", Signature(123))
        .expect("terminal");
    let binding = Binding::new(&dm_a, "DM Terminal").expect("binding");
    assert_eq!(BindingState::Released, binding.get_binding_state().unwrap());

    let dm_b = Terminal::new(&leaf_b, TerminalKind::DeafMute, "DM Terminal", Signature(123))
        .expect("terminal");
    let conn = LocalConnection::new(&leaf_a, &leaf_b).expect("connection");
    wait_until(|| binding.get_binding_state().unwrap() == BindingState::Established);

    // an unrelated target must not establish
    let other = Binding::new(&dm_a, "Other").expect("binding");
    assert_eq!(BindingState::Released, other.get_binding_state().unwrap());

    drop(dm_b);
    wait_until(|| binding.get_binding_state().unwrap() == BindingState::Released);
    drop(conn);
}

#[test]
#[timeout(30000)]
fn local_publish_subscribe() {
    let (_scheduler, leaf_a, leaf_b) = leaf_pair();

    let producer = Terminal::new(&leaf_a, TerminalKind::Producer, "T", Signature(0)).unwrap();
    let consumer = Terminal::new(&leaf_b, TerminalKind::Consumer, "T", Signature(0)).unwrap();

    // publish without the terminal being bound
    assert_eq!(Err(Error::NotBound), producer.publish(&[0x7b]));
    assert!(!producer.try_publish(&[0x7b]));

    assert_eq!(BindingState::Released, consumer.get_binding_state().unwrap());
    let _conn = LocalConnection::new(&leaf_a, &leaf_b).expect("connection");
    wait_until(|| consumer.get_binding_state().unwrap() == BindingState::Established);
    wait_until(|| {
        producer.get_subscription_state().unwrap() == SubscriptionState::Subscribed
    });

    let (tx, rx) = crossbeam_channel::bounded(1);
    consumer.async_receive_message(move |res| tx.send(res).unwrap()).unwrap();

    producer.publish(&[0x7b]).expect("publish");
    let message = expect_message(&rx);
    assert_eq!(vec![0x7b], message.payload);
    assert!(!message.cached);

    assert!(producer.try_publish(&[0x7b]));
}

#[test]
#[timeout(30000)]
fn publish_ordering_is_preserved() {
    let (_scheduler, leaf_a, leaf_b) = leaf_pair();

    let producer = Terminal::new(&leaf_a, TerminalKind::Producer, "T", Signature(0)).unwrap();
    let consumer = Terminal::new(&leaf_b, TerminalKind::Consumer, "T", Signature(0)).unwrap();
    let _conn = LocalConnection::new(&leaf_a, &leaf_b).expect("connection");
    wait_until(|| {
        producer.get_subscription_state().unwrap() == SubscriptionState::Subscribed
    });

    for i in 0..20u8 {
        producer.publish(&[i]).expect("publish");
    }

    // re-registering the handler between messages must not lose or
    // reorder anything
    for i in 0..20u8 {
        let (tx, rx) = crossbeam_channel::bounded(1);
        consumer.async_receive_message(move |res| tx.send(res).unwrap()).unwrap();
        let message = expect_message(&rx);
        assert_eq!(vec![i], message.payload);
    }
}

#[test]
#[timeout(30000)]
fn cached_consumer_receives_cache_on_connect() {
    let (_scheduler, leaf_a, leaf_b) = leaf_pair();

    let producer =
        Terminal::new(&leaf_a, TerminalKind::CachedProducer, "T", Signature(0)).unwrap();
    let consumer =
        Terminal::new(&leaf_b, TerminalKind::CachedConsumer, "T", Signature(0)).unwrap();

    // the publish fails with not-bound but still populates the cache
    assert_eq!(Err(Error::NotBound), producer.publish(&[0x7b]));

    let (tx, rx) = crossbeam_channel::unbounded();
    let tx_clone = tx.clone();
    consumer.async_receive_message(move |res| tx_clone.send(res).unwrap()).unwrap();

    let _conn = LocalConnection::new(&leaf_a, &leaf_b).expect("connection");

    let message = expect_message(&rx);
    assert_eq!(vec![0x7b], message.payload);
    assert!(message.cached);

    // a live publish follows the cache replay with cached=false
    wait_until(|| {
        producer.get_subscription_state().unwrap() == SubscriptionState::Subscribed
    });
    consumer.async_receive_message(move |res| tx.send(res).unwrap()).unwrap();
    producer.publish(&[0x7c]).expect("publish");
    let message = expect_message(&rx);
    assert_eq!(vec![0x7c], message.payload);
    assert!(!message.cached);

    // both sides have the latest payload cached now
    assert_eq!(vec![0x7c], producer.get_cached_message().unwrap());
    assert_eq!(vec![0x7c], consumer.get_cached_message().unwrap());
}

#[test]
#[timeout(30000)]
fn get_cached_message_fails_without_cache() {
    let scheduler = Scheduler::new();
    let leaf = Leaf::new(&scheduler);
    let terminal =
        Terminal::new(&leaf, TerminalKind::CachedPublishSubscribe, "T", Signature(0)).unwrap();
    assert_eq!(Err(Error::NoCache), terminal.get_cached_message());

    let plain = Terminal::new(&leaf, TerminalKind::PublishSubscribe, "T", Signature(0)).unwrap();
    assert_eq!(Err(Error::WrongTerminalKind), plain.get_cached_message());
}

#[test]
#[timeout(30000)]
fn oversize_payloads_are_rejected() {
    let scheduler = Scheduler::new();
    let leaf = Leaf::new(&scheduler);
    let terminal =
        Terminal::new(&leaf, TerminalKind::PublishSubscribe, "T", Signature(0)).unwrap();

    let payload = vec![0u8; libyogi::MAX_MESSAGE_SIZE + 1];
    assert_eq!(Err(Error::BufferTooSmall), terminal.publish(&payload));
}

#[test]
#[timeout(30000)]
fn scatter_gather_deaf_ignore_respond() {
    let (_scheduler, leaf_a, leaf_b) = leaf_pair();

    let sg_a = Terminal::new(&leaf_a, TerminalKind::ScatterGather, "T", Signature(0)).unwrap();
    let sg_b = Terminal::new(&leaf_b, TerminalKind::ScatterGather, "T", Signature(0)).unwrap();
    let _conn = LocalConnection::new(&leaf_a, &leaf_b).expect("connection");

    // nobody is bound: one FINISHED|DEAF response
    let (tx, rx) = crossbeam_channel::unbounded();
    let tx2 = tx.clone();
    let _op = sg_b
        .async_scatter_gather(&[0x45], move |res| {
            tx2.send(res).unwrap();
            ControlFlow::Continue
        })
        .expect("scatter");
    let response = rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
    assert_ne!(0, response.flags & gather_flags::DEAF);
    assert_ne!(0, response.flags & gather_flags::FINISHED);

    // bound, but no receive handler registered: IGNORED
    let binding = Binding::new(&sg_a, "T").expect("binding");
    wait_until(|| binding.get_binding_state().unwrap() == BindingState::Established);
    wait_until(|| sg_b.get_subscription_state().unwrap() == SubscriptionState::Subscribed);

    let tx2 = tx.clone();
    let _op = sg_b
        .async_scatter_gather(&[0x45], move |res| {
            tx2.send(res).unwrap();
            ControlFlow::Continue
        })
        .expect("scatter");
    let response = rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
    assert_ne!(0, response.flags & gather_flags::IGNORED);
    assert_ne!(0, response.flags & gather_flags::FINISHED);

    // an installed responder answers with a payload
    let (scatter_tx, scatter_rx) = crossbeam_channel::bounded(1);
    sg_a.async_receive_scattered_message(move |res| {
        scatter_tx.send(res).unwrap();
    })
    .unwrap();

    let tx2 = tx.clone();
    let _op = sg_b
        .async_scatter_gather(&[0x45], move |res| {
            tx2.send(res).unwrap();
            ControlFlow::Continue
        })
        .expect("scatter");

    let scattered = scatter_rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
    assert_eq!(&[0x45], scattered.payload());
    scattered.respond(&[0x7b]).expect("respond");

    let response = rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
    assert_eq!(vec![0x7b], response.payload);
    assert_ne!(0, response.flags & gather_flags::FINISHED);
}

#[test]
#[timeout(30000)]
fn scatter_operation_cancel() {
    let (_scheduler, leaf_a, leaf_b) = leaf_pair();

    let sg_a = Terminal::new(&leaf_a, TerminalKind::ScatterGather, "T", Signature(0)).unwrap();
    let sg_b = Terminal::new(&leaf_b, TerminalKind::ScatterGather, "T", Signature(0)).unwrap();
    let binding = Binding::new(&sg_a, "T").expect("binding");
    let _conn = LocalConnection::new(&leaf_a, &leaf_b).expect("connection");
    wait_until(|| binding.get_binding_state().unwrap() == BindingState::Established);
    wait_until(|| sg_b.get_subscription_state().unwrap() == SubscriptionState::Subscribed);

    // keep the responder silent so the operation stays outstanding
    sg_a.async_receive_scattered_message(|_| {}).unwrap();

    let (tx, rx) = crossbeam_channel::unbounded();
    let op = sg_b
        .async_scatter_gather(&[0x45], move |res| {
            tx.send(res).unwrap();
            ControlFlow::Stop
        })
        .expect("scatter");

    op.cancel();
    let result = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(Err(Error::Canceled), result.map(|_| ()));
}

#[test]
#[timeout(30000)]
fn responder_destruction_surfaces_binding_destroyed() {
    let (_scheduler, leaf_a, leaf_b) = leaf_pair();

    let sg_a = Terminal::new(&leaf_a, TerminalKind::ScatterGather, "T", Signature(0)).unwrap();
    let sg_b = Terminal::new(&leaf_b, TerminalKind::ScatterGather, "T", Signature(0)).unwrap();
    let binding = Binding::new(&sg_a, "T").expect("binding");
    let _conn = LocalConnection::new(&leaf_a, &leaf_b).expect("connection");
    wait_until(|| binding.get_binding_state().unwrap() == BindingState::Established);
    wait_until(|| sg_b.get_subscription_state().unwrap() == SubscriptionState::Subscribed);

    let (scatter_tx, scatter_rx) = crossbeam_channel::bounded(1);
    sg_a.async_receive_scattered_message(move |res| {
        // hold the message without answering
        scatter_tx.send(res).unwrap();
    })
    .unwrap();

    let (tx, rx) = crossbeam_channel::unbounded();
    let _op = sg_b
        .async_scatter_gather(&[0x45], move |res| {
            tx.send(res).unwrap();
            ControlFlow::Continue
        })
        .expect("scatter");

    let _unanswered = scatter_rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
    drop(binding);
    drop(sg_a);

    let response = rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
    assert_ne!(0, response.flags & gather_flags::BINDING_DESTROYED);
}

#[test]
#[timeout(30000)]
fn master_slave_messages_flow_both_ways() {
    let (_scheduler, leaf_a, leaf_b) = leaf_pair();

    let slave = Terminal::new(&leaf_a, TerminalKind::Slave, "MS", Signature(7)).unwrap();
    let master = Terminal::new(&leaf_b, TerminalKind::Master, "MS", Signature(7)).unwrap();
    let _conn = LocalConnection::new(&leaf_a, &leaf_b).expect("connection");

    wait_until(|| slave.get_binding_state().unwrap() == BindingState::Established);
    wait_until(|| master.get_binding_state().unwrap() == BindingState::Established);
    wait_until(|| master.get_subscription_state().unwrap() == SubscriptionState::Subscribed);
    wait_until(|| slave.get_subscription_state().unwrap() == SubscriptionState::Subscribed);

    let (tx, rx) = crossbeam_channel::bounded(1);
    slave.async_receive_message(move |res| tx.send(res).unwrap()).unwrap();
    master.publish(&[12, 34]).expect("master publish");
    assert_eq!(vec![12, 34], expect_message(&rx).payload);

    let (tx, rx) = crossbeam_channel::bounded(1);
    master.async_receive_message(move |res| tx.send(res).unwrap()).unwrap();
    slave.publish(&[56, 78]).expect("slave publish");
    assert_eq!(vec![56, 78], expect_message(&rx).payload);
}

#[test]
#[timeout(30000)]
fn service_client_request_response() {
    let (_scheduler, leaf_a, leaf_b) = leaf_pair();

    let service = Terminal::new(&leaf_a, TerminalKind::Service, "SC", Signature(1)).unwrap();
    let client = Terminal::new(&leaf_b, TerminalKind::Client, "SC", Signature(1)).unwrap();
    let _conn = LocalConnection::new(&leaf_a, &leaf_b).expect("connection");

    wait_until(|| service.get_binding_state().unwrap() == BindingState::Established);
    wait_until(|| client.get_subscription_state().unwrap() == SubscriptionState::Subscribed);

    let (request_tx, request_rx) = crossbeam_channel::bounded(1);
    service.async_receive_request(move |res| request_tx.send(res).unwrap()).unwrap();

    let (tx, rx) = crossbeam_channel::unbounded();
    let _op = client
        .async_request(&[12, 34], move |res| {
            tx.send(res).unwrap();
            ControlFlow::Continue
        })
        .expect("request");

    let request = request_rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
    assert_eq!(&[12, 34], request.payload());
    request.respond(&[56, 78]).expect("respond");

    let response = rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
    assert_eq!(vec![56, 78], response.payload);
    assert_ne!(0, response.flags & gather_flags::FINISHED);
}

#[test]
#[timeout(30000)]
fn await_binding_state_change_cancellation() {
    let scheduler = Scheduler::new();
    let leaf = Leaf::new(&scheduler);
    let terminal =
        Terminal::new(&leaf, TerminalKind::PublishSubscribe, "T", Signature(0)).unwrap();
    let binding = Binding::new(&terminal, "T").expect("binding");

    let calls = Arc::new(Mutex::new(Vec::new()));
    let calls_clone = Arc::clone(&calls);
    binding
        .async_await_binding_state_change(move |res| {
            calls_clone.lock().unwrap().push(res);
        })
        .unwrap();

    binding.cancel_await_binding_state_change();
    wait_until(|| !calls.lock().unwrap().is_empty());

    // canceling again must not produce a second invocation
    binding.cancel_await_binding_state_change();
    std::thread::sleep(time::Duration::from_millis(50));
    let calls = calls.lock().unwrap();
    assert_eq!(1, calls.len());
    assert_eq!(Err(Error::Canceled), calls[0].clone().map(|_| ()));
}

#[test]
#[timeout(30000)]
fn one_receive_handler_at_a_time() {
    let scheduler = Scheduler::new();
    let leaf = Leaf::new(&scheduler);
    let terminal =
        Terminal::new(&leaf, TerminalKind::PublishSubscribe, "T", Signature(0)).unwrap();

    terminal.async_receive_message(|_| {}).unwrap();
    assert_eq!(
        Err(Error::AlreadyAwaiting),
        terminal.async_receive_message(|_| {})
    );
    terminal.cancel_receive_message();
}

#[test]
#[timeout(30000)]
fn destruction_cancels_outstanding_handlers_before_returning() {
    let scheduler = Scheduler::new();
    let leaf = Leaf::new(&scheduler);
    let terminal = Terminal::new(&leaf, TerminalKind::Consumer, "T", Signature(0)).unwrap();

    let canceled = Arc::new(AtomicBool::new(false));
    let canceled_clone = Arc::clone(&canceled);
    terminal
        .async_receive_message(move |res| {
            assert_eq!(Err(Error::Canceled), res.map(|_| ()));
            canceled_clone.store(true, Ordering::SeqCst);
        })
        .unwrap();

    drop(terminal);
    assert!(canceled.load(Ordering::SeqCst));
}

#[test]
#[timeout(30000)]
fn capability_checks() {
    let scheduler = Scheduler::new();
    let leaf = Leaf::new(&scheduler);

    let dm = Terminal::new(&leaf, TerminalKind::DeafMute, "T", Signature(0)).unwrap();
    assert_eq!(Err(Error::WrongTerminalKind), dm.publish(&[1]));
    assert_eq!(Err(Error::WrongTerminalKind), dm.async_receive_message(|_| {}));
    assert_eq!(Err(Error::WrongTerminalKind), dm.get_subscription_state().map(|_| ()));

    let producer = Terminal::new(&leaf, TerminalKind::Producer, "T", Signature(0)).unwrap();
    assert_eq!(Err(Error::WrongTerminalKind), producer.get_binding_state().map(|_| ()));
    assert_eq!(Err(Error::WrongTerminalKind), producer.async_receive_message(|_| {}));

    // explicit bindings only exist on primitives
    let consumer = Terminal::new(&leaf, TerminalKind::Consumer, "T", Signature(0)).unwrap();
    assert!(matches!(Binding::new(&consumer, "T"), Err(Error::WrongTerminalKind)));
}

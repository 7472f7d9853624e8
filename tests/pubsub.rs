use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use moor::defer::perform_all;
use moor::pubsub::{
    self, glob_match, publish, subscribe, unsubscribe, Message, SubscribeArgs,
};

mod util;

// Deliveries ride the process-global deferred queue; serialize the tests
// that drain it.
static QUEUE_LOCK: Mutex<()> = Mutex::new(());

fn exclusive() -> MutexGuard<'static, ()> {
    util::init();
    let guard = QUEUE_LOCK.lock().unwrap();
    perform_all();
    guard
}

static RECEIVED: Mutex<Vec<(String, Vec<u8>, usize)>> = Mutex::new(Vec::new());
static UNSUBSCRIBED: AtomicUsize = AtomicUsize::new(0);

fn record_message(message: &Message) {
    RECEIVED.lock().unwrap().push((
        message.channel().to_owned(),
        message.data().to_vec(),
        message.udata1(),
    ));
}

fn record_unsubscribe(_udata1: usize, _udata2: usize) {
    UNSUBSCRIBED.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn glob_matches_channel_patterns() {
    assert!(glob_match(b"users.42", b"users.*"));
    assert!(glob_match(b"users.abc", b"users.*"));
    assert!(!glob_match(b"admin.1", b"users.*"));
    assert!(glob_match(b"user-7", b"user-[0-9]"));
    assert!(!glob_match(b"user-x", b"user-[0-9]"));
    assert!(glob_match(b"deep.a.b.c", b"deep.*"));
    assert!(glob_match(b"x", b"?"));
}

#[test]
fn publish_reaches_literal_subscribers() {
    let _guard = exclusive();
    RECEIVED.lock().unwrap().clear();

    let sub = subscribe(SubscribeArgs {
        channel: "news",
        pattern: false,
        on_message: record_message,
        on_unsubscribe: None,
        udata1: 7,
        udata2: 0,
    });
    publish(Some(&pubsub::PROCESS), "news", b"breaking").unwrap();
    publish(Some(&pubsub::PROCESS), "other", b"nope").unwrap();
    perform_all();

    let received = RECEIVED.lock().unwrap().clone();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].0, "news");
    assert_eq!(received[0].1, b"breaking");
    assert_eq!(received[0].2, 7);
    drop(received);

    unsubscribe(sub);
    perform_all();
}

#[test]
fn pattern_subscriptions_see_matching_channels_only() {
    let _guard = exclusive();
    RECEIVED.lock().unwrap().clear();

    let sub = subscribe(SubscribeArgs {
        channel: "users.*",
        pattern: true,
        on_message: record_message,
        on_unsubscribe: None,
        udata1: 1,
        udata2: 0,
    });
    publish(Some(&pubsub::PROCESS), "users.42", b"a").unwrap();
    publish(Some(&pubsub::PROCESS), "users.abc", b"b").unwrap();
    publish(Some(&pubsub::PROCESS), "admin.1", b"c").unwrap();
    perform_all();

    let channels: Vec<String> = RECEIVED
        .lock()
        .unwrap()
        .iter()
        .map(|(channel, _, _)| channel.clone())
        .collect();
    assert_eq!(channels, ["users.42", "users.abc"]);

    unsubscribe(sub);
    perform_all();
}

#[test]
fn duplicate_subscriptions_unwind_exactly_once() {
    let _guard = exclusive();
    RECEIVED.lock().unwrap().clear();
    UNSUBSCRIBED.store(0, Ordering::SeqCst);

    let args = SubscribeArgs {
        channel: "dups",
        pattern: false,
        on_message: record_message,
        on_unsubscribe: Some(record_unsubscribe),
        udata1: 0,
        udata2: 0,
    };
    let first = subscribe(args);
    let second = subscribe(args);
    let third = subscribe(args);

    // One client under the hood: a publish is delivered once.
    publish(Some(&pubsub::PROCESS), "dups", b"once").unwrap();
    perform_all();
    assert_eq!(RECEIVED.lock().unwrap().len(), 1);

    unsubscribe(first);
    unsubscribe(second);
    perform_all();
    assert_eq!(UNSUBSCRIBED.load(Ordering::SeqCst), 0, "still subscribed");

    unsubscribe(third);
    perform_all();
    assert_eq!(UNSUBSCRIBED.load(Ordering::SeqCst), 1, "released exactly once");

    // The channel is gone; publishing reaches nobody.
    RECEIVED.lock().unwrap().clear();
    publish(Some(&pubsub::PROCESS), "dups", b"gone").unwrap();
    perform_all();
    assert!(RECEIVED.lock().unwrap().is_empty());
}

#[test]
fn each_subscriber_gets_its_own_copy() {
    let _guard = exclusive();
    RECEIVED.lock().unwrap().clear();

    let args_a = SubscribeArgs {
        channel: "fan",
        pattern: false,
        on_message: record_message,
        on_unsubscribe: None,
        udata1: 1,
        udata2: 0,
    };
    // A different udata1 makes this a distinct subscriber identity.
    let args_b = SubscribeArgs { udata1: 2, ..args_a };
    let sub_a = subscribe(args_a);
    let sub_b = subscribe(args_b);

    publish(Some(&pubsub::PROCESS), "fan", b"hi").unwrap();
    perform_all();

    let mut udatas: Vec<usize> = RECEIVED
        .lock()
        .unwrap()
        .iter()
        .map(|(_, _, udata)| *udata)
        .collect();
    udatas.sort_unstable();
    assert_eq!(udatas, [1, 2]);

    unsubscribe(sub_a);
    unsubscribe(sub_b);
    perform_all();
}

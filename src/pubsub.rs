//! Publish/subscribe over channels and glob patterns.
//!
//! Subscriptions are deduplicated by identity: subscribing twice with the
//! same `(on_message, on_unsubscribe, udata1, udata2)` on the same channel
//! returns the same client and bumps its count; it takes as many
//! unsubscribes to tear it down, and `on_unsubscribe` fires exactly once.
//!
//! Where a publish goes is decided by its [`Engine`]:
//!
//! * [`PROCESS`] — subscribers in this process only.
//! * [`CLUSTER`] (the default) — every process in the cluster, including
//!   this one.
//! * [`SIBLINGS`] — every *other* process.
//!
//! External services (message brokers and the like) can join in by
//! implementing [`Engine`] and registering it.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use log::error;

use crate::cluster;
use crate::defer;
use crate::reactor;

/* Reserved bus filters; pub/sub control traffic rides on negative ids. */
const FILTER_PUBLISH: i32 = -1;
const FILTER_CHANNEL_SUB: i32 = -3;
const FILTER_PATTERN_SUB: i32 = -4;
const FILTER_CHANNEL_UNSUB: i32 = -5;
const FILTER_PATTERN_UNSUB: i32 = -6;

/// A subscriber's message callback.
pub type OnMessage = fn(&Message);
/// Runs exactly once when a subscription is fully released.
pub type OnUnsubscribe = fn(usize, usize);

struct Client {
    on_message: OnMessage,
    on_unsubscribe: Option<OnUnsubscribe>,
    udata1: usize,
    udata2: usize,
    channel: Arc<str>,
    pattern: bool,
    /// Duplicate-subscription counter; mutated under the registry lock.
    sub_count: AtomicUsize,
    /// Pending deliveries + one registry reference. `on_unsubscribe` fires
    /// when this drains to zero.
    active: AtomicUsize,
    /// Per-client delivery serialization.
    lane: AtomicBool,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    on_message: usize,
    on_unsubscribe: usize,
    udata1: usize,
    udata2: usize,
    channel: String,
    pattern: bool,
}

impl ClientKey {
    fn of(client: &Client) -> ClientKey {
        ClientKey {
            on_message: client.on_message as usize,
            on_unsubscribe: client.on_unsubscribe.map_or(0, |f| f as usize),
            udata1: client.udata1,
            udata2: client.udata2,
            channel: client.channel.to_string(),
            pattern: client.pattern,
        }
    }
}

struct Channel {
    name: Arc<str>,
    pattern: bool,
    advertise: bool,
    clients: Vec<Arc<Client>>,
}

#[derive(Default)]
struct PubSub {
    channels: HashMap<Arc<str>, Channel>,
    patterns: HashMap<Arc<str>, Channel>,
    clients: HashMap<ClientKey, Arc<Client>>,
}

fn registry() -> &'static Mutex<PubSub> {
    static REGISTRY: OnceLock<Mutex<PubSub>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(PubSub::default()))
}

fn engines() -> &'static Mutex<Vec<Arc<dyn Engine>>> {
    static ENGINES: OnceLock<Mutex<Vec<Arc<dyn Engine>>>> = OnceLock::new();
    ENGINES.get_or_init(|| Mutex::new(Vec::new()))
}

/* *****************************************************************************
 * Subscriptions
 **************************************************************************** */

/// Parameters for [`subscribe`].
#[derive(Clone, Copy)]
pub struct SubscribeArgs<'a> {
    /// Channel name, or a glob pattern when `pattern` is set.
    pub channel: &'a str,
    /// Match the channel name as a glob pattern.
    pub pattern: bool,
    /// Message callback.
    pub on_message: OnMessage,
    /// Final-release callback; receives `(udata1, udata2)`.
    pub on_unsubscribe: Option<OnUnsubscribe>,
    /// Opaque user word #1.
    pub udata1: usize,
    /// Opaque user word #2 (two words avoid most allocations).
    pub udata2: usize,
}

impl std::fmt::Debug for SubscribeArgs<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscribeArgs")
            .field("channel", &self.channel)
            .field("pattern", &self.pattern)
            .finish()
    }
}

impl<'a> SubscribeArgs<'a> {
    /// A plain channel subscription with no user data.
    pub fn channel(channel: &'a str, on_message: OnMessage) -> SubscribeArgs<'a> {
        SubscribeArgs {
            channel,
            pattern: false,
            on_message,
            on_unsubscribe: None,
            udata1: 0,
            udata2: 0,
        }
    }

    /// A glob-pattern subscription with no user data.
    pub fn pattern(pattern: &'a str, on_message: OnMessage) -> SubscribeArgs<'a> {
        SubscribeArgs {
            channel: pattern,
            pattern: true,
            on_message,
            on_unsubscribe: None,
            udata1: 0,
            udata2: 0,
        }
    }
}

/// A live subscription handle; pass it back to [`unsubscribe`].
pub struct Subscription(Arc<Client>);

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.0.channel)
            .field("pattern", &self.0.pattern)
            .finish()
    }
}

fn subscribe_inner(args: SubscribeArgs<'_>, advertise: bool) -> Subscription {
    let key = ClientKey {
        on_message: args.on_message as usize,
        on_unsubscribe: args.on_unsubscribe.map_or(0, |f| f as usize),
        udata1: args.udata1,
        udata2: args.udata2,
        channel: args.channel.to_owned(),
        pattern: args.pattern,
    };
    let mut created_channel = None;
    let client = {
        let mut reg = registry().lock().unwrap();
        if let Some(existing) = reg.clients.get(&key) {
            existing.sub_count.fetch_add(1, Ordering::AcqRel);
            return Subscription(Arc::clone(existing));
        }
        let name: Arc<str> = Arc::from(args.channel);
        let client = Arc::new(Client {
            on_message: args.on_message,
            on_unsubscribe: args.on_unsubscribe,
            udata1: args.udata1,
            udata2: args.udata2,
            channel: Arc::clone(&name),
            pattern: args.pattern,
            sub_count: AtomicUsize::new(1),
            active: AtomicUsize::new(1),
            lane: AtomicBool::new(false),
        });
        reg.clients.insert(key, Arc::clone(&client));
        let map = if args.pattern {
            &mut reg.patterns
        } else {
            &mut reg.channels
        };
        let channel = map.entry(Arc::clone(&name)).or_insert_with(|| {
            created_channel = Some((Arc::clone(&name), args.pattern, advertise));
            Channel {
                name,
                pattern: args.pattern,
                advertise,
                clients: Vec::new(),
            }
        });
        channel.clients.push(Arc::clone(&client));
        client
    };
    if let Some((name, pattern, advertise)) = created_channel {
        channel_created(&name, pattern, advertise);
    }
    Subscription(client)
}

/// Subscribes to a channel (or pattern). Repeated identical subscriptions
/// share one client.
pub fn subscribe(args: SubscribeArgs<'_>) -> Subscription {
    subscribe_inner(args, true)
}

/// Finds an existing subscription with the exact same identity, without
/// creating one. The result counts as a borrowed handle — do not
/// unsubscribe it more often than it was subscribed.
pub fn find_subscription(args: SubscribeArgs<'_>) -> Option<Subscription> {
    let key = ClientKey {
        on_message: args.on_message as usize,
        on_unsubscribe: args.on_unsubscribe.map_or(0, |f| f as usize),
        udata1: args.udata1,
        udata2: args.udata2,
        channel: args.channel.to_owned(),
        pattern: args.pattern,
    };
    registry()
        .lock()
        .unwrap()
        .clients
        .get(&key)
        .map(|client| Subscription(Arc::clone(client)))
}

/// Releases one subscription reference. At zero the client is unlinked and
/// its `on_unsubscribe` runs (deferred) exactly once.
pub fn unsubscribe(sub: Subscription) {
    let client = sub.0;
    let mut removed_channel = None;
    {
        let mut reg = registry().lock().unwrap();
        if client.sub_count.fetch_sub(1, Ordering::AcqRel) > 1 {
            return;
        }
        reg.clients.remove(&ClientKey::of(&client));
        let map = if client.pattern {
            &mut reg.patterns
        } else {
            &mut reg.channels
        };
        let empty = match map.get_mut(&client.channel) {
            Some(channel) => {
                channel
                    .clients
                    .retain(|other| !Arc::ptr_eq(other, &client));
                channel.clients.is_empty()
            }
            None => false,
        };
        if empty {
            let channel = map.remove(&client.channel).unwrap();
            removed_channel = Some((channel.name, channel.pattern, channel.advertise));
        }
    }
    release_client(&client);
    if let Some((name, pattern, advertise)) = removed_channel {
        channel_destroyed(&name, pattern, advertise);
    }
}

struct UnsubNotice {
    callback: OnUnsubscribe,
    udata1: usize,
    udata2: usize,
}

fn unsub_task(notice_raw: usize, _unused: usize) {
    let notice = unsafe { Box::from_raw(notice_raw as *mut UnsubNotice) };
    (notice.callback)(notice.udata1, notice.udata2);
}

fn release_client(client: &Arc<Client>) {
    if client.active.fetch_sub(1, Ordering::AcqRel) != 1 {
        return;
    }
    if let Some(callback) = client.on_unsubscribe {
        let notice = Box::new(UnsubNotice {
            callback,
            udata1: client.udata1,
            udata2: client.udata2,
        });
        defer::defer(unsub_task, Box::into_raw(notice) as usize, 0);
    }
}

/* *****************************************************************************
 * Engine notifications
 **************************************************************************** */

fn channel_created(name: &str, pattern: bool, advertise: bool) {
    if advertise {
        CLUSTER.subscribe(name, pattern);
    }
    let engines: Vec<Arc<dyn Engine>> = engines().lock().unwrap().clone();
    for engine in engines {
        engine.subscribe(name, pattern);
    }
}

fn channel_destroyed(name: &str, pattern: bool, advertise: bool) {
    if advertise {
        CLUSTER.unsubscribe(name, pattern);
    }
    let engines: Vec<Arc<dyn Engine>> = engines().lock().unwrap().clone();
    for engine in engines {
        engine.unsubscribe(name, pattern);
    }
}

/* *****************************************************************************
 * Messages and delivery
 **************************************************************************** */

struct Wrapper {
    channel: Arc<str>,
    data: Arc<[u8]>,
}

/// A delivered message. Borrowed by `on_message`; use [`defer_delivery`]
/// to hold on to it past the callback.
pub struct Message {
    wrapper: Arc<Wrapper>,
    client: Arc<Client>,
}

impl Message {
    /// The concrete channel the message was published to.
    pub fn channel(&self) -> &str {
        &self.wrapper.channel
    }

    /// The message payload.
    pub fn data(&self) -> &[u8] {
        &self.wrapper.data
    }

    /// The subscription's first user word.
    pub fn udata1(&self) -> usize {
        self.client.udata1
    }

    /// The subscription's second user word.
    pub fn udata2(&self) -> usize {
        self.client.udata2
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("channel", &self.channel())
            .field("len", &self.data().len())
            .finish()
    }
}

struct Delivery {
    client: Arc<Client>,
    wrapper: Arc<Wrapper>,
}

fn delivery_task(delivery_raw: usize, _unused: usize) {
    let delivery = unsafe { Box::from_raw(delivery_raw as *mut Delivery) };
    if delivery.client.lane.swap(true, Ordering::Acquire) {
        // Another delivery for this client is mid-flight; retry later.
        defer::defer(delivery_task, Box::into_raw(delivery) as usize, 0);
        return;
    }
    let message = Message {
        wrapper: Arc::clone(&delivery.wrapper),
        client: Arc::clone(&delivery.client),
    };
    (delivery.client.on_message)(&message);
    delivery.client.lane.store(false, Ordering::Release);
    release_client(&delivery.client);
}

/// Re-schedules the delivery currently being handled — for use from inside
/// `on_message` when a downstream resource is busy. The callback should
/// return right after calling this.
pub fn defer_delivery(message: &Message) {
    message.client.active.fetch_add(1, Ordering::AcqRel);
    let delivery = Box::new(Delivery {
        client: Arc::clone(&message.client),
        wrapper: Arc::clone(&message.wrapper),
    });
    defer::defer(delivery_task, Box::into_raw(delivery) as usize, 0);
}

fn publish_in_process(channel: &str, data: &[u8]) {
    let wrapper = Arc::new(Wrapper {
        channel: Arc::from(channel),
        data: Arc::from(data),
    });
    let targets: Vec<Arc<Client>> = {
        let reg = registry().lock().unwrap();
        let mut targets = Vec::new();
        if let Some(entry) = reg.channels.get(channel) {
            targets.extend(entry.clients.iter().cloned());
        }
        for (name, entry) in reg.patterns.iter() {
            if glob_match(channel.as_bytes(), name.as_bytes()) {
                targets.extend(entry.clients.iter().cloned());
            }
        }
        targets
    };
    for client in targets {
        client.active.fetch_add(1, Ordering::AcqRel);
        let delivery = Box::new(Delivery {
            client,
            wrapper: Arc::clone(&wrapper),
        });
        defer::defer(delivery_task, Box::into_raw(delivery) as usize, 0);
    }
}

/* *****************************************************************************
 * Engines
 **************************************************************************** */

/// Decides where a publish is delivered and mirrors channel lifecycles —
/// the seam for external pub/sub services.
pub trait Engine: Send + Sync {
    /// A channel (or pattern) gained its first local subscriber.
    fn subscribe(&self, channel: &str, pattern: bool);
    /// A channel (or pattern) lost its last local subscriber.
    fn unsubscribe(&self, channel: &str, pattern: bool);
    /// Deliver `data` to `channel` subscribers, wherever this engine
    /// reaches.
    fn publish(&self, channel: &str, data: &[u8]) -> io::Result<()>;
}

/// Delivers to subscribers within the current process only.
#[derive(Debug)]
pub struct ProcessEngine;

impl Engine for ProcessEngine {
    fn subscribe(&self, _channel: &str, _pattern: bool) {}

    fn unsubscribe(&self, _channel: &str, _pattern: bool) {}

    fn publish(&self, channel: &str, data: &[u8]) -> io::Result<()> {
        publish_in_process(channel, data);
        Ok(())
    }
}

/// Delivers cluster-wide, including to the publishing process.
#[derive(Debug)]
pub struct ClusterEngine;

impl Engine for ClusterEngine {
    fn subscribe(&self, channel: &str, pattern: bool) {
        if reactor::is_running() {
            let filter = if pattern {
                FILTER_PATTERN_SUB
            } else {
                FILTER_CHANNEL_SUB
            };
            let _ = cluster::send(filter, channel.as_bytes(), &[]);
        }
    }

    fn unsubscribe(&self, channel: &str, pattern: bool) {
        if reactor::is_running() {
            let filter = if pattern {
                FILTER_PATTERN_UNSUB
            } else {
                FILTER_CHANNEL_UNSUB
            };
            let _ = cluster::send(filter, channel.as_bytes(), &[]);
        }
    }

    fn publish(&self, channel: &str, data: &[u8]) -> io::Result<()> {
        if reactor::is_running() {
            let _ = cluster::send(FILTER_PUBLISH, channel.as_bytes(), data);
        }
        publish_in_process(channel, data);
        Ok(())
    }
}

/// Delivers to every process in the cluster except the publishing one.
#[derive(Debug)]
pub struct SiblingsEngine;

impl Engine for SiblingsEngine {
    fn subscribe(&self, _channel: &str, _pattern: bool) {}

    fn unsubscribe(&self, _channel: &str, _pattern: bool) {}

    fn publish(&self, channel: &str, data: &[u8]) -> io::Result<()> {
        cluster::send(FILTER_PUBLISH, channel.as_bytes(), data)
    }
}

/// The in-process engine.
pub static PROCESS: ProcessEngine = ProcessEngine;
/// The cluster-wide engine; the default for [`publish`].
pub static CLUSTER: ClusterEngine = ClusterEngine;
/// The everyone-but-me engine.
pub static SIBLINGS: SiblingsEngine = SiblingsEngine;

/// Publishes `data` on `channel` through `engine` (default: [`CLUSTER`]).
pub fn publish(engine: Option<&dyn Engine>, channel: &str, data: &[u8]) -> io::Result<()> {
    engine.unwrap_or(&CLUSTER).publish(channel, data)
}

/// Registers an external engine so it hears about channel lifecycles.
pub fn register_engine(engine: Arc<dyn Engine>) {
    engines().lock().unwrap().push(engine);
}

/// Unregisters a previously registered engine.
pub fn deregister_engine(engine: &Arc<dyn Engine>) {
    let mut engines = engines().lock().unwrap();
    let before = engines.len();
    engines.retain(|other| !Arc::ptr_eq(other, engine));
    if engines.len() == before {
        error!("deregistered an engine that was never registered");
    }
}

/// Replays every live channel into `engine` — for services that dropped
/// their connection and need to resubscribe.
pub fn resubscribe_all(engine: &dyn Engine) {
    let channels: Vec<(String, bool)> = {
        let reg = registry().lock().unwrap();
        reg.channels
            .keys()
            .map(|name| (name.to_string(), false))
            .chain(reg.patterns.keys().map(|name| (name.to_string(), true)))
            .collect()
    };
    for (name, pattern) in channels {
        engine.subscribe(&name, pattern);
    }
}

/* *****************************************************************************
 * Cluster wiring
 **************************************************************************** */

fn noop_on_message(_message: &Message) {}

fn subscribe_remote(channel: &str, pattern: bool) {
    let args = SubscribeArgs {
        channel,
        pattern,
        on_message: noop_on_message,
        on_unsubscribe: None,
        udata1: 0,
        udata2: 0,
    };
    subscribe_inner(args, false);
}

fn unsubscribe_remote(channel: &str, pattern: bool) {
    let args = SubscribeArgs {
        channel,
        pattern,
        on_message: noop_on_message,
        on_unsubscribe: None,
        udata1: 0,
        udata2: 0,
    };
    if let Some(sub) = find_subscription(args) {
        unsubscribe(sub);
    }
}

fn bus_message(filter: i32, channel: &[u8], data: &[u8]) {
    let name = String::from_utf8_lossy(channel);
    match filter {
        FILTER_PUBLISH => publish_in_process(&name, data),
        FILTER_CHANNEL_SUB => subscribe_remote(&name, false),
        FILTER_PATTERN_SUB => subscribe_remote(&name, true),
        FILTER_CHANNEL_UNSUB => unsubscribe_remote(&name, false),
        FILTER_PATTERN_UNSUB => unsubscribe_remote(&name, true),
        _ => {}
    }
}

/// Registers the pub/sub handlers on the cluster bus. Called by the bus
/// installer.
pub(crate) fn cluster_init() {
    for filter in [
        FILTER_PUBLISH,
        FILTER_CHANNEL_SUB,
        FILTER_PATTERN_SUB,
        FILTER_CHANNEL_UNSUB,
        FILTER_PATTERN_UNSUB,
    ] {
        cluster::set_handler(filter, bus_message);
    }
}

/* *****************************************************************************
 * Glob matching
 **************************************************************************** */

/// Binary glob matcher: `?`, `*`, `[set]` / `[^set]` with `-` ranges (`]`
/// legal as the first class member) and `\` escapes. Backtracking is
/// iterative — on mismatch the match resumes one character after the last
/// `*`.
pub fn glob_match(data: &[u8], pattern: &[u8]) -> bool {
    let mut data = data;
    let mut pat = pattern;
    let mut back_pat: Option<&[u8]> = None;
    let mut back_str: &[u8] = data;

    while !data.is_empty() {
        let before = data;
        let c = data[0];
        data = &data[1..];
        let d = match pat.first() {
            Some(d) => *d,
            None => {
                // Pattern exhausted with data left; backtrack or fail.
                match back_pat {
                    Some(bp) => {
                        pat = bp;
                        back_str = &back_str[1..];
                        data = back_str;
                        continue;
                    }
                    None => return false,
                }
            }
        };
        pat = &pat[1..];

        let matched = match d {
            b'?' => true,
            b'*' => {
                if pat.is_empty() {
                    return true;
                }
                back_pat = Some(pat);
                data = before;
                back_str = before;
                true
            }
            b'[' => {
                let inverted = pat.first() == Some(&b'^');
                let mut cls = &pat[usize::from(inverted)..];
                if cls.is_empty() {
                    return false;
                }
                let mut a = cls[0];
                cls = &cls[1..];
                let mut hit = false;
                loop {
                    let mut b = a;
                    if cls.len() >= 2 && cls[0] == b'-' && cls[1] != b']' {
                        b = cls[1];
                        cls = &cls[2..];
                        if a > b {
                            std::mem::swap(&mut a, &mut b);
                        }
                    }
                    hit |= a <= c && c <= b;
                    match cls.first() {
                        Some(&next) => {
                            cls = &cls[1..];
                            if next == b']' {
                                break;
                            }
                            a = next;
                        }
                        None => return false,
                    }
                }
                if hit != inverted {
                    pat = cls;
                }
                hit != inverted
            }
            b'\\' => {
                let escaped = match pat.first() {
                    Some(escaped) => *escaped,
                    None => return false,
                };
                pat = &pat[1..];
                c == escaped
            }
            literal => c == literal,
        };

        if !matched {
            match back_pat {
                Some(bp) => {
                    pat = bp;
                    back_str = &back_str[1..];
                    data = back_str;
                }
                None => return false,
            }
        }
    }
    data.is_empty() && pat.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_literals_and_wildcards() {
        assert!(glob_match(b"users.42", b"users.*"));
        assert!(glob_match(b"users.abc", b"users.*"));
        assert!(!glob_match(b"admin.1", b"users.*"));
        assert!(glob_match(b"abc", b"a?c"));
        assert!(!glob_match(b"ac", b"a?c"));
        assert!(glob_match(b"anything", b"*"));
    }

    #[test]
    fn glob_star_backtracking() {
        assert!(glob_match(b"a.b.c.d", b"a.*.d"));
        assert!(glob_match(b"xxabyy", b"*ab*"));
        assert!(!glob_match(b"xxayy", b"*ab*"));
        assert!(glob_match(b"aaab", b"*aab"));
    }

    #[test]
    fn glob_classes() {
        assert!(glob_match(b"a1c", b"a[0-9]c"));
        assert!(!glob_match(b"axc", b"a[0-9]c"));
        assert!(glob_match(b"axc", b"a[^0-9]c"));
        assert!(glob_match(b"a]c", b"a[]]c"));
        assert!(glob_match(b"a*c", b"a\\*c"));
        assert!(!glob_match(b"abc", b"a\\*c"));
    }
}

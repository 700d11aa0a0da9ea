//! Per-connection task orchestrator.
//!
//! Every inbound message becomes a named background task. Persist tasks are
//! durable: teardown waits for them so accepted writes land even when the
//! client has gone. Query, listen and count tasks belong to the client: they
//! are cancelled through their own [`CancellationToken`] and awaited, and they
//! never send after observing cancellation.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{Arc, Mutex},
};

use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    bus::{BusSubscription, EVENTS_TOPIC},
    error::RelayError,
    event::Event,
    filter::{Filter, Predicate},
    message::{ClientMessage, RelayMessage},
    relay::Relay,
};

/// Whether the connection should keep reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// How a task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskExit {
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskClass {
    Durable,
    Client,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TaskName {
    Persist(String),
    Query(String),
    Listen(String),
    Count(String),
}

impl TaskName {
    fn class(&self) -> TaskClass {
        match self {
            TaskName::Persist(_) => TaskClass::Durable,
            _ => TaskClass::Client,
        }
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskName::Persist(id) => write!(f, "persist:{id}"),
            TaskName::Query(sub) => write!(f, "query:{sub}"),
            TaskName::Listen(sub) => write!(f, "listen:{sub}"),
            TaskName::Count(sub) => write!(f, "count:{sub}"),
        }
    }
}

struct Tracked {
    token: CancellationToken,
    handle: JoinHandle<TaskExit>,
}

/// State of one client connection.
pub struct Session {
    relay: Arc<Relay>,
    out: mpsc::Sender<RelayMessage>,
    tasks: HashMap<TaskName, Tracked>,
}

impl Session {
    pub fn new(relay: Arc<Relay>, out: mpsc::Sender<RelayMessage>) -> Self {
        Self {
            relay,
            out,
            tasks: HashMap::new(),
        }
    }

    /// Handle one inbound text frame.
    pub async fn dispatch(&mut self, text: &str) -> Flow {
        self.reap();
        let result = match ClientMessage::parse(text) {
            Ok(msg) => self.handle(msg).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => Flow::Continue,
            Err(e) if e.is_fatal() => {
                warn!(error = %e, "protocol error, closing session");
                self.notice(&e);
                Flow::Close
            }
            Err(e) => {
                debug!(error = %e, "message rejected");
                self.notice(&e);
                Flow::Continue
            }
        }
    }

    async fn handle(&mut self, msg: ClientMessage) -> Result<(), RelayError> {
        match msg {
            ClientMessage::Event(ev) => {
                self.persist(*ev);
                Ok(())
            }
            ClientMessage::Req { sub, filters } => self.open(sub, filters).await,
            ClientMessage::Count { sub, filters } => self.count(sub, filters).await,
            ClientMessage::Close(sub) => {
                debug!(%sub, "close subscription");
                self.close_subscription(&sub).await;
                Ok(())
            }
        }
    }

    fn persist(&mut self, ev: Event) {
        let name = TaskName::Persist(ev.id.clone());
        if self.tasks.contains_key(&name) {
            debug!(task = %name, "event already being persisted");
            return;
        }
        let relay = self.relay.clone();
        let out = self.out.clone();
        self.spawn(name, |_| run_persist(relay, ev, out));
    }

    async fn open(&mut self, sub: String, filters: Vec<Filter>) -> Result<(), RelayError> {
        self.relay.store.check_filters(&filters)?;
        let predicate = Predicate::compile(&filters)?;
        self.cancel(&TaskName::Query(sub.clone())).await;
        self.cancel(&TaskName::Listen(sub.clone())).await;
        debug!(%sub, filters = filters.len(), "open subscription");

        // listening starts before the query so nothing stored in between is missed
        let listener = self.relay.bus.subscribe(EVENTS_TOPIC)?;
        let delivered = Delivered::new();
        let (relay, out, id) = (self.relay.clone(), self.out.clone(), sub.clone());
        let seen = delivered.clone();
        self.spawn(TaskName::Listen(sub.clone()), move |token| {
            run_listen(listener, predicate, seen, id, out, token)
        });
        let (out, id) = (self.out.clone(), sub.clone());
        self.spawn(TaskName::Query(sub), move |token| {
            run_query(relay, filters, delivered, id, out, token)
        });
        Ok(())
    }

    async fn count(&mut self, sub: String, filters: Vec<Filter>) -> Result<(), RelayError> {
        self.relay.store.check_filters(&filters)?;
        let name = TaskName::Count(sub.clone());
        self.cancel(&name).await;
        let (relay, out) = (self.relay.clone(), self.out.clone());
        self.spawn(name, move |token| run_count(relay, filters, sub, out, token));
        Ok(())
    }

    async fn close_subscription(&mut self, sub: &str) {
        for name in [
            TaskName::Query(sub.to_string()),
            TaskName::Listen(sub.to_string()),
            TaskName::Count(sub.to_string()),
        ] {
            self.cancel(&name).await;
        }
    }

    fn spawn<F, Fut>(&mut self, name: TaskName, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: std::future::Future<Output = TaskExit> + Send + 'static,
    {
        let token = CancellationToken::new();
        let handle = tokio::spawn(task(token.clone()));
        self.tasks.insert(name, Tracked { token, handle });
    }

    /// Cancel a client task and wait until it has stopped.
    async fn cancel(&mut self, name: &TaskName) {
        if let Some(task) = self.tasks.remove(name) {
            task.token.cancel();
            log_exit(name, task.handle.await);
        }
    }

    fn reap(&mut self) {
        self.tasks.retain(|_, t| !t.handle.is_finished());
    }

    /// Queue a NOTICE without waiting; dropped when the client is not reading.
    fn notice(&self, err: &RelayError) {
        match self.out.try_send(RelayMessage::Notice(err.to_string())) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) => {
                warn!(error = %err, "outbound queue full, notice dropped");
            }
        }
    }

    /// Tear the session down: client tasks are cancelled, then every task,
    /// durable ones included, is awaited.
    pub async fn shutdown(mut self) {
        let tasks: Vec<_> = self.tasks.drain().collect();
        for (name, task) in &tasks {
            if name.class() == TaskClass::Client {
                task.token.cancel();
            }
        }
        let pending = tasks.len();
        for (name, task) in tasks {
            log_exit(&name, task.handle.await);
        }
        info!(tasks = pending, "session closed");
    }
}

/// Event ids already sent on one subscription.
///
/// Ids are recorded until the stored events have been sent; afterwards the set
/// is frozen and only filters live events against what was already sent.
#[derive(Clone)]
struct Delivered(Arc<Mutex<Seen>>);

struct Seen {
    ids: HashSet<String>,
    recording: bool,
}

impl Delivered {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(Seen {
            ids: HashSet::new(),
            recording: true,
        })))
    }

    /// Whether `id` still has to be sent.
    fn first(&self, id: &str) -> bool {
        let Ok(mut seen) = self.0.lock() else {
            return true;
        };
        if seen.recording {
            seen.ids.insert(id.to_string())
        } else {
            !seen.ids.contains(id)
        }
    }

    /// Stop recording; called once the stored events are out.
    fn finish(&self) {
        if let Ok(mut seen) = self.0.lock() {
            seen.recording = false;
        }
    }
}

fn log_exit(name: &TaskName, res: Result<TaskExit, tokio::task::JoinError>) {
    match res {
        Ok(exit) => debug!(task = %name, ?exit, "task finished"),
        Err(e) => warn!(task = %name, error = %e, "task panicked"),
    }
}

async fn run_persist(relay: Arc<Relay>, ev: Event, out: mpsc::Sender<RelayMessage>) -> TaskExit {
    let id = ev.id.clone();
    match relay.submit(ev).await {
        Ok(outcome) => {
            debug!(%id, ?outcome, "event handled");
            TaskExit::Completed
        }
        Err(RelayError::Validation(e)) => {
            let _ = out.send(RelayMessage::Notice(e.to_string())).await;
            TaskExit::Failed
        }
        Err(e) => {
            warn!(%id, error = %e, "event write failed");
            let _ = out.send(RelayMessage::Notice(e.to_string())).await;
            TaskExit::Failed
        }
    }
}

/// Send unless cancelled first. `None` when the task should stop.
async fn send(
    out: &mpsc::Sender<RelayMessage>,
    token: &CancellationToken,
    msg: RelayMessage,
) -> Option<TaskExit> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Some(TaskExit::Cancelled),
        sent = out.send(msg) => match sent {
            Ok(()) => None,
            // connection writer is gone
            Err(_) => Some(TaskExit::Completed),
        },
    }
}

async fn run_query(
    relay: Arc<Relay>,
    filters: Vec<Filter>,
    delivered: Delivered,
    sub: String,
    out: mpsc::Sender<RelayMessage>,
    token: CancellationToken,
) -> TaskExit {
    let events = tokio::select! {
        biased;
        _ = token.cancelled() => return TaskExit::Cancelled,
        res = relay.store.query(&filters) => res,
    };
    let events = match events {
        Ok(events) => events,
        Err(e) => {
            warn!(%sub, error = %e, "subscription query failed");
            return send(&out, &token, RelayMessage::Notice(e.to_string()))
                .await
                .unwrap_or(TaskExit::Failed);
        }
    };
    for ev in events {
        if !delivered.first(&ev.id) {
            continue;
        }
        let msg = RelayMessage::Event {
            sub: sub.clone(),
            event: Arc::new(ev),
        };
        if let Some(exit) = send(&out, &token, msg).await {
            return exit;
        }
    }
    delivered.finish();
    send(&out, &token, RelayMessage::Eose(sub))
        .await
        .unwrap_or(TaskExit::Completed)
}

async fn run_listen(
    mut listener: BusSubscription,
    predicate: Predicate,
    delivered: Delivered,
    sub: String,
    out: mpsc::Sender<RelayMessage>,
    token: CancellationToken,
) -> TaskExit {
    loop {
        let ev = tokio::select! {
            biased;
            _ = token.cancelled() => return TaskExit::Cancelled,
            ev = listener.recv() => match ev {
                Some(ev) => ev,
                None => return TaskExit::Completed,
            },
        };
        if !predicate.test(&ev) || !delivered.first(&ev.id) {
            continue;
        }
        let msg = RelayMessage::Event {
            sub: sub.clone(),
            event: ev,
        };
        if let Some(exit) = send(&out, &token, msg).await {
            return exit;
        }
    }
}

async fn run_count(
    relay: Arc<Relay>,
    filters: Vec<Filter>,
    sub: String,
    out: mpsc::Sender<RelayMessage>,
    token: CancellationToken,
) -> TaskExit {
    let counted = tokio::select! {
        biased;
        _ = token.cancelled() => return TaskExit::Cancelled,
        res = relay.store.count(&filters) => res,
    };
    let msg = match counted {
        Ok(count) => RelayMessage::Count { sub, count },
        Err(e) => {
            warn!(%sub, error = %e, "count failed");
            RelayMessage::Notice(e.to_string())
        }
    };
    send(&out, &token, msg).await.unwrap_or(TaskExit::Completed)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::time::timeout;

    use super::*;
    use crate::{
        bus::{Bus, LocalBus},
        relay::testing::relay,
        validation::{
            testing::{e_tag, signed},
            unix_now,
        },
    };

    fn session(relay: Arc<Relay>) -> (Session, mpsc::Receiver<RelayMessage>) {
        let (tx, rx) = mpsc::channel(256);
        (Session::new(relay, tx), rx)
    }

    async fn next(rx: &mut mpsc::Receiver<RelayMessage>) -> RelayMessage {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("channel closed")
    }

    async fn until_eose(rx: &mut mpsc::Receiver<RelayMessage>, sub: &str) -> Vec<Arc<Event>> {
        let mut got = vec![];
        loop {
            match next(rx).await {
                RelayMessage::Event { sub: s, event } if s == sub => got.push(event),
                RelayMessage::Eose(s) if s == sub => return got,
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    fn event_msg(ev: &Event) -> String {
        json!(["EVENT", ev]).to_string()
    }

    async fn wait_stored(relay: &Relay, id: &str) {
        for _ in 0..100 {
            if relay.store.fetch_event(id).await.is_ok() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("event {id} never stored");
    }

    async fn wait_listeners(bus: &LocalBus, n: usize) {
        for _ in 0..100 {
            if bus.subscriber_count(EVENTS_TOPIC) == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {n} bus subscribers");
    }

    #[tokio::test]
    async fn req_streams_stored_then_live() {
        let (_dir, _bus, relay) = relay();
        let stored = signed(1, 1, unix_now() - 5, vec![], "stored");
        relay.submit(stored.clone()).await.unwrap();

        let (mut s, mut rx) = session(relay.clone());
        assert_eq!(s.dispatch(r#"["REQ","feed",{"kinds":[1]}]"#).await, Flow::Continue);
        let history = until_eose(&mut rx, "feed").await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, stored.id);

        let live = signed(2, 1, unix_now(), vec![], "live");
        let other_kind = signed(2, 7, unix_now(), vec![], "+");
        s.dispatch(&event_msg(&other_kind)).await;
        s.dispatch(&event_msg(&live)).await;
        match next(&mut rx).await {
            RelayMessage::Event { sub, event } => {
                assert_eq!(sub, "feed");
                assert_eq!(event.id, live.id);
            }
            other => panic!("unexpected {other:?}"),
        }
        s.shutdown().await;
    }

    #[tokio::test]
    async fn resubscribe_replaces_the_old_filter() {
        let (_dir, bus, relay) = relay();
        for t in 0..20 {
            relay
                .submit(signed(1, 1, unix_now() - 100 + t, vec![], "one"))
                .await
                .unwrap();
        }
        let two = signed(1, 2, unix_now() - 50, vec![], "two");
        relay.submit(two.clone()).await.unwrap();

        let (mut s, mut rx) = session(relay.clone());
        s.dispatch(r#"["REQ","sub1",{"kinds":[1]}]"#).await;
        s.dispatch(r#"["REQ","sub1",{"kinds":[2]}]"#).await;
        assert_eq!(bus.subscriber_count(EVENTS_TOPIC), 1);

        // the old query was stopped before the new one started, so its output
        // (kind 1 events, maybe an EOSE) all precedes the replacement's
        loop {
            match next(&mut rx).await {
                RelayMessage::Event { event, .. } if event.kind == 2 => {
                    assert_eq!(event.id, two.id);
                    break;
                }
                RelayMessage::Event { event, .. } => assert_eq!(event.kind, 1),
                RelayMessage::Eose(sub) => assert_eq!(sub, "sub1"),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(next(&mut rx).await, RelayMessage::Eose("sub1".into()));

        let live_one = signed(3, 1, unix_now(), vec![], "late one");
        let live_two = signed(3, 2, unix_now(), vec![], "late two");
        relay.submit(live_one).await.unwrap();
        relay.submit(live_two.clone()).await.unwrap();
        match next(&mut rx).await {
            RelayMessage::Event { sub, event } => {
                assert_eq!(sub, "sub1");
                assert_eq!(event.kind, 2);
                assert_eq!(event.id, live_two.id);
            }
            other => panic!("unexpected {other:?}"),
        }
        s.shutdown().await;
        wait_listeners(&bus, 0).await;
    }

    #[tokio::test]
    async fn ephemeral_events_reach_live_subscribers_only() {
        let (_dir, _bus, relay) = relay();
        let (mut s, mut rx) = session(relay.clone());
        s.dispatch(r#"["REQ","eph",{"kinds":[20001]}]"#).await;
        assert!(until_eose(&mut rx, "eph").await.is_empty());

        let ev = signed(1, 20_001, unix_now(), vec![], "blink");
        let (mut publisher, _prx) = session(relay.clone());
        publisher.dispatch(&event_msg(&ev)).await;
        match next(&mut rx).await {
            RelayMessage::Event { event, .. } => assert_eq!(event.id, ev.id),
            other => panic!("unexpected {other:?}"),
        }
        publisher.shutdown().await;
        assert!(relay.store.fetch_event(&ev.id).await.is_err());
        s.shutdown().await;
    }

    #[tokio::test]
    async fn tag_filtered_subscription() {
        let (_dir, _bus, relay) = relay();
        let tagged = signed(1, 1, unix_now(), vec![e_tag("abc123")], "");
        relay.submit(tagged.clone()).await.unwrap();
        relay.submit(signed(1, 1, unix_now(), vec![], "plain")).await.unwrap();

        let (mut s, mut rx) = session(relay);
        s.dispatch(r##"["REQ","hit",{"#e":["abc123"]}]"##).await;
        let hits = until_eose(&mut rx, "hit").await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, tagged.id);
        s.dispatch(r##"["REQ","miss",{"#e":["zzz999"]}]"##).await;
        assert!(until_eose(&mut rx, "miss").await.is_empty());
        s.shutdown().await;
    }

    #[tokio::test]
    async fn count_and_close() {
        let (_dir, bus, relay) = relay();
        for t in 0..3 {
            relay.submit(signed(1, 1, unix_now() - t, vec![], "")).await.unwrap();
        }
        let (mut s, mut rx) = session(relay);
        s.dispatch(r#"["COUNT","c",{"kinds":[1],"limit":1}]"#).await;
        assert_eq!(
            next(&mut rx).await,
            RelayMessage::Count {
                sub: "c".into(),
                count: 3
            }
        );

        s.dispatch(r#"["REQ","s",{"kinds":[9]}]"#).await;
        until_eose(&mut rx, "s").await;
        assert_eq!(bus.subscriber_count(EVENTS_TOPIC), 1);
        assert_eq!(s.dispatch(r#"["CLOSE","s"]"#).await, Flow::Continue);
        assert_eq!(bus.subscriber_count(EVENTS_TOPIC), 0);
        s.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_event_gets_a_notice_and_the_session_stays_open() {
        let (_dir, _bus, relay) = relay();
        let (mut s, mut rx) = session(relay.clone());
        let mut forged = signed(1, 1, unix_now(), vec![], "real");
        forged.content = "forged".into();
        assert_eq!(s.dispatch(&event_msg(&forged)).await, Flow::Continue);
        match next(&mut rx).await {
            RelayMessage::Notice(msg) => assert!(msg.contains("id mismatch"), "{msg}"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(s.dispatch(r#"["EVENT",{"kind":1}]"#).await, Flow::Continue);
        assert!(matches!(next(&mut rx).await, RelayMessage::Notice(_)));

        let good = signed(1, 1, unix_now(), vec![], "fine");
        s.dispatch(&event_msg(&good)).await;
        wait_stored(&relay, &good.id).await;
        s.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_message_closes_the_session() {
        let (_dir, _bus, relay) = relay();
        let (mut s, mut rx) = session(relay);
        assert_eq!(s.dispatch(r#"["HELLO"]"#).await, Flow::Close);
        assert!(matches!(next(&mut rx).await, RelayMessage::Notice(_)));
        assert_eq!(s.dispatch(r#"["REQ","x",{"ids":["NOTHEX"]}]"#).await, Flow::Close);
        s.shutdown().await;
    }

    #[tokio::test]
    async fn teardown_finishes_writes_and_releases_listeners() {
        let (_dir, bus, relay) = relay();
        let (mut s, rx) = session(relay.clone());
        s.dispatch(r#"["REQ","a",{}]"#).await;
        s.dispatch(r#"["REQ","b",{"kinds":[1]}]"#).await;
        let events: Vec<_> = (0..10)
            .map(|i| signed(4, 1, unix_now() - i, vec![], "pending"))
            .collect();
        for ev in &events {
            s.dispatch(&event_msg(ev)).await;
        }
        // the client vanishes without reading anything
        drop(rx);
        s.shutdown().await;
        for ev in &events {
            relay.store.fetch_event(&ev.id).await.unwrap();
        }
        assert_eq!(bus.subscriber_count(EVENTS_TOPIC), 0);
    }

    #[test]
    fn delivered_ids_are_sent_once() {
        let delivered = Delivered::new();
        assert!(delivered.first("a"));
        assert!(!delivered.first("a"));
        delivered.finish();
        assert!(!delivered.first("a"));
        assert!(delivered.first("b"));
        // not recorded once frozen
        assert!(delivered.first("b"));
    }

    #[tokio::test]
    async fn stored_event_already_sent_live_is_skipped() {
        let (_dir, _bus, relay) = relay();
        let early = signed(1, 1, unix_now() - 1, vec![], "early");
        let other = signed(1, 1, unix_now() - 2, vec![], "other");
        relay.submit(early.clone()).await.unwrap();
        relay.submit(other.clone()).await.unwrap();

        let delivered = Delivered::new();
        assert!(delivered.first(&early.id));
        let (tx, mut rx) = mpsc::channel(16);
        let filters = vec![Filter::default()];
        let exit = run_query(
            relay,
            filters,
            delivered.clone(),
            "s".into(),
            tx,
            CancellationToken::new(),
        )
        .await;
        assert_eq!(exit, TaskExit::Completed);
        let history = until_eose(&mut rx, "s").await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, other.id);
        assert!(!delivered.first(&other.id));
    }

    #[tokio::test]
    async fn live_event_already_sent_stored_is_skipped() {
        let (_dir, bus, _relay) = relay();
        let listener = bus.subscribe(EVENTS_TOPIC).unwrap();
        let predicate = Predicate::compile(&[Filter::default()]).unwrap();
        let delivered = Delivered::new();
        let stored = Arc::new(signed(1, 1, 10, vec![], "stored"));
        let fresh = Arc::new(signed(1, 1, 11, vec![], "fresh"));
        assert!(delivered.first(&stored.id));
        delivered.finish();

        let (tx, mut rx) = mpsc::channel(16);
        let token = CancellationToken::new();
        let task = tokio::spawn(run_listen(
            listener,
            predicate,
            delivered,
            "s".into(),
            tx,
            token.clone(),
        ));
        bus.publish(EVENTS_TOPIC, stored).unwrap();
        bus.publish(EVENTS_TOPIC, fresh.clone()).unwrap();
        match next(&mut rx).await {
            RelayMessage::Event { event, .. } => assert_eq!(event.id, fresh.id),
            other => panic!("unexpected {other:?}"),
        }
        token.cancel();
        assert_eq!(task.await.unwrap(), TaskExit::Cancelled);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn too_many_filters_close_the_session() {
        let (_dir, bus, relay) = relay();
        let filters: Vec<_> = (0..101).map(|k| json!({"kinds": [k]})).collect();
        let mut req = vec![json!("REQ"), json!("wide")];
        req.extend(filters.iter().cloned());
        let (mut s, mut rx) = session(relay.clone());
        assert_eq!(s.dispatch(&json!(req).to_string()).await, Flow::Close);
        match next(&mut rx).await {
            RelayMessage::Notice(msg) => assert!(msg.contains("too many filters"), "{msg}"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(bus.subscriber_count(EVENTS_TOPIC), 0);

        let mut count = vec![json!("COUNT"), json!("wide")];
        count.extend(filters);
        let (mut s2, _rx2) = session(relay);
        assert_eq!(s2.dispatch(&json!(count).to_string()).await, Flow::Close);
        s.shutdown().await;
        s2.shutdown().await;
    }

    #[tokio::test]
    async fn full_outbound_queue_does_not_stall_dispatch() {
        let (_dir, _bus, relay) = relay();
        let (tx, mut rx) = mpsc::channel(1);
        tx.try_send(RelayMessage::Eose("filler".into())).unwrap();
        let mut s = Session::new(relay, tx);
        let flow = timeout(Duration::from_secs(1), s.dispatch(r#"["EVENT",{"kind":1}]"#))
            .await
            .expect("dispatch blocked on a full queue");
        assert_eq!(flow, Flow::Continue);
        let flow = timeout(Duration::from_secs(1), s.dispatch(r#"["HELLO"]"#))
            .await
            .expect("dispatch blocked on a full queue");
        assert_eq!(flow, Flow::Close);
        assert_eq!(rx.recv().await, Some(RelayMessage::Eose("filler".into())));
        s.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_submissions_share_one_task() {
        let (_dir, _bus, relay) = relay();
        let (mut s, _rx) = session(relay.clone());
        let ev = signed(1, 1, unix_now(), vec![], "once");
        s.dispatch(&event_msg(&ev)).await;
        s.dispatch(&event_msg(&ev)).await;
        assert!(s.tasks.len() <= 1);
        s.shutdown().await;
        assert_eq!(
            relay
                .store
                .count(&[Filter {
                    ids: Some(vec![ev.id.clone()]),
                    ..Default::default()
                }])
                .await
                .unwrap(),
            1
        );
    }
}

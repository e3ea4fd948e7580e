//! Scripted upstream for tests: every `open` hands the test a [`FakeUpstream`]
//! that can push events and observe requests.

use super::{Connection, Connector, LiveError, SessionSetup, UpstreamEvent, UpstreamRequest};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct FakeUpstream {
    pub setup: SessionSetup,
    pub requests: mpsc::UnboundedReceiver<UpstreamRequest>,
    events: Option<mpsc::UnboundedSender<UpstreamEvent>>,
}

impl FakeUpstream {
    pub fn emit(&self, event: UpstreamEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    /// End the event stream the way the upstream does after each turn.
    pub fn end_turn(&mut self) {
        self.events = None;
    }
}

pub struct FakeConnector {
    accepted: mpsc::UnboundedSender<FakeUpstream>,
    opens: AtomicUsize,
    fail_next: AtomicUsize,
    fail_always: AtomicBool,
    refuse_requests: AtomicBool,
}

impl FakeConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FakeUpstream>) {
        let (accepted, upstreams) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            accepted,
            opens: AtomicUsize::new(0),
            fail_next: AtomicUsize::new(0),
            fail_always: AtomicBool::new(false),
            refuse_requests: AtomicBool::new(false),
        });
        (connector, upstreams)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn fail_always(&self, fail: bool) {
        self.fail_always.store(fail, Ordering::SeqCst);
    }

    /// Links still open, but every send on them fails.
    pub fn refuse_requests(&self, refuse: bool) {
        self.refuse_requests.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(&self, setup: &SessionSetup) -> Result<Connection, LiveError> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        let scheduled_failure = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if self.fail_always.load(Ordering::SeqCst) || scheduled_failure {
            return Err(LiveError::Connect("scripted failure".to_string()));
        }

        let (requests_tx, mut requests_rx) = mpsc::unbounded_channel();
        if self.refuse_requests.load(Ordering::SeqCst) {
            requests_rx.close();
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let _ = self.accepted.send(FakeUpstream {
            setup: setup.clone(),
            requests: requests_rx,
            events: Some(events_tx),
        });

        Ok(Connection { requests: requests_tx, events: events_rx })
    }
}

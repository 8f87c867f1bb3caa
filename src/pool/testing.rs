//! In-memory doubles for unit tests.

use super::action::{ActionFuture, JobAction, JobFailure};
use super::job::Job;
use super::link::{LinkError, WorkerLink};
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Action whose attempts settle when the test says so.
pub struct ScriptedAction {
    outcomes_tx: mpsc::UnboundedSender<Result<Value, String>>,
    outcomes_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<Value, String>>>>,
    runs: AtomicUsize,
}

impl ScriptedAction {
    pub const KIND: &'static str = "scripted";

    pub fn new() -> Arc<Self> {
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            outcomes_tx,
            outcomes_rx: Arc::new(tokio::sync::Mutex::new(outcomes_rx)),
            runs: AtomicUsize::new(0),
        })
    }

    pub fn resolve_next(&self, value: Value) {
        let _ = self.outcomes_tx.send(Ok(value));
    }

    pub fn reject_next(&self, reason: &str) {
        let _ = self.outcomes_tx.send(Err(reason.to_string()));
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

impl JobAction for ScriptedAction {
    fn kind(&self) -> &str {
        Self::KIND
    }

    fn params(&self) -> Value {
        json!({})
    }

    fn run(&self, _job: Arc<Job>, _link: Arc<dyn WorkerLink>) -> ActionFuture {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let outcomes = Arc::clone(&self.outcomes_rx);
        async move {
            match outcomes.lock().await.recv().await {
                Some(Ok(value)) => Ok(value),
                Some(Err(reason)) => Err(JobFailure::new(reason)),
                None => Err(JobFailure::new("script exhausted")),
            }
        }
        .boxed()
    }
}

/// Link that records traffic instead of talking to a socket.
pub struct FakeLink {
    open: AtomicBool,
    emitted: Mutex<Vec<(String, Value)>>,
    requests: Mutex<Vec<(String, Value)>>,
    replies: Mutex<VecDeque<Result<Value, LinkError>>>,
    reply_gate: Mutex<Option<tokio::sync::oneshot::Receiver<()>>>,
    subscriptions: Mutex<HashMap<String, mpsc::UnboundedSender<Value>>>,
}

impl FakeLink {
    pub fn open() -> Arc<Self> {
        Arc::new(Self {
            open: AtomicBool::new(true),
            emitted: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            replies: Mutex::new(VecDeque::new()),
            reply_gate: Mutex::new(None),
            subscriptions: Mutex::new(HashMap::new()),
        })
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// Queue the reply for the next request. Defaults to `{statusCode: 200}`.
    pub fn reply_with(&self, reply: Result<Value, LinkError>) {
        self.replies.lock().unwrap().push_back(reply);
    }

    /// Hold the next reply until the returned sender fires.
    pub fn gate_next_reply(&self) -> tokio::sync::oneshot::Sender<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        *self.reply_gate.lock().unwrap() = Some(rx);
        tx
    }

    /// Deliver a message as if the peer sent it on `channel`.
    pub fn push(&self, channel: &str, payload: Value) -> bool {
        match self.subscriptions.lock().unwrap().get(channel) {
            Some(tx) => tx.send(payload).is_ok(),
            None => false,
        }
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.subscriptions.lock().unwrap().contains_key(channel)
    }

    pub fn emitted(&self) -> Vec<(String, Value)> {
        self.emitted.lock().unwrap().clone()
    }

    pub fn requests(&self) -> Vec<(String, Value)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkerLink for FakeLink {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn request(&self, msg_type: &str, payload: Value) -> Result<Value, LinkError> {
        if !self.is_open() {
            return Err(LinkError::Closed);
        }
        self.requests
            .lock()
            .unwrap()
            .push((msg_type.to_string(), payload));
        let gate = self.reply_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        let reply = self.replies.lock().unwrap().pop_front();
        reply.unwrap_or_else(|| Ok(json!({"statusCode": 200})))
    }

    async fn emit(&self, msg_type: &str, payload: Value) -> Result<(), LinkError> {
        if !self.is_open() {
            return Err(LinkError::Closed);
        }
        self.emitted
            .lock()
            .unwrap()
            .push((msg_type.to_string(), payload));
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions
            .lock()
            .unwrap()
            .insert(channel.to_string(), tx);
        rx
    }

    fn unsubscribe(&self, channel: &str) {
        self.subscriptions.lock().unwrap().remove(channel);
    }
}

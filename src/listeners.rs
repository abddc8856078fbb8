use crate::db::{Database, Document, Target, TargetData, TargetSnapshot};
use crate::errors::AppResult;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<T> {
    pub revision: i64,
    pub value: T,
}

/// Local copy of a remote target. Each accepted snapshot replaces the value wholesale;
/// snapshots older than the held revision are rejected.
#[derive(Debug)]
pub struct Mirror<T> {
    sender: Arc<watch::Sender<Option<Snapshot<T>>>>,
}

impl<T> Clone for Mirror<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<T: Clone> Default for Mirror<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Mirror<T> {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn apply(&self, snapshot: Snapshot<T>) -> bool {
        self.apply_if(snapshot, || true)
    }

    /// Like [`Mirror::apply`], but `still_wanted` is evaluated while the mirror is locked, so a
    /// snapshot cannot land after a concurrent [`Mirror::clear`] that made it irrelevant.
    pub fn apply_if(&self, snapshot: Snapshot<T>, still_wanted: impl FnOnce() -> bool) -> bool {
        let mut applied = false;
        self.sender.send_if_modified(|current| {
            if !still_wanted() {
                return false;
            }
            if let Some(held) = current {
                if snapshot.revision < held.revision {
                    return false;
                }
            }
            *current = Some(snapshot);
            applied = true;
            true
        });
        applied
    }

    pub fn current(&self) -> Option<T> {
        self.sender.borrow().as_ref().map(|snapshot| snapshot.value.clone())
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Snapshot<T>>> {
        self.sender.subscribe()
    }

    /// Drops the held value, e.g. when the owning identity goes away.
    pub fn clear(&self) {
        self.sender.send_replace(None);
    }
}

/// Handle of a running listener. Dropping it stops the listener.
#[derive(Debug)]
pub struct Subscription {
    name: String,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn unsubscribe(self) {
        tracing::debug!(listener = %self.name, "listener unsubscribed");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Delivers the current state of `target` immediately, then a full fresh snapshot after every
/// relevant change. Must be called from within a Tokio runtime.
pub fn listen<F>(db: Arc<Database>, name: &str, target: Target, on_snapshot: F) -> Subscription
where
    F: Fn(TargetSnapshot) + Send + Sync + 'static,
{
    // Subscribe before the first read so no write falls between the two.
    let mut changes = db.subscribe_changes();
    let listener = name.to_string();
    let task = tokio::spawn(async move {
        deliver(&db, &listener, &target, &on_snapshot);
        loop {
            match changes.recv().await {
                Ok(event) => {
                    if target.matches(&event) {
                        deliver(&db, &listener, &target, &on_snapshot);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(listener = %listener, skipped, "listener lagged; resynchronising");
                    deliver(&db, &listener, &target, &on_snapshot);
                }
                Err(RecvError::Closed) => {
                    tracing::debug!(listener = %listener, "change feed closed");
                    break;
                }
            }
        }
    });

    Subscription {
        name: name.to_string(),
        task,
    }
}

fn deliver<F>(db: &Database, listener: &str, target: &Target, on_snapshot: &F)
where
    F: Fn(TargetSnapshot),
{
    match db.read_target(target) {
        Ok(snapshot) => on_snapshot(snapshot),
        Err(error) => {
            tracing::warn!(listener, error = %error, "listener read failed; keeping last snapshot");
        }
    }
}

/// Decodes a single-document snapshot. A missing document decodes to `Ok(None)`; a document that
/// does not fit `T` is logged and returned as an error so callers can keep their last value.
pub fn decode_document<T: DeserializeOwned>(snapshot: &TargetSnapshot) -> AppResult<Option<T>> {
    let document = match &snapshot.data {
        TargetData::Document(document) => document.as_ref(),
        TargetData::Documents(documents) => documents.first(),
    };
    let Some(document) = document else {
        return Ok(None);
    };
    document.decode().map(Some).map_err(|error| {
        tracing::warn!(
            collection = %document.collection,
            id = %document.id,
            error = %error,
            "undecodable document; keeping last snapshot"
        );
        error
    })
}

/// Decodes every document of a snapshot, skipping the ones that do not fit `T`.
pub fn decode_documents<T: DeserializeOwned>(snapshot: &TargetSnapshot) -> Vec<T> {
    match &snapshot.data {
        TargetData::Document(document) => document.iter().filter_map(decode_or_warn).collect(),
        TargetData::Documents(documents) => documents.iter().filter_map(decode_or_warn).collect(),
    }
}

fn decode_or_warn<T: DeserializeOwned>(document: &Document) -> Option<T> {
    match document.decode() {
        Ok(value) => Some(value),
        Err(error) => {
            tracing::warn!(
                collection = %document.collection,
                id = %document.id,
                error = %error,
                "skipping undecodable document"
            );
            None
        }
    }
}

/// Running listeners grouped by the identity that owns them.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    owners: Arc<Mutex<HashMap<String, Vec<Subscription>>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn attach(&self, owner: &str, subscription: Subscription) {
        let mut owners = self.owners.lock().await;
        owners.entry(owner.to_string()).or_default().push(subscription);
    }

    pub async fn active_count(&self, owner: &str) -> usize {
        let owners = self.owners.lock().await;
        owners
            .get(owner)
            .map(|subscriptions| subscriptions.iter().filter(|entry| entry.is_active()).count())
            .unwrap_or(0)
    }

    pub async fn close_owner(&self, owner: &str) -> usize {
        let removed = {
            let mut owners = self.owners.lock().await;
            owners.remove(owner).unwrap_or_default()
        };
        let count = removed.len();
        for subscription in removed {
            subscription.unsubscribe();
        }
        if count > 0 {
            tracing::info!(owner, count, "closed listeners");
        }
        count
    }

    pub async fn close_all(&self) -> usize {
        let drained = {
            let mut owners = self.owners.lock().await;
            owners.drain().collect::<Vec<_>>()
        };
        let mut count = 0;
        for (_, subscriptions) in drained {
            count += subscriptions.len();
        }
        count
    }
}

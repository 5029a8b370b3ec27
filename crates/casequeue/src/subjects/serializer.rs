use crate::error::{QueueError, Result};
use crate::subjects::EntityStore;
use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

type Done = Shared<BoxFuture<'static, ()>>;

struct Tail {
    done: Done,
    /// Links created for this key that have not finished or been dropped.
    links: usize,
}

#[derive(Default)]
struct Chains {
    tails: Mutex<HashMap<String, Tail>>,
}

/// Per-key FIFO execution. Each call appends itself to the key's chain at
/// call time and starts only after its predecessor has finished. A call that
/// is dropped before its turn gives the turn up without letting its
/// successor overtake the predecessor. Keys never wait on each other.
///
/// The map holds one entry per key with work queued or running; the last
/// outstanding link removes it.
#[derive(Clone, Default)]
pub struct KeyedSerializer {
    chains: Arc<Chains>,
}

struct Link {
    chains: Arc<Chains>,
    key: String,
    release: Option<oneshot::Sender<()>>,
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Some(tx) = self.release.take() {
            let _ = tx.send(());
        }
        let mut tails = self.chains.tails.lock();
        if let Some(tail) = tails.get_mut(&self.key) {
            tail.links -= 1;
            if tail.links == 0 {
                tails.remove(&self.key);
            }
        }
    }
}

impl KeyedSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `f` behind every earlier call for `key`. The position in the
    /// chain is fixed when this returns, not when the future is first polled.
    pub fn run<F, Fut, T>(&self, key: &str, f: F) -> impl Future<Output = T> + Send + 'static
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel::<()>();

        let prev = {
            let mut tails = self.chains.tails.lock();
            let prev = tails.get(key).map(|t| t.done.clone());

            // this link's turn is over once the predecessor's is and it released
            let before = prev.clone();
            let done = async move {
                if let Some(p) = before {
                    p.await;
                }
                let _ = rx.await;
            }
            .boxed()
            .shared();

            let links = tails.get(key).map_or(0, |t| t.links) + 1;
            tails.insert(key.to_string(), Tail { done, links });
            prev
        };

        let link = Link {
            chains: self.chains.clone(),
            key: key.to_string(),
            release: Some(tx),
        };

        async move {
            if let Some(prev) = prev {
                prev.await;
            }
            let out = f().await;
            drop(link);
            out
        }
    }

    /// Keys that currently have queued or running work.
    pub fn active_keys(&self) -> usize {
        self.chains.tails.lock().len()
    }

    pub fn is_idle(&self) -> bool {
        self.active_keys() == 0
    }
}

/// Read-modify-write against an [`EntityStore`], one update at a time per key.
///
/// Each update loads the freshest record, applies the caller's function and
/// saves with the version it read. Errors stay with the caller that caused
/// them; the next update in the chain still runs.
pub struct EntityUpdateSerializer<E: Clone + Send + Sync + 'static> {
    store: Arc<dyn EntityStore<Entity = E>>,
    chains: KeyedSerializer,
}

impl<E: Clone + Send + Sync + 'static> Clone for EntityUpdateSerializer<E> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            chains: self.chains.clone(),
        }
    }
}

impl<E: Clone + Send + Sync + 'static> EntityUpdateSerializer<E> {
    pub fn new(store: Arc<dyn EntityStore<Entity = E>>) -> Self {
        Self {
            store,
            chains: KeyedSerializer::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn EntityStore<Entity = E>> {
        &self.store
    }

    pub fn active_keys(&self) -> usize {
        self.chains.active_keys()
    }

    /// Apply `f` to the current value of `key` and persist the result.
    /// Resolves to the saved entity.
    pub fn update<F>(&self, key: &str, f: F) -> impl Future<Output = Result<E>> + Send + 'static
    where
        F: FnOnce(&mut E) -> anyhow::Result<()> + Send + 'static,
    {
        let store = self.store.clone();
        let owned_key = key.to_string();

        self.chains.run(key, move || async move {
            let current = store
                .load(&owned_key)
                .await?
                .ok_or_else(|| QueueError::EntityNotFound(owned_key.clone()))?;

            let mut value = current.value;
            if let Err(e) = f(&mut value) {
                warn!(subject_id = %owned_key, error = %e, "subject update function failed");
                return Err(QueueError::Update(e));
            }

            let version = store.save(&owned_key, &value, current.version).await?;
            debug!(subject_id = %owned_key, version, "subject updated");
            Ok(value)
        })
    }
}

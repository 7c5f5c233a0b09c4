//! Trust-bundle sources
//!
//! A bundle source exposes the current root CA bundle PEM and signals
//! subscribers when it changes. Two variants exist: a file-backed source
//! watching a bundle on disk, and an in-memory source fed from a channel
//! for test harnesses. Consumers hold the capability as
//! `Arc<dyn BundleSource>`.

mod file;
mod memory;

pub use file::{FileSource, DEFAULT_POLL_INTERVAL};
pub use memory::MemorySource;

use std::sync::RwLock;

use tokio::sync::mpsc;

/// A source of root CA bundle data with change notifications
pub trait BundleSource: Send + Sync {
    /// The current CA bundle PEM
    fn certificates_pem(&self) -> Vec<u8>;

    /// Subscribe to change events. One `()` arrives per bundle change
    /// observed after the subscription.
    fn subscribe(&self) -> mpsc::Receiver<()>;
}

/// State shared by both source variants: the cached bundle and the
/// subscriber list, each behind its own reader-writer lock.
pub(crate) struct Shared {
    certificates_pem: RwLock<Vec<u8>>,
    subscribers: RwLock<Vec<mpsc::Sender<()>>>,
}

impl Shared {
    pub(crate) fn new(initial: Vec<u8>) -> Self {
        Self {
            certificates_pem: RwLock::new(initial),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn certificates_pem(&self) -> Vec<u8> {
        self.certificates_pem
            .read()
            .expect("bundle lock poisoned")
            .clone()
    }

    pub(crate) fn subscribe(&self) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(1);
        self.subscribers
            .write()
            .expect("subscriber lock poisoned")
            .push(tx);
        rx
    }

    /// Store a new bundle and notify subscribers. Returns false (and emits
    /// nothing) when the bundle is byte-for-byte identical to the cached
    /// one.
    pub(crate) fn update(&self, bundle: Vec<u8>) -> bool {
        {
            let mut current = self
                .certificates_pem
                .write()
                .expect("bundle lock poisoned");
            if *current == bundle {
                return false;
            }
            *current = bundle;
        }

        // Fan out without blocking the caller: one task per subscriber per
        // event, so a slow consumer only delays itself.
        let subscribers = self
            .subscribers
            .read()
            .expect("subscriber lock poisoned")
            .clone();
        for subscriber in subscribers {
            tokio::spawn(async move {
                let _ = subscriber.send(()).await;
            });
        }
        true
    }
}

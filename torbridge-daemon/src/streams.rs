//! Stream handle registry.
//!
//! The table maps caller-visible stream ids to exclusively-owned native
//! tunnels. Every mutation happens under one short-lived lock that is never
//! held across a native call; the native open/send/destroy run on the blocking
//! pool after the lock is released.
//!
//! # Id policy
//!
//! Callers may supply an id. If that id is live (or still opening), the open
//! fails with `DuplicateStream`. Without an id, a fresh UUID is generated.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};

use torbridge_core::{
    BridgeError, CallbackSink, CallbackToken, NativeBackend, StreamId, StreamInfo, StreamObserver,
};

use crate::events::EventHub;
use crate::handles::StreamHandle;

pub(crate) struct StreamEntry<B: NativeBackend> {
    pub(crate) handle: Arc<StreamHandle<B>>,
    pub(crate) target: String,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) generation: u64,
}

pub(crate) enum Slot<B: NativeBackend> {
    /// Id reserved while the native open is in flight.
    Opening { generation: u64 },
    Open(StreamEntry<B>),
}

pub(crate) struct Table<B: NativeBackend> {
    pub(crate) slots: HashMap<StreamId, Slot<B>>,
    /// Bumped by `close_all`; an open that started under an older epoch must
    /// not insert afterwards.
    epoch: u64,
    next_generation: u64,
}

struct Reservation {
    id: StreamId,
    generation: u64,
    epoch: u64,
}

pub struct StreamRegistry<B: NativeBackend> {
    backend: Arc<B>,
    table: Mutex<Table<B>>,
    pub(crate) events: EventHub,
    me: Weak<StreamRegistry<B>>,
}

impl<B: NativeBackend> StreamRegistry<B> {
    pub fn new(backend: Arc<B>, events: EventHub) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            backend,
            table: Mutex::new(Table {
                slots: HashMap::new(),
                epoch: 0,
                next_generation: 1,
            }),
            events,
            me: me.clone(),
        })
    }

    /// Open a tunnel to `target`.
    ///
    /// `proxy` resolves the daemon's SOCKS address; it runs after the id is
    /// reserved so a concurrent daemon stop either sees the reservation or
    /// makes `proxy` fail.
    pub async fn open<F>(
        &self,
        id: Option<StreamId>,
        target: &str,
        timeout: Duration,
        proxy: F,
    ) -> Result<StreamId, BridgeError>
    where
        F: FnOnce() -> Result<SocketAddr, BridgeError>,
    {
        let reservation = self.reserve(id)?;
        let guard = ReservationGuard {
            registry: self,
            reservation: Some(&reservation),
        };

        let proxy_addr = proxy()?;

        let backend = self.backend.clone();
        let native_target = target.to_string();
        // Wrap inside the blocking task: if this future is dropped mid-open,
        // the finished stream is still destroyed rather than leaked.
        let opened = tokio::task::spawn_blocking(move || {
            backend
                .open_stream(&native_target, proxy_addr, timeout)
                .map(|raw| Arc::new(StreamHandle::new(backend.clone(), raw)))
        })
        .await
        .map_err(|err| BridgeError::StreamOpenError(format!("open task join error: {err}")))?
        .map_err(|err| BridgeError::StreamOpenError(err.message().to_string()))?;

        let token = {
            let mut table = self.lock();
            let still_reserved = table.epoch == reservation.epoch
                && matches!(
                    table.slots.get(&reservation.id),
                    Some(Slot::Opening { generation }) if *generation == reservation.generation
                );
            if still_reserved {
                table.slots.insert(
                    reservation.id.clone(),
                    Slot::Open(StreamEntry {
                        handle: opened.clone(),
                        target: target.to_string(),
                        created_at: Utc::now(),
                        generation: reservation.generation,
                    }),
                );
                Some(CallbackToken {
                    stream_id: reservation.id.clone(),
                    generation: reservation.generation,
                })
            } else {
                None
            }
        };
        drop(guard);

        let Some(token) = token else {
            tracing::warn!(stream_id = %reservation.id, "daemon stopped while stream was opening");
            release_off_thread(opened).await;
            return Err(BridgeError::NotRunning);
        };

        opened.subscribe(StreamObserver::new(token, self.sink()));
        tracing::info!(stream_id = %reservation.id, target, "stream opened");
        Ok(reservation.id)
    }

    /// Remove the entry, then destroy the native stream.
    pub async fn close(&self, id: &StreamId) -> Result<(), BridgeError> {
        let entry = {
            let mut table = self.lock();
            match table.slots.get(id) {
                Some(Slot::Open(_)) => match table.slots.remove(id) {
                    Some(Slot::Open(entry)) => entry,
                    _ => return Err(BridgeError::NotFound(id.clone())),
                },
                _ => return Err(BridgeError::NotFound(id.clone())),
            }
        };
        release_off_thread(entry.handle).await;
        tracing::info!(stream_id = %id, "stream closed");
        Ok(())
    }

    pub async fn send(
        &self,
        id: &StreamId,
        message: &str,
        timeout: Duration,
    ) -> Result<(), BridgeError> {
        let handle = self.live_handle(id)?;
        let message = message.to_string();
        tokio::task::spawn_blocking(move || handle.send(&message, timeout))
            .await
            .map_err(|err| BridgeError::SendError(format!("send task join error: {err}")))?
            .map_err(|err| BridgeError::SendError(err.message().to_string()))
    }

    /// Drain every entry (reservations included) and destroy the streams.
    /// Returns how many open streams were destroyed.
    pub async fn close_all(&self) -> usize {
        let handles: Vec<_> = {
            let mut table = self.lock();
            table.epoch += 1;
            table
                .slots
                .drain()
                .filter_map(|(_, slot)| match slot {
                    Slot::Open(entry) => Some(entry.handle),
                    Slot::Opening { .. } => None,
                })
                .collect()
        };
        let count = handles.len();
        if count > 0 {
            if let Err(err) = tokio::task::spawn_blocking(move || drop(handles)).await {
                tracing::warn!(error = %err, "stream teardown task failed");
            }
        }
        count
    }

    /// Snapshot of open streams, oldest first.
    pub fn list(&self) -> Vec<StreamInfo> {
        let table = self.lock();
        let mut infos: Vec<StreamInfo> = table
            .slots
            .iter()
            .filter_map(|(id, slot)| match slot {
                Slot::Open(entry) => Some(StreamInfo {
                    id: id.clone(),
                    target: entry.target.clone(),
                    created_at: entry.created_at,
                }),
                Slot::Opening { .. } => None,
            })
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.0.cmp(&b.id.0)));
        infos
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Table<B>> {
        // Entries stay valid even if a holder panicked mid-lookup.
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sink(&self) -> Weak<dyn CallbackSink> {
        self.me.clone()
    }

    fn reserve(&self, id: Option<StreamId>) -> Result<Reservation, BridgeError> {
        let mut table = self.lock();
        let id = id.unwrap_or_else(StreamId::generate);
        if table.slots.contains_key(&id) {
            return Err(BridgeError::DuplicateStream(id));
        }
        let generation = table.next_generation;
        table.next_generation += 1;
        table
            .slots
            .insert(id.clone(), Slot::Opening { generation });
        Ok(Reservation {
            id,
            generation,
            epoch: table.epoch,
        })
    }

    fn cancel(&self, reservation: &Reservation) {
        let mut table = self.lock();
        if matches!(
            table.slots.get(&reservation.id),
            Some(Slot::Opening { generation }) if *generation == reservation.generation
        ) {
            table.slots.remove(&reservation.id);
        }
    }

    fn live_handle(&self, id: &StreamId) -> Result<Arc<StreamHandle<B>>, BridgeError> {
        match self.lock().slots.get(id) {
            Some(Slot::Open(entry)) => Ok(entry.handle.clone()),
            _ => Err(BridgeError::NotFound(id.clone())),
        }
    }
}

/// Frees an `Opening` slot if the open does not complete.
struct ReservationGuard<'a, B: NativeBackend> {
    registry: &'a StreamRegistry<B>,
    reservation: Option<&'a Reservation>,
}

impl<B: NativeBackend> Drop for ReservationGuard<'_, B> {
    fn drop(&mut self) {
        if let Some(reservation) = self.reservation.take() {
            self.registry.cancel(reservation);
        }
    }
}

/// Native destroy may block; keep it off the async worker.
async fn release_off_thread<B: NativeBackend>(handle: Arc<StreamHandle<B>>) {
    if let Err(err) = tokio::task::spawn_blocking(move || drop(handle)).await {
        tracing::warn!(error = %err, "stream destroy task failed");
    }
}

mod conflict;
mod diff;
mod error;
mod intervals;
mod mutations;
mod queries;
mod store;

pub use conflict::{OwnerSnapshot, TalkWarning, WarningKind, talk_warnings};
pub use diff::{ChangeAction, MovedTalk, ScheduleChanges, SpeakerChanges, diff_slots, speakers_concerned};
pub use error::EngineError;
pub use intervals::{
    clip, covered_duration, covers, intersect, intersection, merge_overlapping, subtract_intervals, union,
};
pub use store::{OwnerStore, ScheduleStore};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::{owner_channel, Notification, NotifyHub, SCHEDULE_CHANNEL};
use crate::wal::Wal;

pub type SharedOwnerState = Arc<RwLock<OwnerState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain all immediately available Appends (the batch window).
/// 3. Single flush_sync for the whole batch.
/// 4. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    tracing::debug!(path = %wal.path().display(), "WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!(path = %wal.path().display(), "WAL flush failed: {e}");
    }
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &mut [(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even on append error so partial bytes do not leak into the next batch.
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// One conference: rooms and speakers with their availabilities, plus the
/// schedule store. Every mutation is written to the WAL before it is applied.
///
/// Lock order: `schedule` before any owner lock.
pub struct Engine {
    pub owners: OwnerStore,
    pub(super) schedule: RwLock<ScheduleStore>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let owners = OwnerStore::new();
        let mut schedule = ScheduleStore::new();
        // Owners are rebuilt unlocked and only wrapped once replay is done.
        let mut replayed: HashMap<Ulid, OwnerState> = HashMap::new();

        for event in &events {
            match event {
                Event::OwnerCreated {
                    id,
                    kind,
                    name,
                    position,
                } => {
                    replayed.insert(*id, OwnerState::new(*id, *kind, name.clone(), *position));
                }
                Event::OwnerDeleted { id } => {
                    if let Some(os) = replayed.remove(id) {
                        for a in &os.availabilities {
                            owners.unmap_entity(&a.id);
                        }
                    }
                }
                Event::AvailabilityAdded { owner_id, .. }
                | Event::AvailabilityRemoved { owner_id, .. } => {
                    if let Some(os) = replayed.get_mut(owner_id) {
                        owners.apply_event(os, event);
                    }
                }
                other => schedule.apply_event(other),
            }
        }

        for (id, os) in replayed {
            owners.insert_owner(id, Arc::new(RwLock::new(os)));
        }

        tracing::debug!(
            path = %wal_path.display(),
            events = events.len(),
            owners = owners.owner_count(),
            releases = schedule.releases.len(),
            "engine replayed"
        );

        Ok(Self {
            owners,
            schedule: RwLock::new(schedule),
            wal_tx,
            notify,
        })
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_owner(&self, id: &Ulid) -> Option<SharedOwnerState> {
        self.owners.get_owner(id)
    }

    /// WAL-append + apply + notify for an availability event.
    pub(super) async fn persist_and_apply_owner(
        &self,
        os: &mut OwnerState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.owners.apply_event(os, event);
        self.notify.send(
            &owner_channel(os.kind, os.id),
            Notification::Changed {
                event: event.clone(),
            },
        );
        Ok(())
    }

    /// WAL-append + apply + notify for a schedule store event.
    pub(super) async fn persist_and_apply_schedule(
        &self,
        store: &mut ScheduleStore,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        store.apply_event(event);
        self.notify.send(
            SCHEDULE_CHANNEL,
            Notification::Changed {
                event: event.clone(),
            },
        );
        Ok(())
    }

    /// Lookup availability → owner, acquire the owner's write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<OwnerState>, EngineError> {
        let owner_id = self
            .owners
            .get_owner_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let os = self
            .get_owner(&owner_id)
            .ok_or(EngineError::NotFound(owner_id))?;
        Ok(os.write_owned().await)
    }
}

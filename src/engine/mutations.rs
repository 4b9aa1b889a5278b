use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::{owner_channel, Notification, SCHEDULE_CHANNEL};

use super::conflict::{now_ms, validate_slot_times, validate_span};
use super::{Engine, EngineError, ScheduleChanges, ScheduleStore, WalCommand};

fn check_name(name: &Option<String>) -> Result<(), EngineError> {
    if let Some(n) = name
        && n.len() > MAX_NAME_LEN
    {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

impl Engine {
    // ── Conference ───────────────────────────────────────────

    pub async fn configure_conference(
        &self,
        timezone: Option<String>,
        default_duration: Option<Ms>,
    ) -> Result<ConferenceConfig, EngineError> {
        if let Some(tz) = &timezone
            && tz.parse::<chrono_tz::Tz>().is_err()
        {
            return Err(EngineError::UnknownTimezone(tz.clone()));
        }
        if let Some(d) = default_duration
            && (d <= 0 || d > MAX_SPAN_DURATION_MS)
        {
            return Err(EngineError::Invalid("default_duration must be positive and at most 31 days"));
        }

        let mut store = self.schedule.write().await;
        let event = Event::ConferenceConfigured {
            timezone: timezone.unwrap_or_else(|| store.config.timezone.clone()),
            default_duration: default_duration.unwrap_or(store.config.default_duration),
        };
        self.persist_and_apply_schedule(&mut store, &event).await?;
        Ok(store.config.clone())
    }

    // ── Rooms & speakers ─────────────────────────────────────

    pub async fn create_owner(
        &self,
        id: Ulid,
        kind: OwnerKind,
        name: Option<String>,
        position: u32,
    ) -> Result<(), EngineError> {
        check_name(&name)?;
        // Held so compaction never snapshots between the WAL append and the insert.
        let _store = self.schedule.write().await;
        if self.owners.owner_count() >= MAX_OWNERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many rooms and speakers"));
        }
        if self.owners.contains_owner(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::OwnerCreated {
            id,
            kind,
            name: name.clone(),
            position,
        };
        self.wal_append(&event).await?;
        let os = OwnerState::new(id, kind, name, position);
        self.owners.insert_owner(id, Arc::new(RwLock::new(os)));
        self.notify.send(
            SCHEDULE_CHANNEL,
            Notification::Changed { event },
        );
        Ok(())
    }

    /// Delete a room or speaker. Rejected while a slot references the room
    /// or a submission lists the speaker.
    pub async fn delete_owner(&self, id: Ulid, kind: OwnerKind) -> Result<(), EngineError> {
        let store = self.schedule.write().await;
        let os = self.get_owner(&id).ok_or(EngineError::NotFound(id))?;
        let guard = os.write().await;
        if guard.kind != kind {
            return Err(EngineError::WrongOwnerKind { id, expected: kind });
        }
        let in_use = match kind {
            OwnerKind::Room => store.room_is_used(&id),
            OwnerKind::Speaker => store.speaker_is_used(&id),
        };
        if in_use {
            return Err(EngineError::InUse(id));
        }

        let event = Event::OwnerDeleted { id };
        self.wal_append(&event).await?;
        for a in &guard.availabilities {
            self.owners.unmap_entity(&a.id);
        }
        self.owners.remove_owner(&id);
        let channel = owner_channel(kind, id);
        self.notify.send(&channel, Notification::Changed { event });
        self.notify.remove(&channel);
        Ok(())
    }

    // ── Availabilities ───────────────────────────────────────

    pub async fn add_availability(&self, id: Ulid, owner_id: Ulid, span: Span) -> Result<(), EngineError> {
        validate_span(&span)?;
        let os = self
            .get_owner(&owner_id)
            .ok_or(EngineError::NotFound(owner_id))?;
        let mut guard = os.write().await;
        if guard.availabilities.len() >= MAX_AVAILABILITIES_PER_OWNER {
            return Err(EngineError::LimitExceeded("too many availabilities"));
        }
        if self.owners.contains_entity(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::AvailabilityAdded { id, owner_id, span };
        self.persist_and_apply_owner(&mut guard, &event).await
    }

    /// Add several availabilities at once, possibly for different owners.
    /// All-or-nothing: nothing is written unless every entry is valid.
    pub async fn batch_add_availabilities(&self, entries: Vec<(Ulid, Ulid, Span)>) -> Result<(), EngineError> {
        if entries.is_empty() {
            return Ok(());
        }
        if entries.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        for (_, _, span) in &entries {
            validate_span(span)?;
        }

        // Acquire write locks in sorted order to prevent deadlocks.
        let mut owner_ids: Vec<Ulid> = entries.iter().map(|(_, oid, _)| *oid).collect();
        owner_ids.sort();
        owner_ids.dedup();

        let mut guards = Vec::with_capacity(owner_ids.len());
        let mut index = HashMap::new();
        for oid in &owner_ids {
            let os = self.get_owner(oid).ok_or(EngineError::NotFound(*oid))?;
            let guard = os.write_owned().await;
            let adding = entries.iter().filter(|(_, o, _)| o == oid).count();
            if guard.availabilities.len() + adding > MAX_AVAILABILITIES_PER_OWNER {
                return Err(EngineError::LimitExceeded("too many availabilities"));
            }
            index.insert(*oid, guards.len());
            guards.push(guard);
        }

        let mut seen = std::collections::HashSet::new();
        for (id, _, _) in &entries {
            if self.owners.contains_entity(id) || !seen.insert(*id) {
                return Err(EngineError::AlreadyExists(*id));
            }
        }

        for (id, owner_id, span) in entries {
            let event = Event::AvailabilityAdded { id, owner_id, span };
            self.persist_and_apply_owner(&mut guards[index[&owner_id]], &event)
                .await?;
        }
        Ok(())
    }

    pub async fn remove_availability(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let mut guard = self.resolve_entity_write(&id).await?;
        let owner_id = guard.id;
        let event = Event::AvailabilityRemoved { id, owner_id };
        self.persist_and_apply_owner(&mut guard, &event).await?;
        Ok(owner_id)
    }

    // ── Submissions ──────────────────────────────────────────

    /// Insert or replace a submission.
    pub async fn save_submission(&self, submission: Submission) -> Result<(), EngineError> {
        if submission.title.len() > MAX_TITLE_LEN {
            return Err(EngineError::LimitExceeded("title too long"));
        }
        if submission.speakers.len() > MAX_SPEAKERS_PER_SUBMISSION {
            return Err(EngineError::LimitExceeded("too many speakers"));
        }
        if let Some(d) = submission.duration
            && (d <= 0 || d > MAX_SPAN_DURATION_MS)
        {
            return Err(EngineError::Invalid("duration must be positive and at most 31 days"));
        }

        let mut store = self.schedule.write().await;
        if !store.submissions.contains_key(&submission.id)
            && store.submissions.len() >= MAX_SUBMISSIONS_PER_TENANT
        {
            return Err(EngineError::LimitExceeded("too many submissions"));
        }
        for speaker in &submission.speakers {
            self.expect_kind(speaker, OwnerKind::Speaker).await?;
        }

        let event = Event::SubmissionSaved { submission };
        self.persist_and_apply_schedule(&mut store, &event).await
    }

    pub async fn set_submission_state(&self, id: Ulid, state: SubmissionState) -> Result<(), EngineError> {
        let mut store = self.schedule.write().await;
        if !store.submissions.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::SubmissionStateChanged { id, state };
        self.persist_and_apply_schedule(&mut store, &event).await
    }

    // ── WIP slots ────────────────────────────────────────────

    pub async fn place_slot(&self, slot: TalkSlot) -> Result<(), EngineError> {
        validate_slot_times(slot.start, slot.end)?;
        if slot.description.as_ref().is_some_and(|d| d.len() > MAX_TITLE_LEN) {
            return Err(EngineError::LimitExceeded("description too long"));
        }

        let mut store = self.schedule.write().await;
        if store.wip.slots.len() >= MAX_SLOTS_PER_SCHEDULE {
            return Err(EngineError::LimitExceeded("too many slots"));
        }
        let known = store.wip.slot(&slot.id).is_some()
            || store.releases.iter().any(|r| r.slot(&slot.id).is_some());
        if known {
            return Err(EngineError::AlreadyExists(slot.id));
        }
        if let Some(sub) = slot.submission_id
            && !store.submissions.contains_key(&sub)
        {
            return Err(EngineError::NotFound(sub));
        }
        if let Some(room) = slot.room_id {
            self.expect_kind(&room, OwnerKind::Room).await?;
        }

        let event = Event::SlotPlaced {
            slot: TalkSlot {
                is_visible: false,
                ..slot
            },
        };
        self.persist_and_apply_schedule(&mut store, &event).await
    }

    pub async fn move_slot(
        &self,
        id: Ulid,
        room_id: Option<Ulid>,
        start: Option<Ms>,
        end: Option<Ms>,
    ) -> Result<(), EngineError> {
        let patch = SlotPatch {
            room_id: Some(room_id),
            start: Some(start),
            end: Some(end),
        };
        self.update_slot(id, &patch).await
    }

    /// Change some of room, start and end of a WIP slot.
    pub async fn update_slot(&self, id: Ulid, patch: &SlotPatch) -> Result<(), EngineError> {
        let mut store = self.schedule.write().await;
        let Some(slot) = store.wip.slot(&id) else {
            return Err(Self::missing_slot(&store, id));
        };
        let (room_id, start, end) = patch.apply(slot);
        validate_slot_times(start, end)?;
        if let Some(room) = room_id {
            self.expect_kind(&room, OwnerKind::Room).await?;
        }
        let event = Event::SlotMoved {
            id,
            room_id,
            start,
            end,
        };
        self.persist_and_apply_schedule(&mut store, &event).await
    }

    pub async fn remove_slot(&self, id: Ulid) -> Result<(), EngineError> {
        let mut store = self.schedule.write().await;
        if store.wip.slot(&id).is_none() {
            return Err(Self::missing_slot(&store, id));
        }
        let event = Event::SlotRemoved { id };
        self.persist_and_apply_schedule(&mut store, &event).await
    }

    /// Slots only live on in releases once dropped from WIP; those are frozen.
    fn missing_slot(store: &ScheduleStore, id: Ulid) -> EngineError {
        if store.releases.iter().any(|r| r.slot(&id).is_some()) {
            EngineError::Immutable
        } else {
            EngineError::NotFound(id)
        }
    }

    async fn expect_kind(&self, id: &Ulid, expected: OwnerKind) -> Result<(), EngineError> {
        let os = self.get_owner(id).ok_or(EngineError::NotFound(*id))?;
        if os.read().await.kind != expected {
            return Err(EngineError::WrongOwnerKind { id: *id, expected });
        }
        Ok(())
    }

    // ── Versioning ───────────────────────────────────────────

    /// Freeze the WIP schedule as release `version` and start a new WIP
    /// schedule from it. Returns the changes against the previous release.
    pub async fn freeze(
        &self,
        version: &str,
        comment: Option<String>,
        notify_speakers: bool,
    ) -> Result<ScheduleChanges, EngineError> {
        if version.is_empty() {
            return Err(EngineError::EmptyVersion);
        }
        if version == "wip" || version == "latest" {
            return Err(EngineError::ReservedVersion(version.to_string()));
        }
        if version.len() > MAX_VERSION_LEN {
            return Err(EngineError::LimitExceeded("version name too long"));
        }
        if comment.as_ref().is_some_and(|c| c.len() > MAX_COMMENT_LEN) {
            return Err(EngineError::LimitExceeded("comment too long"));
        }

        let mut store = self.schedule.write().await;
        if store.release(version).is_some() {
            return Err(EngineError::DuplicateVersion(version.to_string()));
        }
        if store.releases.len() >= MAX_RELEASES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many releases"));
        }

        let published = now_ms();
        let event = Event::ScheduleFrozen {
            version: version.to_string(),
            comment,
            published,
        };
        self.persist_and_apply_schedule(&mut store, &event).await?;

        let Some(release) = store.latest().cloned() else {
            return Err(EngineError::VersionNotFound(version.to_string()));
        };
        let changes = Self::changes_for(&store, &release);

        metrics::counter!(crate::observability::SCHEDULES_RELEASED_TOTAL).increment(1);
        tracing::info!(
            version,
            slots = release.slots.len(),
            changes = changes.count(),
            notify_speakers,
            "schedule released"
        );

        self.notify.send(
            SCHEDULE_CHANNEL,
            Notification::ScheduleReleased {
                version: version.to_string(),
                published,
                action: changes.action,
                changes: changes.count(),
            },
        );
        if notify_speakers {
            for (speaker_id, notification) in self.speaker_notifications(&store, &release).await {
                self.notify
                    .send(&owner_channel(OwnerKind::Speaker, speaker_id), notification);
            }
        }
        Ok(changes)
    }

    /// Reset the WIP schedule to a release. Talks scheduled since then stay.
    /// Returns the number of slots in the new WIP schedule.
    pub async fn unfreeze(&self, version: &VersionRef) -> Result<usize, EngineError> {
        if *version == VersionRef::Wip {
            return Err(EngineError::Invalid("cannot reset the WIP schedule to itself"));
        }
        let mut store = self.schedule.write().await;
        let name = store
            .resolve(version)
            .and_then(|s| s.version.clone())
            .ok_or_else(|| EngineError::VersionNotFound(version.to_string()))?;

        let event = Event::ScheduleUnfrozen { version: name.clone() };
        self.persist_and_apply_schedule(&mut store, &event).await?;
        tracing::info!(version = %name, slots = store.wip.slots.len(), "WIP schedule reset");
        Ok(store.wip.slots.len())
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let store = self.schedule.read().await;
        let mut events = vec![Event::ConferenceConfigured {
            timezone: store.config.timezone.clone(),
            default_duration: store.config.default_duration,
        }];

        let mut owner_ids = self.owners.owner_ids();
        owner_ids.sort();
        // Read guards stay alive until the compacted file is in place.
        let mut guards = Vec::with_capacity(owner_ids.len());
        for id in owner_ids {
            if let Some(os) = self.get_owner(&id) {
                guards.push(os.read_owned().await);
            }
        }
        for guard in &guards {
            events.push(Event::OwnerCreated {
                id: guard.id,
                kind: guard.kind,
                name: guard.name.clone(),
                position: guard.position,
            });
            for a in &guard.availabilities {
                events.push(Event::AvailabilityAdded {
                    id: a.id,
                    owner_id: a.owner_id,
                    span: a.span,
                });
            }
        }

        let mut submissions: Vec<&Submission> = store.submissions.values().collect();
        submissions.sort_by_key(|s| s.id);
        events.extend(submissions.into_iter().map(|s| Event::SubmissionSaved {
            submission: s.clone(),
        }));
        events.extend(store.releases.iter().map(|s| Event::ScheduleRestored {
            schedule: s.clone(),
        }));
        events.push(Event::ScheduleRestored {
            schedule: store.wip.clone(),
        });

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::debug!(events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

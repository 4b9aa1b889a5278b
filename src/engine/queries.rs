use std::collections::{BTreeMap, HashMap};

use ulid::Ulid;

use crate::ascii::{self, RoomColumn, TimetableEntry, TimetableFormat};
use crate::limits::*;
use crate::model::*;
use crate::notify::{NotifiedMove, NotifiedTalk, Notification};

use super::conflict::{talk_warnings, OwnerSnapshot, TalkWarning};
use super::diff::{diff_slots, speakers_concerned, ScheduleChanges, SpeakerChanges};
use super::intervals::{clip, intersection, subtract_intervals, union};
use super::{Engine, EngineError, ScheduleStore};

fn query_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let window = Span::try_new(start, end).ok_or(EngineError::InvalidSpan { start, end })?;
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if window.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(window)
}

fn at_least(mut spans: Vec<Span>, min_duration_ms: Option<Ms>) -> Vec<Span> {
    if let Some(min) = min_duration_ms {
        spans.retain(|s| s.duration_ms() >= min);
    }
    spans
}

impl Engine {
    // ── Availability ─────────────────────────────────────────

    /// Merged availability of one room or speaker inside the window.
    pub async fn compute_availability(
        &self,
        owner_id: Ulid,
        query_start: Ms,
        query_end: Ms,
        min_duration_ms: Option<Ms>,
    ) -> Result<Vec<Span>, EngineError> {
        let window = query_window(query_start, query_end)?;
        let os = self
            .get_owner(&owner_id)
            .ok_or(EngineError::NotFound(owner_id))?;
        let guard = os.read().await;
        let spans: Vec<Span> = guard.overlapping(&window).map(|a| a.span).collect();
        Ok(at_least(clip(&union(&spans), &window), min_duration_ms))
    }

    /// Windows in which every listed owner is available.
    pub async fn compute_common_availability(
        &self,
        owner_ids: &[Ulid],
        query_start: Ms,
        query_end: Ms,
        min_duration_ms: Option<Ms>,
    ) -> Result<Vec<Span>, EngineError> {
        let window = query_window(query_start, query_end)?;
        if owner_ids.len() > MAX_IN_CLAUSE_IDS {
            return Err(EngineError::LimitExceeded("too many owner IDs"));
        }
        let mut sets = Vec::with_capacity(owner_ids.len());
        for id in owner_ids {
            let os = self.get_owner(id).ok_or(EngineError::NotFound(*id))?;
            let guard = os.read().await;
            sets.push(guard.overlapping(&window).map(|a| a.span).collect::<Vec<_>>());
        }
        Ok(at_least(clip(&intersection(&sets), &window), min_duration_ms))
    }

    /// A room's availability minus the WIP slots placed in it. A room without
    /// any availability counts as open for the whole window.
    pub async fn compute_free_time(
        &self,
        room_id: Ulid,
        query_start: Ms,
        query_end: Ms,
        min_duration_ms: Option<Ms>,
    ) -> Result<Vec<Span>, EngineError> {
        let window = query_window(query_start, query_end)?;
        let store = self.schedule.read().await;
        let os = self.get_owner(&room_id).ok_or(EngineError::NotFound(room_id))?;
        let guard = os.read().await;
        if guard.kind != OwnerKind::Room {
            return Err(EngineError::WrongOwnerKind {
                id: room_id,
                expected: OwnerKind::Room,
            });
        }

        let open = if guard.availabilities.is_empty() {
            vec![window]
        } else {
            let spans: Vec<Span> = guard.overlapping(&window).map(|a| a.span).collect();
            clip(&union(&spans), &window)
        };
        let busy: Vec<Span> = store
            .wip
            .slots
            .iter()
            .filter(|s| s.room_id == Some(room_id))
            .filter_map(|s| store.slot_span(s))
            .collect();
        Ok(at_least(subtract_intervals(&open, &union(&busy)), min_duration_ms))
    }

    pub async fn get_availabilities(&self, owner_id: Ulid) -> Result<Vec<Availability>, EngineError> {
        let os = self
            .get_owner(&owner_id)
            .ok_or(EngineError::NotFound(owner_id))?;
        let guard = os.read().await;
        Ok(guard.availabilities.clone())
    }

    // ── Listings ─────────────────────────────────────────────

    /// Rooms or speakers (or both), in timetable order.
    pub async fn list_owners(&self, kind: Option<OwnerKind>) -> Vec<OwnerInfo> {
        let mut owners = Vec::new();
        for id in self.owners.owner_ids() {
            let Some(os) = self.get_owner(&id) else {
                continue;
            };
            let guard = os.read().await;
            if kind.is_some_and(|k| k != guard.kind) {
                continue;
            }
            owners.push(OwnerInfo {
                id: guard.id,
                kind: guard.kind,
                name: guard.name.clone(),
                position: guard.position,
                availability_count: guard.availabilities.len(),
            });
        }
        owners.sort_by(|a, b| (a.position, &a.name, a.id).cmp(&(b.position, &b.name, b.id)));
        owners
    }

    pub async fn list_submissions(&self) -> Vec<Submission> {
        let store = self.schedule.read().await;
        let mut submissions: Vec<Submission> = store.submissions.values().cloned().collect();
        submissions.sort_by_key(|s| s.id);
        submissions
    }

    /// The WIP schedule first, then releases newest first.
    pub async fn list_schedules(&self) -> Vec<ScheduleInfo> {
        let store = self.schedule.read().await;
        std::iter::once(&store.wip)
            .chain(store.releases.iter().rev())
            .map(|s| ScheduleInfo {
                version: s.version.clone(),
                published: s.published,
                comment: s.comment.clone(),
                slot_count: s.slots.len(),
            })
            .collect()
    }

    pub async fn conference_config(&self) -> ConferenceConfig {
        self.schedule.read().await.config.clone()
    }

    /// All slots of a schedule, unscheduled ones last.
    pub async fn get_slots(&self, version: &VersionRef) -> Result<Vec<TalkSlot>, EngineError> {
        let store = self.schedule.read().await;
        let schedule = Self::resolve(&store, version)?;
        let mut slots = schedule.slots.clone();
        slots.sort_by_key(|s| (s.start.is_none(), s.start, s.room_id, s.id));
        Ok(slots)
    }

    fn resolve<'a>(store: &'a ScheduleStore, version: &VersionRef) -> Result<&'a Schedule, EngineError> {
        store
            .resolve(version)
            .ok_or_else(|| EngineError::VersionNotFound(version.to_string()))
    }

    // ── Changes ──────────────────────────────────────────────

    /// Changes of `schedule` against the release before it.
    pub(super) fn changes_for(store: &ScheduleStore, schedule: &Schedule) -> ScheduleChanges {
        match store.previous_release(schedule) {
            None => ScheduleChanges::created(),
            Some(previous) => diff_slots(
                &store.scheduled_talks(previous),
                &store.scheduled_talks(schedule),
            ),
        }
    }

    /// Changes of `version` against `base`, or against its previous release.
    pub async fn schedule_changes(
        &self,
        version: &VersionRef,
        base: Option<&VersionRef>,
    ) -> Result<ScheduleChanges, EngineError> {
        let store = self.schedule.read().await;
        let schedule = Self::resolve(&store, version)?;
        match base {
            None => Ok(Self::changes_for(&store, schedule)),
            Some(base) => {
                let base = Self::resolve(&store, base)?;
                Ok(diff_slots(
                    &store.scheduled_talks(base),
                    &store.scheduled_talks(schedule),
                ))
            }
        }
    }

    pub async fn speakers_concerned(
        &self,
        version: &VersionRef,
    ) -> Result<BTreeMap<Ulid, SpeakerChanges>, EngineError> {
        let store = self.schedule.read().await;
        let schedule = Self::resolve(&store, version)?;
        let changes = Self::changes_for(&store, schedule);
        Ok(speakers_concerned(
            &changes,
            &store.scheduled_talks(schedule),
            |id| store.speakers_of(id),
        ))
    }

    /// The notification each concerned speaker gets for `version`.
    pub async fn notifications(&self, version: &VersionRef) -> Result<Vec<(Ulid, Notification)>, EngineError> {
        let store = self.schedule.read().await;
        let schedule = Self::resolve(&store, version)?;
        Ok(self.speaker_notifications(&store, schedule).await)
    }

    pub(super) async fn speaker_notifications(
        &self,
        store: &ScheduleStore,
        schedule: &Schedule,
    ) -> Vec<(Ulid, Notification)> {
        let changes = Self::changes_for(store, schedule);
        let concerned = speakers_concerned(&changes, &store.scheduled_talks(schedule), |id| {
            store.speakers_of(id)
        });
        if concerned.is_empty() {
            return Vec::new();
        }

        let owners = self.owner_snapshots().await;
        let tz = store.timezone();
        let title = |slot: &TalkSlot| {
            slot.submission_id
                .and_then(|id| store.submissions.get(&id))
                .map(|s| s.title.clone())
                .unwrap_or_default()
        };
        let room = |slot: &TalkSlot| {
            slot.room_id
                .and_then(|id| owners.get(&id))
                .map(|o| o.name.clone())
                .unwrap_or_default()
        };
        let start = |slot: &TalkSlot| {
            slot.start
                .map(|t| ascii::format_local(t, &tz))
                .unwrap_or_default()
        };

        concerned
            .into_iter()
            .map(|(speaker_id, entry)| {
                let create = entry
                    .create
                    .iter()
                    .filter_map(|slot| {
                        Some(NotifiedTalk {
                            submission_id: slot.submission_id?,
                            title: title(slot),
                            room: room(slot),
                            start: start(slot),
                        })
                    })
                    .collect();
                let update = entry
                    .update
                    .iter()
                    .map(|m| NotifiedMove {
                        submission_id: m.submission_id,
                        title: title(&m.new),
                        old_room: room(&m.old),
                        new_room: room(&m.new),
                        old_start: start(&m.old),
                        new_start: start(&m.new),
                    })
                    .collect();
                let notification = Notification::SpeakerSchedule {
                    speaker_id,
                    version: schedule.label().to_string(),
                    create,
                    update,
                };
                (speaker_id, notification)
            })
            .collect()
    }

    // ── Warnings & timetable ─────────────────────────────────

    async fn owner_snapshots(&self) -> HashMap<Ulid, OwnerSnapshot> {
        let mut owners = HashMap::new();
        for id in self.owners.owner_ids() {
            let Some(os) = self.get_owner(&id) else {
                continue;
            };
            let guard = os.read().await;
            owners.insert(
                id,
                OwnerSnapshot {
                    kind: guard.kind,
                    position: guard.position,
                    name: guard.display_name(),
                    spans: guard.spans(),
                },
            );
        }
        owners
    }

    pub async fn warnings(&self, version: &VersionRef) -> Result<Vec<TalkWarning>, EngineError> {
        let store = self.schedule.read().await;
        let schedule = Self::resolve(&store, version)?;
        let owners = self.owner_snapshots().await;
        Ok(talk_warnings(&store, schedule, &owners))
    }

    /// Render a schedule as plain text, one line per row.
    pub async fn timetable(
        &self,
        version: &VersionRef,
        format: TimetableFormat,
        column_width: usize,
    ) -> Result<Vec<String>, EngineError> {
        if column_width > MAX_COLUMN_WIDTH {
            return Err(EngineError::LimitExceeded("timetable column too wide"));
        }
        let store = self.schedule.read().await;
        let schedule = Self::resolve(&store, version)?;
        let owners = self.owner_snapshots().await;

        let mut by_room: HashMap<Ulid, Vec<TimetableEntry>> = HashMap::new();
        for slot in store.rendered_slots(schedule) {
            let (Some(room_id), Some(span)) = (slot.room_id, store.slot_span(&slot)) else {
                continue;
            };
            let submission = slot.submission_id.and_then(|id| store.submissions.get(&id));
            let title = match (submission, &slot.description) {
                (Some(s), _) => s.title.clone(),
                (None, Some(description)) => description.clone(),
                (None, None) => "Break".to_string(),
            };
            let speakers: Vec<String> = submission
                .map(|s| {
                    s.speakers
                        .iter()
                        .map(|id| {
                            owners
                                .get(id)
                                .map(|o| o.name.clone())
                                .unwrap_or_else(|| id.to_string())
                        })
                        .collect()
                })
                .unwrap_or_default();
            by_room.entry(room_id).or_default().push(TimetableEntry {
                start: span.start,
                end: span.end,
                title,
                speakers,
                is_break: slot.is_break(),
            });
        }

        let mut rooms: Vec<(u32, String, Ulid)> = by_room
            .keys()
            .map(|id| match owners.get(id) {
                Some(o) => (o.position, o.name.clone(), *id),
                None => (u32::MAX, id.to_string(), *id),
            })
            .collect();
        rooms.sort();
        let columns: Vec<RoomColumn> = rooms
            .into_iter()
            .map(|(_, name, id)| RoomColumn {
                name,
                entries: by_room.remove(&id).unwrap_or_default(),
            })
            .collect();

        Ok(ascii::render(&columns, &store.timezone(), format, column_width))
    }
}

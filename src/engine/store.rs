use std::collections::{HashMap, HashSet};

use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

use super::SharedOwnerState;

// ── Owners ───────────────────────────────────────────────────────

/// Rooms and speakers, each behind its own lock, plus the index from
/// availability id to owner.
pub struct OwnerStore {
    owners: DashMap<Ulid, SharedOwnerState>,
    entity_to_owner: DashMap<Ulid, Ulid>,
}

impl Default for OwnerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OwnerStore {
    pub fn new() -> Self {
        Self {
            owners: DashMap::new(),
            entity_to_owner: DashMap::new(),
        }
    }

    pub fn owner_count(&self) -> usize {
        self.owners.len()
    }

    pub fn contains_owner(&self, id: &Ulid) -> bool {
        self.owners.contains_key(id)
    }

    pub fn get_owner(&self, id: &Ulid) -> Option<SharedOwnerState> {
        self.owners.get(id).map(|e| e.value().clone())
    }

    pub fn insert_owner(&self, id: Ulid, state: SharedOwnerState) {
        self.owners.insert(id, state);
    }

    pub fn remove_owner(&self, id: &Ulid) -> Option<(Ulid, SharedOwnerState)> {
        self.owners.remove(id)
    }

    pub fn owner_ids(&self) -> Vec<Ulid> {
        self.owners.iter().map(|e| *e.key()).collect()
    }

    pub fn get_owner_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_owner.get(entity_id).map(|e| *e.value())
    }

    pub fn contains_entity(&self, entity_id: &Ulid) -> bool {
        self.entity_to_owner.contains_key(entity_id)
    }

    pub fn map_entity(&self, entity_id: Ulid, owner_id: Ulid) {
        self.entity_to_owner.insert(entity_id, owner_id);
    }

    pub fn unmap_entity(&self, entity_id: &Ulid) {
        self.entity_to_owner.remove(entity_id);
    }

    pub fn apply_event(&self, os: &mut OwnerState, event: &Event) {
        match event {
            Event::AvailabilityAdded { id, owner_id, span } => {
                os.insert_availability(Availability {
                    id: *id,
                    owner_id: *owner_id,
                    span: *span,
                });
                self.map_entity(*id, *owner_id);
            }
            Event::AvailabilityRemoved { id, .. } => {
                os.remove_availability(*id);
                self.unmap_entity(id);
            }
            _ => {}
        }
    }
}

// ── Schedules ────────────────────────────────────────────────────

/// Conference settings, submissions, the WIP schedule and every release.
#[derive(Debug, Clone, Default)]
pub struct ScheduleStore {
    pub config: ConferenceConfig,
    pub submissions: HashMap<Ulid, Submission>,
    pub wip: Schedule,
    /// Publication order, oldest first.
    pub releases: Vec<Schedule>,
}

impl ScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configured timezone; UTC if the stored name no longer parses.
    pub fn timezone(&self) -> chrono_tz::Tz {
        self.config.timezone.parse().unwrap_or(chrono_tz::Tz::UTC)
    }

    pub fn latest(&self) -> Option<&Schedule> {
        self.releases.last()
    }

    pub fn release(&self, version: &str) -> Option<&Schedule> {
        self.releases
            .iter()
            .find(|s| s.version.as_deref() == Some(version))
    }

    pub fn resolve(&self, version: &VersionRef) -> Option<&Schedule> {
        match version {
            VersionRef::Wip => Some(&self.wip),
            VersionRef::Latest => self.latest(),
            VersionRef::Named(name) => self.release(name),
        }
    }

    /// The release published right before `schedule`; for WIP the latest one.
    pub fn previous_release(&self, schedule: &Schedule) -> Option<&Schedule> {
        let Some(version) = schedule.version.as_deref() else {
            return self.latest();
        };
        let pos = self
            .releases
            .iter()
            .position(|s| s.version.as_deref() == Some(version))?;
        pos.checked_sub(1).map(|i| &self.releases[i])
    }

    pub fn submission_state(&self, id: &Ulid) -> Option<SubmissionState> {
        self.submissions.get(id).map(|s| s.state)
    }

    /// Visibility a slot gets when its schedule is frozen.
    pub fn visible_when_frozen(&self, slot: &TalkSlot) -> bool {
        if slot.start.is_none() {
            return false;
        }
        match slot.submission_id {
            None => true,
            Some(id) => self.submission_state(&id) == Some(SubmissionState::Confirmed),
        }
    }

    /// Released schedules keep the visibility fixed at freeze time; the WIP
    /// schedule is judged as if it were frozen now.
    pub fn is_visible(&self, schedule: &Schedule, slot: &TalkSlot) -> bool {
        if schedule.is_released() {
            slot.is_visible
        } else {
            self.visible_when_frozen(slot)
        }
    }

    fn is_deleted(&self, submission_id: &Ulid) -> bool {
        self.submission_state(submission_id) == Some(SubmissionState::Deleted)
    }

    /// Visible, scheduled slots of real talks. These are what diffs compare.
    pub fn scheduled_talks(&self, schedule: &Schedule) -> Vec<TalkSlot> {
        schedule
            .slots
            .iter()
            .filter(|slot| {
                slot.is_scheduled()
                    && slot
                        .submission_id
                        .is_some_and(|id| !self.is_deleted(&id))
                    && self.is_visible(schedule, slot)
            })
            .cloned()
            .collect()
    }

    /// Visible, scheduled slots including breaks, as they appear on a timetable.
    pub fn rendered_slots(&self, schedule: &Schedule) -> Vec<TalkSlot> {
        schedule
            .slots
            .iter()
            .filter(|slot| {
                slot.is_scheduled()
                    && !slot.submission_id.is_some_and(|id| self.is_deleted(&id))
                    && self.is_visible(schedule, slot)
            })
            .cloned()
            .collect()
    }

    /// Effective time span of a slot. An unset end falls back to the
    /// submission's duration, then to the conference default.
    pub fn slot_span(&self, slot: &TalkSlot) -> Option<Span> {
        let start = slot.start?;
        let end = match slot.end {
            Some(end) => end,
            None => {
                let duration = slot
                    .submission_id
                    .and_then(|id| self.submissions.get(&id))
                    .and_then(|s| s.duration)
                    .unwrap_or(self.config.default_duration);
                start + duration
            }
        };
        Span::try_new(start, end)
    }

    pub fn speakers_of(&self, submission_id: &Ulid) -> Vec<Ulid> {
        self.submissions
            .get(submission_id)
            .map(|s| s.speakers.clone())
            .unwrap_or_default()
    }

    pub fn room_is_used(&self, room_id: &Ulid) -> bool {
        std::iter::once(&self.wip)
            .chain(self.releases.iter())
            .flat_map(|s| s.slots.iter())
            .any(|slot| slot.room_id == Some(*room_id))
    }

    pub fn speaker_is_used(&self, speaker_id: &Ulid) -> bool {
        self.submissions
            .values()
            .any(|s| s.speakers.contains(speaker_id))
    }

    /// WIP slots with the visibility they get in a release.
    pub fn frozen_slots(&self) -> Vec<TalkSlot> {
        self.wip
            .slots
            .iter()
            .map(|slot| TalkSlot {
                is_visible: self.visible_when_frozen(slot),
                ..slot.clone()
            })
            .collect()
    }

    /// Slots of the WIP schedule that replaces the current one when
    /// resetting to `release`: all of the release's slots, plus current WIP
    /// slots whose submission the release does not contain. Breaks carried
    /// over are deduplicated by slot id.
    pub fn unfrozen_slots(&self, release: &Schedule) -> Vec<TalkSlot> {
        let in_release = release.submission_ids();
        let slot_ids: HashSet<Ulid> = release.slots.iter().map(|s| s.id).collect();

        let mut slots = release.slots.clone();
        slots.extend(
            self.wip
                .slots
                .iter()
                .filter(|slot| !slot_ids.contains(&slot.id))
                .filter(|slot| match slot.submission_id {
                    Some(id) => !in_release.contains(&id),
                    None => true,
                })
                .cloned(),
        );
        slots
    }

    // ── Event application ────────────────────────────────────

    pub fn apply_event(&mut self, event: &Event) {
        match event {
            Event::ConferenceConfigured {
                timezone,
                default_duration,
            } => {
                self.config = ConferenceConfig {
                    timezone: timezone.clone(),
                    default_duration: *default_duration,
                };
            }
            Event::SubmissionSaved { submission } => {
                self.submissions.insert(submission.id, submission.clone());
            }
            Event::SubmissionStateChanged { id, state } => {
                if let Some(submission) = self.submissions.get_mut(id) {
                    submission.state = *state;
                }
            }
            Event::SlotPlaced { slot } => match self.wip.slot_mut(&slot.id) {
                Some(existing) => *existing = slot.clone(),
                None => self.wip.slots.push(slot.clone()),
            },
            Event::SlotMoved {
                id,
                room_id,
                start,
                end,
            } => {
                if let Some(slot) = self.wip.slot_mut(id) {
                    slot.room_id = *room_id;
                    slot.start = *start;
                    slot.end = *end;
                }
            }
            Event::SlotRemoved { id } => {
                self.wip.slots.retain(|s| s.id != *id);
            }
            Event::ScheduleFrozen {
                version,
                comment,
                published,
            } => {
                let slots = self.frozen_slots();
                self.releases.push(Schedule {
                    version: Some(version.clone()),
                    published: Some(*published),
                    comment: comment.clone(),
                    slots: slots.clone(),
                });
                self.wip = Schedule::wip(slots);
            }
            Event::ScheduleUnfrozen { version } => {
                if let Some(release) = self.release(version) {
                    let slots = self.unfrozen_slots(release);
                    self.wip = Schedule::wip(slots);
                }
            }
            Event::ScheduleRestored { schedule } => {
                if schedule.is_released() {
                    self.releases.push(schedule.clone());
                } else {
                    self.wip = schedule.clone();
                }
            }
            Event::OwnerCreated { .. }
            | Event::OwnerDeleted { .. }
            | Event::AvailabilityAdded { .. }
            | Event::AvailabilityRemoved { .. } => {}
        }
    }
}

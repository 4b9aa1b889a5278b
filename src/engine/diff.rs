use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use ulid::Ulid;

use crate::model::*;

// ── Schedule diff ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    /// No earlier release to compare against.
    Create,
    Update,
}

/// A submission whose placement changed between two schedules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MovedTalk {
    pub submission_id: Ulid,
    pub old: TalkSlot,
    pub new: TalkSlot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleChanges {
    pub action: ChangeAction,
    pub new_talks: Vec<TalkSlot>,
    pub canceled_talks: Vec<TalkSlot>,
    pub moved_talks: Vec<MovedTalk>,
}

impl ScheduleChanges {
    pub fn created() -> Self {
        Self {
            action: ChangeAction::Create,
            new_talks: Vec::new(),
            canceled_talks: Vec::new(),
            moved_talks: Vec::new(),
        }
    }

    pub fn count(&self) -> usize {
        self.new_talks.len() + self.canceled_talks.len() + self.moved_talks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

type SlotKey = (Ulid, Option<Ulid>, Option<Ms>);

fn slot_key(slot: &TalkSlot) -> Option<SlotKey> {
    slot.submission_id.map(|sub| (sub, slot.room_id, slot.start))
}

fn by_start(a: &TalkSlot, b: &TalkSlot) -> std::cmp::Ordering {
    (a.start, a.room_id, a.submission_id, a.id).cmp(&(b.start, b.room_id, b.submission_id, b.id))
}

/// Compare two sets of scheduled talks.
///
/// Slots are keyed by `(submission, room, start)`. A submission only in `new`
/// is new, only in `old` is canceled; a submission on both sides whose keys
/// differ is paired up slot by slot (see [`pair_submission_slots`]).
/// Breaks (slots without a submission) are ignored.
pub fn diff_slots(old: &[TalkSlot], new: &[TalkSlot]) -> ScheduleChanges {
    let mut old_slots: BTreeMap<SlotKey, &TalkSlot> = BTreeMap::new();
    for slot in old {
        if let Some(key) = slot_key(slot) {
            old_slots.entry(key).or_insert(slot);
        }
    }
    let mut new_slots: BTreeMap<SlotKey, &TalkSlot> = BTreeMap::new();
    for slot in new {
        if let Some(key) = slot_key(slot) {
            new_slots.entry(key).or_insert(slot);
        }
    }

    let mut old_by_submission: BTreeMap<Ulid, Vec<&TalkSlot>> = BTreeMap::new();
    for (key, slot) in &old_slots {
        old_by_submission.entry(key.0).or_default().push(slot);
    }
    let mut new_by_submission: BTreeMap<Ulid, Vec<&TalkSlot>> = BTreeMap::new();
    for (key, slot) in &new_slots {
        new_by_submission.entry(key.0).or_default().push(slot);
    }

    // Submissions with at least one slot present on only one side.
    let touched: BTreeSet<Ulid> = old_slots
        .keys()
        .filter(|k| !new_slots.contains_key(k))
        .chain(new_slots.keys().filter(|k| !old_slots.contains_key(k)))
        .map(|k| k.0)
        .collect();

    let mut changes = ScheduleChanges {
        action: ChangeAction::Update,
        new_talks: Vec::new(),
        canceled_talks: Vec::new(),
        moved_talks: Vec::new(),
    };

    for submission in touched {
        match (old_by_submission.get(&submission), new_by_submission.get(&submission)) {
            (Some(old_all), None) => {
                changes.canceled_talks.extend(old_all.iter().map(|s| (*s).clone()));
            }
            (None, Some(new_all)) => {
                changes.new_talks.extend(new_all.iter().map(|s| (*s).clone()));
            }
            (Some(old_all), Some(new_all)) => {
                pair_submission_slots(submission, old_all, new_all, &mut changes);
            }
            (None, None) => {}
        }
    }

    changes.new_talks.sort_by(by_start);
    changes.canceled_talks.sort_by(by_start);
    changes.moved_talks.sort_by(|a, b| by_start(&a.new, &b.new));
    changes
}

/// Pair up the slots of one submission that appears on both sides.
///
/// Slots with an identical counterpart (same room and start) are unchanged.
/// Of the rest, surplus old slots are canceled, surplus new slots are new and
/// the remaining ones are matched in start order as moves.
fn pair_submission_slots(
    submission_id: Ulid,
    old_all: &[&TalkSlot],
    new_all: &[&TalkSlot],
    changes: &mut ScheduleChanges,
) {
    let mut old_only: Vec<&TalkSlot> = old_all
        .iter()
        .copied()
        .filter(|slot| !new_all.iter().any(|other| slot.is_same_slot(other)))
        .collect();
    let mut new_only: Vec<&TalkSlot> = new_all
        .iter()
        .copied()
        .filter(|slot| !old_all.iter().any(|other| slot.is_same_slot(other)))
        .collect();
    old_only.sort_by(|a, b| by_start(a, b));
    new_only.sort_by(|a, b| by_start(a, b));

    if old_only.len() > new_only.len() {
        let surplus = old_only.len() - new_only.len();
        changes
            .canceled_talks
            .extend(old_only.drain(..surplus).map(|s| s.clone()));
    } else if new_only.len() > old_only.len() {
        let surplus = new_only.len() - old_only.len();
        changes
            .new_talks
            .extend(new_only.drain(..surplus).map(|s| s.clone()));
    }

    for (old, new) in old_only.into_iter().zip(new_only) {
        changes.moved_talks.push(MovedTalk {
            submission_id,
            old: old.clone(),
            new: new.clone(),
        });
    }
}

// ── Speakers concerned ───────────────────────────────────────────

/// What one speaker should be told about a release.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SpeakerChanges {
    pub create: Vec<TalkSlot>,
    pub update: Vec<MovedTalk>,
}

/// Group the changes of a release by speaker.
///
/// A first release tells every speaker about all their scheduled slots in
/// `schedule_slots`. A release that only cancels talks concerns nobody.
/// Otherwise speakers of new talks get `create` entries and speakers of moved
/// talks get `update` entries.
pub fn speakers_concerned<F>(
    changes: &ScheduleChanges,
    schedule_slots: &[TalkSlot],
    speakers_of: F,
) -> BTreeMap<Ulid, SpeakerChanges>
where
    F: Fn(&Ulid) -> Vec<Ulid>,
{
    let mut result: BTreeMap<Ulid, SpeakerChanges> = BTreeMap::new();

    if changes.action == ChangeAction::Create {
        let mut slots: Vec<&TalkSlot> = schedule_slots
            .iter()
            .filter(|s| s.is_scheduled() && !s.is_break())
            .collect();
        slots.sort_by(|a, b| by_start(a, b));
        for slot in slots {
            let Some(submission_id) = slot.submission_id else {
                continue;
            };
            for speaker in speakers_of(&submission_id) {
                result.entry(speaker).or_default().create.push(slot.clone());
            }
        }
        return result;
    }

    if changes.count() == changes.canceled_talks.len() {
        return result;
    }

    for talk in &changes.new_talks {
        let Some(submission_id) = talk.submission_id else {
            continue;
        };
        for speaker in speakers_of(&submission_id) {
            result.entry(speaker).or_default().create.push(talk.clone());
        }
    }
    for moved in &changes.moved_talks {
        for speaker in speakers_of(&moved.submission_id) {
            result.entry(speaker).or_default().update.push(moved.clone());
        }
    }
    result
}

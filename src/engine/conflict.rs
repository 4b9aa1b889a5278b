use std::collections::HashMap;

use serde::Serialize;
use ulid::Ulid;

use crate::limits::{MAX_SPAN_DURATION_MS, MAX_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS};
use crate::model::*;

use super::intervals::covers;
use super::{EngineError, ScheduleStore};

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// Check optional slot times: an end needs a start, and both together must
/// form a valid span.
pub(crate) fn validate_slot_times(start: Option<Ms>, end: Option<Ms>) -> Result<(), EngineError> {
    match (start, end) {
        (None, Some(_)) => Err(EngineError::Invalid("a slot end needs a start")),
        (Some(start), Some(end)) => {
            let span = Span::try_new(start, end).ok_or(EngineError::InvalidSpan { start, end })?;
            validate_span(&span)
        }
        (Some(start), None) => {
            if !(MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&start) {
                return Err(EngineError::LimitExceeded("timestamp out of range"));
            }
            Ok(())
        }
        (None, None) => Ok(()),
    }
}

// ── Talk warnings ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// Room has availabilities, none covering the slot.
    Room,
    /// Another slot in the same room overlaps.
    RoomOverlap,
    /// A speaker has availabilities, none covering the slot.
    Speaker,
    /// A speaker has another slot at the same time.
    SpeakerOverlap,
    /// The slot has no start time.
    Unscheduled,
    /// The submission is not confirmed, so the slot stays hidden on release.
    Unconfirmed,
}

impl WarningKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WarningKind::Room => "room",
            WarningKind::RoomOverlap => "room_overlap",
            WarningKind::Speaker => "speaker",
            WarningKind::SpeakerOverlap => "speaker_overlap",
            WarningKind::Unscheduled => "unscheduled",
            WarningKind::Unconfirmed => "unconfirmed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TalkWarning {
    pub slot_id: Ulid,
    pub submission_id: Option<Ulid>,
    pub kind: WarningKind,
    /// The room or speaker the warning is about.
    pub owner_id: Option<Ulid>,
    pub message: String,
}

/// Snapshot of one owner taken before the warnings are computed.
#[derive(Debug, Clone)]
pub struct OwnerSnapshot {
    pub kind: OwnerKind,
    pub position: u32,
    pub name: String,
    pub spans: Vec<Span>,
}

/// All warnings for the talks in `schedule`, in slot order.
pub fn talk_warnings(
    store: &ScheduleStore,
    schedule: &Schedule,
    owners: &HashMap<Ulid, OwnerSnapshot>,
) -> Vec<TalkWarning> {
    let timed: Vec<(&TalkSlot, Span)> = schedule
        .slots
        .iter()
        .filter_map(|slot| store.slot_span(slot).map(|span| (slot, span)))
        .collect();

    let mut warnings = Vec::new();
    for slot in &schedule.slots {
        let Some(submission_id) = slot.submission_id else {
            continue;
        };
        let warn = |kind: WarningKind, owner_id: Option<Ulid>, message: String| TalkWarning {
            slot_id: slot.id,
            submission_id: Some(submission_id),
            kind,
            owner_id,
            message,
        };

        if store.submission_state(&submission_id) != Some(SubmissionState::Confirmed) {
            warnings.push(warn(
                WarningKind::Unconfirmed,
                None,
                "The submission is not confirmed and will not be visible.".into(),
            ));
        }

        let (Some(room_id), Some(span)) = (slot.room_id, store.slot_span(slot)) else {
            if slot.start.is_none() {
                warnings.push(warn(
                    WarningKind::Unscheduled,
                    None,
                    "The talk has no start time.".into(),
                ));
            }
            continue;
        };

        if let Some(room) = owners.get(&room_id)
            && !room.spans.is_empty()
            && !covers(&room.spans, &span)
        {
            warnings.push(warn(
                WarningKind::Room,
                Some(room_id),
                format!("Room {} is not available at the scheduled time.", room.name),
            ));
        }

        let room_clash = timed.iter().any(|(other, other_span)| {
            other.id != slot.id && other.room_id == Some(room_id) && other_span.overlaps(&span)
        });
        if room_clash {
            warnings.push(warn(
                WarningKind::RoomOverlap,
                Some(room_id),
                "Another session in the same room overlaps with this one.".into(),
            ));
        }

        for speaker_id in store.speakers_of(&submission_id) {
            let name = owners
                .get(&speaker_id)
                .map(|o| o.name.clone())
                .unwrap_or_else(|| speaker_id.to_string());

            if let Some(speaker) = owners.get(&speaker_id)
                && !speaker.spans.is_empty()
                && !covers(&speaker.spans, &span)
            {
                warnings.push(warn(
                    WarningKind::Speaker,
                    Some(speaker_id),
                    format!("{name} is not available at the scheduled time."),
                ));
            }

            let double_booked = timed.iter().any(|(other, other_span)| {
                other.id != slot.id
                    && other
                        .submission_id
                        .is_some_and(|sub| store.speakers_of(&sub).contains(&speaker_id))
                    && other_span.overlaps(&span)
            });
            if double_booked {
                warnings.push(warn(
                    WarningKind::SpeakerOverlap,
                    Some(speaker_id),
                    format!("{name} is scheduled for another session at the same time."),
                ));
            }
        }
    }
    warnings
}

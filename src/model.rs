use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for untrusted input.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Real overlap; spans that merely touch do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Overlap or direct adjacency.
    pub fn touches(&self, other: &Span) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn intersect(&self, other: &Span) -> Option<Span> {
        Span::try_new(self.start.max(other.start), self.end.min(other.end))
    }
}

/// Who an availability belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OwnerKind {
    Room,
    Speaker,
}

impl OwnerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerKind::Room => "room",
            OwnerKind::Speaker => "speaker",
        }
    }
}

impl fmt::Display for OwnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub span: Span,
}

/// A room or a speaker together with the windows in which it can be scheduled.
#[derive(Debug, Clone)]
pub struct OwnerState {
    pub id: Ulid,
    pub kind: OwnerKind,
    pub name: Option<String>,
    /// Column order in rendered timetables (rooms only).
    pub position: u32,
    /// Sorted by `span.start`.
    pub availabilities: Vec<Availability>,
}

impl OwnerState {
    pub fn new(id: Ulid, kind: OwnerKind, name: Option<String>, position: u32) -> Self {
        Self {
            id,
            kind,
            name,
            position,
            availabilities: Vec::new(),
        }
    }

    /// Insert availability maintaining sort order by span.start.
    pub fn insert_availability(&mut self, availability: Availability) {
        let pos = self
            .availabilities
            .binary_search_by_key(&availability.span.start, |a| a.span.start)
            .unwrap_or_else(|e| e);
        self.availabilities.insert(pos, availability);
    }

    pub fn remove_availability(&mut self, id: Ulid) -> Option<Availability> {
        let pos = self.availabilities.iter().position(|a| a.id == id)?;
        Some(self.availabilities.remove(pos))
    }

    /// Return only availabilities whose span overlaps the query window.
    /// Uses binary search to skip entries starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Availability> {
        let right_bound = self
            .availabilities
            .partition_point(|a| a.span.start < query.end);
        self.availabilities[..right_bound]
            .iter()
            .filter(move |a| a.span.end > query.start)
    }

    /// All spans in start order.
    pub fn spans(&self) -> Vec<Span> {
        self.availabilities.iter().map(|a| a.span).collect()
    }

    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.id.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubmissionState {
    Submitted,
    Accepted,
    Confirmed,
    Rejected,
    Canceled,
    Withdrawn,
    Deleted,
}

impl SubmissionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionState::Submitted => "submitted",
            SubmissionState::Accepted => "accepted",
            SubmissionState::Confirmed => "confirmed",
            SubmissionState::Rejected => "rejected",
            SubmissionState::Canceled => "canceled",
            SubmissionState::Withdrawn => "withdrawn",
            SubmissionState::Deleted => "deleted",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown submission state: {0}")]
pub struct UnknownState(pub String);

impl FromStr for SubmissionState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "submitted" => Ok(SubmissionState::Submitted),
            "accepted" => Ok(SubmissionState::Accepted),
            "confirmed" => Ok(SubmissionState::Confirmed),
            "rejected" => Ok(SubmissionState::Rejected),
            "canceled" | "cancelled" => Ok(SubmissionState::Canceled),
            "withdrawn" => Ok(SubmissionState::Withdrawn),
            "deleted" => Ok(SubmissionState::Deleted),
            _ => Err(UnknownState(s.to_string())),
        }
    }
}

impl fmt::Display for SubmissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub id: Ulid,
    pub title: String,
    pub state: SubmissionState,
    pub speakers: Vec<Ulid>,
    /// Planned talk length; the conference default applies when unset.
    pub duration: Option<Ms>,
}

/// One placement of a submission (or a break) in a schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TalkSlot {
    pub id: Ulid,
    /// `None` for breaks and similar non-talk blocks.
    pub submission_id: Option<Ulid>,
    pub room_id: Option<Ulid>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub description: Option<String>,
    /// Fixed when the schedule is frozen.
    pub is_visible: bool,
}

impl TalkSlot {
    pub fn is_break(&self) -> bool {
        self.submission_id.is_none()
    }

    /// Has both a room and a start time.
    pub fn is_scheduled(&self) -> bool {
        self.room_id.is_some() && self.start.is_some()
    }

    /// Same room and same start time.
    pub fn is_same_slot(&self, other: &TalkSlot) -> bool {
        self.room_id == other.room_id && self.start == other.start
    }
}

/// Partial update of a WIP slot. `None` leaves a field as it is,
/// `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotPatch {
    pub room_id: Option<Option<Ulid>>,
    pub start: Option<Option<Ms>>,
    pub end: Option<Option<Ms>>,
}

impl SlotPatch {
    pub fn is_empty(&self) -> bool {
        self.room_id.is_none() && self.start.is_none() && self.end.is_none()
    }

    /// Room, start and end of `slot` after the patch.
    pub fn apply(&self, slot: &TalkSlot) -> (Option<Ulid>, Option<Ms>, Option<Ms>) {
        (
            self.room_id.unwrap_or(slot.room_id),
            self.start.unwrap_or(slot.start),
            self.end.unwrap_or(slot.end),
        )
    }
}

/// A schedule version. `version == None` marks the work-in-progress schedule;
/// everything else is a frozen release and never changes again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub version: Option<String>,
    pub published: Option<Ms>,
    pub comment: Option<String>,
    pub slots: Vec<TalkSlot>,
}

impl Schedule {
    pub fn wip(slots: Vec<TalkSlot>) -> Self {
        Self {
            version: None,
            published: None,
            comment: None,
            slots,
        }
    }

    pub fn is_released(&self) -> bool {
        self.version.is_some()
    }

    pub fn slot(&self, id: &Ulid) -> Option<&TalkSlot> {
        self.slots.iter().find(|s| s.id == *id)
    }

    pub fn slot_mut(&mut self, id: &Ulid) -> Option<&mut TalkSlot> {
        self.slots.iter_mut().find(|s| s.id == *id)
    }

    pub fn submission_ids(&self) -> HashSet<Ulid> {
        self.slots.iter().filter_map(|s| s.submission_id).collect()
    }

    pub fn label(&self) -> &str {
        self.version.as_deref().unwrap_or("wip")
    }
}

impl Default for Schedule {
    fn default() -> Self {
        Schedule::wip(Vec::new())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConferenceConfig {
    /// IANA timezone name used for local times in renderings and notifications.
    pub timezone: String,
    pub default_duration: Ms,
}

impl Default for ConferenceConfig {
    fn default() -> Self {
        Self {
            timezone: crate::limits::DEFAULT_TIMEZONE.to_string(),
            default_duration: crate::limits::DEFAULT_SLOT_DURATION_MS,
        }
    }
}

/// How a query names a schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionRef {
    Wip,
    Latest,
    Named(String),
}

impl VersionRef {
    pub fn parse(s: &str) -> Self {
        match s {
            "wip" => VersionRef::Wip,
            "latest" => VersionRef::Latest,
            other => VersionRef::Named(other.to_string()),
        }
    }
}

impl fmt::Display for VersionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionRef::Wip => f.write_str("wip"),
            VersionRef::Latest => f.write_str("latest"),
            VersionRef::Named(name) => f.write_str(name),
        }
    }
}

/// Everything that changes a conference. Also the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ConferenceConfigured {
        timezone: String,
        default_duration: Ms,
    },
    OwnerCreated {
        id: Ulid,
        kind: OwnerKind,
        name: Option<String>,
        position: u32,
    },
    OwnerDeleted {
        id: Ulid,
    },
    AvailabilityAdded {
        id: Ulid,
        owner_id: Ulid,
        span: Span,
    },
    AvailabilityRemoved {
        id: Ulid,
        owner_id: Ulid,
    },
    SubmissionSaved {
        submission: Submission,
    },
    SubmissionStateChanged {
        id: Ulid,
        state: SubmissionState,
    },
    SlotPlaced {
        slot: TalkSlot,
    },
    SlotMoved {
        id: Ulid,
        room_id: Option<Ulid>,
        start: Option<Ms>,
        end: Option<Ms>,
    },
    SlotRemoved {
        id: Ulid,
    },
    ScheduleFrozen {
        version: String,
        comment: Option<String>,
        published: Ms,
    },
    ScheduleUnfrozen {
        version: String,
    },
    /// Written by WAL compaction: a release (or the WIP schedule when
    /// `version` is `None`) in its final form.
    ScheduleRestored {
        schedule: Schedule,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerInfo {
    pub id: Ulid,
    pub kind: OwnerKind,
    pub name: Option<String>,
    pub position: u32,
    pub availability_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleInfo {
    pub version: Option<String>,
    pub published: Option<Ms>,
    pub comment: Option<String>,
    pub slot_count: usize,
}

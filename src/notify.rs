use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::engine::ChangeAction;
use crate::model::{Event, Ms, OwnerKind};

const CHANNEL_CAPACITY: usize = 256;

/// Channel carrying WIP changes and release announcements.
pub const SCHEDULE_CHANNEL: &str = "schedule";

/// `room_{id}` / `speaker_{id}`.
pub fn owner_channel(kind: OwnerKind, id: Ulid) -> String {
    format!("{}_{id}", kind.as_str())
}

/// A talk as a speaker sees it: names and conference-local times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotifiedTalk {
    pub submission_id: Ulid,
    pub title: String,
    pub room: String,
    pub start: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotifiedMove {
    pub submission_id: Ulid,
    pub title: String,
    pub old_room: String,
    pub new_room: String,
    pub old_start: String,
    pub new_start: String,
}

/// NOTIFY payloads. Serialized as JSON with a `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    Changed {
        event: Event,
    },
    ScheduleReleased {
        version: String,
        published: Ms,
        action: ChangeAction,
        changes: usize,
    },
    SpeakerSchedule {
        speaker_id: Ulid,
        version: String,
        create: Vec<NotifiedTalk>,
        update: Vec<NotifiedMove>,
    },
}

impl Notification {
    pub fn to_payload(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Broadcast hub for LISTEN/NOTIFY, one channel per name.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a channel. Creates the channel if needed.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, channel: &str, notification: Notification) {
        if let Some(sender) = self.channels.get(channel) {
            let _ = sender.send(notification);
        }
    }

    /// Drop a channel, e.g. when its room or speaker is deleted.
    pub fn remove(&self, channel: &str) {
        self.channels.remove(channel);
    }
}

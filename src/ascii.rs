//! Plain-text timetables: a per-day list and a per-day room grid.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use chrono_tz::Tz;

use crate::limits::MAX_COLUMN_WIDTH;
use crate::model::Ms;

/// Grid rows are five minutes apart.
const STEP_MINUTES: i64 = 5;
const LABEL_WIDTH: usize = 8;
pub const DEFAULT_COLUMN_WIDTH: usize = 24;
const MIN_COLUMN_WIDTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimetableFormat {
    List,
    Grid,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown timetable format: {0} (expected list or grid)")]
pub struct UnknownFormat(pub String);

impl FromStr for TimetableFormat {
    type Err = UnknownFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "list" => Ok(TimetableFormat::List),
            "grid" | "table" => Ok(TimetableFormat::Grid),
            _ => Err(UnknownFormat(s.to_string())),
        }
    }
}

/// One block on the timetable, in UTC milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimetableEntry {
    pub start: Ms,
    pub end: Ms,
    pub title: String,
    pub speakers: Vec<String>,
    pub is_break: bool,
}

/// A room and everything scheduled in it. Rooms are rendered in the order given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomColumn {
    pub name: String,
    pub entries: Vec<TimetableEntry>,
}

pub fn to_local(ms: Ms, tz: &Tz) -> Option<NaiveDateTime> {
    DateTime::from_timestamp_millis(ms).map(|utc| utc.with_timezone(tz).naive_local())
}

/// `YYYY-MM-DD HH:MM` in the conference timezone.
pub fn format_local(ms: Ms, tz: &Tz) -> String {
    to_local(ms, tz)
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ms.to_string())
}

struct LocalEntry<'a> {
    room: usize,
    start: NaiveDateTime,
    end: NaiveDateTime,
    entry: &'a TimetableEntry,
}

fn group_by_day<'a>(rooms: &'a [RoomColumn], tz: &Tz) -> BTreeMap<NaiveDate, Vec<LocalEntry<'a>>> {
    let mut days: BTreeMap<NaiveDate, Vec<LocalEntry<'a>>> = BTreeMap::new();
    for (room, column) in rooms.iter().enumerate() {
        for entry in &column.entries {
            let (Some(start), Some(end)) = (to_local(entry.start, tz), to_local(entry.end, tz)) else {
                continue;
            };
            days.entry(start.date()).or_default().push(LocalEntry {
                room,
                start,
                end,
                entry,
            });
        }
    }
    for entries in days.values_mut() {
        entries.sort_by_key(|e| (e.start, e.room));
    }
    days
}

pub fn render(rooms: &[RoomColumn], tz: &Tz, format: TimetableFormat, column_width: usize) -> Vec<String> {
    match format {
        TimetableFormat::List => render_list(rooms, tz),
        TimetableFormat::Grid => render_grid(rooms, tz, column_width),
    }
}

// ── List ─────────────────────────────────────────────────────────

pub fn render_list(rooms: &[RoomColumn], tz: &Tz) -> Vec<String> {
    let mut lines = Vec::new();
    for (date, entries) in group_by_day(rooms, tz) {
        if !lines.is_empty() {
            lines.push(String::new());
        }
        lines.push(date.format("%Y-%m-%d").to_string());
        for e in entries {
            let time = e.start.format("%H:%M");
            let room = &rooms[e.room].name;
            let line = if e.entry.is_break {
                format!("* {time} {} in {room}", e.entry.title)
            } else if e.entry.speakers.is_empty() {
                format!("* {time} {}, No speakers; in {room}", e.entry.title)
            } else {
                format!("* {time} {}, {}; in {room}", e.entry.title, e.entry.speakers.join(", "))
            };
            lines.push(line);
        }
    }
    lines
}

// ── Grid ─────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
struct Cell {
    starts: bool,
    ends: bool,
    running: Option<usize>,
}

impl Cell {
    fn above(&self) -> bool {
        self.ends || self.running.is_some()
    }

    fn below(&self) -> bool {
        self.starts || self.running.is_some()
    }

    fn edge(&self) -> bool {
        self.starts || self.ends
    }
}

fn box_char(up: bool, down: bool, left: bool, right: bool) -> char {
    match (up, down, left, right) {
        (false, false, false, false) => ' ',
        (true, true, false, false) | (true, false, false, false) | (false, true, false, false) => '│',
        (false, false, true, true) | (false, false, true, false) | (false, false, false, true) => '─',
        (false, true, false, true) => '┌',
        (false, true, true, false) => '┐',
        (true, false, false, true) => '└',
        (true, false, true, false) => '┘',
        (true, true, false, true) => '├',
        (true, true, true, false) => '┤',
        (false, true, true, true) => '┬',
        (true, false, true, true) => '┴',
        (true, true, true, true) => '┼',
    }
}

/// Border character between two neighbouring cells (`None` at the edges).
fn junction(left: Option<Cell>, right: Option<Cell>) -> char {
    let l = left.unwrap_or_default();
    let r = right.unwrap_or_default();
    box_char(l.above() || r.above(), l.below() || r.below(), l.edge(), r.edge())
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    if width == 0 {
        return String::new();
    }
    let mut out: String = text.chars().take(width - 1).collect();
    out.push('…');
    out
}

/// Greedy word wrap; words longer than `width` are split.
fn wrap(text: &str, width: usize) -> Vec<String> {
    let width = width.max(1);
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        let mut word: Vec<char> = word.chars().collect();
        while word.len() > width {
            if !current.is_empty() {
                lines.push(std::mem::take(&mut current));
            }
            lines.push(word.drain(..width).collect());
        }
        if word.is_empty() {
            continue;
        }
        let word: String = word.into_iter().collect();
        let needed = if current.is_empty() { 0 } else { current.chars().count() + 1 };
        if needed + word.chars().count() > width {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(&word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

/// The inside of a talk box, exactly `height` lines of `width` characters.
fn card_lines(entry: &TimetableEntry, height: usize, width: usize) -> Vec<String> {
    let text_width = width.saturating_sub(4);
    if height == 0 {
        return Vec::new();
    }
    let speakers = (!entry.is_break && !entry.speakers.is_empty())
        .then(|| truncate(&entry.speakers.join(", "), text_width));
    let reserved = usize::from(speakers.is_some());
    let padded = height > 4 + reserved;
    let max_title = height.saturating_sub(reserved + usize::from(padded)).max(1);

    let mut title = wrap(&entry.title, text_width);
    if title.len() > max_title {
        let rest = title.split_off(max_title - 1).join(" ");
        title.push(truncate(&rest, text_width));
    }

    let mut lines = Vec::with_capacity(height);
    if padded {
        lines.push(String::new());
    }
    lines.extend(title);
    if let Some(speakers) = speakers {
        if padded && height.saturating_sub(lines.len()) > 1 {
            lines.push(String::new());
        }
        lines.push(speakers);
    }
    lines.truncate(height);
    lines.resize(height, String::new());
    lines
        .into_iter()
        .map(|l| format!("  {l:<text_width$}  "))
        .collect()
}

fn minutes_since(day: NaiveDate, t: NaiveDateTime) -> i64 {
    (t - day.and_hms_opt(0, 0, 0).unwrap_or(t)).num_minutes()
}

struct Block {
    start: i64,
    end: i64,
    lines: Vec<String>,
}

fn render_day(rooms: &[RoomColumn], day: NaiveDate, entries: &[LocalEntry<'_>], width: usize) -> Vec<String> {
    // Only rooms with something on this day get a column, in room order.
    let mut columns: Vec<usize> = entries.iter().map(|e| e.room).collect();
    columns.sort_unstable();
    columns.dedup();

    let blocks: Vec<Vec<Block>> = columns
        .iter()
        .map(|room| {
            entries
                .iter()
                .filter(|e| e.room == *room)
                .map(|e| {
                    let start = minutes_since(day, e.start).div_euclid(STEP_MINUTES) * STEP_MINUTES;
                    let end = (minutes_since(day, e.end) + STEP_MINUTES - 1).div_euclid(STEP_MINUTES) * STEP_MINUTES;
                    let end = end.max(start + STEP_MINUTES);
                    let height = ((end - start) / STEP_MINUTES - 1) as usize;
                    Block {
                        start,
                        end,
                        lines: card_lines(e.entry, height, width),
                    }
                })
                .collect()
        })
        .collect();

    let first = blocks.iter().flatten().map(|b| b.start).min().unwrap_or(0);
    let last = blocks.iter().flatten().map(|b| b.end).max().unwrap_or(0);

    let mut lines = Vec::new();
    let mut header = " ".repeat(LABEL_WIDTH);
    for room in &columns {
        let name = truncate(&rooms[*room].name, width.saturating_sub(2));
        header.push_str(&format!("| {name:<w$} ", w = width.saturating_sub(2)));
    }
    header.push('|');
    lines.push(header);

    let mut t = first;
    while t <= last {
        let cells: Vec<Cell> = blocks
            .iter()
            .map(|column| Cell {
                starts: column.iter().any(|b| b.start == t),
                ends: column.iter().any(|b| b.end == t),
                running: column.iter().position(|b| b.start < t && t < b.end),
            })
            .collect();

        let mut line = if t % 30 == 0 {
            format!("{:02}:{:02} --", (t / 60).rem_euclid(24), t % 60)
        } else {
            " ".repeat(LABEL_WIDTH)
        };
        for (i, cell) in cells.iter().enumerate() {
            let left = i.checked_sub(1).map(|j| cells[j]);
            line.push(junction(left, Some(*cell)));
            if cell.edge() {
                line.push_str(&"─".repeat(width));
            } else if let Some(b) = cell.running {
                let block = &blocks[i][b];
                let row = ((t - block.start) / STEP_MINUTES - 1) as usize;
                match block.lines.get(row) {
                    Some(text) => line.push_str(text),
                    None => line.push_str(&" ".repeat(width)),
                }
            } else {
                line.push_str(&" ".repeat(width));
            }
        }
        line.push(junction(cells.last().copied(), None));
        lines.push(line.trim_end().to_string());
        t += STEP_MINUTES;
    }
    lines
}

pub fn render_grid(rooms: &[RoomColumn], tz: &Tz, column_width: usize) -> Vec<String> {
    let width = column_width.clamp(MIN_COLUMN_WIDTH, MAX_COLUMN_WIDTH);
    let mut lines = Vec::new();
    for (date, entries) in group_by_day(rooms, tz) {
        if !lines.is_empty() {
            lines.push(String::new());
        }
        lines.push(date.format("%Y-%m-%d").to_string());
        lines.extend(render_day(rooms, date, &entries, width));
    }
    lines
}

//! Console line classification.
//!
//! Each recognizer below matches one line shape. A line must be claimed by
//! exactly one recognizer to become an event; a line claimed by several is
//! ambiguous and dropped, so the result never depends on the order the
//! recognizers run in.
//!
//! Line shapes:
//!
//! ```text
//! [CHAT GLOBAL] alice : hello there
//! bob was killed by alice with rifle.ak
//! Saved 41,235 ents, cache(0.12), write(0.03), disk(0.01).
//! [ZORP] alice requested claim at (120.5, 14.0, -310.25)
//! 10.0.0.7:51234/76561198000000001/alice joined [windows/76561198000000001]
//! 10.0.0.7:51234/76561198000000001/alice disconnecting: closing
//! ```

use std::time::Duration;

use crate::event::{ChatChannel, Coordinate, DomainEvent, EventKind, Presence, ZoneTriggerKind};
use crate::ServerId;

/// How many frames a split line may span before it is thrown away.
pub const MAX_PENDING_FRAGMENTS: u32 = 4;
/// Upper bound on a reassembled line.
pub const MAX_LINE_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Event(EventKind),
    Ambiguous(Vec<&'static str>),
    Unrecognized,
}

type Recognizer = fn(&str) -> Option<EventKind>;

const RECOGNIZERS: [(&str, Recognizer); 5] = [
    ("chat", parse_chat),
    ("kill", parse_kill),
    ("save", parse_save),
    ("zone_trigger", parse_zone_trigger),
    ("presence", parse_presence),
];

pub fn classify_line(line: &str) -> Classification {
    let line = line.trim();
    if line.is_empty() {
        return Classification::Unrecognized;
    }

    let mut matches: Vec<(&'static str, EventKind)> = RECOGNIZERS
        .iter()
        .filter_map(|(name, recognize)| recognize(line).map(|kind| (*name, kind)))
        .collect();

    match matches.len() {
        0 => Classification::Unrecognized,
        1 => Classification::Event(matches.remove(0).1),
        _ => Classification::Ambiguous(matches.into_iter().map(|(name, _)| name).collect()),
    }
}

/// `name[76561198000000001]` and `name[123/76561198000000001]` both become `name`.
fn strip_player_id(raw: &str) -> &str {
    let raw = raw.trim();
    if let Some(open) = raw.rfind('[') {
        let suffix = &raw[open + 1..];
        if let Some(inner) = suffix.strip_suffix(']') {
            if !inner.is_empty() && inner.chars().all(|c| c.is_ascii_digit() || c == '/') {
                return raw[..open].trim_end();
            }
        }
    }
    raw
}

fn parse_chat(line: &str) -> Option<EventKind> {
    let rest = line.strip_prefix("[CHAT ")?;
    let (tag, rest) = rest.split_once("] ")?;
    let (speaker, message) = rest.split_once(" : ")?;
    let speaker = strip_player_id(speaker);
    if tag.is_empty() || speaker.is_empty() {
        return None;
    }

    Some(EventKind::Chat {
        speaker: speaker.to_string(),
        channel: ChatChannel::from_tag(tag),
        message: message.trim().to_string(),
    })
}

fn parse_kill(line: &str) -> Option<EventKind> {
    if line.starts_with('[') {
        return None;
    }
    let (victim, rest) = line.split_once(" was killed by ")?;
    let (killer, weapon) = rest.rsplit_once(" with ")?;
    let victim = strip_player_id(victim);
    let killer = strip_player_id(killer);
    let weapon = weapon.trim();
    if victim.is_empty() || killer.is_empty() || weapon.is_empty() {
        return None;
    }

    Some(EventKind::Kill {
        killer: killer.to_string(),
        victim: victim.to_string(),
        weapon: weapon.to_string(),
    })
}

/// Sums the `stage(seconds)` timings of a save line.
fn parse_save(line: &str) -> Option<EventKind> {
    let rest = line.strip_prefix("Saved ")?;
    if !rest.contains(" ents") {
        return None;
    }

    let mut total = 0.0f64;
    let mut stages = 0;
    for segment in rest.split(", ") {
        let Some((_, value)) = segment.split_once('(') else {
            continue;
        };
        let value = value.trim_end_matches('.').trim_end_matches(')');
        let seconds: f64 = value.parse().ok()?;
        if !seconds.is_finite() || seconds < 0.0 {
            return None;
        }
        total += seconds;
        stages += 1;
    }

    if stages == 0 {
        return None;
    }
    Some(EventKind::Save {
        elapsed: Duration::from_secs_f64(total),
    })
}

fn parse_zone_trigger(line: &str) -> Option<EventKind> {
    let rest = line.strip_prefix("[ZORP] ")?;
    let (head, position) = rest.rsplit_once(" at ")?;
    let (player, action) = head.rsplit_once(" requested ")?;
    let kind = match action.trim() {
        "claim" => ZoneTriggerKind::Claim,
        "remove" => ZoneTriggerKind::Remove,
        _ => return None,
    };
    let player = strip_player_id(player);
    if player.is_empty() {
        return None;
    }
    let position: Coordinate = position.parse().ok()?;

    Some(EventKind::ZoneTrigger {
        player: player.to_string(),
        kind,
        position,
    })
}

/// `address/steamid/name joined [...]` or `address/steamid/name disconnecting: reason`.
fn parse_presence(line: &str) -> Option<EventKind> {
    let (identity, transition) = if let Some((identity, _)) = line.split_once(" joined [") {
        (identity, Presence::Online)
    } else if let Some((identity, _)) = line.split_once(" disconnecting: ") {
        (identity, Presence::Offline)
    } else {
        return None;
    };

    let mut parts = identity.splitn(3, '/');
    let address = parts.next()?;
    let player_id = parts.next()?;
    let name = parts.next()?.trim();
    if !address.contains(':')
        || player_id.is_empty()
        || !player_id.chars().all(|c| c.is_ascii_digit())
        || name.is_empty()
    {
        return None;
    }

    Some(EventKind::PlayerPresence {
        player: name.to_string(),
        transition,
    })
}

/// Turns console frame bodies into whole lines.
///
/// Game servers cut long output at their maximum body size, so a frame whose
/// body fills that limit and does not end in a newline has its last line
/// continued in the next frame. Every other frame ends on a line boundary.
#[derive(Debug)]
pub struct LineAssembler {
    partial: Option<PartialLine>,
    split_threshold: usize,
    max_fragments: u32,
    discarded: u64,
}

#[derive(Debug)]
struct PartialLine {
    text: String,
    fragments: u32,
}

impl LineAssembler {
    pub fn new(split_threshold: usize) -> Self {
        Self {
            partial: None,
            split_threshold,
            max_fragments: MAX_PENDING_FRAGMENTS,
            discarded: 0,
        }
    }

    pub fn max_fragments(mut self, max: u32) -> Self {
        self.max_fragments = max.max(1);
        self
    }

    /// Number of partial lines thrown away so far.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn has_partial(&self) -> bool {
        self.partial.is_some()
    }

    pub fn push(&mut self, body: &str) -> Vec<String> {
        let frame_was_cut = body.len() >= self.split_threshold && !body.ends_with('\n');

        let (text, fragments) = match self.partial.take() {
            Some(partial) => (partial.text + body, partial.fragments),
            None => (body.to_string(), 0),
        };

        let mut lines: Vec<String> = text
            .split('\n')
            .map(|line| line.trim_end_matches('\r').to_string())
            .collect();

        if frame_was_cut {
            if let Some(tail) = lines.pop() {
                let fragments = if lines.is_empty() { fragments + 1 } else { 1 };
                if fragments > self.max_fragments || tail.len() > MAX_LINE_LEN {
                    self.discarded += 1;
                } else {
                    self.partial = Some(PartialLine {
                        text: tail,
                        fragments,
                    });
                }
            }
        }

        lines.retain(|line| !line.trim().is_empty());
        lines
    }
}

/// Per-server pipeline from frame bodies to events.
#[derive(Debug)]
pub struct EventParser {
    server: ServerId,
    assembler: LineAssembler,
    emit_generic: bool,
    ambiguous: u64,
}

impl EventParser {
    pub fn new(server: ServerId, split_threshold: usize, emit_generic: bool) -> Self {
        Self {
            server,
            assembler: LineAssembler::new(split_threshold),
            emit_generic,
            ambiguous: 0,
        }
    }

    pub fn push_frame(&mut self, body: &str, timestamp: u64) -> Vec<DomainEvent> {
        let mut events = Vec::new();

        for line in self.assembler.push(body) {
            let kind = match classify_line(&line) {
                Classification::Event(kind) => kind,
                Classification::Ambiguous(_) => {
                    self.ambiguous += 1;
                    continue;
                }
                Classification::Unrecognized if self.emit_generic => EventKind::Generic {
                    line: line.trim().to_string(),
                },
                Classification::Unrecognized => continue,
            };
            events.push(DomainEvent::new(self.server.clone(), timestamp, kind));
        }

        events
    }

    pub fn ambiguous_count(&self) -> u64 {
        self.ambiguous
    }

    pub fn discarded_count(&self) -> u64 {
        self.assembler.discarded()
    }

    /// Forgets any half-received line, e.g. after a reconnect.
    pub fn reset(&mut self) {
        self.assembler.partial = None;
    }
}

//! Participant directory: identity bookkeeping and cursor colors.
//!
//! Colors come from a fixed palette. A joiner takes the lowest slot no
//! current member holds; once every slot is taken, assignment cycles by
//! join order. A leaver's slot goes back to the pool for future joiners but
//! is never taken away from an existing member.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::{now_millis, ParticipantId, Timestamp};

/// RGBA cursor/selection color.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Opaque color from a `0xRRGGBB` value.
    pub fn from_rgb_hex(rgb: u32) -> Self {
        Self {
            r: ((rgb >> 16) & 0xFF) as f32 / 255.0,
            g: ((rgb >> 8) & 0xFF) as f32 / 255.0,
            b: (rgb & 0xFF) as f32 / 255.0,
            a: 1.0,
        }
    }

    /// `#rrggbb` form for web clients.
    pub fn to_hex(&self) -> String {
        let channel = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!(
            "#{:02x}{:02x}{:02x}",
            channel(self.r),
            channel(self.g),
            channel(self.b)
        )
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

/// Participant palette (`0xRRGGBB`), in assignment order.
pub const PALETTE: [u32; 8] = [
    0xFF6B6B, 0x4ECDC4, 0x45B7D1, 0x96CEB4, 0xFFEAA7, 0xDDA0DD, 0x98D8C8, 0xF7DC6F,
];

/// Color for a palette slot, wrapping past the end.
pub fn palette_color(slot: usize) -> CursorColor {
    CursorColor::from_rgb_hex(PALETTE[slot % PALETTE.len()])
}

/// Presence status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantStatus {
    Online,
    Typing,
    Away,
}

/// A member of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub display_name: String,
    pub avatar: Option<String>,
    pub color: CursorColor,
    /// Palette slot backing `color`.
    pub color_slot: usize,
    pub status: ParticipantStatus,
    pub joined_at: Timestamp,
    pub last_seen: Timestamp,
}

impl Participant {
    pub fn touch(&mut self, status: ParticipantStatus) {
        self.status = status;
        self.last_seen = now_millis();
    }
}

/// Identity and color bindings for one session.
#[derive(Debug, Default)]
pub struct ParticipantDirectory {
    members: HashMap<ParticipantId, Participant>,
    /// Members in join order.
    order: Vec<ParticipantId>,
    /// Registrations over the directory's lifetime; drives cycling.
    joins: usize,
}

impl ParticipantDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `id` to a color. Re-registering returns the existing color and
    /// leaves the record untouched.
    pub fn register(
        &mut self,
        id: ParticipantId,
        display_name: impl Into<String>,
        avatar: Option<String>,
    ) -> CursorColor {
        if let Some(existing) = self.members.get(&id) {
            return existing.color;
        }

        let slot = self.next_slot();
        self.joins += 1;
        let now = now_millis();
        let participant = Participant {
            id: id.clone(),
            display_name: display_name.into(),
            avatar,
            color: palette_color(slot),
            color_slot: slot,
            status: ParticipantStatus::Online,
            joined_at: now,
            last_seen: now,
        };
        let color = participant.color;
        self.members.insert(id.clone(), participant);
        self.order.push(id);
        color
    }

    /// Drop `id`'s binding, returning its record.
    pub fn unregister(&mut self, id: &ParticipantId) -> Option<Participant> {
        let removed = self.members.remove(id)?;
        self.order.retain(|p| p != id);
        Some(removed)
    }

    fn next_slot(&self) -> usize {
        (0..PALETTE.len())
            .find(|slot| self.members.values().all(|p| p.color_slot != *slot))
            .unwrap_or(self.joins % PALETTE.len())
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&Participant> {
        self.members.get(id)
    }

    pub fn get_mut(&mut self, id: &ParticipantId) -> Option<&mut Participant> {
        self.members.get_mut(id)
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.members.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members in join order.
    pub fn participants(&self) -> Vec<Participant> {
        self.order
            .iter()
            .filter_map(|id| self.members.get(id).cloned())
            .collect()
    }

    /// Flip members not seen since `cutoff` to `Away`, returning their ids.
    pub fn mark_away_before(&mut self, cutoff: Timestamp) -> Vec<ParticipantId> {
        let mut flipped = Vec::new();
        for id in &self.order {
            if let Some(p) = self.members.get_mut(id) {
                if p.status != ParticipantStatus::Away && p.last_seen < cutoff {
                    p.status = ParticipantStatus::Away;
                    flipped.push(id.clone());
                }
            }
        }
        flipped
    }
}

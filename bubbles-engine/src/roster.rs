//! Position roster: last known position and color of every remote participant.
//!
//! Only the inbound network path mutates the roster. The render path reads
//! it through [`PositionRoster::snapshot`], which copies the entries under a
//! short read lock so a render cycle never holds the lock.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use uuid::Uuid;

/// One session member rendered as a colored point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Participant {
    pub id: Uuid,
    pub x: i32,
    pub y: i32,
    /// Packed `0xRRGGBB`
    pub color: u32,
}

/// Stable, vivid color derived from a participant id.
///
/// The hue comes from the id so every viewer renders the same color
/// before the relay confirms one.
pub fn color_from_id(id: Uuid) -> u32 {
    let hue = (id.as_u128() % 360) as f32 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    let channel = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u32;
    let packed = (channel(r) << 16) | (channel(g) << 8) | channel(b);
    // 0 means "let the relay pick" on the wire.
    packed.max(1)
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        p + (q - p) * 6.0 * t
    } else if t < 1.0 / 2.0 {
        q
    } else if t < 2.0 / 3.0 {
        p + (q - p) * (2.0 / 3.0 - t) * 6.0
    } else {
        p
    }
}

/// Concurrent table of remote participants.
#[derive(Default)]
pub struct PositionRoster {
    entries: RwLock<HashMap<Uuid, Participant>>,
}

impl PositionRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a participant. Returns true if it was new.
    pub fn upsert(&self, id: Uuid, x: i32, y: i32, color: u32) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries
            .insert(id, Participant { id, x, y, color })
            .is_none()
    }

    /// Remove a participant. Returns true if it was present.
    pub fn remove(&self, id: &Uuid) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some()
    }

    pub fn get(&self, id: &Uuid) -> Option<Participant> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .copied()
    }

    /// Point-in-time copy of every entry, ordered by id.
    pub fn snapshot(&self) -> Vec<Participant> {
        let mut participants: Vec<Participant> = {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            entries.values().copied().collect()
        };
        participants.sort_unstable_by_key(|p| p.id);
        participants
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

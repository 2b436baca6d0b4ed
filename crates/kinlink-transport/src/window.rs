//! # Frame Window
//!
//! Fixed-depth arena of per-frame slots indexed by `frame_id mod depth`.
//!
//! Replaces an unbounded `frame_id → collection` map: a stalled or hostile
//! sender can at most fill `depth` slots. When a frame claims a slot held by
//! an older frame, the older one is evicted; a frame that would displace a
//! newer one is refused. For any set of live frames spanning fewer than
//! `depth` ids the arena behaves exactly like a map.

use crate::FrameId;

#[derive(Debug)]
struct Slot<T> {
    frame_id: FrameId,
    value: T,
}

/// Outcome of [`FrameWindow::claim`].
#[derive(Debug, PartialEq, Eq)]
pub enum Claim {
    /// The frame already had a slot.
    Existing,
    /// A fresh slot was created for the frame.
    Created,
    /// A fresh slot was created by evicting this older frame.
    Evicted(FrameId),
    /// The slot belongs to a newer frame; nothing was stored.
    Superseded,
}

/// Fixed-depth, frame-indexed arena.
#[derive(Debug)]
pub struct FrameWindow<T> {
    slots: Vec<Option<Slot<T>>>,
    len: usize,
}

impl<T> FrameWindow<T> {
    /// Create a window with `depth` slots.
    ///
    /// # Panics
    ///
    /// Panics if `depth` is zero.
    pub fn new(depth: usize) -> Self {
        assert!(depth > 0, "window depth must be > 0");
        FrameWindow {
            slots: (0..depth).map(|_| None).collect(),
            len: 0,
        }
    }

    #[inline]
    fn index(&self, frame_id: FrameId) -> usize {
        (frame_id as i64).rem_euclid(self.slots.len() as i64) as usize
    }

    /// Number of slots.
    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, frame_id: FrameId) -> bool {
        self.get(frame_id).is_some()
    }

    pub fn get(&self, frame_id: FrameId) -> Option<&T> {
        match &self.slots[self.index(frame_id)] {
            Some(slot) if slot.frame_id == frame_id => Some(&slot.value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, frame_id: FrameId) -> Option<&mut T> {
        let idx = self.index(frame_id);
        match &mut self.slots[idx] {
            Some(slot) if slot.frame_id == frame_id => Some(&mut slot.value),
            _ => None,
        }
    }

    /// Ensure `frame_id` owns its slot, creating the value with `make` if
    /// needed.
    pub fn claim(&mut self, frame_id: FrameId, make: impl FnOnce() -> T) -> Claim {
        let idx = self.index(frame_id);
        let claim = match &self.slots[idx] {
            Some(slot) if slot.frame_id == frame_id => return Claim::Existing,
            Some(slot) if slot.frame_id > frame_id => return Claim::Superseded,
            Some(slot) => Claim::Evicted(slot.frame_id),
            None => {
                self.len += 1;
                Claim::Created
            }
        };
        self.slots[idx] = Some(Slot {
            frame_id,
            value: make(),
        });
        claim
    }

    pub fn remove(&mut self, frame_id: FrameId) -> Option<T> {
        let idx = self.index(frame_id);
        if !matches!(&self.slots[idx], Some(slot) if slot.frame_id == frame_id) {
            return None;
        }
        self.len -= 1;
        self.slots[idx].take().map(|s| s.value)
    }

    /// Drop every frame for which `keep` returns false. Returns how many
    /// were dropped.
    pub fn retain(&mut self, mut keep: impl FnMut(FrameId, &T) -> bool) -> usize {
        let mut dropped = 0;
        for entry in self.slots.iter_mut() {
            let evict = matches!(entry, Some(slot) if !keep(slot.frame_id, &slot.value));
            if evict {
                *entry = None;
                dropped += 1;
            }
        }
        self.len -= dropped;
        dropped
    }

    /// Occupied frame ids in ascending order.
    pub fn frame_ids(&self) -> Vec<FrameId> {
        let mut ids: Vec<FrameId> = self
            .slots
            .iter()
            .flatten()
            .map(|slot| slot.frame_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_creates_then_reuses() {
        let mut w: FrameWindow<u32> = FrameWindow::new(8);
        assert_eq!(w.claim(3, || 30), Claim::Created);
        assert_eq!(w.claim(3, || 99), Claim::Existing);
        assert_eq!(w.get(3), Some(&30));
        assert_eq!(w.len(), 1);
    }

    #[test]
    fn newer_frame_evicts_older_in_same_slot() {
        let mut w: FrameWindow<&str> = FrameWindow::new(4);
        w.claim(1, || "old");
        assert_eq!(w.claim(5, || "new"), Claim::Evicted(1));
        assert!(!w.contains(1));
        assert_eq!(w.get(5), Some(&"new"));
        assert_eq!(w.len(), 1);
    }

    #[test]
    fn older_frame_cannot_displace_newer() {
        let mut w: FrameWindow<&str> = FrameWindow::new(4);
        w.claim(9, || "newer");
        assert_eq!(w.claim(5, || "older"), Claim::Superseded);
        assert_eq!(w.get(9), Some(&"newer"));
        assert!(w.get(5).is_none());
    }

    #[test]
    fn get_checks_frame_id_not_just_slot() {
        let mut w: FrameWindow<u8> = FrameWindow::new(4);
        w.claim(2, || 1);
        assert!(w.get(6).is_none());
        assert!(w.get_mut(6).is_none());
        assert!(w.remove(6).is_none());
        assert_eq!(w.len(), 1);
    }

    #[test]
    fn retain_and_remove_track_len() {
        let mut w: FrameWindow<u8> = FrameWindow::new(16);
        for id in 0..6 {
            w.claim(id, || id as u8);
        }
        assert_eq!(w.retain(|id, _| id > 2), 3);
        assert_eq!(w.len(), 3);
        assert_eq!(w.remove(4), Some(4));
        assert_eq!(w.frame_ids(), vec![3, 5]);
        w.clear();
        assert!(w.is_empty());
    }

    #[test]
    fn negative_ids_map_to_valid_slots() {
        let mut w: FrameWindow<u8> = FrameWindow::new(4);
        assert_eq!(w.claim(-3, || 1), Claim::Created);
        assert_eq!(w.get(-3), Some(&1));
    }

    #[test]
    fn frame_ids_sorted() {
        let mut w: FrameWindow<()> = FrameWindow::new(8);
        for id in [12, 9, 15, 10] {
            w.claim(id, || ());
        }
        assert_eq!(w.frame_ids(), vec![9, 10, 12, 15]);
    }

    #[test]
    #[should_panic(expected = "window depth must be > 0")]
    fn zero_depth_panics() {
        let _: FrameWindow<()> = FrameWindow::new(0);
    }
}

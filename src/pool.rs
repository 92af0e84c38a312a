// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Pool of hardware frame ownership slots.
//!
//! Each slot keeps one submitted hardware frame alive until the device
//! reports, through the recycle index embedded in a returned packet, that it
//! is done reading the corresponding surface. The pool is sized once at
//! session setup and never grows; running out of slots means the device's
//! own admission control was not respected.

use std::collections::VecDeque;

use log::warn;
use thiserror::Error as ThisError;

use crate::frame::FrameStorage;

#[derive(Debug, ThisError)]
pub enum PoolAcquireError {
    #[error("no free hardware frame slot available")]
    Exhausted,
}

#[derive(Debug, ThisError)]
pub enum PoolBindError {
    #[error("hardware frame index {0} is already owned by another slot")]
    IndexInUse(u16),
    #[error("slot {0} has not been acquired")]
    NotAcquired(usize),
    #[error("binding requires hardware-backed storage")]
    NotHardware,
}

enum SlotState {
    Free,
    /// Removed from the free list, owner not yet recorded.
    Acquired,
    /// Owning the frame that keeps the hardware surface alive.
    Bound(FrameStorage),
}

pub struct HwFramePool {
    slots: Box<[SlotState]>,
    /// Indices of free slots, oldest first.
    free: VecDeque<usize>,
}

impl HwFramePool {
    pub fn new(capacity: usize) -> Self {
        HwFramePool {
            slots: (0..capacity).map(|_| SlotState::Free).collect(),
            free: (0..capacity).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn free_slots(&self) -> usize {
        self.free.len()
    }

    /// Take the oldest free slot out of the pool.
    pub fn acquire_free_slot(&mut self) -> Result<usize, PoolAcquireError> {
        let slot = self.free.pop_front().ok_or(PoolAcquireError::Exhausted)?;
        self.slots[slot] = SlotState::Acquired;
        Ok(slot)
    }

    /// Record `storage` as the owner held by `slot`. The storage must be
    /// hardware-backed, and its frame index must not be owned by any other
    /// slot.
    pub fn bind(&mut self, slot: usize, storage: FrameStorage) -> Result<(), PoolBindError> {
        let index = storage
            .hw_surface()
            .ok_or(PoolBindError::NotHardware)?
            .frame_index;
        if self.slot_of_index(index).is_some() {
            return Err(PoolBindError::IndexInUse(index));
        }
        match self.slots.get(slot) {
            Some(SlotState::Acquired) => {
                self.slots[slot] = SlotState::Bound(storage);
                Ok(())
            }
            _ => Err(PoolBindError::NotAcquired(slot)),
        }
    }

    /// Release the slot owning hardware frame `index`, dropping the frame it
    /// kept alive. A recycle for an index no slot owns is logged and ignored
    /// rather than treated as fatal, since the device is the only source of
    /// these indices.
    pub fn recycle(&mut self, index: u16) -> bool {
        match self.slot_of_index(index) {
            Some(slot) => {
                self.slots[slot] = SlotState::Free;
                self.free.push_back(slot);
                true
            }
            None => {
                warn!("recycle for hardware frame index {} with no owner", index);
                false
            }
        }
    }

    /// Whether any slot currently owns hardware frame `index`.
    pub fn owns_index(&self, index: u16) -> bool {
        self.slot_of_index(index).is_some()
    }

    /// Point every bound surface at `device_handle`. Called after a session
    /// close/reopen cycle so surfaces do not reference the dead instance.
    pub fn rebind_device_handle(&mut self, device_handle: i64) {
        for state in self.slots.iter_mut() {
            if let SlotState::Bound(FrameStorage::Hardware(surface)) = state {
                surface.device_handle = device_handle;
            }
        }
    }

    /// Drop every owned frame and return all slots to the free list.
    pub fn clear(&mut self) {
        for state in self.slots.iter_mut() {
            *state = SlotState::Free;
        }
        self.free = (0..self.slots.len()).collect();
    }

    fn slot_of_index(&self, index: u16) -> Option<usize> {
        self.slots.iter().position(|state| {
            matches!(state, SlotState::Bound(FrameStorage::Hardware(surface))
                if surface.frame_index == index)
        })
    }
}

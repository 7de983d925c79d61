//! In-flight job registry.
//!
//! A fixed table indexed by local job id. Ids advance in strides of 8 so
//! the low three bits stay free for the small-core index the chips fold
//! into the returned id byte. Reusing a slot releases the prior occupant;
//! the chips process jobs strictly in arrival order per chip, so a slot
//! never has two live results racing.

use std::sync::Arc;

use crate::job::AsicJob;

/// Table size; ids live in [0, 128).
pub const SLOT_COUNT: usize = 128;

/// Id stride; the low three bits carry the small-core index on return.
pub const SLOT_STRIDE: u8 = 8;

/// Registry interior. The pipeline guards it with the shared-state mutex;
/// there is no locking here.
pub struct ActiveJobRegistry {
    active: [Option<Arc<AsicJob>>; SLOT_COUNT],
    valid: [bool; SLOT_COUNT],
    next_id: u8,
}

impl ActiveJobRegistry {
    pub fn new() -> Self {
        Self {
            active: std::array::from_fn(|_| None),
            valid: [false; SLOT_COUNT],
            next_id: 0,
        }
    }

    /// Install a job in the next slot and mark it valid.
    ///
    /// Assigns the slot id into the job and returns it alongside the shared
    /// handle. Any prior occupant of the slot is released.
    pub fn install(&mut self, mut job: AsicJob) -> (u8, Arc<AsicJob>) {
        self.next_id = (self.next_id + SLOT_STRIDE) % (SLOT_COUNT as u8);
        let id = self.next_id;

        job.local_job_id = id;
        let job = Arc::new(job);
        self.active[id as usize] = Some(Arc::clone(&job));
        self.valid[id as usize] = true;
        (id, job)
    }

    /// Fetch the job for a returned result.
    ///
    /// Returns `None` unless the slot is marked valid and occupied; results
    /// failing this check must be discarded.
    pub fn lookup(&self, local_job_id: u8) -> Option<Arc<AsicJob>> {
        let index = (local_job_id & 0xF8) as usize;
        if !self.valid[index] {
            return None;
        }
        self.active[index].clone()
    }

    /// Invalidate and release every slot (work abandonment).
    pub fn invalidate_all(&mut self) {
        self.valid = [false; SLOT_COUNT];
        for slot in &mut self.active {
            *slot = None;
        }
    }
}

impl Default for ActiveJobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

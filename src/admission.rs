use std::sync::{Arc, Mutex, MutexGuard};

/// Admission bounds the number of concurrently active sessions.
/// The count is only touched under its mutex, so it stays within
/// `0..=max` however admits and releases interleave
#[derive(Debug)]
pub struct Admission {
    active: Mutex<usize>,
    max: usize,
}

/// Admission implementation block
impl Admission {
    /// new is a constructor for the Admission type
    pub fn new(max: usize) -> Arc<Self> {
        Arc::new(Self {
            active: Mutex::new(0),
            max,
        })
    }

    /// try_admit takes a slot if one is free. The slot is released when the
    /// returned permit is dropped
    pub fn try_admit(self: &Arc<Self>) -> Option<AdmissionPermit> {
        let mut active = self.lock();
        if *active >= self.max {
            return None;
        }
        *active += 1;

        Some(AdmissionPermit {
            admission: Arc::clone(self),
        })
    }

    /// active returns the current number of admitted sessions
    pub fn active(&self) -> usize {
        *self.lock()
    }

    /// max returns the configured ceiling
    pub fn max(&self) -> usize {
        self.max
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        // The counter is a plain integer; a panic while holding the lock
        // cannot leave it half-updated
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// AdmissionPermit holds one admission slot
#[derive(Debug)]
pub struct AdmissionPermit {
    admission: Arc<Admission>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let mut active = self.admission.lock();
        *active = active.saturating_sub(1);
    }
}

//! Handle ownership
//!
//! A [`Claim`] is the set of resources one driver handle owns. Drivers keep
//! one as their first field and check it at the top of every operation, which
//! is what turns use-after-free into a `NotInitialized` error.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use heapless::Vec;
use portable_atomic::{AtomicBool, Ordering};

use crate::hwmgr::{HwManager, HwmgrError, Resource, ResourceType};
use crate::result::{Result, StatusCode};

/// Most resources a single handle can own (block plus pins)
pub const MAX_CLAIM: usize = 10;

/// Resources owned by one handle
pub struct Claim<'a> {
    hw: &'a HwManager,
    resources: Mutex<CriticalSectionRawMutex, RefCell<Vec<Resource, MAX_CLAIM>>>,
    live: AtomicBool,
}

impl<'a> Claim<'a> {
    /// Reserve every resource or none
    ///
    /// On the first conflict the resources already reserved by this call are
    /// released again before the error is returned.
    pub fn acquire(hw: &'a HwManager, resources: &[Resource]) -> Result<Self> {
        if resources.len() > MAX_CLAIM {
            return Err(HwmgrError::InvalidArgument.into());
        }

        let mut held: Vec<Resource, MAX_CLAIM> = Vec::new();
        for &res in resources {
            if let Err(e) = hw.reserve(res) {
                for &r in held.iter() {
                    let _ = hw.free(r);
                }
                return Err(e);
            }
            // Capacity checked above
            let _ = held.push(res);
        }

        Ok(Self {
            hw,
            resources: Mutex::new(RefCell::new(held)),
            live: AtomicBool::new(true),
        })
    }

    /// Claim the first free instance of a type
    pub fn allocate(hw: &'a HwManager, kind: ResourceType) -> Result<Self> {
        let res = hw.allocate(kind)?;
        let mut held = Vec::new();
        let _ = held.push(res);
        Ok(Self {
            hw,
            resources: Mutex::new(RefCell::new(held)),
            live: AtomicBool::new(true),
        })
    }

    /// Fail with `NotInitialized` once the claim has been released
    pub fn check<E: From<StatusCode>>(&self) -> Result<(), E> {
        if self.live.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StatusCode::NotInitialized.into())
        }
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Reserve one more resource for this handle
    pub fn add(&self, res: Resource) -> Result<()> {
        self.check::<HwmgrError>()?;
        self.resources.lock(|held| {
            let mut held = held.borrow_mut();
            if held.is_full() {
                return Err(HwmgrError::InvalidArgument.into());
            }
            self.hw.reserve(res)?;
            let _ = held.push(res);
            Ok(())
        })
    }

    /// Give back one resource, keeping the rest of the claim
    pub fn remove(&self, res: Resource) -> Result<()> {
        self.check::<HwmgrError>()?;
        self.resources.lock(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().position(|&r| r == res) {
                held.remove(pos);
                self.hw.free(res)?;
            }
            Ok(())
        })
    }

    pub fn contains(&self, res: Resource) -> bool {
        self.resources.lock(|held| held.borrow().contains(&res))
    }

    /// First resource in the claim, normally the peripheral block
    pub fn primary(&self) -> Option<Resource> {
        self.resources.lock(|held| held.borrow().first().copied())
    }

    /// Release everything
    ///
    /// Returns `false` if the claim had already been released.
    pub fn release(&self) -> bool {
        if !self.live.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.resources.lock(|held| {
            let mut held = held.borrow_mut();
            for &res in held.iter() {
                let _ = self.hw.free(res);
            }
            held.clear();
        });
        true
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

use core::result::Result;

#[cfg(feature = "stm32f103")]
use stm32f1::stm32f103::FLASH;

/// High-level API for the Flash memory
pub trait Flash
where
    Self: Sized,
{
    /// Check if Flash program and erase controller is locked
    fn is_locked(&self) -> bool;

    /// Check Flash status
    fn status(&self) -> FlashResult;

    /// Unlocks the Flash program and erase controller (FPEC).
    ///
    /// # Panics
    /// Panics if unlock sequence did not unlock the flash
    ///
    /// # Safety
    ///
    unsafe fn unlock(&self);

    /// Lock the Flash program and erase controller (FPEC).
    ///
    /// # Safety
    ///
    unsafe fn lock(&self);

    /// Unlocks the Flash program and erase controller (FPEC).
    /// An RAII guard is returned to allow scoped unlock of the Flash. When the guard goes out of scope,
    /// the Flash will be locked.
    ///
    /// # Note
    /// If flash is unlocked already, unlock sequence is skipped and it Flash is not locked when guard drops.
    ///
    /// # Safety
    ///
    unsafe fn unlock_guard(&self) -> UnlockResult<'_, Self> {
        let locked = self.is_locked();
        if locked {
            self.unlock();
        }
        Ok(UnlockGuard {
            flash: self,
            should_lock: locked,
        })
    }

    /// Read a 32-bit word from a location in the Flash memory. `address` must be aligned to
    /// four bytes.
    fn read_word(&self, address: usize) -> u32;

    /// Erase specified flash page. `address` must be an address of a beginning of the page in
    /// Flash memory.
    ///
    /// # Safety
    ///
    unsafe fn erase_page(&self, address: usize) -> FlashResult;

    /// Program half-word (16-bit) value at a specified address. `address` must be an address of
    /// a location in the Flash memory aligned to two bytes.
    ///
    /// # Safety
    ///
    unsafe fn program_half_word(&self, address: usize, data: u16) -> FlashResult;
}

/// Flash operation error
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashError {
    /// Flash program and erase controller failed to unlock
    UnlockFailed,
    /// Timeout while waiting for the completion of the operation
    Timeout,
    /// Address to be programmed contains a value different from '0xFFFF' before programming
    ProgrammingError,
    /// Programming a write-protected address of the Flash memory
    WriteProtectionError,
    /// Programming and erase controller is busy
    Busy,
}

/// A type alias for the result of a Flash operation.
pub type FlashResult = Result<(), FlashError>;

/// A type alias for the result of a Flash unlock method.
pub type UnlockResult<'a, FlashT> = Result<UnlockGuard<'a, FlashT>, FlashError>;

/// An RAII implementation of a "scoped unlock" of a Flash. When this structure is dropped (falls
/// out of scope), the Flash will be locked.
pub struct UnlockGuard<'a, FlashT: Flash>
where
    FlashT: 'a,
{
    flash: &'a FlashT,
    should_lock: bool,
}

impl<'a, FlashT: Flash> Drop for UnlockGuard<'a, FlashT> {
    fn drop(&mut self) {
        if self.should_lock {
            unsafe {
                self.flash.lock();
            }
        }
    }
}

impl<'a, FlashT: Flash> core::ops::Deref for UnlockGuard<'a, FlashT> {
    type Target = FlashT;

    fn deref(&self) -> &FlashT {
        self.flash
    }
}

// Hardware-mandated FPEC unlock sequence (RM0008)
#[cfg(feature = "stm32f103")]
const UNLOCK_KEYS: [u32; 2] = [0x4567_0123, 0xCDEF_89AB];

// Busy-poll budgets, in loop iterations. A page erase takes orders of
// magnitude longer than a half-word program.
#[cfg(feature = "stm32f103")]
const ERASE_CYCLES: u32 = 0x000B_0000;

#[cfg(feature = "stm32f103")]
const PROGRAM_CYCLES: u32 = 0x0000_2000;

#[cfg(feature = "stm32f103")]
impl Flash for FLASH {
    fn is_locked(&self) -> bool {
        self.cr.read().lock().bit_is_set()
    }

    fn status(&self) -> FlashResult {
        let sr = self.sr.read();
        if sr.bsy().bit_is_set() {
            Err(FlashError::Busy)
        } else if sr.pgerr().bit_is_set() {
            Err(FlashError::ProgrammingError)
        } else if sr.wrprterr().bit_is_set() {
            Err(FlashError::WriteProtectionError)
        } else {
            Ok(())
        }
    }

    fn read_word(&self, address: usize) -> u32 {
        unsafe { core::ptr::read_volatile(address as *const u32) }
    }

    unsafe fn erase_page(&self, address: usize) -> FlashResult {
        run_and_wait(
            self,
            ERASE_CYCLES,
            |flash| {
                flash.cr.modify(|_, w| w.per().set_bit());
                flash.ar.write(|w| w.bits(address as u32));
                flash.cr.modify(|_, w| w.strt().set_bit());
            },
            |flash| flash.cr.modify(|_, w| w.per().clear_bit()),
        )
    }

    unsafe fn program_half_word(&self, address: usize, data: u16) -> FlashResult {
        run_and_wait(
            self,
            PROGRAM_CYCLES,
            |flash| {
                flash.cr.modify(|_, w| w.pg().set_bit());
                // With PG selected, the program is a plain half-word store
                // into the mapped flash
                unsafe { core::ptr::write_volatile(address as *mut u16, data) };
            },
            |flash| flash.cr.modify(|_, w| w.pg().clear_bit()),
        )
    }

    unsafe fn unlock(&self) {
        for key in UNLOCK_KEYS {
            self.keyr.write(|w| w.key().bits(key));
        }
        if self.is_locked() {
            panic!("flash FPEC did not accept the unlock sequence");
        }
    }

    unsafe fn lock(&self) {
        self.cr.modify(|_, w| w.lock().set_bit());
    }
}

/// Drive one FPEC operation to completion: `start` selects the mode bits and
/// triggers the operation, `finish` deselects them again on every exit. The
/// busy poll is bounded by `cycles` iterations; a controller that never goes
/// idle within the budget surfaces [`FlashError::Timeout`].
#[cfg(feature = "stm32f103")]
fn run_and_wait(
    flash: &FLASH,
    cycles: u32,
    start: impl FnOnce(&FLASH),
    finish: impl FnOnce(&FLASH),
) -> FlashResult {
    flash.status()?;
    start(flash);

    let mut remaining = cycles;
    while flash.sr.read().bsy().bit_is_set() {
        remaining = match remaining.checked_sub(1) {
            Some(left) => left,
            None => {
                finish(flash);
                return Err(FlashError::Timeout);
            }
        };
    }
    finish(flash);
    flash.status()
}

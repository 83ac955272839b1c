//! Flash-based EEPROM emulation for the STM32 series microcontrollers.
//! Stores 16-bit values keyed by 8-bit identifiers in two Flash pages.
//!
//! Flash only supports whole-page erases and one-shot half-word programming,
//! so values are written as an append-only log of CRC-protected records: the
//! latest record for an identifier wins. When the active page fills up, the
//! latest record of every identifier is carried over to the other page and
//! the roles swap. Every step of that rotation is expressed as monotonic
//! bit-clearing of the page headers, which lets [`Eeprom::init`] tell exactly
//! how far an interrupted rotation got and finish (or restart) it, so a power
//! loss at any moment leaves the store recoverable.
//!
//! # Examples
//! ```rust
//! use fee::Eeprom;
//! use stm32_flash::sim::FlashSim;
//!
//! let flash = FlashSim::new(0x0800_f800, 1024, 2);
//! let mut eeprom = Eeprom::init(&flash, 0x0800_f800, 1024).expect("failed to init EEPROM");
//! eeprom.write(1, 0xdead).expect("failed to write data to EEPROM");
//! eeprom.write(2, 0xbeef).expect("failed to write data to EEPROM");
//! assert_eq!(Ok(0xdead), eeprom.read(1));
//! assert_eq!(Ok(0xbeef), eeprom.read(2));
//! assert_eq!(Err(fee::Error::NotFound), eeprom.read(3));
//! ```
#![no_std]
#![warn(missing_docs)]
#![deny(warnings)]

#[cfg(test)]
#[macro_use]
extern crate std;


mod crc;
mod page;
mod record;

use core::mem::size_of;

use stm32_flash::flash::{Flash, FlashError, FlashResult};

use crate::page::PageStatus;
use crate::record::{Record, RESERVED_ID};

const VERSION_MAJOR: u32 = 0x01;
const VERSION_MINOR: u32 = 0x03;
const VERSION_PATCH: u32 = 0x01;

// Each slot is one record: 8-bit CRC, 8-bit identifier, 16-bit data
const SLOT_SIZE: usize = size_of::<u32>();

// Default EEPROM (should be defined by the linker script, if feature is enabled)
#[cfg(all(feature = "default-eeprom", feature = "stm32f103"))]
extern "C" {
    #[link_name = "_eeprom_offset"]
    static EEPROM_START: u32;
    #[link_name = "_page_size"]
    static PAGE_SIZE: u32;
}

/// Version of the engine and its on-flash format, packed as
/// `(major << 16) | (minor << 8) | patch`.
pub fn version() -> u32 {
    (VERSION_MAJOR << 16) | (VERSION_MINOR << 8) | VERSION_PATCH
}

/// Errors surfaced by the EEPROM store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// An underlying Flash erase or program operation failed.
    Flash(FlashError),
    /// No record with the requested identifier exists on the active page.
    NotFound,
    /// A record with the identifier exists but fails its CRC check.
    Corrupted {
        /// Data field of the damaged record, handed out for salvage.
        data: u16,
    },
    /// Rejected argument: the reserved identifier `0xFF` on write, or an
    /// unusable page geometry on init.
    InvalidArgument,
    /// No slot accepted the record, even after consolidating to the other
    /// page. The store is at capacity or the flash is worn out.
    TransferExhausted,
}

impl From<FlashError> for Error {
    fn from(error: FlashError) -> Error {
        Error::Flash(error)
    }
}

/// EEPROM controller. Uses two Flash pages for implementing key-value storage
/// for 16-bit data values.
///
/// Created by [`Eeprom::init`], which restores the on-flash structures to a
/// consistent state, and consumed by [`Eeprom::terminate`]. The controller
/// borrows the flash driver for its whole lifetime; serializing calls against
/// other users of the flash controller is the caller's responsibility.
pub struct Eeprom<'a, FlashT: Flash> {
    flash: &'a FlashT,
    start_address: usize,
    page_size: usize,
    active_page_address: usize,
    // Free slots remaining on the active page (32-bit records)
    free_space: usize,
}

impl<'a, FlashT: Flash> Eeprom<'a, FlashT> {
    /// Initialize the store kept in the two pages at `start_address` and
    /// `start_address + page_size`. Restores the pages to a known good state
    /// in case of a status corruption after a power loss, re-running an
    /// interrupted page transfer if one is found, and ends with an active
    /// page that has room for at least one record whenever the set of stored
    /// identifiers allows it.
    ///
    /// `page_size` must be a multiple of 4 of at least 8 bytes.
    pub fn init(
        flash: &'a FlashT,
        start_address: usize,
        page_size: usize,
    ) -> Result<Eeprom<'a, FlashT>, Error> {
        if page_size < 2 * SLOT_SIZE || page_size % SLOT_SIZE != 0 {
            return Err(Error::InvalidArgument);
        }
        debug_assert_eq!(start_address % SLOT_SIZE, 0, "pages must be word-aligned");

        let mut eeprom = Eeprom {
            flash,
            start_address,
            page_size,
            active_page_address: start_address,
            free_space: 0,
        };

        let _unlocked = unsafe { flash.unlock_guard()? };
        eeprom.recover()?;
        Ok(eeprom)
    }

    /// Read the latest value stored for `identifier`.
    ///
    /// A record whose CRC does not match is reported as
    /// [`Error::Corrupted`], with the raw data included so the caller can
    /// decide whether to salvage it.
    pub fn read(&self, identifier: u8) -> Result<u16, Error> {
        self.find_latest(self.active_page_address, identifier)
    }

    /// Write `data` for `identifier`, superseding any earlier value.
    ///
    /// Writing the value that is already stored touches no flash cell. When
    /// the active page is full, live records are first consolidated onto the
    /// sibling page. Every append is verified by reading it back; a slot
    /// that fails verification is abandoned and the next one is tried.
    ///
    /// The identifier `0xFF` is rejected: an erased slot reads back with it.
    pub fn write(&mut self, identifier: u8, data: u16) -> Result<(), Error> {
        if identifier == RESERVED_ID {
            return Err(Error::InvalidArgument);
        }
        if let Ok(stored) = self.read(identifier) {
            if stored == data {
                return Ok(());
            }
        }

        let _unlocked = unsafe { self.flash.unlock_guard()? };

        // Each attempt consumes a slot, so a page worth of attempts means no
        // slot anywhere took the record.
        for _ in 0..self.page_size / SLOT_SIZE {
            if self.free_space == 0 {
                self.transfer()?;
                if self.free_space == 0 {
                    // Every slot of the fresh page is taken by a live record
                    return Err(Error::TransferExhausted);
                }
            }
            // Program status is ignored, the read-back below is the arbiter
            let _ = self.add_record(Record::new(identifier, data));
            if let Ok(stored) = self.find_latest(self.active_page_address, identifier) {
                if stored == data {
                    return Ok(());
                }
            }
        }
        Err(Error::TransferExhausted)
    }

    /// Erase all values stored in the EEPROM, leaving an initialized store
    /// with both pages blank.
    pub fn erase(&mut self) -> Result<(), Error> {
        let _unlocked = unsafe { self.flash.unlock_guard()? };
        self.format()
    }

    /// Shut the store down, consuming the handle. Only page 0 is erased, so
    /// the next [`Eeprom::init`] recognizes the store as fresh without
    /// scanning; call [`Eeprom::erase`] first to also wipe residual records
    /// from page 1.
    pub fn terminate(self) -> Result<(), Error> {
        let _unlocked = unsafe { self.flash.unlock_guard()? };
        unsafe { self.flash.erase_page(self.start_address)? };
        Ok(())
    }

    /// Restore the exactly-one-active-page invariant, whatever combination of
    /// page statuses an interruption left behind.
    fn recover(&mut self) -> Result<(), Error> {
        let page_0 = self.start_address;
        let page_1 = self.start_address + self.page_size;
        let status_0 = self.page_status(page_0);
        let status_1 = self.page_status(page_1);

        use crate::page::PageStatus::{Active, Erased, Receive};
        match (status_0, status_1) {
            (Active, Erased) | (Erased, Active) => {
                let (active, erased) = if status_0 == Active {
                    (page_0, page_1)
                } else {
                    (page_1, page_0)
                };
                self.erase_if_dirty(erased)?;
                self.active_page_address = active;
            }
            (Active, Receive) | (Receive, Active) => {
                // Power was lost before the receive page got promoted: the
                // old page is still active and complete, redo the move.
                self.active_page_address = if status_0 == Active { page_0 } else { page_1 };
                self.transfer()?;
            }
            (Receive, Erased) | (Erased, Receive) => {
                // The old page is gone already, only the promotion is missing
                let (receive, erased) = if status_0 == Receive {
                    (page_0, page_1)
                } else {
                    (page_1, page_0)
                };
                self.erase_if_dirty(erased)?;
                self.set_page_status(receive, Active)?;
                self.active_page_address = receive;
            }
            _ => {
                self.format()?;
            }
        }

        self.free_space = self.free_space_of(self.active_page_address);
        if self.free_space == 0 {
            self.transfer()?;
        }
        Ok(())
    }

    /// Erase whatever the two pages hold and start over with page 0 active.
    fn format(&mut self) -> Result<(), Error> {
        for page in 0..2 {
            self.erase_if_dirty(self.start_address + page * self.page_size)?;
        }
        self.set_page_status(self.start_address, PageStatus::Active)?;
        self.active_page_address = self.start_address;
        self.free_space = self.page_size / SLOT_SIZE - 1;
        Ok(())
    }

    /// Move the latest record of every identifier from the active page to the
    /// sibling page, then swap the roles. Safe to re-run after an
    /// interruption at any point: records are visited in a deterministic
    /// order, and a copy that already sits in its slot verifies clean and is
    /// simply skipped over.
    fn transfer(&mut self) -> Result<(), Error> {
        let (old_page, new_page) = if self.active_page_address == self.start_address {
            (self.start_address, self.start_address + self.page_size)
        } else {
            (self.start_address + self.page_size, self.start_address)
        };

        if self.page_status(new_page) != PageStatus::Receive {
            self.set_page_status(new_page, PageStatus::Receive)?;
        }

        let mut seen = IdSet::new();
        let mut to_address = new_page + SLOT_SIZE;
        let new_page_end = new_page + self.page_size;
        let mut from_address = old_page + self.page_size - SLOT_SIZE;

        while from_address > old_page {
            let record = Record::from_word(self.flash.read_word(from_address));
            // 0xFF doubles as the identifier of an erased slot, never move it
            if record.id() != RESERVED_ID && seen.insert(record.id()) {
                // The CRC is not re-checked here: the record is moved as
                // found, a damaged one stays visible to the caller instead
                // of silently disappearing.
                loop {
                    if to_address >= new_page_end {
                        return Err(Error::TransferExhausted);
                    }
                    let _ = unsafe { self.flash.program_half_word(to_address + 2, record.high()) };
                    let _ = unsafe { self.flash.program_half_word(to_address, record.low()) };
                    let stored = self.flash.read_word(to_address);
                    to_address += SLOT_SIZE;
                    if stored == record.word() {
                        break;
                    }
                }
            }
            from_address -= SLOT_SIZE;
        }

        self.erase_if_dirty(old_page)?;
        self.set_page_status(new_page, PageStatus::Active)?;

        self.active_page_address = new_page;
        self.free_space = self.free_space_of(new_page);
        Ok(())
    }

    /// Scan `page_address` from the newest record down for `identifier`.
    fn find_latest(&self, page_address: usize, identifier: u8) -> Result<u16, Error> {
        let mut address = page_address + self.page_size - SLOT_SIZE;
        while address > page_address {
            let record = Record::from_word(self.flash.read_word(address));
            if record.id() == identifier {
                return if record.verify() {
                    Ok(record.data())
                } else {
                    Err(Error::Corrupted {
                        data: record.data(),
                    })
                };
            }
            address -= SLOT_SIZE;
        }
        Err(Error::NotFound)
    }

    // Free slots on a page, counted from the first erased slot upward. Both
    // callers hand in a page whose header is already programmed, so the scan
    // walks the data slots and never reports more than total_slots - 1. A
    // slot a failed program left half-written reads as used; the read-back
    // loops reclaim nothing and simply move past it.
    fn free_space_of(&self, page_address: usize) -> usize {
        let total_slots = self.page_size / SLOT_SIZE;
        for slot in 0..total_slots {
            let word = self.flash.read_word(page_address + slot * SLOT_SIZE);
            if Record::from_word(word).is_erased() {
                return total_slots - slot;
            }
        }
        0
    }

    /// Program a record into the next free slot of the active page. The data
    /// half goes first: an append torn between the two programs leaves a
    /// slot without an identifier instead of an identifier pointing at
    /// garbage, so the previous value stays reachable.
    fn add_record(&mut self, record: Record) -> FlashResult {
        debug_assert!(self.free_space > 0, "no free slot on the active page");
        let address = self.active_page_address + self.page_size - SLOT_SIZE * self.free_space;
        self.free_space -= 1;
        unsafe {
            self.flash.program_half_word(address + 2, record.high())?;
            self.flash.program_half_word(address, record.low())
        }
    }

    fn page_status(&self, page_address: usize) -> PageStatus {
        PageStatus::from_header(self.flash.read_word(page_address))
    }

    // A status advances by programming a single half-word, receive clears
    // the low one and active the high one, so receive -> active needs no
    // intermediate erase.
    fn set_page_status(&self, page_address: usize, status: PageStatus) -> Result<(), Error> {
        let result = match status {
            PageStatus::Receive => unsafe { self.flash.program_half_word(page_address, 0x0000) },
            PageStatus::Active => unsafe { self.flash.program_half_word(page_address + 2, 0x0000) },
            _ => unreachable!("pages are only ever marked receive or active"),
        };
        result.map_err(Error::from)
    }

    fn erase_if_dirty(&self, page_address: usize) -> Result<(), Error> {
        if self.is_page_dirty(page_address) {
            unsafe { self.flash.erase_page(page_address)? };
            debug_assert!(!self.is_page_dirty(page_address));
        }
        Ok(())
    }

    fn is_page_dirty(&self, page_address: usize) -> bool {
        (0..self.page_size / SLOT_SIZE).any(|slot| {
            let word = self.flash.read_word(page_address + slot * SLOT_SIZE);
            !Record::from_word(word).is_erased()
        })
    }
}

#[cfg(all(feature = "default-eeprom", feature = "stm32f103"))]
impl<'a> Eeprom<'a, stm32f1::stm32f103::FLASH> {
    /// Initialize the default EEPROM store. Uses variables defined by the
    /// linker script to determine the EEPROM location:
    ///
    /// * `_eeprom_offset` should be an address of the first page
    /// * `_page_size` should be the FLASH page size (in bytes)
    pub fn new_default(
        flash: &'a stm32f1::stm32f103::FLASH,
    ) -> Result<Eeprom<'a, stm32f1::stm32f103::FLASH>, Error> {
        let start_address = unsafe { &EEPROM_START } as *const u32 as usize;
        let page_size = unsafe { &PAGE_SIZE } as *const u32 as usize;
        Eeprom::init(flash, start_address, page_size)
    }
}

// Presence bitmap over the 256 identifiers, used while consolidating
struct IdSet {
    bits: [u32; 8],
}

impl IdSet {
    fn new() -> IdSet {
        IdSet { bits: [0; 8] }
    }

    /// Mark `id` as present; `true` if it was absent before.
    fn insert(&mut self, id: u8) -> bool {
        let index = usize::from(id >> 5);
        let mask = 1u32 << (id & 31);
        let fresh = self.bits[index] & mask == 0;
        self.bits[index] |= mask;
        fresh
    }
}

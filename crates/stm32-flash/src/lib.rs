//! Flash memory access layer for STM32 devices on top of STM32 device crates (`stm32f103`)
#![no_std]
#![warn(missing_docs)]
#![deny(warnings)]

#[cfg(feature = "sim")]
extern crate std;

/// Higher-level API for the Flash memory controller.
///
/// # Examples
///
/// Erasing a flash memory page and writing some data to it:
///
/// ```rust,no_run
/// use stm32_flash::flash::Flash;
///
/// fn persist<F: Flash>(flash: &F) {
///     unsafe {
///         let flash = flash.unlock_guard().unwrap(); // Unlock Flash for writing
///         flash.erase_page(0x800_fc00).unwrap(); // last 1K page on a chip with 64K flash memory
///         flash.program_half_word(0x800_fc00, 0xcafe).unwrap();
///         flash.program_half_word(0x800_fc02, 0xbabe).unwrap();
///     }
/// }
/// ```
pub mod flash;

/// RAM-backed flash simulator honoring the erase-to-ones / program-clears-bits
/// constraints of the real device. Used by unit tests of crates built on top
/// of the [`flash::Flash`] trait.
#[cfg(feature = "sim")]
pub mod sim;

//! `getrandom` backend for bare-metal targets.
//!
//! The station draws random bytes for its device address, for connection
//! addresses and for the reply slot of a discovery. [`OsRandom`] gets them
//! from `getrandom`, which has no entropy source on `target_os = "none"`.
//!
//! # Feature Flag: `unsafe-rng`
//!
//! - **With `unsafe-rng`**: a xorshift generator is registered. Stations that
//!   power up together draw the same addresses unless each one is seeded
//!   with [`init_prng_seed`] first.
//! - **Without `unsafe-rng`**: the application registers its own backend,
//!   usually the MCU's hardware RNG.
//!
//! # Example: hardware RNG
//!
//! ```ignore
//! fn hardware_rng(buf: &mut [u8]) -> Result<(), getrandom::Error> {
//!     critical_section::with(|cs| match RNG.borrow_ref_mut(cs).as_mut() {
//!         Some(rng) => {
//!             rng.fill_bytes(buf);
//!             Ok(())
//!         }
//!         None => Err(getrandom::Error::UNAVAILABLE),
//!     })
//! }
//!
//! getrandom::register_custom_getrandom!(hardware_rng);
//! ```
//!
//! [`OsRandom`]: crate::hal::OsRandom

#![cfg(all(target_arch = "arm", target_os = "none"))]

#[cfg(feature = "unsafe-rng")]
use core::sync::atomic::{AtomicU32, Ordering};

#[cfg(feature = "unsafe-rng")]
static PRNG_STATE: AtomicU32 = AtomicU32::new(0x1A5E_12DA);

/// Xorshift32 generator. Good enough to spread device addresses and reply
/// slots, nothing more.
#[cfg(feature = "unsafe-rng")]
pub fn prng_fill(buf: &mut [u8]) -> Result<(), getrandom::Error> {
    for chunk in buf.chunks_mut(4) {
        let mut state = PRNG_STATE.load(Ordering::Relaxed);
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        PRNG_STATE.store(state, Ordering::Relaxed);
        chunk.copy_from_slice(&state.to_le_bytes()[..chunk.len()]);
    }
    Ok(())
}

#[cfg(feature = "unsafe-rng")]
getrandom::register_custom_getrandom!(prng_fill);

/// Seeds the generator, typically with the chip's unique id so stations pick
/// different addresses. A zero seed would stall xorshift and is replaced.
///
/// ```ignore
/// irlap::getrandom_impl::init_prng_seed(read_unique_device_id());
/// ```
#[cfg(feature = "unsafe-rng")]
pub fn init_prng_seed(seed: u32) {
    let seed = if seed == 0 { 0x1A5E_12DA } else { seed };
    PRNG_STATE.store(seed, Ordering::Relaxed);
}

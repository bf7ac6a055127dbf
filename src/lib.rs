//! Manual mapper for 64-bit Windows PE images.
//!
//! [`PeImage`] parses and validates a PE file in its on-disk layout;
//! [`load`] materialises it in the current process the way the system
//! loader would — section layout, import resolution, base relocation,
//! section protection, and TLS callbacks — yielding a [`Module`] whose
//! code can run and whose exports can be located.

use cfg_if::cfg_if;

pub mod error;
mod mem;
pub mod pe;

cfg_if! {
    if #[cfg(all(target_arch = "x86_64", target_os = "windows"))] {
        mod export;
        mod loader;

        pub use loader::{load, Module};
    }
}

pub use error::{LoadError, PeError};
pub use pe::PeImage;

#[cfg(test)]
pub(crate) mod testpe;

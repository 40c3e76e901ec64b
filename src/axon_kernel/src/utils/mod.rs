//! Utility
//!
//! **This module is exempt from the API stability guarantee** unless specified
//! otherwise. It's exposed because the configuration macros need it.
mod aligned_storage;
mod init;
pub(crate) mod intrusive_list;
mod prio_bitmap;
mod rawcell;

pub use self::{aligned_storage::*, init::*, prio_bitmap::*, rawcell::*};

/// Unwrap a `Result` whose error type is uninhabited.
pub(crate) trait UnwrapInfallible {
    type Ok;

    fn unwrap_infallible(self) -> Self::Ok;
}

impl<T> UnwrapInfallible for Result<T, core::convert::Infallible> {
    type Ok = T;

    #[inline]
    fn unwrap_infallible(self) -> T {
        match self {
            Ok(x) => x,
            Err(e) => match e {},
        }
    }
}

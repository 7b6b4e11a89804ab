//! Persistent store contract and the mount recovery protocol.
//!
//! A [`Store`] is a tiny append-only filesystem: named files that can be
//! created, appended to and read back. Nothing may be opened until the store
//! has gone through [`mount_or_format`], which is the only code path allowed to
//! destroy existing data.

use core::fmt::Debug;

use crate::fmt::Dbg;

/// Append-only named-file storage.
pub trait Store {
    type Error: Debug;
    /// An open file, positioned for appending.
    type File;

    /// Attach to existing contents.
    fn mount(&mut self) -> Result<(), Self::Error>;

    /// Erase everything and lay down an empty filesystem.
    fn format(&mut self) -> Result<(), Self::Error>;

    /// Open a file for appending, creating it if it does not exist.
    fn open(&mut self, name: &str) -> Result<Self::File, Self::Error>;

    /// Current length of a file in bytes.
    fn len(&mut self, file: &Self::File) -> Result<usize, Self::Error>;

    /// Read up to `buf.len()` bytes starting at `offset`. Returns the number
    /// of bytes read, which is zero at or past the end.
    fn read(
        &mut self,
        file: &Self::File,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<usize, Self::Error>;

    /// Append `data` to the end of the file.
    fn append(&mut self, file: &mut Self::File, data: &[u8]) -> Result<(), Self::Error>;

    /// Flush and release a file.
    fn close(&mut self, file: Self::File) -> Result<(), Self::Error>;
}

/// The mount and its recovery both failed. Nothing durable can be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MountError<E> {
    /// Formatting after the first failed mount failed.
    Format(E),
    /// The store still would not mount after a fresh format.
    Remount(E),
}

/// A store that has been mounted this boot.
///
/// Only [`mount_or_format`] produces one, so holding a `Mounted` proves the
/// recovery protocol already ran.
pub struct Mounted<'s, S: Store> {
    store: &'s mut S,
    reformatted: bool,
}

impl<'s, S: Store> Mounted<'s, S> {
    /// True if the previous contents were lost to a reformat.
    pub const fn reformatted(&self) -> bool {
        self.reformatted
    }

    pub fn store(&mut self) -> &mut S {
        self.store
    }

    pub fn into_inner(self) -> &'s mut S {
        self.store
    }

    /// A shorter-lived witness for the same mount.
    pub fn reborrow(&mut self) -> Mounted<'_, S> {
        Mounted {
            store: &mut *self.store,
            reformatted: self.reformatted,
        }
    }
}

/// Mount the store, formatting and mounting once more if the first attempt
/// fails. Never formats more than once and never retries beyond that.
pub fn mount_or_format<S: Store>(store: &mut S) -> Result<Mounted<'_, S>, MountError<S::Error>> {
    match store.mount() {
        Ok(()) => {
            info!("store mounted");
            return Ok(Mounted {
                store,
                reformatted: false,
            });
        }
        Err(e) => warn!("mount failed: {:?}, formatting", Dbg(&e)),
    }

    store.format().map_err(|e| {
        error!("format failed: {:?}", Dbg(&e));
        MountError::Format(e)
    })?;

    store.mount().map_err(|e| {
        error!("mount after format failed: {:?}", Dbg(&e));
        MountError::Remount(e)
    })?;

    info!("store formatted and mounted");
    Ok(Mounted {
        store,
        reformatted: true,
    })
}

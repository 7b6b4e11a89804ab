//! Minimal append-only log store on NOR flash.
//!
//! Layout:
//!
//! ```text
//! sector 0        superblock: magic, then MAX_LOGS table entries
//! sector 1..      one region of LOG_REGION_SECTORS per table slot
//! ```
//!
//! A table entry is a zero-padded name (`0xFF` in the first byte marks the
//! slot unused), the region's first sector and its sector count, both u16
//! little endian. Log data is text and never contains `0xFF`, so a log ends at
//! the first erased byte of its region.

use crate::{
    config::{
        FLASH_SECTOR_SIZE,
        LOG_REGION_SECTORS,
        MAX_LOG_NAME,
        MAX_LOGS,
    },
    flash::BlockDevice,
    store::Store,
};

const MAGIC: [u8; 8] = *b"SNLOGv01";
const ENTRY_LEN: usize = MAX_LOG_NAME + 4;
const TABLE_OFFSET: u32 = MAGIC.len() as u32;
const ERASED: u8 = 0xFF;
const REGION_LEN: u32 = LOG_REGION_SECTORS as u32 * FLASH_SECTOR_SIZE as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FsError<E> {
    Flash(E),
    /// Blank superblock.
    NotFormatted,
    /// Superblock or table entry that this layout could not have produced.
    Corrupt,
    /// Used before a successful mount.
    NotMounted,
    /// The log region is full, or the device has no room for another region.
    NoSpace,
    TooManyLogs,
    /// The log is already open.
    Busy,
    /// Empty, too long, or containing NUL or `0xFF`.
    BadName,
    /// Data contains the erased byte value.
    InvalidData,
}

impl<E> From<E> for FsError<E> {
    fn from(e: E) -> Self {
        Self::Flash(e)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct Entry {
    name: [u8; MAX_LOG_NAME],
    start: u16,
    sectors: u16,
}

impl Entry {
    fn for_slot(slot: usize, name: &[u8]) -> Self {
        let mut padded = [0u8; MAX_LOG_NAME];
        padded[..name.len()].copy_from_slice(name);
        Self {
            name: padded,
            start: region_start(slot),
            sectors: LOG_REGION_SECTORS,
        }
    }

    fn encode(&self) -> [u8; ENTRY_LEN] {
        let mut raw = [0u8; ENTRY_LEN];
        raw[..MAX_LOG_NAME].copy_from_slice(&self.name);
        raw[MAX_LOG_NAME..MAX_LOG_NAME + 2].copy_from_slice(&self.start.to_le_bytes());
        raw[MAX_LOG_NAME + 2..].copy_from_slice(&self.sectors.to_le_bytes());
        raw
    }

    /// `Ok(None)` for an unused slot.
    fn decode(slot: usize, raw: &[u8; ENTRY_LEN]) -> Result<Option<Self>, ()> {
        if raw[0] == ERASED {
            return if raw.iter().all(|&b| b == ERASED) {
                Ok(None)
            } else {
                Err(())
            };
        }

        let mut name = [0u8; MAX_LOG_NAME];
        name.copy_from_slice(&raw[..MAX_LOG_NAME]);
        let entry = Self {
            name,
            start: u16::from_le_bytes([raw[MAX_LOG_NAME], raw[MAX_LOG_NAME + 1]]),
            sectors: u16::from_le_bytes([raw[MAX_LOG_NAME + 2], raw[MAX_LOG_NAME + 3]]),
        };

        let padded = &entry.name[entry.name().len()..];
        let name_ok = valid_name(entry.name()) && padded.iter().all(|&b| b == 0);
        let placed_ok =
            entry.start == region_start(slot) && entry.sectors == LOG_REGION_SECTORS;
        if name_ok && placed_ok {
            Ok(Some(entry))
        } else {
            Err(())
        }
    }

    fn name(&self) -> &[u8] {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(MAX_LOG_NAME);
        &self.name[..len]
    }

    fn base(&self) -> u32 {
        u32::from(self.start) * FLASH_SECTOR_SIZE as u32
    }
}

const fn region_start(slot: usize) -> u16 {
    1 + slot as u16 * LOG_REGION_SECTORS
}

fn valid_name(name: &[u8]) -> bool {
    !name.is_empty()
        && name.len() <= MAX_LOG_NAME
        && !name.iter().any(|&b| b == 0 || b == ERASED)
}

fn entry_addr(slot: usize) -> u32 {
    TABLE_OFFSET + (slot * ENTRY_LEN) as u32
}

/// An open log on a [`FlashStore`].
#[derive(Debug)]
pub struct FlashFile {
    slot: u8,
    len: u32,
}

/// Log store over any [`BlockDevice`].
///
/// A log has at most one open [`FlashFile`] at a time, since each handle
/// tracks its own end of the log.
pub struct FlashStore<D> {
    device: D,
    table: Option<[Option<Entry>; MAX_LOGS]>,
    /// One bit per table slot with a live handle.
    open: u8,
}

impl<D: BlockDevice> FlashStore<D> {
    pub const fn new(device: D) -> Self {
        Self {
            device,
            table: None,
            open: 0,
        }
    }

    pub fn into_inner(self) -> D {
        self.device
    }

    /// Table slots whose regions fit on the device.
    fn usable_slots(&self) -> usize {
        let sectors = self.device.capacity() / FLASH_SECTOR_SIZE as u32;
        let regions = sectors.saturating_sub(1) / u32::from(LOG_REGION_SECTORS);
        (regions as usize).min(MAX_LOGS)
    }

    fn table(&self) -> Result<&[Option<Entry>; MAX_LOGS], FsError<D::Error>> {
        self.table.as_ref().ok_or(FsError::NotMounted)
    }

    fn entry(&self, slot: u8) -> Result<Entry, FsError<D::Error>> {
        self.table()?[usize::from(slot)].ok_or(FsError::Corrupt)
    }

    fn create(&mut self, name: &[u8]) -> Result<usize, FsError<D::Error>> {
        let usable = self.usable_slots();
        let table = self.table()?;
        let slot = table
            .iter()
            .position(Option::is_none)
            .ok_or(FsError::TooManyLogs)?;
        if slot >= usable {
            return Err(FsError::NoSpace);
        }

        let entry = Entry::for_slot(slot, name);
        for sector in 0..u32::from(entry.sectors) {
            self.device
                .erase_sector(entry.base() + sector * FLASH_SECTOR_SIZE as u32)?;
        }
        self.device.program(entry_addr(slot), &entry.encode())?;

        if let Some(table) = self.table.as_mut() {
            table[slot] = Some(entry);
        }
        info!("created log in slot {}", slot);
        Ok(slot)
    }

    /// Offset of the first erased byte in the region.
    fn find_end(&mut self, entry: &Entry) -> Result<u32, FsError<D::Error>> {
        let base = entry.base();
        let (mut lo, mut hi) = (0, REGION_LEN);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let mut byte = [0u8];
            self.device.read(base + mid, &mut byte)?;
            if byte[0] == ERASED {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        Ok(lo)
    }
}

impl<D: BlockDevice> Store for FlashStore<D> {
    type Error = FsError<D::Error>;
    type File = FlashFile;

    fn mount(&mut self) -> Result<(), Self::Error> {
        self.table = None;
        self.open = 0;

        let mut magic = [0u8; MAGIC.len()];
        self.device.read(0, &mut magic)?;
        if magic == [ERASED; MAGIC.len()] {
            return Err(FsError::NotFormatted);
        }
        if magic != MAGIC {
            return Err(FsError::Corrupt);
        }

        let mut table = [None; MAX_LOGS];
        for (slot, entry) in table.iter_mut().enumerate() {
            let mut raw = [0u8; ENTRY_LEN];
            self.device.read(entry_addr(slot), &mut raw)?;
            *entry = Entry::decode(slot, &raw).map_err(|()| FsError::Corrupt)?;
        }
        if table[self.usable_slots()..].iter().any(Option::is_some) {
            return Err(FsError::Corrupt);
        }

        let logs = table.iter().flatten().count();
        debug!("mounted flash store with {} logs", logs);
        self.table = Some(table);
        Ok(())
    }

    fn format(&mut self) -> Result<(), Self::Error> {
        self.table = None;
        self.open = 0;
        if self.usable_slots() == 0 {
            return Err(FsError::NoSpace);
        }
        // Regions are erased when their log is created.
        self.device.erase_sector(0)?;
        self.device.program(0, &MAGIC)?;
        info!("flash store formatted");
        Ok(())
    }

    fn open(&mut self, name: &str) -> Result<FlashFile, Self::Error> {
        let name = name.as_bytes();
        if !valid_name(name) {
            return Err(FsError::BadName);
        }

        let existing = self
            .table()?
            .iter()
            .position(|e| e.is_some_and(|e| e.name() == name));
        let slot = match existing {
            Some(slot) => slot,
            None => self.create(name)?,
        };

        let slot = slot as u8;
        if self.open & (1 << slot) != 0 {
            return Err(FsError::Busy);
        }
        let entry = self.entry(slot)?;
        let len = self.find_end(&entry)?;
        self.open |= 1 << slot;
        Ok(FlashFile { slot, len })
    }

    fn len(&mut self, file: &FlashFile) -> Result<usize, Self::Error> {
        Ok(file.len as usize)
    }

    fn read(
        &mut self,
        file: &FlashFile,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<usize, Self::Error> {
        let entry = self.entry(file.slot)?;
        let end = file.len as usize;
        if offset >= end {
            return Ok(0);
        }
        let n = buf.len().min(end - offset);
        self.device.read(entry.base() + offset as u32, &mut buf[..n])?;
        Ok(n)
    }

    fn append(&mut self, file: &mut FlashFile, data: &[u8]) -> Result<(), Self::Error> {
        if data.contains(&ERASED) {
            return Err(FsError::InvalidData);
        }
        let entry = self.entry(file.slot)?;
        let end = file.len as usize + data.len();
        if end > REGION_LEN as usize {
            return Err(FsError::NoSpace);
        }
        self.device.program(entry.base() + file.len, data)?;
        file.len = end as u32;
        Ok(())
    }

    fn close(&mut self, file: FlashFile) -> Result<(), Self::Error> {
        // Programs complete before `append` returns; nothing is buffered.
        self.entry(file.slot)?;
        self.open &= !(1 << file.slot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ramflash::RamFlash,
        store::mount_or_format,
    };

    const SECTORS: usize = 1 + 3 * LOG_REGION_SECTORS as usize;

    fn erased() -> Vec<u8> {
        vec![ERASED; SECTORS * FLASH_SECTOR_SIZE]
    }

    fn read_all(store: &mut FlashStore<RamFlash<'_>>, file: &FlashFile) -> Vec<u8> {
        let len = store.len(file).unwrap();
        let mut out = vec![0u8; len];
        assert_eq!(store.read(file, 0, &mut out), Ok(len));
        out
    }

    #[test]
    fn blank_flash_needs_formatting() {
        let mut mem = erased();
        let mut store = FlashStore::new(RamFlash::new(&mut mem));
        assert_eq!(store.mount(), Err(FsError::NotFormatted));
        assert_eq!(store.open("light").map(|_| ()), Err(FsError::NotMounted));
    }

    #[test]
    fn garbage_is_corrupt_and_recovers_with_one_format() {
        let mut mem = vec![0x5A; SECTORS * FLASH_SECTOR_SIZE];
        let mut store = FlashStore::new(RamFlash::new(&mut mem));
        let mounted = mount_or_format(&mut store).unwrap();
        assert!(mounted.reformatted());
        // Superblock only.
        assert_eq!(store.into_inner().erases(), 1);
    }

    #[test]
    fn appends_survive_a_remount() {
        let mut mem = erased();
        {
            let mut store = FlashStore::new(RamFlash::new(&mut mem));
            store.format().unwrap();
            store.mount().unwrap();
            let mut file = store.open("temperature").unwrap();
            store.append(&mut file, b"header\r\n").unwrap();
            store.append(&mut file, b"1,2\r\n").unwrap();
            store.close(file).unwrap();
        }

        let mut store = FlashStore::new(RamFlash::new(&mut mem));
        store.mount().unwrap();
        let mut file = store.open("temperature").unwrap();
        assert_eq!(store.len(&file), Ok(13));
        store.append(&mut file, b"3,4\r\n").unwrap();
        assert_eq!(read_all(&mut store, &file), b"header\r\n1,2\r\n3,4\r\n");
    }

    #[test]
    fn logs_get_separate_regions() {
        let mut mem = erased();
        let mut store = FlashStore::new(RamFlash::new(&mut mem));
        store.format().unwrap();
        store.mount().unwrap();

        let mut a = store.open("pressure").unwrap();
        let mut b = store.open("light").unwrap();
        store.append(&mut a, b"aaa").unwrap();
        store.append(&mut b, b"bb").unwrap();
        store.append(&mut a, b"A").unwrap();

        assert_eq!(read_all(&mut store, &a), b"aaaA");
        assert_eq!(read_all(&mut store, &b), b"bb");

        // Reopening finds the same log rather than creating another.
        store.close(a).unwrap();
        let again = store.open("pressure").unwrap();
        assert_eq!(read_all(&mut store, &again), b"aaaA");
    }

    #[test]
    fn capacity_limits_are_reported() {
        let mut mem = erased();
        let mut store = FlashStore::new(RamFlash::new(&mut mem));
        store.format().unwrap();
        store.mount().unwrap();

        for name in ["a", "b", "c"] {
            let file = store.open(name).unwrap();
            store.close(file).unwrap();
        }
        // Only three regions fit on this device.
        assert_eq!(store.open("d").map(|_| ()), Err(FsError::NoSpace));

        let mut file = store.open("a").unwrap();
        let block = [b'x'; FLASH_SECTOR_SIZE];
        for _ in 0..LOG_REGION_SECTORS {
            store.append(&mut file, &block).unwrap();
        }
        assert_eq!(store.append(&mut file, b"y"), Err(FsError::NoSpace));
        assert_eq!(store.len(&file), Ok(REGION_LEN as usize));
    }

    #[test]
    fn rejects_bad_names_and_erased_bytes() {
        let mut mem = erased();
        let mut store = FlashStore::new(RamFlash::new(&mut mem));
        store.format().unwrap();
        store.mount().unwrap();

        assert_eq!(store.open("").map(|_| ()), Err(FsError::BadName));
        assert_eq!(
            store.open("a-name-longer-than-16").map(|_| ()),
            Err(FsError::BadName)
        );
        let mut file = store.open("audio-peak").unwrap();
        assert_eq!(store.append(&mut file, &[b'1', 0xFF]), Err(FsError::InvalidData));
        assert_eq!(store.len(&file), Ok(0));
    }

    #[test]
    fn second_handle_on_an_open_log_is_refused() {
        let mut mem = erased();
        let mut store = FlashStore::new(RamFlash::new(&mut mem));
        store.format().unwrap();
        store.mount().unwrap();

        let mut first = store.open("light").unwrap();
        assert_eq!(store.open("light").map(|_| ()), Err(FsError::Busy));
        store.append(&mut first, b"12,34\r\n").unwrap();
        store.close(first).unwrap();

        let mut second = store.open("light").unwrap();
        store.append(&mut second, b"56,78\r\n").unwrap();
        assert_eq!(read_all(&mut store, &second), b"12,34\r\n56,78\r\n");

        // A remount forgets handles from before it.
        store.mount().unwrap();
        assert!(store.open("light").is_ok());
    }

    #[test]
    fn misplaced_table_entry_is_corrupt() {
        let mut mem = erased();
        {
            let mut store = FlashStore::new(RamFlash::new(&mut mem));
            store.format().unwrap();
        }
        // Hand-craft an entry pointing slot 0 at slot 1's region.
        let mut entry = Entry::for_slot(1, b"light").encode();
        let addr = entry_addr(0) as usize;
        mem[addr..addr + ENTRY_LEN].copy_from_slice(&entry);
        let mut store = FlashStore::new(RamFlash::new(&mut mem));
        assert_eq!(store.mount(), Err(FsError::Corrupt));

        entry = Entry::for_slot(0, b"light").encode();
        drop(store);
        mem[addr..addr + ENTRY_LEN].copy_from_slice(&entry);
        let mut store = FlashStore::new(RamFlash::new(&mut mem));
        assert_eq!(store.mount(), Ok(()));
    }
}

//! Append-only measurement logs.
//!
//! Each metric gets its own named log on the store. A log starts with one
//! header line and then holds one `<value>,<timestamp>\r\n` line per
//! acquisition pass.

use crate::{
    fmt::Dbg,
    store::{
        Mounted,
        Store,
    },
    timestamp::{
        self,
        MAX_DIGITS,
    },
};

/// Longest record line: two 20-character fields, a comma and CRLF.
pub const MAX_RECORD_LEN: usize = 2 * MAX_DIGITS + 3;

const LINE_END: &[u8] = b"\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LogError<E> {
    Store(E),
    /// The log holds data that does not start with the expected header.
    HeaderMismatch,
}

impl<E> From<E> for LogError<E> {
    fn from(e: E) -> Self {
        Self::Store(e)
    }
}

/// What [`LogWriter::ensure_header`] found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HeaderStatus {
    /// The log was empty and the header has just been appended.
    Written,
    /// The log already starts with the header.
    Present,
    /// The log held a cut-off start of the header and the rest was appended.
    Completed,
}

/// An open log, positioned for appending.
pub struct LogHandle<F> {
    file: F,
    name: &'static str,
}

impl<F> LogHandle<F> {
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

/// One rendered record line.
#[derive(Clone, Copy)]
pub struct Record {
    buf: [u8; MAX_RECORD_LEN],
    len: usize,
}

impl Record {
    pub fn new(value: i64, timestamp_secs: u64) -> Self {
        let mut record = Self {
            buf: [0; MAX_RECORD_LEN],
            len: 0,
        };
        record.push(timestamp::encode_signed(value).as_bytes());
        record.push(b",");
        record.push(timestamp::encode(timestamp_secs).as_bytes());
        record.push(LINE_END);
        record
    }

    fn push(&mut self, bytes: &[u8]) {
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

/// Writes records to logs on a mounted store.
pub struct LogWriter<'s, S: Store> {
    store: Mounted<'s, S>,
}

impl<'s, S: Store> LogWriter<'s, S> {
    pub fn new(store: Mounted<'s, S>) -> Self {
        Self { store }
    }

    /// True if the store lost its contents to a reformat this boot.
    pub const fn reformatted(&self) -> bool {
        self.store.reformatted()
    }

    /// Open a log for appending, creating it if absent.
    pub fn open_or_create(
        &mut self,
        name: &'static str,
    ) -> Result<LogHandle<S::File>, LogError<S::Error>> {
        let file = self.store.store().open(name)?;
        debug!("opened log {}", name);
        Ok(LogHandle { file, name })
    }

    /// Make sure the log starts with `header`.
    ///
    /// An empty log gets the header appended. A log that already starts with
    /// it is left alone, so calling this on every boot writes the header once.
    /// A log holding only the first part of the header, as left by an
    /// interrupted header write, gets the remainder appended. Anything else is
    /// left untouched and reported as [`LogError::HeaderMismatch`].
    pub fn ensure_header(
        &mut self,
        log: &mut LogHandle<S::File>,
        header: &str,
    ) -> Result<HeaderStatus, LogError<S::Error>> {
        let store = self.store.store();
        let len = store.len(&log.file)?;

        if len == 0 {
            store.append(&mut log.file, header.as_bytes())?;
            info!("{}: header written", log.name);
            return Ok(HeaderStatus::Written);
        }

        let header = header.as_bytes();
        if len >= header.len() {
            if self.starts_with(log, header)? {
                debug!("{}: header present", log.name);
                return Ok(HeaderStatus::Present);
            }
        } else if self.starts_with(log, &header[..len])? {
            self.store.store().append(&mut log.file, &header[len..])?;
            warn!("{}: completed a truncated header", log.name);
            return Ok(HeaderStatus::Completed);
        }

        warn!("{}: existing data does not start with the header", log.name);
        Err(LogError::HeaderMismatch)
    }

    fn starts_with(
        &mut self,
        log: &LogHandle<S::File>,
        expected: &[u8],
    ) -> Result<bool, LogError<S::Error>> {
        let store = self.store.store();
        let mut chunk = [0u8; 32];
        let mut offset = 0;
        while offset < expected.len() {
            let want = (expected.len() - offset).min(chunk.len());
            let got = store.read(&log.file, offset, &mut chunk[..want])?;
            if got == 0 || chunk[..got] != expected[offset..offset + got] {
                return Ok(false);
            }
            offset += got;
        }
        Ok(true)
    }

    /// Append one `<value>,<timestamp>\r\n` line in a single write.
    pub fn append_record(
        &mut self,
        log: &mut LogHandle<S::File>,
        value: i64,
        timestamp_secs: u64,
    ) -> Result<(), LogError<S::Error>> {
        let record = Record::new(value, timestamp_secs);
        self.store
            .store()
            .append(&mut log.file, record.as_bytes())
            .map_err(|e| {
                error!("{}: append failed: {:?}", log.name, Dbg(&e));
                LogError::Store(e)
            })
    }

    /// Read raw log bytes starting at `offset`.
    pub fn read(
        &mut self,
        log: &LogHandle<S::File>,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<usize, LogError<S::Error>> {
        Ok(self.store.store().read(&log.file, offset, buf)?)
    }

    pub fn len(&mut self, log: &LogHandle<S::File>) -> Result<usize, LogError<S::Error>> {
        Ok(self.store.store().len(&log.file)?)
    }

    /// Flush and release a log.
    pub fn close(&mut self, log: LogHandle<S::File>) -> Result<(), LogError<S::Error>> {
        let name = log.name;
        self.store.store().close(log.file)?;
        debug!("closed log {}", name);
        Ok(())
    }
}

//! Host-side fakes shared by the unit tests.

use std::{
    cell::RefCell,
    collections::VecDeque,
    rc::Rc,
    vec::Vec,
};

use embedded_hal::{
    digital::{
        self,
        OutputPin,
    },
    spi::{
        self,
        ErrorKind,
        Mode,
        SpiBus,
    },
};

use crate::{
    bus::BusConfig,
    capture::{
        CaptureDma,
        DmaTarget,
        DoubleBuffer,
        Sleep,
    },
    config::{
        CAPTURE_LEN,
        DeviceConfig,
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Configure(DeviceConfig),
    Select(usize, bool),
    Write(Vec<u8>),
    Read(usize),
    Flush,
}

#[derive(Default)]
struct BusState {
    events: Vec<BusEvent>,
    rx: VecDeque<u8>,
    fail_next: bool,
}

/// SPI bus that records traffic and answers reads from a script.
#[derive(Clone, Default)]
pub struct FakeBus {
    state: Rc<RefCell<BusState>>,
}

impl FakeBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes to be returned by subsequent reads. Unscripted reads get 0.
    pub fn respond(&self, bytes: &[u8]) {
        self.state.borrow_mut().rx.extend(bytes.iter().copied());
    }

    /// Make the next data transfer fail.
    pub fn fail_next(&self) {
        self.state.borrow_mut().fail_next = true;
    }

    pub fn events(&self) -> Vec<BusEvent> {
        self.state.borrow().events.clone()
    }

    /// Every byte written while any device was selected, flattened.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state
            .borrow()
            .events
            .iter()
            .filter_map(|e| match e {
                BusEvent::Write(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.state.borrow_mut().events.clear();
    }

    fn data_op(&self, event: BusEvent) -> Result<(), ErrorKind> {
        let mut state = self.state.borrow_mut();
        if core::mem::take(&mut state.fail_next) {
            return Err(ErrorKind::Other);
        }
        state.events.push(event);
        Ok(())
    }

    fn fill(&self, words: &mut [u8]) {
        let mut state = self.state.borrow_mut();
        for word in words {
            *word = state.rx.pop_front().unwrap_or(0);
        }
    }
}

impl spi::ErrorType for FakeBus {
    type Error = ErrorKind;
}

impl SpiBus for FakeBus {
    fn read(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        self.data_op(BusEvent::Read(words.len()))?;
        self.fill(words);
        Ok(())
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        self.data_op(BusEvent::Write(words.to_vec()))
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Self::Error> {
        self.data_op(BusEvent::Write(write.to_vec()))?;
        self.fill(read);
        Ok(())
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        self.data_op(BusEvent::Write(words.to_vec()))?;
        self.fill(words);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.state.borrow_mut().events.push(BusEvent::Flush);
        Ok(())
    }
}

impl BusConfig for FakeBus {
    fn reconfigure(&mut self, clock_hz: u32, mode: Mode) -> Result<(), Self::Error> {
        self.state
            .borrow_mut()
            .events
            .push(BusEvent::Configure(DeviceConfig::new(clock_hz, mode)));
        Ok(())
    }
}

/// Chip-select pin that logs its level changes into a [`FakeBus`].
pub struct FakePin {
    id: usize,
    state: Rc<RefCell<BusState>>,
}

impl FakePin {
    pub fn new(id: usize, bus: &FakeBus) -> Self {
        Self {
            id,
            state: bus.state.clone(),
        }
    }

    fn record(&mut self, high: bool) {
        // The inactive level set at attach time is not interesting.
        let mut state = self.state.borrow_mut();
        if high && !state.events.iter().any(|e| *e == BusEvent::Select(self.id, false)) {
            return;
        }
        state.events.push(BusEvent::Select(self.id, high));
    }
}

impl digital::ErrorType for FakePin {
    type Error = core::convert::Infallible;
}

impl OutputPin for FakePin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.record(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.record(true);
        Ok(())
    }
}

/// Build a bus with one fake line per device and return the handles.
pub fn shared_bus<const N: usize>(
    configs: [DeviceConfig; N],
) -> (
    FakeBus,
    crate::bus::SharedBus<FakeBus, FakePin>,
    [crate::bus::DeviceHandle; N],
) {
    let bus = FakeBus::new();
    let mut shared = crate::bus::SharedBus::new(bus.clone());
    let handles = core::array::from_fn(|i| {
        shared
            .attach(FakePin::new(i, &bus), configs[i])
            .unwrap()
    });
    (bus, shared, handles)
}

/// In-memory [`Store`](crate::store::Store) with named byte vectors as files.
#[derive(Default)]
pub struct MemStore {
    files: Vec<(std::string::String, Vec<u8>)>,
    /// Mount attempts left to fail.
    pub fail_mounts: usize,
    pub fail_appends: bool,
    pub mounts: usize,
    pub formats: usize,
    pub opened: usize,
    pub closed: usize,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, data: &[u8]) {
        self.files.push((name.into(), data.to_vec()));
    }

    pub fn file(&self, name: &str) -> Option<&[u8]> {
        self.files
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, data)| data.as_slice())
    }
}

impl crate::store::Store for MemStore {
    type Error = &'static str;
    type File = usize;

    fn mount(&mut self) -> Result<(), Self::Error> {
        self.mounts += 1;
        if self.fail_mounts > 0 {
            self.fail_mounts -= 1;
            return Err("mount failed");
        }
        Ok(())
    }

    fn format(&mut self) -> Result<(), Self::Error> {
        self.formats += 1;
        self.files.clear();
        Ok(())
    }

    fn open(&mut self, name: &str) -> Result<usize, Self::Error> {
        self.opened += 1;
        if let Some(index) = self.files.iter().position(|(n, _)| n == name) {
            return Ok(index);
        }
        self.insert(name, &[]);
        Ok(self.files.len() - 1)
    }

    fn len(&mut self, file: &usize) -> Result<usize, Self::Error> {
        Ok(self.files[*file].1.len())
    }

    fn read(&mut self, file: &usize, offset: usize, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let data = &self.files[*file].1;
        let start = offset.min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn append(&mut self, file: &mut usize, data: &[u8]) -> Result<(), Self::Error> {
        if self.fail_appends {
            return Err("append failed");
        }
        self.files[*file].1.extend_from_slice(data);
        Ok(())
    }

    fn close(&mut self, _: usize) -> Result<(), Self::Error> {
        self.closed += 1;
        Ok(())
    }
}

/// Capture front end whose completion "interrupt" fires while the caller
/// sleeps, filling the target from a queue of prepared buffers.
pub struct SimFrontEnd<'b> {
    buffer: &'b DoubleBuffer<CAPTURE_LEN>,
    state: RefCell<SimState>,
}

#[derive(Default)]
struct SimState {
    target: Option<DmaTarget>,
    feeds: VecDeque<[i16; CAPTURE_LEN]>,
    log: Vec<&'static str>,
    fail_start: bool,
}

impl<'b> SimFrontEnd<'b> {
    pub fn new(buffer: &'b DoubleBuffer<CAPTURE_LEN>, feeds: &[[i16; CAPTURE_LEN]]) -> Self {
        Self {
            buffer,
            state: RefCell::new(SimState {
                feeds: feeds.iter().copied().collect(),
                ..Default::default()
            }),
        }
    }

    pub fn fail_start(&self) {
        self.state.borrow_mut().fail_start = true;
    }

    pub fn log(&self) -> Vec<&'static str> {
        self.state.borrow().log.clone()
    }

    /// Completion interrupt: copy the next feed into the target.
    pub fn interrupt(&self) {
        let mut state = self.state.borrow_mut();
        let Some(target) = state.target else {
            return;
        };
        let Some(feed) = state.feeds.pop_front() else {
            return;
        };
        unsafe { target.as_mut_slice() }.copy_from_slice(&feed);
        state.target = self.buffer.on_buffer_full();
        state.log.push("irq");
    }
}

impl CaptureDma for &SimFrontEnd<'_> {
    type Error = &'static str;

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.state.borrow_mut().log.push("flush");
        Ok(())
    }

    fn start(&mut self, target: DmaTarget) -> Result<(), Self::Error> {
        let mut state = self.state.borrow_mut();
        if state.fail_start {
            return Err("dma busy");
        }
        state.target = Some(target);
        state.log.push("start");
        Ok(())
    }

    fn stop(&mut self) -> Result<(), Self::Error> {
        let mut state = self.state.borrow_mut();
        state.target = None;
        state.log.push("stop");
        Ok(())
    }
}

impl Sleep for &SimFrontEnd<'_> {
    fn check_or_sleep<T>(&mut self, check: impl FnOnce() -> Option<T>) -> Option<T> {
        if let Some(ready) = critical_section::with(|_| check()) {
            return Some(ready);
        }
        self.state.borrow_mut().log.push("sleep");
        self.interrupt();
        None
    }
}

pub fn tone(bin: usize) -> [i16; CAPTURE_LEN] {
    core::array::from_fn(|n| {
        let phase = core::f32::consts::TAU * (bin * n) as f32 / CAPTURE_LEN as f32;
        (6_000.0 * phase.sin()) as i16
    })
}

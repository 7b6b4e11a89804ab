//! One acquisition pass: read every sensor once, capture audio, log.

use core::fmt::Debug;

use crate::{
    capture::{
        AudioCapture,
        CaptureDma,
        Sleep,
    },
    fmt::Dbg,
    logbook::{
        LogError,
        LogHandle,
        LogWriter,
    },
    sensors::{
        Barometer,
        LightSensor,
        Metric,
        Sample,
        WallClock,
    },
    store::{
        Mounted,
        Store,
    },
};

/// Why a metric has no record this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Skip {
    /// The log holds data without the expected header.
    HeaderMismatch,
    /// The sensor or capture front end failed.
    ReadFailed,
    /// The clock could not be read.
    NoTimestamp,
    /// The audio buffer held no signal.
    Silent,
    /// The pass aborted before reaching this metric.
    NotReached,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Outcome {
    Recorded(Sample),
    Skipped(Skip),
}

/// What one pass did.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PassReport {
    /// The store was reformatted before logging, losing earlier records.
    pub reformatted: bool,
    outcomes: [Outcome; 4],
}

impl PassReport {
    pub fn outcome(&self, metric: Metric) -> Outcome {
        self.outcomes[metric.index()]
    }

    pub fn recorded(&self) -> impl Iterator<Item = &Sample> {
        self.outcomes.iter().filter_map(|o| match o {
            Outcome::Recorded(sample) => Some(sample),
            Outcome::Skipped(_) => None,
        })
    }

    pub fn skipped(&self) -> impl Iterator<Item = (Metric, Skip)> + '_ {
        Metric::ALL.into_iter().filter_map(|m| match self.outcome(m) {
            Outcome::Skipped(why) => Some((m, why)),
            Outcome::Recorded(_) => None,
        })
    }
}

/// Everything one pass talks to, built once at startup.
pub struct Node<'a, B, C, L, D, S> {
    pub barometer: B,
    pub clock: C,
    pub light: L,
    pub capture: AudioCapture<'a>,
    pub dma: D,
    pub sleep: S,
}

type Logs<F> = [Option<LogHandle<F>>; 4];

impl<B, C, L, D, S> Node<'_, B, C, L, D, S>
where
    B: Barometer,
    C: WallClock,
    L: LightSensor,
    D: CaptureDma,
    S: Sleep,
{
    /// Run one full acquisition pass against a store mounted with
    /// [`mount_or_format`](crate::store::mount_or_format).
    ///
    /// The mount and its one reformat happen once per boot, before the first
    /// pass. A pass never remounts.
    ///
    /// Sensor, clock and capture failures only skip the affected metric.
    /// Storage failures end the pass; logs already open are still closed.
    pub fn acquire<St: Store>(
        &mut self,
        store: &mut Mounted<'_, St>,
    ) -> Result<PassReport, LogError<St::Error>> {
        let mut report = PassReport {
            reformatted: store.reformatted(),
            outcomes: [Outcome::Skipped(Skip::NotReached); 4],
        };
        let mut writer = LogWriter::new(store.reborrow());
        let mut logs: Logs<St::File> = [None, None, None, None];

        let mut result = open_logs(&mut writer, &mut logs, &mut report);
        if result.is_ok() {
            result = self.record_all(&mut writer, &mut logs, &mut report);
        }
        let closed = close_all(&mut writer, &mut logs);

        result.and(closed)?;
        info!(
            "pass complete: {} recorded",
            report.recorded().count()
        );
        Ok(report)
    }

    fn record_all<St: Store>(
        &mut self,
        writer: &mut LogWriter<'_, St>,
        logs: &mut Logs<St::File>,
        report: &mut PassReport,
    ) -> Result<(), LogError<St::Error>> {
        for metric in Metric::ALL {
            let Some(log) = logs[metric.index()].as_mut() else {
                continue;
            };

            let value = match self.read(metric) {
                Ok(value) => value,
                Err(why) => {
                    report.outcomes[metric.index()] = Outcome::Skipped(why);
                    continue;
                }
            };
            let timestamp_secs = match self.clock.now() {
                Ok(t) => t,
                Err(e) => {
                    warn!("skipping {}: clock read failed: {:?}", metric.log_name(), Dbg(&e));
                    report.outcomes[metric.index()] = Outcome::Skipped(Skip::NoTimestamp);
                    continue;
                }
            };

            writer.append_record(log, value, timestamp_secs)?;
            info!("{} = {} at {}", metric.log_name(), value, timestamp_secs);
            report.outcomes[metric.index()] = Outcome::Recorded(Sample {
                metric,
                value,
                timestamp_secs,
            });
        }
        Ok(())
    }

    /// Take one reading in the metric's logged unit.
    fn read(&mut self, metric: Metric) -> Result<i64, Skip> {
        match metric {
            Metric::Temperature => self
                .barometer
                .read_temperature()
                .map(i64::from)
                .map_err(|e| read_failed(metric, &e)),
            Metric::Pressure => self
                .barometer
                .read_pressure()
                .map(i64::from)
                .map_err(|e| read_failed(metric, &e)),
            Metric::Light => self
                .light
                .read_light()
                .map(i64::from)
                .map_err(|e| read_failed(metric, &e)),
            Metric::AudioPeak => match self.capture.run(&mut self.dma, &mut self.sleep) {
                Ok(Some(peak)) => Ok(i64::from(peak.frequency_hz)),
                Ok(None) => Err(Skip::Silent),
                Err(e) => Err(read_failed(metric, &e)),
            },
        }
    }
}

fn read_failed<E: Debug>(metric: Metric, e: &E) -> Skip {
    warn!("skipping {}: read failed: {:?}", metric.log_name(), Dbg(e));
    Skip::ReadFailed
}

/// Open every log and check its header. A log with foreign data is closed
/// again and its metric skipped.
fn open_logs<St: Store>(
    writer: &mut LogWriter<'_, St>,
    logs: &mut Logs<St::File>,
    report: &mut PassReport,
) -> Result<(), LogError<St::Error>> {
    for metric in Metric::ALL {
        let mut log = writer.open_or_create(metric.log_name())?;
        match writer.ensure_header(&mut log, metric.header()) {
            Ok(_) => logs[metric.index()] = Some(log),
            Err(LogError::HeaderMismatch) => {
                warn!("skipping {}: log has no header", metric.log_name());
                report.outcomes[metric.index()] = Outcome::Skipped(Skip::HeaderMismatch);
                writer.close(log)?;
            }
            Err(e) => {
                // Keep the handle so it gets closed with the rest.
                logs[metric.index()] = Some(log);
                return Err(e);
            }
        }
    }
    Ok(())
}

/// Close every open log, reporting the first failure.
fn close_all<St: Store>(
    writer: &mut LogWriter<'_, St>,
    logs: &mut Logs<St::File>,
) -> Result<(), LogError<St::Error>> {
    let mut first = Ok(());
    for log in logs.iter_mut().filter_map(Option::take) {
        if let Err(e) = writer.close(log) {
            error!("closing a log failed");
            first = first.and(Err(e));
        }
    }
    first
}

#[cfg(test)]
mod tests {
    use std::string::String;

    use super::*;
    use crate::{
        capture::DoubleBuffer,
        config::{
            CAPTURE_LEN,
            CaptureConfig,
        },
        store::mount_or_format,
        testing::{
            MemStore,
            SimFrontEnd,
            tone,
        },
    };

    struct Fixed<T>(Result<T, &'static str>);

    struct FixedBarometer {
        temperature: Result<i32, &'static str>,
        pressure: Result<u32, &'static str>,
    }

    impl Barometer for FixedBarometer {
        type Error = &'static str;

        fn read_temperature(&mut self) -> Result<i32, Self::Error> {
            self.temperature
        }

        fn read_pressure(&mut self) -> Result<u32, Self::Error> {
            self.pressure
        }
    }

    impl WallClock for Fixed<u64> {
        type Error = &'static str;

        fn now(&mut self) -> Result<u64, Self::Error> {
            self.0
        }
    }

    impl LightSensor for Fixed<u32> {
        type Error = &'static str;

        fn read_light(&mut self) -> Result<u32, Self::Error> {
            self.0
        }
    }

    type TestNode<'a> =
        Node<'a, FixedBarometer, Fixed<u64>, Fixed<u32>, &'a SimFrontEnd<'a>, &'a SimFrontEnd<'a>>;

    fn node<'a>(buffer: &'a DoubleBuffer<CAPTURE_LEN>, sim: &'a SimFrontEnd<'a>) -> TestNode<'a> {
        Node {
            barometer: FixedBarometer {
                temperature: Ok(21_500),
                pressure: Ok(100_653),
            },
            clock: Fixed(Ok(1_700_000_000)),
            light: Fixed(Ok(1_800)),
            capture: AudioCapture::new(
                buffer,
                CaptureConfig {
                    settle_buffers: 0,
                    ..CaptureConfig::default()
                },
            ),
            dma: sim,
            sleep: sim,
        }
    }

    fn text(store: &MemStore, metric: Metric) -> String {
        String::from_utf8(store.file(metric.log_name()).unwrap().to_vec()).unwrap()
    }

    /// Mount `store` and run one pass on it.
    fn pass(
        node: &mut TestNode<'_>,
        store: &mut MemStore,
    ) -> Result<PassReport, LogError<&'static str>> {
        let mut mounted = mount_or_format(store).unwrap();
        node.acquire(&mut mounted)
    }

    #[test]
    fn full_pass_logs_every_metric() {
        let buffer = DoubleBuffer::new();
        let sim = SimFrontEnd::new(&buffer, &[tone(64)]);
        let mut store = MemStore::new();

        let report = pass(&mut node(&buffer, &sim), &mut store).unwrap();

        assert!(!report.reformatted);
        assert_eq!(report.recorded().count(), 4);
        assert_eq!(
            text(&store, Metric::Temperature),
            "temperature_mC,unix_time_s\r\n21500,1700000000\r\n"
        );
        assert_eq!(
            text(&store, Metric::Pressure),
            "pressure_Pa,unix_time_s\r\n100653,1700000000\r\n"
        );
        assert_eq!(
            text(&store, Metric::Light),
            "light_mV,unix_time_s\r\n1800,1700000000\r\n"
        );
        assert_eq!(
            text(&store, Metric::AudioPeak),
            "audio_peak_Hz,unix_time_s\r\n1000,1700000000\r\n"
        );
        assert_eq!(store.closed, store.opened);
    }

    #[test]
    fn repeated_passes_keep_one_header() {
        let buffer = DoubleBuffer::new();
        let sim = SimFrontEnd::new(&buffer, &[tone(64), tone(64)]);
        let mut store = MemStore::new();
        let mut node = node(&buffer, &sim);

        pass(&mut node, &mut store).unwrap();
        node.clock = Fixed(Ok(1_700_000_060));
        pass(&mut node, &mut store).unwrap();

        assert_eq!(
            text(&store, Metric::Light),
            "light_mV,unix_time_s\r\n1800,1700000000\r\n1800,1700000060\r\n"
        );
    }

    #[test]
    fn failed_sensor_is_skipped_and_the_rest_recorded() {
        let buffer = DoubleBuffer::new();
        let sim = SimFrontEnd::new(&buffer, &[tone(64)]);
        let mut store = MemStore::new();
        let mut node = node(&buffer, &sim);
        node.barometer.temperature = Err("no response");

        let report = pass(&mut node, &mut store).unwrap();

        assert_eq!(
            report.outcome(Metric::Temperature),
            Outcome::Skipped(Skip::ReadFailed)
        );
        assert!(matches!(report.outcome(Metric::Pressure), Outcome::Recorded(_)));
        assert_eq!(text(&store, Metric::Temperature), Metric::Temperature.header());
    }

    #[test]
    fn clock_failure_skips_without_writing() {
        let buffer = DoubleBuffer::new();
        let sim = SimFrontEnd::new(&buffer, &[tone(64)]);
        let mut store = MemStore::new();
        let mut node = node(&buffer, &sim);
        node.clock = Fixed(Err("rtc offline"));

        let report = pass(&mut node, &mut store).unwrap();

        assert_eq!(report.recorded().count(), 0);
        assert!(report.skipped().all(|(_, why)| why == Skip::NoTimestamp));
        assert_eq!(text(&store, Metric::Light), Metric::Light.header());
    }

    #[test]
    fn silent_audio_is_not_logged() {
        let buffer = DoubleBuffer::new();
        let sim = SimFrontEnd::new(&buffer, &[[0; CAPTURE_LEN]]);
        let mut store = MemStore::new();

        let report = pass(&mut node(&buffer, &sim), &mut store).unwrap();

        assert_eq!(
            report.outcome(Metric::AudioPeak),
            Outcome::Skipped(Skip::Silent)
        );
        assert_eq!(report.recorded().count(), 3);
    }

    #[test]
    fn header_mismatch_skips_only_that_metric() {
        let buffer = DoubleBuffer::new();
        let sim = SimFrontEnd::new(&buffer, &[tone(64)]);
        let mut store = MemStore::new();
        store.insert("light", b"legacy data\r\n");

        let report = pass(&mut node(&buffer, &sim), &mut store).unwrap();

        assert_eq!(
            report.skipped().collect::<std::vec::Vec<_>>(),
            [(Metric::Light, Skip::HeaderMismatch)]
        );
        assert_eq!(text(&store, Metric::Light), "legacy data\r\n");
    }

    #[test]
    fn unmountable_store_never_reaches_a_pass() {
        let mut store = MemStore::new();
        store.fail_mounts = 2;

        assert_eq!(
            mount_or_format(&mut store).map(|m| m.reformatted()),
            Err(crate::store::MountError::Remount("mount failed"))
        );
        assert_eq!(store.formats, 1);
        assert_eq!(store.opened, 0);
    }

    #[test]
    fn one_mount_failure_reformats_and_continues() {
        let buffer = DoubleBuffer::new();
        let sim = SimFrontEnd::new(&buffer, &[tone(64)]);
        let mut store = MemStore::new();
        store.insert("temperature", b"old");
        store.fail_mounts = 1;

        let report = pass(&mut node(&buffer, &sim), &mut store).unwrap();

        assert!(report.reformatted);
        assert_eq!(store.formats, 1);
        assert_eq!(report.recorded().count(), 4);
    }

    #[test]
    fn passes_on_one_mount_never_remount_or_reformat() {
        let buffer = DoubleBuffer::new();
        let sim = SimFrontEnd::new(&buffer, &[tone(64), tone(64), tone(64)]);
        let mut store = MemStore::new();
        store.fail_mounts = 1;
        let mut node = node(&buffer, &sim);

        let mut mounted = mount_or_format(&mut store).unwrap();
        for _ in 0..3 {
            let report = node.acquire(&mut mounted).unwrap();
            assert!(report.reformatted);
            assert_eq!(report.recorded().count(), 4);
        }
        drop(mounted);

        assert_eq!((store.mounts, store.formats), (2, 1));
        assert_eq!(
            text(&store, Metric::Light),
            "light_mV,unix_time_s\r\n1800,1700000000\r\n1800,1700000000\r\n1800,1700000000\r\n"
        );
    }

    #[test]
    fn storage_failure_aborts_but_closes_logs() {
        let buffer = DoubleBuffer::new();
        let sim = SimFrontEnd::new(&buffer, &[tone(64)]);
        let mut store = MemStore::new();
        for metric in Metric::ALL {
            store.insert(metric.log_name(), metric.header().as_bytes());
        }
        store.fail_appends = true;

        let result = pass(&mut node(&buffer, &sim), &mut store);

        assert!(matches!(result, Err(LogError::Store(_))));
        assert_eq!(store.opened, 4);
        assert_eq!(store.closed, 4);
    }
}

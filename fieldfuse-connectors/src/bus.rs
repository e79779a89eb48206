//! I2C ambient light source
//!
//! ## Overview
//!
//! The station's own APDS-9960 is read synchronously, on demand, inside
//! [`SensorSource::merge`]. There is no background thread: the read takes
//! one bus transaction and the snapshot is stamped with the time of that
//! read, so the light channels are never stale.
//!
//! ## Registers
//!
//! | Register | Name   | Use                                  |
//! |----------|--------|--------------------------------------|
//! | `0x80`   | ENABLE | `PON | AEN` (`0x03`) at construction |
//! | `0x81`   | ATIME  | ALS integration time                 |
//! | `0x94`   | CDATAL | clear, red, green, blue as 4 × u16 LE |
//!
//! A failed read leaves all four channels unknown for that merge and is
//! logged; it never fails the cycle.

use std::sync::{Arc, Mutex};

use embedded_hal::i2c::I2c;
use log::{debug, warn};

use fieldfuse_core::errors::ChannelError;
use fieldfuse_core::snapshot::{MergeReport, SnapshotBuffer, StalenessPolicy};
use fieldfuse_core::time::Clock;
use fieldfuse_core::{Reading, SensorSource, UnifiedRecord};

/// Columns the bus source owns
pub const BUS_FIELDS: [&str; 4] = ["amb", "r", "g", "b"];

const REG_ENABLE: u8 = 0x80;
const REG_ATIME: u8 = 0x81;
const REG_CDATAL: u8 = 0x94;
const ENABLE_PON_AEN: u8 = 0x03;
/// 0xDB: 37 cycles, about 100 ms
const DEFAULT_ATIME: u8 = 0xDB;

/// Raw light channel counts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LightChannels {
    pub clear: u16,
    pub red: u16,
    pub green: u16,
    pub blue: u16,
}

/// A light sensor that can be read on demand
pub trait LightBus: Send {
    fn read_channels(&mut self) -> Result<LightChannels, ChannelError>;
}

/// APDS-9960 driver over any `embedded-hal` I2C bus
pub struct Apds9960<I2C> {
    i2c: I2C,
    address: u8,
}

impl<I2C: I2c> Apds9960<I2C> {
    /// Default 7-bit bus address
    pub const DEFAULT_ADDRESS: u8 = 0x39;

    /// Power the sensor on and enable the ambient light engine
    pub fn new(mut i2c: I2C, address: u8) -> Result<Self, ChannelError> {
        i2c.write(address, &[REG_ATIME, DEFAULT_ATIME]).map_err(bus_error)?;
        i2c.write(address, &[REG_ENABLE, ENABLE_PON_AEN]).map_err(bus_error)?;
        debug!("APDS-9960 at {:#04x} enabled", address);
        Ok(Self { i2c, address })
    }

    /// Give the bus back
    pub fn release(self) -> I2C {
        self.i2c
    }
}

impl<I2C: I2c + Send> LightBus for Apds9960<I2C> {
    fn read_channels(&mut self) -> Result<LightChannels, ChannelError> {
        let mut raw = [0u8; 8];
        self.i2c
            .write_read(self.address, &[REG_CDATAL], &mut raw)
            .map_err(bus_error)?;

        let word = |i: usize| u16::from_le_bytes([raw[2 * i], raw[2 * i + 1]]);
        Ok(LightChannels { clear: word(0), red: word(1), green: word(2), blue: word(3) })
    }
}

fn bus_error<E: embedded_hal::i2c::Error>(err: E) -> ChannelError {
    ChannelError::Connect(format!("I2C {:?}", err.kind()))
}

/// Open the sensor on a Linux I2C character device
#[cfg(feature = "i2c")]
pub fn open_linux(
    path: impl AsRef<std::path::Path>,
    address: u8,
) -> Result<Apds9960<linux_embedded_hal::I2cdev>, fieldfuse_core::errors::SetupError> {
    use fieldfuse_core::errors::SetupError;

    let path = path.as_ref();
    let dev = linux_embedded_hal::I2cdev::new(path)
        .map_err(|e| SetupError::Device(format!("cannot open {}: {e}", path.display())))?;
    Apds9960::new(dev, address).map_err(|e| SetupError::Device(format!("APDS-9960 on {}: {e}", path.display())))
}

/// Sensor source reading a [`LightBus`] at merge time
pub struct BusSource<B: LightBus> {
    bus: Mutex<B>,
    clock: Arc<dyn Clock>,
    buffer: SnapshotBuffer,
}

impl<B: LightBus> BusSource<B> {
    pub fn new(bus: B, clock: Arc<dyn Clock>) -> Self {
        Self {
            bus: Mutex::new(bus),
            clock,
            buffer: SnapshotBuffer::new("bus", BUS_FIELDS),
        }
    }

    /// Read the bus and publish; on failure the channels become unknown
    pub fn update(&self) -> Result<(), ChannelError> {
        let read = self.bus.lock().unwrap_or_else(|e| e.into_inner()).read_channels();
        let now = self.clock.now();

        match read {
            Ok(ch) => {
                debug!("Ambient light: {:?}", ch);
                let values = [ch.clear, ch.red, ch.green, ch.blue];
                self.buffer.publish(
                    now,
                    BUS_FIELDS
                        .iter()
                        .zip(values)
                        .map(|(name, v)| (*name, Some(Reading::Int(i64::from(v))))),
                );
                Ok(())
            }
            Err(e) => {
                self.buffer.publish(now, BUS_FIELDS.map(|name| (name, None)));
                Err(e)
            }
        }
    }
}

impl<B: LightBus> SensorSource for BusSource<B> {
    fn name(&self) -> &str {
        self.buffer.source()
    }

    fn merge(&self, target: &mut UnifiedRecord, policy: StalenessPolicy) -> MergeReport {
        if let Err(e) = self.update() {
            warn!("Light sensor read failed, channels unknown this cycle: {}", e);
        }
        self.buffer.merge_into(target, policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal::i2c::{ErrorKind, ErrorType, Operation};
    use fieldfuse_core::{ManualClock, Timestamp};

    #[derive(Debug)]
    struct FakeError;

    impl embedded_hal::i2c::Error for FakeError {
        fn kind(&self) -> ErrorKind {
            ErrorKind::Other
        }
    }

    /// Register file with an optional failure switch
    #[derive(Default)]
    struct FakeI2c {
        writes: Vec<Vec<u8>>,
        channels: [u8; 8],
        broken: bool,
    }

    impl ErrorType for FakeI2c {
        type Error = FakeError;
    }

    impl I2c for FakeI2c {
        fn transaction(&mut self, address: u8, operations: &mut [Operation<'_>]) -> Result<(), FakeError> {
            assert_eq!(address, 0x39);
            if self.broken {
                return Err(FakeError);
            }
            for op in operations {
                match op {
                    Operation::Write(bytes) => self.writes.push(bytes.to_vec()),
                    Operation::Read(buf) => buf.copy_from_slice(&self.channels[..buf.len()]),
                }
            }
            Ok(())
        }
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Timestamp::parse("20250601120000").unwrap()))
    }

    #[test]
    fn construction_enables_als() {
        let sensor = Apds9960::new(FakeI2c::default(), Apds9960::<FakeI2c>::DEFAULT_ADDRESS).unwrap();
        let bus = sensor.release();
        assert_eq!(bus.writes, vec![vec![REG_ATIME, DEFAULT_ATIME], vec![REG_ENABLE, ENABLE_PON_AEN]]);
    }

    #[test]
    fn channels_are_little_endian_words() {
        let i2c = FakeI2c { channels: [0x2c, 0x03, 0x2d, 0x01, 0x20, 0x01, 0xbe, 0x00], ..Default::default() };
        let mut sensor = Apds9960::new(i2c, 0x39).unwrap();
        assert_eq!(
            sensor.read_channels().unwrap(),
            LightChannels { clear: 812, red: 301, green: 288, blue: 190 }
        );
    }

    #[test]
    fn merge_reads_fresh_values() {
        let i2c = FakeI2c { channels: [10, 0, 20, 0, 30, 0, 40, 0], ..Default::default() };
        let clock = clock();
        let source = BusSource::new(Apds9960::new(i2c, 0x39).unwrap(), clock.clone());

        clock.advance(3600);
        let mut record = UnifiedRecord::new(clock.now());
        let report = source.merge(&mut record, StalenessPolicy::default());

        assert!(!report.is_stale());
        assert_eq!((record.amb, record.r, record.g, record.b), (Some(10), Some(20), Some(30), Some(40)));
    }

    struct FlakyBus {
        fail: bool,
    }

    impl LightBus for FlakyBus {
        fn read_channels(&mut self) -> Result<LightChannels, ChannelError> {
            if self.fail {
                Err(ChannelError::Connect("I2C Other".into()))
            } else {
                Ok(LightChannels { clear: 1, red: 2, green: 3, blue: 4 })
            }
        }
    }

    #[test]
    fn failed_read_nulls_channels() {
        let source = BusSource::new(FlakyBus { fail: false }, clock());
        let mut record = UnifiedRecord::new(Timestamp::parse("20250601120000").unwrap());
        source.merge(&mut record, StalenessPolicy::default());
        assert_eq!(record.amb, Some(1));

        source.bus.lock().unwrap().fail = true;
        let mut record = UnifiedRecord::new(Timestamp::parse("20250601120000").unwrap());
        record.amb = Some(99);
        source.merge(&mut record, StalenessPolicy::default());
        assert_eq!((record.amb, record.r, record.g, record.b), (None, None, None, None));
    }
}

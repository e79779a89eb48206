//! Characteristic table and value decoding for the environmental board
//!
//! All values are little-endian. UUIDs share one vendor template and differ
//! only in the second group:
//!
//! ```text
//! 19b10000-XXXX-537e-4f6c-d104768a1214
//! ```

use fieldfuse_core::errors::ProtocolError;
use fieldfuse_core::Reading;
use uuid::Uuid;

const UUID_TEMPLATE: u128 = 0x19b1_0000_0000_537e_4f6c_d104_768a_1214;

/// Wire encoding of one characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// `<f`
    F32,
    /// `<I`
    U32,
    /// `<i`
    I32,
    /// `<fff`
    F32x3,
    /// `<ffff`
    F32x4,
}

impl Encoding {
    pub fn width(&self) -> usize {
        match self {
            Encoding::F32 | Encoding::U32 | Encoding::I32 => 4,
            Encoding::F32x3 => 12,
            Encoding::F32x4 => 16,
        }
    }
}

/// One GATT characteristic feeding one record column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Characteristic {
    pub field: &'static str,
    pub id: u16,
    pub encoding: Encoding,
}

impl Characteristic {
    const fn new(field: &'static str, id: u16, encoding: Encoding) -> Self {
        Self { field, id, encoding }
    }

    pub fn uuid(&self) -> Uuid {
        Uuid::from_u128(UUID_TEMPLATE | (u128::from(self.id) << 80))
    }

    /// Decode a raw value
    pub fn decode(&self, bytes: &[u8]) -> Result<Reading, ProtocolError> {
        let expected = self.encoding.width();
        if bytes.len() != expected {
            return Err(ProtocolError::BadLength { name: self.field, expected, got: bytes.len() });
        }

        let word = |i: usize| [bytes[4 * i], bytes[4 * i + 1], bytes[4 * i + 2], bytes[4 * i + 3]];
        let float = |i: usize| f32::from_le_bytes(word(i));

        Ok(match self.encoding {
            Encoding::F32 => Reading::Float(f64::from(float(0))),
            Encoding::U32 => Reading::Int(i64::from(u32::from_le_bytes(word(0)))),
            Encoding::I32 => Reading::Int(i64::from(i32::from_le_bytes(word(0)))),
            Encoding::F32x3 => Reading::Vec3([float(0), float(1), float(2)]),
            Encoding::F32x4 => Reading::Quat([float(0), float(1), float(2), float(3)]),
        })
    }
}

/// Read directly every cycle
pub const SCALARS: [Characteristic; 5] = [
    Characteristic::new("temp", 0x2001, Encoding::F32),
    Characteristic::new("pressure", 0x4001, Encoding::F32),
    Characteristic::new("humidity", 0x3001, Encoding::U32),
    Characteristic::new("gas", 0x9003, Encoding::U32),
    Characteristic::new("co2", 0x9002, Encoding::I32),
];

/// Sampled through a short notification subscription every cycle
pub const VECTORS: [Characteristic; 3] = [
    Characteristic::new("accel", 0x5001, Encoding::F32x3),
    Characteristic::new("gyro", 0x6001, Encoding::F32x3),
    Characteristic::new("quat", 0x7001, Encoding::F32x4),
];

/// Column derived from the quaternion sample
pub const EULER_FIELD: &str = "euler";

/// Roll, pitch and yaw in degrees from an `(x, y, z, w)` quaternion
///
/// Returns `None` for a zero quaternion.
pub fn quat_to_euler([x, y, z, w]: [f32; 4]) -> Option<[f32; 3]> {
    let norm = (x * x + y * y + z * z + w * w).sqrt();
    if norm < f32::EPSILON {
        return None;
    }
    let (x, y, z, w) = (x / norm, y / norm, z / norm, w / norm);

    let roll = (2.0 * (w * x + y * z)).atan2(1.0 - 2.0 * (x * x + y * y));
    let pitch = (2.0 * (w * y - z * x)).clamp(-1.0, 1.0).asin();
    let yaw = (2.0 * (w * z + x * y)).atan2(1.0 - 2.0 * (y * y + z * z));

    Some([roll.to_degrees(), pitch.to_degrees(), yaw.to_degrees()])
}

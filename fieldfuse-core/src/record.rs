//! Unified Record Schema
//!
//! ## Overview
//!
//! One [`UnifiedRecord`] is built per scheduling tick. Sensor sources merge
//! their snapshots into it, then one copy per bracketed capture is overlaid
//! with that capture's image fields and persisted as a row.
//!
//! ## Schema
//!
//! Columns, in the stable order they are written:
//!
//! ```text
//! timestamp | image | aec_level agc_gain | amb r g b | temp pressure humidity gas co2 | accel gyro euler | quat
//!   clock   | file  |  exposure / gain   |   light   |        environment            |    3-vectors     | 4-vector
//! ```
//!
//! Every column other than `timestamp` is either a typed value or explicitly
//! unknown (`None`). There is no "missing key": a row always carries every
//! column.
//!
//! ## Validation Boundary
//!
//! Sources describe their readings by column name. [`Field::from_str`] and
//! [`UnifiedRecord::set`] are the only places names and value shapes are
//! checked; anything that does not fit comes back as a [`SchemaError`] for
//! the caller to report.

use std::fmt;
use std::str::FromStr;

use crate::errors::SchemaError;
use crate::time::Timestamp;

/// A schema column other than `timestamp`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Field {
    /// Image filename
    Image,
    /// Exposure level (camera AEC level or capture EV)
    AecLevel,
    /// Gain level (camera AGC gain or analogue gain)
    AgcGain,
    /// Ambient light, clear channel
    Amb,
    /// Ambient light, red channel
    Red,
    /// Ambient light, green channel
    Green,
    /// Ambient light, blue channel
    Blue,
    /// Temperature, °C
    Temp,
    /// Barometric pressure, hPa
    Pressure,
    /// Relative humidity, %
    Humidity,
    /// Gas resistance index
    Gas,
    /// CO2 equivalent, ppm
    Co2,
    /// Accelerometer sample
    Accel,
    /// Gyroscope sample
    Gyro,
    /// Orientation as roll/pitch/yaw degrees
    Euler,
    /// Orientation quaternion (x, y, z, w)
    Quat,
}

/// Kind of value a column holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Integer,
    Float,
    Vec3,
    Quat,
}

impl FieldKind {
    fn describe(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Float => "number",
            Self::Vec3 => "3-vector",
            Self::Quat => "4-vector",
        }
    }
}

impl Field {
    /// All columns in persisted order
    pub const ALL: [Field; 16] = [
        Field::Image,
        Field::AecLevel,
        Field::AgcGain,
        Field::Amb,
        Field::Red,
        Field::Green,
        Field::Blue,
        Field::Temp,
        Field::Pressure,
        Field::Humidity,
        Field::Gas,
        Field::Co2,
        Field::Accel,
        Field::Gyro,
        Field::Euler,
        Field::Quat,
    ];

    /// Column name as written in the header
    pub const fn name(self) -> &'static str {
        match self {
            Field::Image => "image",
            Field::AecLevel => "aec_level",
            Field::AgcGain => "agc_gain",
            Field::Amb => "amb",
            Field::Red => "r",
            Field::Green => "g",
            Field::Blue => "b",
            Field::Temp => "temp",
            Field::Pressure => "pressure",
            Field::Humidity => "humidity",
            Field::Gas => "gas",
            Field::Co2 => "co2",
            Field::Accel => "accel",
            Field::Gyro => "gyro",
            Field::Euler => "euler",
            Field::Quat => "quat",
        }
    }

    pub const fn kind(self) -> FieldKind {
        match self {
            Field::Image => FieldKind::Text,
            Field::AecLevel | Field::AgcGain | Field::Temp | Field::Pressure => FieldKind::Float,
            Field::Amb
            | Field::Red
            | Field::Green
            | Field::Blue
            | Field::Humidity
            | Field::Gas
            | Field::Co2 => FieldKind::Integer,
            Field::Accel | Field::Gyro | Field::Euler => FieldKind::Vec3,
            Field::Quat => FieldKind::Quat,
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Field {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Field::ALL
            .iter()
            .copied()
            .find(|field| field.name() == s)
            .ok_or_else(|| SchemaError::UnknownField(s.to_string()))
    }
}

/// A single sensor value
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    Int(i64),
    Float(f64),
    Text(String),
    Vec3([f32; 3]),
    Quat([f32; 4]),
}

impl Reading {
    fn kind_name(&self) -> &'static str {
        match self {
            Reading::Int(_) => "integer",
            Reading::Float(_) => "number",
            Reading::Text(_) => "text",
            Reading::Vec3(_) => "3-vector",
            Reading::Quat(_) => "4-vector",
        }
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reading::Int(v) => write!(f, "{v}"),
            Reading::Float(v) => write!(f, "{v}"),
            Reading::Text(v) => f.write_str(v),
            Reading::Vec3([x, y, z]) => write!(f, "({x}, {y}, {z})"),
            Reading::Quat([x, y, z, w]) => write!(f, "({x}, {y}, {z}, {w})"),
        }
    }
}

/// Header line of the record log, without trailing newline
pub fn header() -> String {
    std::iter::once("timestamp")
        .chain(Field::ALL.iter().map(|f| f.name()))
        .collect::<Vec<_>>()
        .join(",")
}

/// Schema-complete record for one tick (and, once overlaid, one capture)
#[derive(Debug, Clone, PartialEq)]
pub struct UnifiedRecord {
    pub timestamp: Timestamp,
    pub image: Option<String>,
    pub aec_level: Option<f64>,
    pub agc_gain: Option<f64>,
    pub amb: Option<i64>,
    pub r: Option<i64>,
    pub g: Option<i64>,
    pub b: Option<i64>,
    pub temp: Option<f64>,
    pub pressure: Option<f64>,
    pub humidity: Option<i64>,
    pub gas: Option<i64>,
    pub co2: Option<i64>,
    pub accel: Option<[f32; 3]>,
    pub gyro: Option<[f32; 3]>,
    pub euler: Option<[f32; 3]>,
    pub quat: Option<[f32; 4]>,
}

impl UnifiedRecord {
    /// Record with every column unknown, stamped `timestamp`
    pub fn new(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            image: None,
            aec_level: None,
            agc_gain: None,
            amb: None,
            r: None,
            g: None,
            b: None,
            temp: None,
            pressure: None,
            humidity: None,
            gas: None,
            co2: None,
            accel: None,
            gyro: None,
            euler: None,
            quat: None,
        }
    }

    /// Store a reading; `None` marks the column unknown
    ///
    /// Integer readings are accepted by float columns. Every other shape
    /// disagreement is a [`SchemaError::TypeMismatch`] and leaves the
    /// column untouched.
    pub fn set(&mut self, field: Field, reading: Option<Reading>) -> Result<(), SchemaError> {
        let Some(reading) = reading else {
            self.clear(field);
            return Ok(());
        };

        let mismatch = |reading: &Reading| SchemaError::TypeMismatch {
            field: field.name(),
            expected: field.kind().describe(),
            got: reading.kind_name(),
        };

        match (field.kind(), reading) {
            (FieldKind::Text, Reading::Text(v)) => self.image = Some(v),
            (FieldKind::Float, Reading::Float(v)) => self.set_float(field, v),
            (FieldKind::Float, Reading::Int(v)) => self.set_float(field, v as f64),
            (FieldKind::Integer, Reading::Int(v)) => *self.int_slot(field) = Some(v),
            (FieldKind::Vec3, Reading::Vec3(v)) => *self.vec3_slot(field) = Some(v),
            (FieldKind::Quat, Reading::Quat(v)) => self.quat = Some(v),
            (_, other) => return Err(mismatch(&other)),
        }
        Ok(())
    }

    /// Store a reading addressed by column name
    pub fn set_named(&mut self, name: &str, reading: Option<Reading>) -> Result<Field, SchemaError> {
        let field: Field = name.parse()?;
        self.set(field, reading)?;
        Ok(field)
    }

    /// Mark a column unknown
    pub fn clear(&mut self, field: Field) {
        match field.kind() {
            FieldKind::Text => self.image = None,
            FieldKind::Float => match field {
                Field::AecLevel => self.aec_level = None,
                Field::AgcGain => self.agc_gain = None,
                Field::Temp => self.temp = None,
                _ => self.pressure = None,
            },
            FieldKind::Integer => *self.int_slot(field) = None,
            FieldKind::Vec3 => *self.vec3_slot(field) = None,
            FieldKind::Quat => self.quat = None,
        }
    }

    /// Current value of a column
    pub fn get(&self, field: Field) -> Option<Reading> {
        match field {
            Field::Image => self.image.clone().map(Reading::Text),
            Field::AecLevel => self.aec_level.map(Reading::Float),
            Field::AgcGain => self.agc_gain.map(Reading::Float),
            Field::Amb => self.amb.map(Reading::Int),
            Field::Red => self.r.map(Reading::Int),
            Field::Green => self.g.map(Reading::Int),
            Field::Blue => self.b.map(Reading::Int),
            Field::Temp => self.temp.map(Reading::Float),
            Field::Pressure => self.pressure.map(Reading::Float),
            Field::Humidity => self.humidity.map(Reading::Int),
            Field::Gas => self.gas.map(Reading::Int),
            Field::Co2 => self.co2.map(Reading::Int),
            Field::Accel => self.accel.map(Reading::Vec3),
            Field::Gyro => self.gyro.map(Reading::Vec3),
            Field::Euler => self.euler.map(Reading::Vec3),
            Field::Quat => self.quat.map(Reading::Quat),
        }
    }

    /// Cells in schema order; `None` for unknown columns
    pub fn cells(&self) -> impl Iterator<Item = (Field, Option<Reading>)> + '_ {
        Field::ALL.iter().map(move |&field| (field, self.get(field)))
    }

    fn set_float(&mut self, field: Field, value: f64) {
        match field {
            Field::AecLevel => self.aec_level = Some(value),
            Field::AgcGain => self.agc_gain = Some(value),
            Field::Temp => self.temp = Some(value),
            _ => self.pressure = Some(value),
        }
    }

    fn int_slot(&mut self, field: Field) -> &mut Option<i64> {
        match field {
            Field::Amb => &mut self.amb,
            Field::Red => &mut self.r,
            Field::Green => &mut self.g,
            Field::Blue => &mut self.b,
            Field::Humidity => &mut self.humidity,
            Field::Gas => &mut self.gas,
            _ => &mut self.co2,
        }
    }

    fn vec3_slot(&mut self, field: Field) -> &mut Option<[f32; 3]> {
        match field {
            Field::Accel => &mut self.accel,
            Field::Gyro => &mut self.gyro,
            _ => &mut self.euler,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> UnifiedRecord {
        UnifiedRecord::new(Timestamp::epoch())
    }

    #[test]
    fn header_lists_every_column_once() {
        assert_eq!(
            header(),
            "timestamp,image,aec_level,agc_gain,amb,r,g,b,temp,pressure,humidity,gas,co2,accel,gyro,euler,quat"
        );
    }

    #[test]
    fn names_round_trip_through_from_str() {
        for field in Field::ALL {
            assert_eq!(field.name().parse::<Field>().unwrap(), field);
        }
        assert_eq!(
            "uv".parse::<Field>(),
            Err(SchemaError::UnknownField("uv".into()))
        );
    }

    #[test]
    fn set_and_get_every_kind() {
        let mut rec = record();
        rec.set(Field::Image, Some(Reading::Text("00_x.jpg".into()))).unwrap();
        rec.set(Field::Temp, Some(Reading::Float(21.5))).unwrap();
        rec.set(Field::Pressure, Some(Reading::Int(1013))).unwrap();
        rec.set(Field::Co2, Some(Reading::Int(415))).unwrap();
        rec.set(Field::Gyro, Some(Reading::Vec3([0.1, 0.2, 0.3]))).unwrap();
        rec.set(Field::Quat, Some(Reading::Quat([0.0, 0.0, 0.0, 1.0]))).unwrap();

        assert_eq!(rec.image.as_deref(), Some("00_x.jpg"));
        assert_eq!(rec.temp, Some(21.5));
        assert_eq!(rec.pressure, Some(1013.0));
        assert_eq!(rec.co2, Some(415));
        assert_eq!(rec.get(Field::Gyro), Some(Reading::Vec3([0.1, 0.2, 0.3])));
        assert_eq!(rec.quat, Some([0.0, 0.0, 0.0, 1.0]));
        assert_eq!(rec.accel, None);
    }

    #[test]
    fn type_mismatch_leaves_column_untouched() {
        let mut rec = record();
        rec.set(Field::Amb, Some(Reading::Int(7))).unwrap();

        let err = rec.set(Field::Amb, Some(Reading::Float(7.5))).unwrap_err();
        assert_eq!(
            err,
            SchemaError::TypeMismatch { field: "amb", expected: "integer", got: "number" }
        );
        assert_eq!(rec.amb, Some(7));
    }

    #[test]
    fn clear_marks_unknown() {
        let mut rec = record();
        for field in Field::ALL {
            let sample = match field.kind() {
                FieldKind::Text => Reading::Text("f".into()),
                FieldKind::Integer => Reading::Int(1),
                FieldKind::Float => Reading::Float(1.0),
                FieldKind::Vec3 => Reading::Vec3([1.0; 3]),
                FieldKind::Quat => Reading::Quat([1.0; 4]),
            };
            rec.set(field, Some(sample)).unwrap();
        }
        assert!(rec.cells().all(|(_, v)| v.is_some()));

        for field in Field::ALL {
            rec.clear(field);
        }
        assert!(rec.cells().all(|(_, v)| v.is_none()));
    }

    #[test]
    fn vectors_render_as_tuples() {
        assert_eq!(Reading::Vec3([1.0, -2.5, 0.0]).to_string(), "(1, -2.5, 0)");
        assert_eq!(Reading::Float(3.0).to_string(), "3");
    }
}

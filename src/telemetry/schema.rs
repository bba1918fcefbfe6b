// src/telemetry/schema.rs
//
// Sensor schema registry.
//
// Each record in a telemetry payload starts with a one-byte sensor id. The id selects
// one of the rows below, which says how many payload bytes follow and how to name them.
// Adding a sensor type means adding a row here; the decode loop does not change.

use std::borrow::Cow;

// ============================================================================
// Types
// ============================================================================

/// How a sensor's payload bytes are laid out after its id byte
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Encoding {
    /// `count` little-endian IEEE-754 f32 values
    FloatList(u8),
    /// A single byte resolved through a label table
    EnumByte(&'static [(u8, &'static str)]),
}

impl Encoding {
    /// Number of payload bytes a record with this encoding occupies
    pub fn payload_len(&self) -> usize {
        match self {
            Encoding::FloatList(count) => 4 * *count as usize,
            Encoding::EnumByte(_) => 1,
        }
    }

    /// Resolve an enum byte to its label. Bytes outside the table map to
    /// `UNKNOWN_STATE_<n>`; float encodings have no labels.
    pub fn resolve_label(&self, byte: u8) -> Option<Cow<'static, str>> {
        match self {
            Encoding::FloatList(_) => None,
            Encoding::EnumByte(mapping) => Some(
                mapping
                    .iter()
                    .find(|(value, _)| *value == byte)
                    .map(|(_, label)| Cow::Borrowed(*label))
                    .unwrap_or_else(|| Cow::Owned(format!("UNKNOWN_STATE_{}", byte))),
            ),
        }
    }

    /// Reverse lookup used when re-encoding a reading
    pub fn byte_for_label(&self, label: &str) -> Option<u8> {
        match self {
            Encoding::FloatList(_) => None,
            Encoding::EnumByte(mapping) => mapping
                .iter()
                .find(|(_, l)| *l == label)
                .map(|(value, _)| *value),
        }
    }
}

/// One registry row
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorSchema {
    pub id: u8,
    pub name: &'static str,
    pub encoding: Encoding,
    pub field_names: &'static [&'static str],
}

impl SensorSchema {
    /// Bytes that must follow the id byte for a complete record
    pub fn payload_len(&self) -> usize {
        self.encoding.payload_len()
    }

    /// Name for the value at `index`. Positions beyond the declared names get a
    /// synthesized `value_<index>` name.
    pub fn field_name(&self, index: usize) -> Cow<'static, str> {
        match self.field_names.get(index) {
            Some(name) => Cow::Borrowed(*name),
            None => Cow::Owned(format!("value_{}", index)),
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Flight computer state machine, as reported by sensor id 5
pub const ROCKET_STATES: &[(u8, &str)] = &[
    (1, "IDLE"),
    (2, "BOOST"),
    (3, "BURNOUT"),
    (4, "COAST"),
    (5, "APOGEE"),
    (6, "DESCENT_DROGUE"),
    (7, "DESCENT_MAIN"),
    (8, "LANDED"),
];

static SENSOR_SCHEMAS: [SensorSchema; 7] = [
    SensorSchema {
        id: 0,
        name: "Barometer",
        encoding: Encoding::FloatList(2),
        field_names: &["altitude", "pressure"],
    },
    SensorSchema {
        id: 1,
        name: "IMU",
        encoding: Encoding::FloatList(8),
        field_names: &[
            "tilt_angle",
            "g_force_z",
            "accel_x",
            "accel_y",
            "accel_z",
            "velocity_x",
            "velocity_y",
            "velocity_z",
        ],
    },
    SensorSchema {
        id: 2,
        name: "Magnetometer",
        encoding: Encoding::FloatList(1),
        field_names: &["heading"],
    },
    SensorSchema {
        id: 3,
        name: "Temp_Humid",
        encoding: Encoding::FloatList(2),
        field_names: &["humidity", "temperature"],
    },
    SensorSchema {
        id: 4,
        name: "Real_Time_Clock",
        encoding: Encoding::FloatList(0),
        field_names: &[],
    },
    SensorSchema {
        id: 5,
        name: "Rocket_State",
        encoding: Encoding::EnumByte(ROCKET_STATES),
        field_names: &["state"],
    },
    SensorSchema {
        id: 6,
        name: "Time",
        encoding: Encoding::FloatList(0),
        field_names: &[],
    },
];

/// Every registered schema, ordered by id
pub fn schemas() -> &'static [SensorSchema] {
    &SENSOR_SCHEMAS
}

/// Find the schema for a sensor id
pub fn lookup(id: u8) -> Option<&'static SensorSchema> {
    SENSOR_SCHEMAS.iter().find(|schema| schema.id == id)
}

/// Ordered union of every declared field name. Used as the column set of
/// tabular logs so every reading fits the same header.
pub fn known_field_names() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = Vec::new();
    for schema in schemas() {
        for name in schema.field_names {
            if !names.contains(name) {
                names.push(name);
            }
        }
    }
    names
}

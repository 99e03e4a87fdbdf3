//! Named telemetry fields decoded from a read reply, and the offset table that
//! maps payload bytes onto them.
//!
//! The table is configuration, not logic: [`FieldMap::renogy_controller`]
//! describes the register block `0x0100..0x0121` of Renogy Rover/Wanderer
//! controllers read through a BT-1 module, and any other firmware can supply
//! its own map (see [`FieldMap::new`] or deserialize one from YAML).

use crate::Error;
use crate::ProtocolError;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Every field of a [`TelemetryRecord`], in output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    BatteryPercentage,
    BatteryVoltage,
    BatteryCurrent,
    ControllerTemperature,
    BatteryTemperature,
    LoadStatus,
    LoadVoltage,
    LoadCurrent,
    LoadPower,
    PvVoltage,
    PvCurrent,
    PvPower,
    MaxChargingPowerToday,
    MaxDischargingPowerToday,
    ChargingAmpHoursToday,
    DischargingAmpHoursToday,
    PowerGenerationToday,
    PowerConsumptionToday,
    PowerConsumptionTotal,
    PowerGenerationTotal,
    ChargingStatus,
}

impl Field {
    pub const COUNT: usize = 21;

    pub const ALL: [Field; Field::COUNT] = [
        Field::BatteryPercentage,
        Field::BatteryVoltage,
        Field::BatteryCurrent,
        Field::ControllerTemperature,
        Field::BatteryTemperature,
        Field::LoadStatus,
        Field::LoadVoltage,
        Field::LoadCurrent,
        Field::LoadPower,
        Field::PvVoltage,
        Field::PvCurrent,
        Field::PvPower,
        Field::MaxChargingPowerToday,
        Field::MaxDischargingPowerToday,
        Field::ChargingAmpHoursToday,
        Field::DischargingAmpHoursToday,
        Field::PowerGenerationToday,
        Field::PowerConsumptionToday,
        Field::PowerConsumptionTotal,
        Field::PowerGenerationTotal,
        Field::ChargingStatus,
    ];

    /// Key used for this field in JSON documents and CSV headers.
    pub fn name(self) -> &'static str {
        match self {
            Field::BatteryPercentage => "battery_percentage",
            Field::BatteryVoltage => "battery_voltage",
            Field::BatteryCurrent => "battery_current",
            Field::ControllerTemperature => "controller_temperature",
            Field::BatteryTemperature => "battery_temperature",
            Field::LoadStatus => "load_status",
            Field::LoadVoltage => "load_voltage",
            Field::LoadCurrent => "load_current",
            Field::LoadPower => "load_power",
            Field::PvVoltage => "pv_voltage",
            Field::PvCurrent => "pv_current",
            Field::PvPower => "pv_power",
            Field::MaxChargingPowerToday => "max_charging_power_today",
            Field::MaxDischargingPowerToday => "max_discharging_power_today",
            Field::ChargingAmpHoursToday => "charging_amp_hours_today",
            Field::DischargingAmpHoursToday => "discharging_amp_hours_today",
            Field::PowerGenerationToday => "power_generation_today",
            Field::PowerConsumptionToday => "power_consumption_today",
            Field::PowerConsumptionTotal => "power_consumption_total",
            Field::PowerGenerationTotal => "power_generation_total",
            Field::ChargingStatus => "charging_status",
        }
    }
}

/// Divisor applied to the raw register value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scale {
    #[default]
    Unit,
    Deci,
    Centi,
    Milli,
}

impl Scale {
    fn divisor(self) -> f64 {
        match self {
            Scale::Unit => 1.0,
            Scale::Deci => 10.0,
            Scale::Centi => 100.0,
            Scale::Milli => 1000.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signedness {
    #[default]
    Unsigned,
    TwosComplement,
    /// Top bit is the sign, remaining bits the magnitude (controller temperatures).
    SignMagnitude,
}

/// Location and encoding of one field inside the read reply payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub field: Field,
    /// Byte offset from the start of the payload (after the byte count).
    pub offset: usize,
    /// Width in bytes, big-endian: 1, 2 or 4.
    pub width: usize,
    #[serde(default)]
    pub scale: Scale,
    #[serde(default)]
    pub sign: Signedness,
    /// Right shift applied before sign handling, for values packed in the upper bits.
    #[serde(default)]
    pub shift: u8,
}

impl FieldSpec {
    pub fn new(field: Field, offset: usize, width: usize) -> Self {
        Self {
            field,
            offset,
            width,
            scale: Scale::Unit,
            sign: Signedness::Unsigned,
            shift: 0,
        }
    }

    pub fn scaled(mut self, scale: Scale) -> Self {
        self.scale = scale;
        self
    }

    pub fn signed(mut self, sign: Signedness) -> Self {
        self.sign = sign;
        self
    }

    pub fn shifted(mut self, shift: u8) -> Self {
        self.shift = shift;
        self
    }

    fn end(&self) -> usize {
        self.offset + self.width
    }

    /// Raw integer after shift and sign handling. `payload` must cover `offset + width`.
    fn raw(&self, payload: &[u8]) -> i64 {
        let bytes = &payload[self.offset..self.end()];
        let unsigned = bytes
            .iter()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
            >> self.shift;
        let bits = (self.width * 8) as u32 - u32::from(self.shift);
        let sign_bit = 1u64 << (bits - 1);
        match self.sign {
            Signedness::Unsigned => unsigned as i64,
            Signedness::TwosComplement if unsigned & sign_bit != 0 => {
                unsigned as i64 - (1i64 << bits)
            }
            Signedness::TwosComplement => unsigned as i64,
            Signedness::SignMagnitude => {
                let magnitude = (unsigned & (sign_bit - 1)) as i64;
                if unsigned & sign_bit != 0 {
                    -magnitude
                } else {
                    magnitude
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Reading {
    raw: i64,
    value: f64,
}

/// A validated offset table covering every [`Field`] exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<FieldSpec>", into = "Vec<FieldSpec>")]
pub struct FieldMap {
    specs: Vec<FieldSpec>,
    required_len: usize,
}

impl FieldMap {
    pub fn new(specs: Vec<FieldSpec>) -> Result<Self, Error> {
        let mut seen = [false; Field::COUNT];
        for spec in &specs {
            if !matches!(spec.width, 1 | 2 | 4) {
                return Err(Error::InvalidArgument(format!(
                    "field '{}' has unsupported width {}",
                    spec.field.name(),
                    spec.width
                )));
            }
            if spec.offset.checked_add(spec.width).is_none() {
                return Err(Error::InvalidArgument(format!(
                    "field '{}' offset {} out of range",
                    spec.field.name(),
                    spec.offset
                )));
            }
            if usize::from(spec.shift) >= spec.width * 8 {
                return Err(Error::InvalidArgument(format!(
                    "field '{}' shift {} exceeds its width",
                    spec.field.name(),
                    spec.shift
                )));
            }
            // The status code is a single unsigned byte on the wire.
            if spec.field == Field::ChargingStatus
                && (spec.width != 1 || spec.sign != Signedness::Unsigned)
            {
                return Err(Error::InvalidArgument(format!(
                    "field '{}' must be one unsigned byte",
                    spec.field.name()
                )));
            }
            if std::mem::replace(&mut seen[spec.field as usize], true) {
                return Err(Error::InvalidArgument(format!(
                    "field '{}' mapped more than once",
                    spec.field.name()
                )));
            }
        }
        if let Some(missing) = Field::ALL.iter().find(|f| !seen[**f as usize]) {
            return Err(Error::InvalidArgument(format!(
                "field '{}' is not mapped",
                missing.name()
            )));
        }
        Ok(Self::from_specs(specs))
    }

    fn from_specs(specs: Vec<FieldSpec>) -> Self {
        let required_len = specs.iter().map(FieldSpec::end).max().unwrap_or(0);
        Self {
            specs,
            required_len,
        }
    }

    /// Register block `0x0100` read as 34 words (68 payload bytes).
    pub fn renogy_controller() -> Self {
        use Field::*;
        use Scale::*;
        Self::from_specs(vec![
            FieldSpec::new(BatteryPercentage, 0, 2),
            FieldSpec::new(BatteryVoltage, 2, 2).scaled(Deci),
            FieldSpec::new(BatteryCurrent, 4, 2).scaled(Centi),
            FieldSpec::new(ControllerTemperature, 6, 1).signed(Signedness::SignMagnitude),
            FieldSpec::new(BatteryTemperature, 7, 1).signed(Signedness::SignMagnitude),
            FieldSpec::new(LoadVoltage, 8, 2).scaled(Deci),
            FieldSpec::new(LoadCurrent, 10, 2).scaled(Centi),
            FieldSpec::new(LoadPower, 12, 2),
            FieldSpec::new(PvVoltage, 14, 2).scaled(Deci),
            FieldSpec::new(PvCurrent, 16, 2).scaled(Centi),
            FieldSpec::new(PvPower, 18, 2),
            FieldSpec::new(MaxChargingPowerToday, 30, 2),
            FieldSpec::new(MaxDischargingPowerToday, 32, 2),
            FieldSpec::new(ChargingAmpHoursToday, 34, 2),
            FieldSpec::new(DischargingAmpHoursToday, 36, 2),
            FieldSpec::new(PowerGenerationToday, 38, 2),
            FieldSpec::new(PowerConsumptionToday, 40, 2),
            FieldSpec::new(PowerGenerationTotal, 56, 4),
            FieldSpec::new(PowerConsumptionTotal, 60, 4),
            FieldSpec::new(Field::LoadStatus, 64, 1).shifted(7),
            FieldSpec::new(Field::ChargingStatus, 65, 1),
        ])
    }

    pub fn specs(&self) -> &[FieldSpec] {
        &self.specs
    }

    /// Smallest payload length that covers every mapped field.
    pub fn required_len(&self) -> usize {
        self.required_len
    }

    /// Walks the table over a read reply payload.
    pub fn decode(&self, payload: &[u8]) -> Result<TelemetryRecord, ProtocolError> {
        if payload.len() < self.required_len {
            return Err(ProtocolError::PayloadTooShort {
                required: self.required_len,
                actual: payload.len(),
            });
        }
        let mut readings = [Reading::default(); Field::COUNT];
        for spec in &self.specs {
            let raw = spec.raw(payload);
            readings[spec.field as usize] = Reading {
                raw,
                value: raw as f64 / spec.scale.divisor(),
            };
        }
        let value = |field: Field| readings[field as usize].value;
        let raw = |field: Field| readings[field as usize].raw;

        Ok(TelemetryRecord {
            battery_percentage: value(Field::BatteryPercentage),
            battery_voltage: value(Field::BatteryVoltage),
            battery_current: value(Field::BatteryCurrent),
            controller_temperature: value(Field::ControllerTemperature),
            battery_temperature: value(Field::BatteryTemperature),
            load_status: LoadStatus::from(raw(Field::LoadStatus) != 0),
            load_voltage: value(Field::LoadVoltage),
            load_current: value(Field::LoadCurrent),
            load_power: value(Field::LoadPower),
            pv_voltage: value(Field::PvVoltage),
            pv_current: value(Field::PvCurrent),
            pv_power: value(Field::PvPower),
            max_charging_power_today: value(Field::MaxChargingPowerToday),
            max_discharging_power_today: value(Field::MaxDischargingPowerToday),
            charging_amp_hours_today: value(Field::ChargingAmpHoursToday),
            discharging_amp_hours_today: value(Field::DischargingAmpHoursToday),
            power_generation_today: value(Field::PowerGenerationToday),
            power_consumption_today: value(Field::PowerConsumptionToday),
            power_consumption_total: value(Field::PowerConsumptionTotal),
            power_generation_total: value(Field::PowerGenerationTotal),
            charging_status: u8::try_from(raw(Field::ChargingStatus))
                .map_or(ChargingStatus::Unknown(u8::MAX), ChargingStatus::from),
        })
    }
}

impl Default for FieldMap {
    fn default() -> Self {
        Self::renogy_controller()
    }
}

impl TryFrom<Vec<FieldSpec>> for FieldMap {
    type Error = Error;

    fn try_from(specs: Vec<FieldSpec>) -> Result<Self, Self::Error> {
        Self::new(specs)
    }
}

impl From<FieldMap> for Vec<FieldSpec> {
    fn from(map: FieldMap) -> Self {
        map.specs
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadStatus {
    On,
    Off,
}

impl From<bool> for LoadStatus {
    fn from(on: bool) -> Self {
        if on {
            LoadStatus::On
        } else {
            LoadStatus::Off
        }
    }
}

impl fmt::Display for LoadStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LoadStatus::On => write!(f, "on"),
            LoadStatus::Off => write!(f, "off"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargingStatus {
    Deactivated,
    Activated,
    Mppt,
    Equalizing,
    Boost,
    Floating,
    CurrentLimiting,
    Unknown(u8),
}

impl From<u8> for ChargingStatus {
    fn from(code: u8) -> Self {
        match code {
            0 => ChargingStatus::Deactivated,
            1 => ChargingStatus::Activated,
            2 => ChargingStatus::Mppt,
            3 => ChargingStatus::Equalizing,
            4 => ChargingStatus::Boost,
            5 => ChargingStatus::Floating,
            6 => ChargingStatus::CurrentLimiting,
            other => ChargingStatus::Unknown(other),
        }
    }
}

impl fmt::Display for ChargingStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChargingStatus::Deactivated => write!(f, "deactivated"),
            ChargingStatus::Activated => write!(f, "activated"),
            ChargingStatus::Mppt => write!(f, "mppt"),
            ChargingStatus::Equalizing => write!(f, "equalizing"),
            ChargingStatus::Boost => write!(f, "boost"),
            ChargingStatus::Floating => write!(f, "floating"),
            ChargingStatus::CurrentLimiting => write!(f, "current limiting"),
            ChargingStatus::Unknown(code) => write!(f, "unknown({code})"),
        }
    }
}

impl Serialize for ChargingStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// One decoded snapshot of controller state; the unit handed to every sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryRecord {
    pub battery_percentage: f64,
    pub battery_voltage: f64,
    pub battery_current: f64,
    pub controller_temperature: f64,
    pub battery_temperature: f64,
    pub load_status: LoadStatus,
    pub load_voltage: f64,
    pub load_current: f64,
    pub load_power: f64,
    pub pv_voltage: f64,
    pub pv_current: f64,
    pub pv_power: f64,
    pub max_charging_power_today: f64,
    pub max_discharging_power_today: f64,
    pub charging_amp_hours_today: f64,
    pub discharging_amp_hours_today: f64,
    pub power_generation_today: f64,
    pub power_consumption_today: f64,
    pub power_consumption_total: f64,
    pub power_generation_total: f64,
    pub charging_status: ChargingStatus,
}

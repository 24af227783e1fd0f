//! Composite sample records and their serialized line format.
//!
//! One [`SampleRecord`] is assembled per sampling tick from the particulate
//! reading (raw and filtered), the collaborator sensors, and the node's
//! bookkeeping fields. The same space-separated field layout is used for the
//! per-sample published message and for log file lines; only the decimal
//! separator differs, since the original deployment region wrote comma
//! decimals in its archives.

use crate::filter::FilteredReading;
use crate::opc::RawReading;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Fixed column-header line written after the description line of every log
/// file.
pub const COLUMN_HEADER: &str = "sample date_time latitude longitude gps_error \
co_1 co_2 no2_1 no2_2 \
pm1_opc pm25_opc pm10_opc pm1_opc_filt pm25_opc_filt pm10_opc_filt \
temperature pressure humidity \
power kp_base kd_base event image_file \
acceleration_1 acceleration_2 acceleration_3 \
pm1_secondary pm25_secondary pm4_secondary pm10_secondary ip sampling_period";

/// Decimal separator used when rendering value fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecimalStyle {
    #[default]
    Point,
    Comma,
}

/// A GPS fix, or all-sentinel when the receiver has none.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal dilution of precision, or -1 when unavailable.
    pub error: f64,
}

impl GpsFix {
    pub const NO_FIX: GpsFix = GpsFix {
        latitude: -1.0,
        longitude: -1.0,
        error: -1.0,
    };
}

/// Gas, environment, power and acceleration values from the auxiliary
/// sensors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AuxReading {
    pub gas_co_1: f64,
    pub gas_co_2: f64,
    pub gas_no2_1: f64,
    pub gas_no2_2: f64,
    pub temperature: f64,
    pub pressure: f64,
    pub humidity: f64,
    pub power: f64,
    pub acceleration: [f64; 3],
}

/// Reading from the secondary particulate sensor, sentinel -1 on no reply.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SecondaryPmReading {
    pub pm1: f64,
    pub pm2_5: f64,
    pub pm4: f64,
    pub pm10: f64,
}

impl SecondaryPmReading {
    pub const NO_REPLY: SecondaryPmReading = SecondaryPmReading {
        pm1: -1.0,
        pm2_5: -1.0,
        pm4: -1.0,
        pm10: -1.0,
    };
}

/// One row destined for the log and the sensor-data topic. Immutable once
/// constructed.
#[derive(Debug, Clone)]
pub struct SampleRecord {
    pub iteration: u64,
    pub timestamp: DateTime<Local>,
    pub gps: GpsFix,
    pub aux: AuxReading,
    pub raw: RawReading,
    pub filtered: FilteredReading,
    pub kp_base: f64,
    pub kd_base: f64,
    pub event: String,
    pub image_file: String,
    pub secondary: SecondaryPmReading,
    pub ip: String,
    pub sampling_period_secs: u32,
}

impl SampleRecord {
    /// Renders the record as one space-separated line in the fixed field
    /// order of [`COLUMN_HEADER`].
    pub fn to_line(&self, style: DecimalStyle) -> String {
        let num = |v: f64| fmt_value(v, style);
        let fields: Vec<String> = vec![
            self.iteration.to_string(),
            self.timestamp.format("%Y-%m-%dT%H:%M:%S").to_string(),
            num(self.gps.latitude),
            num(self.gps.longitude),
            num(self.gps.error),
            num(self.aux.gas_co_1),
            num(self.aux.gas_co_2),
            num(self.aux.gas_no2_1),
            num(self.aux.gas_no2_2),
            num(self.raw.pm1),
            num(self.raw.pm2_5),
            num(self.raw.pm10),
            num(self.filtered.pm1),
            num(self.filtered.pm2_5),
            num(self.filtered.pm10),
            num(self.aux.temperature),
            num(self.aux.pressure),
            num(self.aux.humidity),
            num(self.aux.power),
            num(self.kp_base),
            num(self.kd_base),
            self.event.clone(),
            self.image_file.clone(),
            num(self.aux.acceleration[0]),
            num(self.aux.acceleration[1]),
            num(self.aux.acceleration[2]),
            num(self.secondary.pm1),
            num(self.secondary.pm2_5),
            num(self.secondary.pm4),
            num(self.secondary.pm10),
            self.ip.clone(),
            self.sampling_period_secs.to_string(),
        ];
        fields.join(" ")
    }
}

fn fmt_value(value: f64, style: DecimalStyle) -> String {
    let rendered = value.to_string();
    match style {
        DecimalStyle::Point => rendered,
        DecimalStyle::Comma => rendered.replace('.', ","),
    }
}

//! Sensor Multilevel (0x31)
//!
//! Values are created from the first report of each sensor type; the type
//! byte is the value index.

use byteorder::{BigEndian, ByteOrder};
use tracing::{debug, warn};
use zwrust_core::constants::command_class;
use zwrust_types::{ValueGenre, ValueType};

use super::{CcContext, CommandClassHandler, RequestFlags};
use crate::driver::queue::MsgQueue;
use crate::value::{Value, ValueData};

const GET: u8 = 0x04;
const REPORT: u8 = 0x05;

const PRECISION_SHIFT: u8 = 5;
const SCALE_SHIFT: u8 = 3;
const SCALE_MASK: u8 = 0x18;
const SIZE_MASK: u8 = 0x07;

/// Label and per-scale units of known sensor types
fn sensor_type(kind: u8) -> (&'static str, &'static [&'static str]) {
    match kind {
        1 => ("Temperature", &["C", "F"]),
        2 => ("General", &["%", ""]),
        3 => ("Luminance", &["%", "lux"]),
        4 => ("Power", &["W", "BTU/h"]),
        5 => ("Relative Humidity", &["%"]),
        6 => ("Velocity", &["m/s", "mph"]),
        8 => ("Atmospheric Pressure", &["kPa", "inHg"]),
        15 => ("Voltage", &["V", "mV"]),
        16 => ("Current", &["A", "mA"]),
        17 => ("CO2 Level", &["ppm"]),
        _ => ("Unknown", &[]),
    }
}

/// Decode the `[precision|scale|size][value...]` part of a report
///
/// Returns the decimal text and the scale.
pub fn decode_reading(data: &[u8]) -> Option<(String, u8)> {
    let (&header, rest) = data.split_first()?;
    let size = (header & SIZE_MASK) as usize;
    let scale = (header & SCALE_MASK) >> SCALE_SHIFT;
    let precision = (header >> PRECISION_SHIFT) as u32;

    if !matches!(size, 1 | 2 | 4) || rest.len() < size {
        return None;
    }
    let raw = BigEndian::read_int(&rest[..size], size);
    Some((format_decimal(raw, precision), scale))
}

fn format_decimal(raw: i64, precision: u32) -> String {
    if precision == 0 {
        return raw.to_string();
    }
    let divisor = 10i64.pow(precision);
    let sign = if raw < 0 { "-" } else { "" };
    let abs = raw.unsigned_abs() as i64;
    format!(
        "{}{}.{:0width$}",
        sign,
        abs / divisor,
        abs % divisor,
        width = precision as usize
    )
}

#[derive(Debug, Default)]
pub struct SensorMultilevel;

impl CommandClassHandler for SensorMultilevel {
    fn id(&self) -> u8 {
        command_class::SENSOR_MULTILEVEL
    }

    fn name(&self) -> &'static str {
        "COMMAND_CLASS_SENSOR_MULTILEVEL"
    }

    fn request_state(
        &self,
        ctx: &mut CcContext<'_>,
        flags: RequestFlags,
        instance: u8,
        queue: MsgQueue,
    ) -> bool {
        flags.contains(RequestFlags::DYNAMIC) && self.request_value(ctx, 0, instance, queue)
    }

    fn request_value(&self, ctx: &mut CcContext<'_>, _index: u8, instance: u8, queue: MsgQueue) -> bool {
        ctx.send_request("SensorMultilevelCmd_Get", instance, &[GET], queue)
    }

    fn handle_msg(&mut self, ctx: &mut CcContext<'_>, data: &[u8], instance: u8) -> bool {
        let [REPORT, kind, reading @ ..] = data else {
            return false;
        };
        let Some((text, scale)) = decode_reading(reading) else {
            warn!(node_id = ctx.node_id, "Malformed sensor report: {}", hex::encode(data));
            return false;
        };

        if ctx.value(instance, *kind).is_none() {
            let (label, units) = sensor_type(*kind);
            let unit = units.get(scale as usize).copied().unwrap_or("");
            match ctx.value_id(ValueGenre::User, instance, *kind, ValueType::Decimal) {
                Ok(id) => {
                    let label = ctx.label(&format!("sensor_multilevel.{}", kind), label);
                    ctx.add_value(Value::new(id, label).with_units(unit).read_only());
                }
                Err(e) => {
                    warn!(node_id = ctx.node_id, "Sensor value not created: {}", e);
                    return false;
                }
            }
        }

        debug!(node_id = ctx.node_id, kind, reading = %text, scale, "Received sensor report");
        self.update_value(ctx, instance, *kind, ValueData::Decimal(text));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_classes::testing::Harness;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_decode_reading() {
        // precision 2, scale 0, size 2: 0x0866 = 2150
        assert_eq!(decode_reading(&[0x42, 0x08, 0x66]), Some(("21.50".to_string(), 0)));
        // precision 1, scale 1, size 1, negative
        assert_eq!(decode_reading(&[0x29, 0xF6]), Some(("-1.0".to_string(), 1)));
        // precision 0, size 4
        assert_eq!(decode_reading(&[0x04, 0x00, 0x01, 0x00, 0x00]), Some(("65536".to_string(), 0)));
        assert_eq!(decode_reading(&[0x03, 0x00]), None);
        assert_eq!(decode_reading(&[0x02, 0x00]), None);
    }

    #[test]
    fn test_report_creates_value() {
        let mut harness = Harness::new();
        let mut sensor = SensorMultilevel;

        assert!(sensor.handle_msg(&mut harness.ctx(command_class::SENSOR_MULTILEVEL), &[REPORT, 0x01, 0x42, 0x08, 0x66], 1));

        let value = harness.values.find(command_class::SENSOR_MULTILEVEL, 1, 1).unwrap();
        assert_eq!(value.label(), "Temperature");
        assert_eq!(value.units(), "C");
        assert_eq!(value.data(), ValueData::Decimal("21.50".into()));
        assert_eq!(harness.out.notifications.len(), 2);
    }
}

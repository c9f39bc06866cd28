//! Configuration (0x70)
//!
//! Parameters are device specific. A value appears the first time a
//! parameter is reported, typed after the reported size.

use byteorder::{BigEndian, ByteOrder};
use tracing::{debug, warn};
use zwrust_core::constants::command_class;
use zwrust_types::{ValueGenre, ValueType};

use super::{CcContext, CommandClassHandler, RequestFlags};
use crate::driver::queue::MsgQueue;
use crate::error::{Error, Result};
use crate::value::{Value, ValueData};

const SET: u8 = 0x04;
const GET: u8 = 0x05;
const REPORT: u8 = 0x06;

const SIZE_MASK: u8 = 0x07;

/// Read every known parameter again
///
/// Used when discovery is sent back to the configuration stage.
pub fn request_all(ctx: &mut CcContext<'_>, queue: MsgQueue) -> bool {
    let params: Vec<u8> = ctx
        .values
        .of_genre(ValueGenre::Config)
        .iter()
        .filter(|v| !v.is_write_only())
        .map(|v| v.id())
        .filter(|id| id.command_class_id == command_class::CONFIGURATION)
        .map(|id| id.index)
        .collect();

    let mut queued = false;
    for param in params {
        queued |= request_param(ctx, param, queue);
    }
    queued
}

fn request_param(ctx: &mut CcContext<'_>, param: u8, queue: MsgQueue) -> bool {
    ctx.send_request("ConfigurationCmd_Get", 1, &[GET, param], queue)
}

fn value_type(size: u8) -> Option<ValueType> {
    match size {
        1 => Some(ValueType::Byte),
        2 => Some(ValueType::Short),
        4 => Some(ValueType::Int),
        _ => None,
    }
}

/// Big-endian wire bytes of a parameter value
fn encode(data: &ValueData) -> Option<Vec<u8>> {
    match *data {
        ValueData::Byte(v) => Some(vec![v]),
        ValueData::Short(v) => {
            let mut buf = vec![0; 2];
            BigEndian::write_i16(&mut buf, v);
            Some(buf)
        }
        ValueData::Int(v) => {
            let mut buf = vec![0; 4];
            BigEndian::write_i32(&mut buf, v);
            Some(buf)
        }
        _ => None,
    }
}

fn decode(size: u8, raw: &[u8]) -> Option<ValueData> {
    let size = size as usize;
    if raw.len() < size {
        return None;
    }
    match size {
        1 => Some(ValueData::Byte(raw[0])),
        2 => Some(ValueData::Short(BigEndian::read_i16(raw))),
        4 => Some(ValueData::Int(BigEndian::read_i32(raw))),
        _ => None,
    }
}

#[derive(Debug, Default)]
pub struct Configuration;

impl CommandClassHandler for Configuration {
    fn id(&self) -> u8 {
        command_class::CONFIGURATION
    }

    fn name(&self) -> &'static str {
        "COMMAND_CLASS_CONFIGURATION"
    }

    fn request_state(
        &self,
        ctx: &mut CcContext<'_>,
        flags: RequestFlags,
        _instance: u8,
        queue: MsgQueue,
    ) -> bool {
        flags.contains(RequestFlags::SESSION) && request_all(ctx, queue)
    }

    fn request_value(&self, ctx: &mut CcContext<'_>, index: u8, _instance: u8, queue: MsgQueue) -> bool {
        request_param(ctx, index, queue)
    }

    fn handle_msg(&mut self, ctx: &mut CcContext<'_>, data: &[u8], instance: u8) -> bool {
        let [REPORT, param, size, raw @ ..] = data else {
            return false;
        };
        let size = size & SIZE_MASK;
        let (Some(value_type), Some(reading)) = (value_type(size), decode(size, raw)) else {
            warn!(node_id = ctx.node_id, param, size, "Unsupported configuration report");
            return false;
        };

        match ctx.value(instance, *param) {
            Some(existing) if existing.id().value_type != value_type => {
                // Parameter changed size; the old value cannot hold the reading
                warn!(node_id = ctx.node_id, param, "Configuration parameter changed size");
                return false;
            }
            Some(_) => {}
            None => match ctx.value_id(ValueGenre::Config, instance, *param, value_type) {
                Ok(id) => {
                    let label = ctx.label(
                        &format!("configuration.{}", param),
                        &format!("Parameter #{}", param),
                    );
                    ctx.add_value(Value::new(id, label));
                }
                Err(e) => {
                    warn!(node_id = ctx.node_id, "Parameter value not created: {}", e);
                    return false;
                }
            },
        }

        debug!(node_id = ctx.node_id, param, value = %reading, "Configuration parameter reported");
        self.update_value(ctx, instance, *param, reading);
        true
    }

    fn set_value(&self, ctx: &mut CcContext<'_>, value: &Value, data: &ValueData) -> Result<bool> {
        let id = value.id();
        let bytes = encode(data).ok_or(Error::TypeMismatch {
            id,
            expected: id.value_type,
            actual: data.value_type(),
        })?;

        let mut command = vec![SET, id.index, bytes.len() as u8];
        command.extend_from_slice(&bytes);
        let msg = ctx.command("ConfigurationCmd_Set", id.instance, &command)?;
        ctx.send_set(msg, id);
        Ok(true)
    }
}

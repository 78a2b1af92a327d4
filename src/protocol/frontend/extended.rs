//! Extended query protocol messages.
//!
//! Parameters travel in text format and the server infers their types, so a
//! statement is sent as one unnamed Parse/Bind/Describe/Execute/Sync batch.

use crate::protocol::codec::MessageBuilder;
use crate::protocol::types::FormatCode;

/// Write a Parse message for the unnamed statement.
///
/// Every parameter type is left for the server to infer.
pub fn write_parse(buf: &mut Vec<u8>, query: &str, param_count: usize) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::PARSE);
    msg.write_cstr("");
    msg.write_cstr(query);
    msg.write_i16(param_count as i16);
    for _ in 0..param_count {
        msg.write_i32(0);
    }
    msg.finish();
}

/// Write a Bind message binding text parameters to the unnamed portal.
///
/// `None` binds SQL NULL. Results are requested in text format.
pub fn write_bind(buf: &mut Vec<u8>, params: &[Option<&[u8]>]) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::BIND);
    msg.write_cstr("");
    msg.write_cstr("");

    // A single format code applies to every parameter
    msg.write_i16(1);
    msg.write_i16(FormatCode::Text as i16);

    msg.write_i16(params.len() as i16);
    for param in params {
        match param {
            Some(value) => {
                msg.write_i32(value.len() as i32);
                msg.write_bytes(value);
            }
            None => msg.write_i32(-1),
        }
    }

    msg.write_i16(1);
    msg.write_i16(FormatCode::Text as i16);
    msg.finish();
}

/// Write a Describe message for the unnamed portal.
pub fn write_describe_portal(buf: &mut Vec<u8>) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::DESCRIBE);
    msg.write_u8(b'P');
    msg.write_cstr("");
    msg.finish();
}

/// Write an Execute message for the unnamed portal with no row limit.
pub fn write_execute(buf: &mut Vec<u8>) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::EXECUTE);
    msg.write_cstr("");
    msg.write_i32(0);
    msg.finish();
}

/// Write a Sync message.
///
/// Ends the batch; the server answers with ReadyForQuery even after an error.
pub fn write_sync(buf: &mut Vec<u8>) {
    let msg = MessageBuilder::new(buf, super::msg_type::SYNC);
    msg.finish();
}

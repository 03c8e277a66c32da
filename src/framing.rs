//! Binary frame layer of the protocol.
//!
//! Binary frames start with a one-byte opcode followed by a fixed
//! little-endian header and a trailing payload. Server-bound and client-bound
//! opcodes are separate namespaces.

use std::io::{Cursor, Write};
use std::mem::size_of;

use thiserror::Error;

use crate::protocol_types::{ClientChannelId, ServiceId, SubscriptionId};

const MESSAGE_DATA: u8 = 0x01;
const TIME: u8 = 0x02;
const SERVICE_CALL_RESPONSE: u8 = 0x03;

const CLIENT_MESSAGE_DATA: u8 = 0x01;
const CLIENT_SERVICE_CALL_REQUEST: u8 = 0x02;

const SERVICE_CALL_REQUEST_HEADER_LEN: usize = 13;

/// Reasons an inbound binary frame is rejected. The display text is sent
/// verbatim to the client as a `status` error.
#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum FramingError {
    #[error("Received invalid binary message of size {0}")]
    Undersized(usize),
    #[error("Received binary message with invalid operation {0}")]
    UnknownOpcode(u8),
    #[error("Received truncated binary message")]
    Truncated,
    #[error("Service call encoding is not valid UTF-8")]
    InvalidEncoding,
}

/// Builds a `MESSAGE_DATA` frame addressed by the receiving client's own
/// subscription id.
pub(crate) fn message_data(
    subscription_id: SubscriptionId,
    timestamp_ns: u64,
    payload: &[u8],
) -> anyhow::Result<Vec<u8>> {
    let mut buffer =
        vec![0; size_of::<u8>() + size_of::<u32>() + size_of::<u64>() + payload.len()];
    {
        let mut w = Cursor::new(&mut buffer);
        w.write_all(&MESSAGE_DATA.to_le_bytes())?;
        w.write_all(&subscription_id.to_le_bytes())?;
        w.write_all(&timestamp_ns.to_le_bytes())?;
        w.write_all(payload)?;
    }
    Ok(buffer)
}

/// Builds a `TIME` frame.
pub(crate) fn time_data(timestamp_ns: u64) -> anyhow::Result<Vec<u8>> {
    let mut buffer = vec![0; size_of::<u8>() + size_of::<u64>()];
    {
        let mut w = Cursor::new(&mut buffer);
        w.write_all(&TIME.to_le_bytes())?;
        w.write_all(&timestamp_ns.to_le_bytes())?;
    }
    Ok(buffer)
}

/// Builds a `SERVICE_CALL_RESPONSE` frame echoing the request's service id,
/// call id and encoding.
pub(crate) fn service_call_response(
    service_id: ServiceId,
    call_id: u32,
    encoding: &str,
    payload: &[u8],
) -> anyhow::Result<Vec<u8>> {
    let mut buffer = vec![
        0;
        size_of::<u8>()
            + 3 * size_of::<u32>()
            + encoding.len()
            + payload.len()
    ];
    {
        let mut w = Cursor::new(&mut buffer);
        w.write_all(&SERVICE_CALL_RESPONSE.to_le_bytes())?;
        w.write_all(&service_id.to_le_bytes())?;
        w.write_all(&call_id.to_le_bytes())?;
        w.write_all(&(encoding.len() as u32).to_le_bytes())?;
        w.write_all(encoding.as_bytes())?;
        w.write_all(payload)?;
    }
    Ok(buffer)
}

/// A decoded client-to-server binary frame, borrowing from the raw message.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ClientFrame<'a> {
    MessageData {
        channel_id: ClientChannelId,
        payload: &'a [u8],
    },
    ServiceCallRequest {
        service_id: ServiceId,
        call_id: u32,
        encoding: &'a str,
        payload: &'a [u8],
    },
}

fn u32_at(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

pub(crate) fn decode_client_frame(data: &[u8]) -> Result<ClientFrame<'_>, FramingError> {
    if data.len() < 5 {
        return Err(FramingError::Undersized(data.len()));
    }
    match data[0] {
        CLIENT_MESSAGE_DATA => Ok(ClientFrame::MessageData {
            channel_id: u32_at(data, 1),
            payload: &data[5..],
        }),
        CLIENT_SERVICE_CALL_REQUEST => {
            if data.len() < SERVICE_CALL_REQUEST_HEADER_LEN {
                return Err(FramingError::Truncated);
            }
            let encoding_len = u32_at(data, 9) as usize;
            let payload_start = SERVICE_CALL_REQUEST_HEADER_LEN
                .checked_add(encoding_len)
                .ok_or(FramingError::Truncated)?;
            if data.len() < payload_start {
                return Err(FramingError::Truncated);
            }
            let encoding = std::str::from_utf8(&data[SERVICE_CALL_REQUEST_HEADER_LEN..payload_start])
                .map_err(|_| FramingError::InvalidEncoding)?;
            Ok(ClientFrame::ServiceCallRequest {
                service_id: u32_at(data, 1),
                call_id: u32_at(data, 5),
                encoding,
                payload: &data[payload_start..],
            })
        }
        op => Err(FramingError::UnknownOpcode(op)),
    }
}

//! Records sent by instrumented code back to the tool.
//!
//! Every record starts with a [`SampleHeader`]; `type_` selects the layout
//! that follows.

use plain::Plain;
use thiserror::Error;

use crate::{Address, Pid, Timestamp};

pub mod msg_type {
    pub const SAMPLE_REPORT: u32 = 1;
    pub const TRACE: u32 = 2;
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MessageError {
    #[error("record too short: expected {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    #[error("unknown record type {0}")]
    UnknownType(u32),
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct SampleHeader {
    pub size: u32,
    pub type_: u32,
    pub timestamp: u64,
}
unsafe impl Plain for SampleHeader {}

/// Cumulative value of a pushed data source, reported by the sampling routine
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct SampleReportMsg {
    pub header: SampleHeader,
    pub pid: u32,
    pub _pad: u32,
    pub address: u64,
    pub value: i64,
}
unsafe impl Plain for SampleReportMsg {}

/// Header of a trace record; `len` payload bytes follow it
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct TraceMsg {
    pub header: SampleHeader,
    pub pid: u32,
    pub len: u32,
    pub address: u64,
}
unsafe impl Plain for TraceMsg {}

/// A decoded record
#[derive(Debug, PartialEq)]
pub enum Message<'a> {
    SampleReport(SampleReportMsg),
    Trace(TraceMsg, &'a [u8]),
}

fn copy_record<T: Plain + Default>(data: &[u8]) -> Result<T, MessageError> {
    let mut record = T::default();
    plain::copy_from_bytes(&mut record, data).map_err(|_| MessageError::TooShort {
        expected: std::mem::size_of::<T>(),
        actual: data.len(),
    })?;
    Ok(record)
}

/// Decodes a record of any known type
pub fn parse(data: &[u8]) -> Result<Message<'_>, MessageError> {
    let header: SampleHeader = copy_record(data)?;
    match header.type_ {
        msg_type::SAMPLE_REPORT => Ok(Message::SampleReport(copy_record(data)?)),
        msg_type::TRACE => {
            let trace: TraceMsg = copy_record(data)?;
            let offset = std::mem::size_of::<TraceMsg>();
            let end = offset + trace.len as usize;
            let payload = data.get(offset..end).ok_or(MessageError::TooShort {
                expected: end,
                actual: data.len(),
            })?;
            Ok(Message::Trace(trace, payload))
        }
        other => Err(MessageError::UnknownType(other)),
    }
}

fn encode<T: Plain>(record: &T) -> Vec<u8> {
    unsafe { plain::as_bytes(record) }.to_vec()
}

pub fn encode_sample_report(timestamp: Timestamp, pid: Pid, address: Address, value: i64) -> Vec<u8> {
    let msg = SampleReportMsg {
        header: SampleHeader {
            size: std::mem::size_of::<SampleReportMsg>() as u32,
            type_: msg_type::SAMPLE_REPORT,
            timestamp,
        },
        pid,
        _pad: 0,
        address,
        value,
    };
    encode(&msg)
}

pub fn encode_trace(timestamp: Timestamp, pid: Pid, address: Address, payload: &[u8]) -> Vec<u8> {
    let msg = TraceMsg {
        header: SampleHeader {
            size: (std::mem::size_of::<TraceMsg>() + payload.len()) as u32,
            type_: msg_type::TRACE,
            timestamp,
        },
        pid,
        len: payload.len() as u32,
        address,
    };
    let mut data = encode(&msg);
    data.extend_from_slice(payload);
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_sizes() {
        assert_eq!(std::mem::size_of::<SampleHeader>(), 16);
        assert_eq!(std::mem::size_of::<SampleReportMsg>(), 40);
        assert_eq!(std::mem::size_of::<TraceMsg>(), 32);
    }

    #[test]
    fn test_parse_sample_report() {
        let data = encode_sample_report(77, 12, 0x4000, -3);
        match parse(&data).unwrap() {
            Message::SampleReport(msg) => {
                assert_eq!(msg.header.timestamp, 77);
                assert_eq!(msg.pid, 12);
                assert_eq!(msg.address, 0x4000);
                assert_eq!(msg.value, -3);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_parse_trace_with_payload() {
        let data = encode_trace(5, 3, 0x10, b"open(/etc/hosts)");
        match parse(&data).unwrap() {
            Message::Trace(msg, payload) => {
                assert_eq!(msg.address, 0x10);
                assert_eq!(payload, b"open(/etc/hosts)");
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_short_and_unknown_records() {
        let data = encode_sample_report(1, 1, 1, 1);
        assert_eq!(
            parse(&data[..20]),
            Err(MessageError::TooShort {
                expected: 40,
                actual: 20
            })
        );

        let mut trace = encode_trace(1, 1, 1, b"abcd");
        trace.truncate(34);
        assert_eq!(
            parse(&trace),
            Err(MessageError::TooShort {
                expected: 36,
                actual: 34
            })
        );

        let mut unknown = data.clone();
        unknown[4] = 9;
        assert_eq!(parse(&unknown), Err(MessageError::UnknownType(9)));
    }
}

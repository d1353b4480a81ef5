//! Wire framing: the host-facing frame header, request/response type tags,
//! and the packet encoders nested inside `APC_DATA` bodies (spec §6).

use crate::varint;

/// Tagged kind of data carried by a ring (spec §3 `FrameType`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Summary,
    Backtrace,
    /// One ring per CPU; the wrapped value is that CPU's index.
    CountersPerCpu(u32),
    BlockCounter,
    External,
    PerfAttrs,
    /// One ring per CPU; the wrapped value is that CPU's index.
    PerfDataPerCpu(u32),
    Annotation,
}

impl FrameType {
    /// The varint tag written as the first field of every packet body, per
    /// spec §6 ("Body of APC_DATA contains one packed packet beginning with
    /// a `frame_type` varint").
    pub fn wire_tag(self) -> u32 {
        match self {
            FrameType::Summary => 0,
            FrameType::Backtrace => 1,
            FrameType::CountersPerCpu(_) => 2,
            FrameType::BlockCounter => 3,
            FrameType::External => 4,
            FrameType::PerfAttrs => 5,
            FrameType::PerfDataPerCpu(_) => 6,
            FrameType::Annotation => 7,
        }
    }
}

/// Host → daemon request command byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestType {
    RequestXml = 0,
    DeliverXml = 1,
    ApcStart = 2,
    ApcStop = 3,
    Disconnect = 4,
    Ping = 5,
    ExitOk = 6,
    RequestCurrentConfig = 7,
}

impl RequestType {
    pub fn from_byte(b: u8) -> Option<Self> {
        use RequestType::*;
        Some(match b {
            0 => RequestXml,
            1 => DeliverXml,
            2 => ApcStart,
            3 => ApcStop,
            4 => Disconnect,
            5 => Ping,
            6 => ExitOk,
            7 => RequestCurrentConfig,
            _ => return None,
        })
    }
}

/// Daemon → host response type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseType {
    Xml = 1,
    ApcData = 3,
    Ack = 4,
    Nak = 5,
    CurrentConfig = 6,
    /// Raw forwarding of a pre-framed payload; skips framing entirely.
    Raw = 0xfe,
    Error = 0xff,
}

/// Encodes a frame header: `{response_type: 1 byte, length: 4 bytes LE}`.
pub fn write_header(out: &mut Vec<u8>, response_type: ResponseType, length: u32) {
    out.push(response_type as u8);
    out.extend_from_slice(&length.to_le_bytes());
}

/// Decodes a 5-byte request header read from the host socket (spec §4.9
/// step 9: "decodes header as `{command_byte, length_u32_le}`").
pub fn read_request_header(buf: &[u8; 5]) -> (u8, u32) {
    let cmd = buf[0];
    let len = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]);
    (cmd, len)
}

/// Packet body encoders. Each returns the packed bytes *including* the
/// leading `frame_type` tag, ready to be appended into a ring via
/// `RingBuffer::write_bytes`.
pub mod packet {
    use super::*;

    pub fn summary(
        timestamp_realtime_ns: i64,
        uptime_ns: i64,
        monotonic_started_ns: i64,
        uname: &str,
        page_size: u32,
        extras: &[(&str, &str)],
    ) -> Vec<u8> {
        let mut out = Vec::new();
        varint::write_u32(&mut out, FrameType::Summary.wire_tag());
        varint::write_i64(&mut out, timestamp_realtime_ns);
        varint::write_i64(&mut out, uptime_ns);
        varint::write_i64(&mut out, monotonic_started_ns);
        varint::write_string(&mut out, "uname");
        varint::write_string(&mut out, uname);
        varint::write_string(&mut out, "PAGESIZE");
        varint::write_string(&mut out, &page_size.to_string());
        for (k, v) in extras {
            varint::write_string(&mut out, k);
            varint::write_string(&mut out, v);
        }
        varint::write_string(&mut out, ""); // terminator: empty-string key
        out
    }

    pub fn core_name(core_index: u32, cpuid: u32, name: &str) -> Vec<u8> {
        let mut out = Vec::new();
        varint::write_u32(&mut out, FrameType::CountersPerCpu(core_index).wire_tag());
        varint::write_u32(&mut out, core_index);
        varint::write_u32(&mut out, cpuid);
        varint::write_string(&mut out, name);
        out
    }

    /// `COUNTERS`: `time_ns`, then repeated `len, key, delta` triples
    /// terminated by length 0.
    pub fn counters(time_ns: i64, entries: &[(u32, i64)]) -> Vec<u8> {
        let mut out = Vec::new();
        varint::write_u32(&mut out, FrameType::BlockCounter.wire_tag());
        varint::write_i64(&mut out, time_ns);
        for (key, delta) in entries {
            let mut body = Vec::new();
            varint::write_u32(&mut body, *key);
            varint::write_i64(&mut body, *delta);
            varint::write_u32(&mut out, body.len() as u32);
            out.extend_from_slice(&body);
        }
        varint::write_u32(&mut out, 0);
        out
    }

    pub fn backtrace(
        time_ns: i64,
        exec_cookie: u64,
        tgid: i32,
        pid: i32,
        in_kernel: bool,
        frames: &[u64],
    ) -> Vec<u8> {
        let mut out = Vec::new();
        varint::write_u32(&mut out, FrameType::Backtrace.wire_tag());
        varint::write_i64(&mut out, time_ns);
        varint::write_u64(&mut out, exec_cookie);
        varint::write_i32(&mut out, tgid);
        varint::write_i32(&mut out, pid);
        varint::write_u32(&mut out, in_kernel as u32);
        for frame in frames {
            varint::write_u64(&mut out, *frame);
        }
        varint::write_u64(&mut out, 0); // terminator
        out
    }

    pub fn annotation(tid: u32, time_ns: i64, cpu: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        varint::write_u32(&mut out, FrameType::Annotation.wire_tag());
        varint::write_u32(&mut out, tid);
        varint::write_i64(&mut out, time_ns);
        varint::write_u32(&mut out, cpu);
        varint::write_u32(&mut out, payload.len() as u32);
        out.extend_from_slice(payload);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_matches_spec() {
        let mut out = Vec::new();
        write_header(&mut out, ResponseType::ApcData, 42);
        assert_eq!(out.len(), 5);
        assert_eq!(out[0], ResponseType::ApcData as u8);
        assert_eq!(u32::from_le_bytes([out[1], out[2], out[3], out[4]]), 42);
    }

    #[test]
    fn request_header_round_trip() {
        let raw = [RequestType::ApcStop as u8, 0, 0, 0, 0];
        let (cmd, len) = read_request_header(&raw);
        assert_eq!(RequestType::from_byte(cmd), Some(RequestType::ApcStop));
        assert_eq!(len, 0);
    }

    #[test]
    fn unknown_request_type_is_none() {
        assert_eq!(RequestType::from_byte(200), None);
    }

    #[test]
    fn summary_packet_has_terminator() {
        let body = packet::summary(1, 2, 3, "Linux test 6.1", 4096, &[("nosync", "1")]);
        assert_eq!(body[0], FrameType::Summary.wire_tag() as u8);
        assert_eq!(body[body.len() - 1], 0); // empty-string length terminator
    }

    #[test]
    fn counters_packet_terminated_by_zero_length() {
        let body = packet::counters(10, &[(5, 100), (6, -3)]);
        // Trailing byte is the zero-length terminator varint.
        assert_eq!(*body.last().unwrap(), 0);
    }
}

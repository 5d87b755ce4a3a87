//! Replay source for classic libpcap capture files.
//!
//! Handles both byte orders and both the microsecond and nanosecond
//! timestamp variants. pcapng files are rejected with a clear error.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use crate::capture::packet::{LinkType, RawPacket};
use crate::capture::{CaptureError, PacketSource, Poll};

const MAGIC_MICROS: u32 = 0xA1B2_C3D4;
const MAGIC_NANOS: u32 = 0xA1B2_3C4D;
const MAGIC_PCAPNG: u32 = 0x0A0D_0D0A;

/// Records larger than this are treated as file corruption.
const MAX_RECORD_LEN: u32 = 256 * 1024;

/// Sequential reader over the records of a pcap file.
pub struct PcapReplay<R: Read> {
    reader: R,
    origin: PathBuf,
    big_endian: bool,
    nanos: bool,
    link: LinkType,
}

impl PcapReplay<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self, CaptureError> {
        let file = File::open(path).map_err(|e| CaptureError::Replay {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_reader(BufReader::new(file), path)
    }
}

impl<R: Read> PcapReplay<R> {
    /// Read and validate the global header.
    pub fn from_reader(mut reader: R, origin: &Path) -> Result<Self, CaptureError> {
        let replay_err = |reason: String| CaptureError::Replay {
            path: origin.to_path_buf(),
            reason,
        };

        let mut header = [0u8; 24];
        reader
            .read_exact(&mut header)
            .map_err(|e| replay_err(format!("reading global header: {e}")))?;

        let magic_le = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let magic_be = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let (big_endian, nanos) = match (magic_le, magic_be) {
            (MAGIC_MICROS, _) => (false, false),
            (MAGIC_NANOS, _) => (false, true),
            (_, MAGIC_MICROS) => (true, false),
            (_, MAGIC_NANOS) => (true, true),
            (MAGIC_PCAPNG, _) => return Err(replay_err("pcapng files are not supported".into())),
            _ => return Err(replay_err(format!("bad magic number {magic_be:#010x}"))),
        };

        let field = |at: usize| read_u32(&header[at..at + 4], big_endian);
        let linktype = field(20) & 0x0FFF_FFFF;
        let link = LinkType::from_pcap(linktype)
            .ok_or_else(|| replay_err(format!("unsupported link type {linktype}")))?;

        Ok(Self {
            reader,
            origin: origin.to_path_buf(),
            big_endian,
            nanos,
            link,
        })
    }

    pub fn link_type(&self) -> LinkType {
        self.link
    }

    /// Next record, or `None` at end of file.
    ///
    /// A record cut short by the end of the file also ends the replay.
    pub fn next_packet(&mut self) -> Result<Option<RawPacket>, CaptureError> {
        let mut header = [0u8; 16];
        match read_full(&mut self.reader, &mut header) {
            Ok(0) => return Ok(None),
            Ok(n) if n < header.len() => {
                tracing::debug!(
                    "{}: trailing partial record header ignored",
                    self.origin.display()
                );
                return Ok(None);
            }
            Ok(_) => {}
            Err(e) => return Err(self.error(format!("reading record header: {e}"))),
        }

        let field = |at: usize| read_u32(&header[at..at + 4], self.big_endian);
        let ts_sec = field(0);
        let ts_frac = field(4);
        let incl_len = field(8);
        let orig_len = field(12);

        if incl_len > MAX_RECORD_LEN {
            return Err(self.error(format!("record length {incl_len} exceeds {MAX_RECORD_LEN}")));
        }

        let mut data = vec![0u8; incl_len as usize];
        match read_full(&mut self.reader, &mut data) {
            Ok(n) if n < data.len() => {
                tracing::debug!("{}: trailing partial record ignored", self.origin.display());
                return Ok(None);
            }
            Ok(_) => {}
            Err(e) => return Err(self.error(format!("reading record data: {e}"))),
        }

        let divisor = if self.nanos { 1e9 } else { 1e6 };
        Ok(Some(RawPacket {
            timestamp: f64::from(ts_sec) + f64::from(ts_frac) / divisor,
            link: self.link,
            data,
            wire_len: orig_len.max(incl_len),
        }))
    }

    fn error(&self, reason: String) -> CaptureError {
        CaptureError::Replay {
            path: self.origin.clone(),
            reason,
        }
    }
}

impl<R: Read + Send> PacketSource for PcapReplay<R> {
    fn describe(&self) -> String {
        format!("pcap replay {}", self.origin.display())
    }

    fn poll_packet(&mut self) -> Result<Poll, CaptureError> {
        Ok(match self.next_packet()? {
            Some(packet) => Poll::Packet(packet),
            None => Poll::Exhausted,
        })
    }
}

fn read_u32(bytes: &[u8], big_endian: bool) -> u32 {
    let raw = [bytes[0], bytes[1], bytes[2], bytes[3]];
    if big_endian {
        u32::from_be_bytes(raw)
    } else {
        u32::from_le_bytes(raw)
    }
}

/// Like `read_exact`, but reports how many bytes were read before EOF.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

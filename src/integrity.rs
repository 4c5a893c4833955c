use std::path::Path;
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};
use thiserror::Error;

pub const TS_PACKET_SIZE: usize = 188;
pub const TS_SYNC_BYTE: u8 = 0x47;

/// Leading bytes of a receiver container file.
pub const CONTAINER_MAGIC: &[u8; 4] = b"TiVo";
/// Bytes needed to recognise a container header and read its length.
pub const CONTAINER_PROBE_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A run of consecutive transport-stream packets whose first byte was not
/// the sync byte. `offset` is measured from the start of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncError {
    pub offset: u64,
    pub packets: u64,
    /// Byte found where the sync byte belonged, in the first bad packet.
    pub found: u8,
}

impl SyncError {
    pub fn byte_len(&self) -> u64 {
        self.packets * TS_PACKET_SIZE as u64
    }
}

/// Header the receiver puts in front of every recording it sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHeader {
    /// Total header length, probe bytes included.
    pub header_len: u32,
    pub transport_stream: bool,
}

impl ContainerHeader {
    pub fn parse(probe: &[u8]) -> Option<Self> {
        if probe.len() < CONTAINER_PROBE_LEN || &probe[..4] != CONTAINER_MAGIC {
            return None;
        }
        let header_len = u32::from_be_bytes([probe[10], probe[11], probe[12], probe[13]]);
        Some(Self {
            header_len: header_len.max(CONTAINER_PROBE_LEN as u32),
            transport_stream: probe[7] & 0x20 != 0,
        })
    }
}

enum Phase {
    Probe,
    SkipHeader(u64),
    Packets,
}

/// Incremental transport-stream sync checker.
///
/// Bytes can be fed in chunks of any size. A container header, when
/// present, is skipped before packet alignment starts.
pub struct StreamValidator {
    check_sync: bool,
    phase: Phase,
    probe: Vec<u8>,
    header: Option<ContainerHeader>,
    /// Offset of the next packet to check.
    position: u64,
    partial: Vec<u8>,
    in_loss: bool,
    errors: Vec<SyncError>,
}

impl StreamValidator {
    pub fn new() -> Self {
        Self::with_sync_check(true)
    }

    /// Only detects the container header; packets are not checked.
    /// Used for program streams.
    pub fn header_only() -> Self {
        Self::with_sync_check(false)
    }

    fn with_sync_check(check_sync: bool) -> Self {
        Self {
            check_sync,
            phase: Phase::Probe,
            probe: Vec::with_capacity(CONTAINER_PROBE_LEN),
            header: None,
            position: 0,
            partial: Vec::with_capacity(TS_PACKET_SIZE),
            in_loss: false,
            errors: Vec::new(),
        }
    }

    /// Feeds the next chunk of the stream and returns how many new sync
    /// error runs it started.
    pub fn feed(&mut self, mut data: &[u8]) -> usize {
        let before = self.errors.len();
        while !data.is_empty() {
            match self.phase {
                Phase::Probe => {
                    let take = (CONTAINER_PROBE_LEN - self.probe.len()).min(data.len());
                    self.probe.extend_from_slice(&data[..take]);
                    data = &data[take..];
                    if self.probe.len() == CONTAINER_PROBE_LEN {
                        self.resolve_probe();
                    }
                }
                Phase::SkipHeader(remaining) => {
                    let take = remaining.min(data.len() as u64);
                    self.position += take;
                    data = &data[take as usize..];
                    self.phase = if remaining == take {
                        Phase::Packets
                    } else {
                        Phase::SkipHeader(remaining - take)
                    };
                }
                Phase::Packets => {
                    self.scan(data);
                    data = &[];
                }
            }
        }
        self.errors.len() - before
    }

    /// Flushes a stream shorter than the probe and a trailing partial
    /// packet. Returns the errors collected so far.
    pub fn finish(&mut self) -> &[SyncError] {
        if matches!(self.phase, Phase::Probe) && !self.probe.is_empty() {
            self.phase = Phase::Packets;
            let probe = std::mem::take(&mut self.probe);
            self.scan(&probe);
        }
        if !self.partial.is_empty() {
            let first = self.partial[0];
            self.partial.clear();
            self.check(first);
        }
        &self.errors
    }

    pub fn errors(&self) -> &[SyncError] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<SyncError> {
        self.errors
    }

    pub fn first_error(&self) -> Option<&SyncError> {
        self.errors.first()
    }

    pub fn header(&self) -> Option<ContainerHeader> {
        self.header
    }

    fn resolve_probe(&mut self) {
        let probe = std::mem::take(&mut self.probe);
        match ContainerHeader::parse(&probe) {
            Some(header) => {
                self.header = Some(header);
                self.position = CONTAINER_PROBE_LEN as u64;
                let rest = u64::from(header.header_len) - CONTAINER_PROBE_LEN as u64;
                self.phase = if rest == 0 { Phase::Packets } else { Phase::SkipHeader(rest) };
            }
            None => {
                self.phase = Phase::Packets;
                self.scan(&probe);
            }
        }
    }

    fn scan(&mut self, mut data: &[u8]) {
        if !self.check_sync {
            self.position += data.len() as u64;
            return;
        }
        if !self.partial.is_empty() {
            let take = (TS_PACKET_SIZE - self.partial.len()).min(data.len());
            self.partial.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.partial.len() < TS_PACKET_SIZE {
                return;
            }
            let first = self.partial[0];
            self.partial.clear();
            self.check(first);
        }
        let mut packets = data.chunks_exact(TS_PACKET_SIZE);
        for packet in &mut packets {
            self.check(packet[0]);
        }
        self.partial.extend_from_slice(packets.remainder());
    }

    fn check(&mut self, first: u8) {
        let offset = self.position;
        self.position += TS_PACKET_SIZE as u64;
        if first == TS_SYNC_BYTE {
            self.in_loss = false;
            return;
        }
        if self.in_loss {
            if let Some(run) = self.errors.last_mut() {
                run.packets += 1;
            }
        } else {
            self.in_loss = true;
            self.errors.push(SyncError { offset, packets: 1, found: first });
        }
    }
}

impl Default for StreamValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// Checks a finished file for transport-stream sync errors.
pub async fn validate_file(path: &Path) -> Result<Vec<SyncError>, IntegrityError> {
    let file = File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut validator = StreamValidator::new();
    let mut buffer = vec![0u8; TS_PACKET_SIZE * 256];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 { break; }
        validator.feed(&buffer[..n]);
    }
    validator.finish();
    Ok(validator.into_errors())
}

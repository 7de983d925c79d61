//! BM13xx wire protocol: frame encoding and decoding.
//!
//! Two frame families share the outbound preamble `0x55 0xAA`: command
//! frames (register writes/reads, addressing) trailed by a 5-bit CRC, and
//! job frames trailed by CRC-16 transmitted big-endian. Responses arrive
//! with the preamble `0xAA 0x55` as fixed 11-byte frames whose final byte
//! packs the response type in the top three bits and the CRC-5 in the low
//! five.

use bytes::{Buf, BufMut, BytesMut};
use std::{fmt, io};
use strum::FromRepr;
use tokio_util::codec::{Decoder, Encoder};

use super::crc::{crc16, crc5, crc5_is_valid};
use super::error::ProtocolError;
use crate::tracing::prelude::*;

/// Header byte: frame carries a job.
pub const TYPE_JOB: u8 = 0x20;
/// Header byte: frame carries a command.
pub const TYPE_CMD: u8 = 0x40;
/// Header byte: target a single addressed chip.
pub const GROUP_SINGLE: u8 = 0x00;
/// Header byte: broadcast to the whole chain.
pub const GROUP_ALL: u8 = 0x10;

pub const CMD_SET_ADDRESS: u8 = 0x00;
pub const CMD_WRITE: u8 = 0x01;
pub const CMD_READ: u8 = 0x02;
pub const CMD_INACTIVE: u8 = 0x03;

/// Version-rolling mask requested from pools and written to the chips.
pub const STRATUM_DEFAULT_VERSION_MASK: u32 = 0x1fffe000;

/// Wrapper for formatting byte slices as space-separated hex.
struct HexBytes<'a>(&'a [u8]);

impl fmt::Display for HexBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Chip register addresses used by the bring-up sequence and job flow.
#[derive(FromRepr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RegisterAddress {
    ChipId = 0x00,
    PllDivider = 0x08,
    NonceCount = 0x10,
    TicketMask = 0x14,
    MiscControl = 0x18,
    OrderedClockEnable = 0x20,
    FastUart = 0x28,
    UartRelay = 0x2C,
    CoreControl = 0x3C,
    AnalogMux = 0x54,
    IoDriverStrength = 0x58,
    Pll3Parameter = 0x68,
    ClockOrderControl0 = 0x80,
    ClockOrderControl1 = 0x84,
    VersionMask = 0xA4,
    InitControl = 0xA8,
}

/// PLL divider set realizing a hash frequency from the 25 MHz crystal.
///
/// `frequency = 25 * fb / (ref * post1 * post2)` MHz.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PllDividers {
    pub fb: u8,
    pub ref_div: u8,
    pub post1: u8,
    pub post2: u8,
}

impl PllDividers {
    /// Crystal frequency in MHz.
    pub const CRYSTAL_MHZ: f32 = 25.0;
    /// Feedback divider domain.
    pub const FB_MIN: u8 = 144;
    pub const FB_MAX: u8 = 235;
    /// VCO frequency at or above this requires the high-VCO control bit.
    pub const HIGH_VCO_MHZ: f32 = 2400.0;

    /// Search the divider space for the target frequency.
    ///
    /// Walks ref descending, post1 descending, post2 ascending below post1,
    /// and takes the first in-range combination within tolerance. Returns
    /// `None` when no feedback divider lands in [144, 235].
    pub fn search(target_mhz: f32) -> Option<Self> {
        const TOLERANCE_MHZ: f32 = 10.0;
        let mut found: Option<Self> = None;

        for ref_div in (1..=2u8).rev() {
            if found.is_some() {
                break;
            }
            for post1 in (1..=7u8).rev() {
                if found.is_some() {
                    break;
                }
                for post2 in 1..post1 {
                    let fb = ((post1 as f32 * post2 as f32 * target_mhz * ref_div as f32)
                        / Self::CRYSTAL_MHZ)
                        .round();
                    if !(Self::FB_MIN as f32..=Self::FB_MAX as f32).contains(&fb) {
                        continue;
                    }
                    let candidate = Self {
                        fb: fb as u8,
                        ref_div,
                        post1,
                        post2,
                    };
                    let difference = (target_mhz - candidate.frequency()).abs();
                    if difference < TOLERANCE_MHZ {
                        found = Some(candidate);
                        break;
                    }
                }
            }
        }

        found
    }

    /// The frequency actually realized by this divider set.
    pub fn frequency(&self) -> f32 {
        Self::CRYSTAL_MHZ * self.fb as f32
            / (self.ref_div as f32 * self.post1 as f32 * self.post2 as f32)
    }

    /// Whether the VCO crosses the high-range boundary.
    pub fn high_vco(&self) -> bool {
        self.fb as f32 * Self::CRYSTAL_MHZ / self.ref_div as f32 >= Self::HIGH_VCO_MHZ
    }

    /// PLL register value: control byte, feedback, reference, packed posts.
    pub fn register_value(&self) -> [u8; 4] {
        let control = if self.high_vco() { 0x50 } else { 0x40 };
        [
            control,
            self.fb,
            self.ref_div,
            (((self.post1 - 1) & 0xf) << 4) | ((self.post2 - 1) & 0xf),
        ]
    }

    /// Fixed 200 MHz fallback used when the search fails.
    pub fn fallback_200mhz() -> Self {
        Self {
            fb: 0xA0,
            ref_div: 0x02,
            post1: 5,
            post2: 2,
        }
    }
}

/// Largest power of two less than or equal to `n` (n >= 1).
pub fn largest_power_of_two(n: u32) -> u32 {
    1u32 << (31 - n.max(1).leading_zeros())
}

/// Reverse the bit order within one byte.
pub fn reverse_bits(byte: u8) -> u8 {
    byte.reverse_bits()
}

/// Ticket-mask register value for a requested difficulty.
///
/// The chip reports only nonces whose hash clears the mask, so the
/// difficulty is rounded down to a power of two for gapless nonce coverage
/// and the resulting mask is packed with per-byte bit reversal.
pub fn difficulty_mask_value(difficulty: u32) -> [u8; 4] {
    let mask = largest_power_of_two(difficulty) - 1;

    let mut value = [0u8; 4];
    for i in 0..4 {
        value[3 - i] = reverse_bits(((mask >> (8 * i)) & 0xFF) as u8);
    }
    value
}

/// Version-mask register value.
///
/// Only bits 13..29 of the negotiated mask are rollable in hardware; the
/// register takes them as a big-endian 16-bit field after the enable bytes.
pub fn version_mask_value(version_mask: u32) -> [u8; 4] {
    let versions_to_roll = (version_mask >> 13) as u16;
    let [hi, lo] = versions_to_roll.to_be_bytes();
    [0x90, 0x00, hi, lo]
}

/// Convert a 32-byte hash between hashing order and wire order.
///
/// The chips take hashes as eight 4-byte words in reversed word order; byte
/// order within each word is preserved. The transform is its own inverse.
pub fn hash_wire_order(hash: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..8 {
        out[(7 - i) * 4..(8 - i) * 4].copy_from_slice(&hash[i * 4..(i + 1) * 4]);
    }
    out
}

/// Job payload, per chip family.
#[derive(Debug, Clone)]
pub enum JobPayload {
    /// Full header material; the chip derives its own midstates.
    FullHeader {
        merkle_root_be: [u8; 32],
        prev_block_hash_be: [u8; 32],
        version: u32,
    },
    /// Host-computed midstates plus the merkle-root tail.
    Midstates {
        merkle_tail: [u8; 4],
        midstates: [[u8; 32]; 4],
        count: u8,
    },
}

/// One job frame as sent to a chip.
#[derive(Debug, Clone)]
pub struct JobFrame {
    /// High five bits significant; a multiple of 8 in [0, 128).
    pub job_id: u8,
    pub num_midstates: u8,
    pub starting_nonce: u32,
    pub nbits: u32,
    pub ntime: u32,
    pub payload: JobPayload,
}

/// Outbound frames.
#[derive(Debug, Clone)]
pub enum Command {
    /// Assign an address to the next unaddressed chip in the chain.
    SetChipAddress { chip_address: u8 },
    /// Broadcast: stop daisy-chain forwarding, enter addressing mode.
    ChainInactive,
    /// Read a register from one chip or all of them.
    ReadRegister {
        broadcast: bool,
        chip_address: u8,
        register: RegisterAddress,
    },
    /// Write a register value to one chip or all of them.
    WriteRegister {
        broadcast: bool,
        chip_address: u8,
        register: RegisterAddress,
        value: [u8; 4],
    },
    /// Send a job to a single chip.
    Job(JobFrame),
}

impl Command {
    fn header(&self) -> u8 {
        match self {
            Command::SetChipAddress { .. } => TYPE_CMD | GROUP_SINGLE | CMD_SET_ADDRESS,
            Command::ChainInactive => TYPE_CMD | GROUP_ALL | CMD_INACTIVE,
            Command::ReadRegister { broadcast, .. } => {
                TYPE_CMD | if *broadcast { GROUP_ALL } else { GROUP_SINGLE } | CMD_READ
            }
            Command::WriteRegister { broadcast, .. } => {
                TYPE_CMD | if *broadcast { GROUP_ALL } else { GROUP_SINGLE } | CMD_WRITE
            }
            Command::Job(_) => TYPE_JOB | GROUP_SINGLE | CMD_WRITE,
        }
    }

    fn encode_payload(&self, dst: &mut BytesMut) {
        match self {
            Command::SetChipAddress { chip_address } => {
                dst.put_u8(*chip_address);
                dst.put_u8(0x00);
            }
            Command::ChainInactive => {
                dst.put_u8(0x00);
                dst.put_u8(0x00);
            }
            Command::ReadRegister {
                chip_address,
                register,
                ..
            } => {
                dst.put_u8(*chip_address);
                dst.put_u8(*register as u8);
            }
            Command::WriteRegister {
                chip_address,
                register,
                value,
                ..
            } => {
                dst.put_u8(*chip_address);
                dst.put_u8(*register as u8);
                dst.put_slice(value);
            }
            Command::Job(job) => {
                dst.put_u8(job.job_id);
                dst.put_u8(job.num_midstates);
                dst.put_u32_le(job.starting_nonce);
                dst.put_u32_le(job.nbits);
                dst.put_u32_le(job.ntime);
                match &job.payload {
                    JobPayload::FullHeader {
                        merkle_root_be,
                        prev_block_hash_be,
                        version,
                    } => {
                        dst.put_slice(merkle_root_be);
                        dst.put_slice(prev_block_hash_be);
                        dst.put_u32_le(*version);
                    }
                    JobPayload::Midstates {
                        merkle_tail,
                        midstates,
                        count,
                    } => {
                        dst.put_slice(merkle_tail);
                        for midstate in midstates.iter().take(*count as usize) {
                            dst.put_slice(midstate);
                        }
                    }
                }
            }
        }
    }
}

/// Decoded 11-byte nonce frame.
///
/// Field extraction follows the chip conventions: the returned job id keeps
/// the high five bits, its low three bits name the small core, the core id
/// hides in the byte-reversed nonce, and the rolled version delta arrives
/// as a byte-swapped 16-bit field occupying header version bits 13..29.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultFrame {
    pub nonce: u32,
    pub midstate_num: u8,
    pub job_id: u8,
    pub version: u16,
}

impl ResultFrame {
    /// Registry slot this result belongs to (multiple of 8).
    pub fn job_id_hi(&self) -> u8 {
        self.job_id & 0xF8
    }

    /// Small-core index within the reporting core.
    pub fn small_core(&self) -> u8 {
        self.job_id & 0x07
    }

    /// Big-core index recovered from the nonce.
    pub fn core_id(&self) -> u8 {
        ((self.nonce.swap_bytes() >> 25) & 0x7F) as u8
    }

    /// Version bits to OR into the job's base version.
    pub fn version_bits(&self) -> u32 {
        (self.version.swap_bytes() as u32) << 13
    }
}

#[derive(FromRepr)]
#[repr(u8)]
enum ResponseType {
    ReadRegister = 0,
    Nonce = 4,
}

/// Inbound frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    ReadRegister {
        chip_address: u8,
        register: u8,
        value: [u8; 4],
    },
    Nonce(ResultFrame),
}

/// Response frame length: preamble plus nine data bytes.
pub const RESPONSE_FRAME_LEN: usize = 11;

const RESPONSE_PREAMBLE: [u8; 2] = [0xAA, 0x55];

/// Parse a complete 11-byte response frame.
///
/// Validates length, preamble, and CRC-5 before interpreting the payload,
/// so every accepted frame satisfies the framing contract.
pub fn parse_response(frame: &[u8]) -> Result<Response, ProtocolError> {
    if frame.len() < RESPONSE_FRAME_LEN {
        return Err(ProtocolError::ShortFrame {
            need: RESPONSE_FRAME_LEN,
            have: frame.len(),
        });
    }
    if frame[0..2] != RESPONSE_PREAMBLE {
        return Err(ProtocolError::BadPreamble(frame[0], frame[1]));
    }
    if !crc5_is_valid(&frame[2..RESPONSE_FRAME_LEN]) {
        return Err(ProtocolError::CrcMismatch);
    }

    let data = &frame[2..RESPONSE_FRAME_LEN];
    let type_repr = data[8] >> 5;
    match ResponseType::from_repr(type_repr) {
        Some(ResponseType::Nonce) => Ok(Response::Nonce(ResultFrame {
            nonce: u32::from_le_bytes(data[0..4].try_into().unwrap()),
            midstate_num: data[4],
            job_id: data[5],
            version: u16::from_le_bytes(data[6..8].try_into().unwrap()),
        })),
        Some(ResponseType::ReadRegister) => Ok(Response::ReadRegister {
            chip_address: data[4],
            register: data[5],
            value: data[0..4].try_into().unwrap(),
        }),
        None => Err(ProtocolError::InvalidResponseType(type_repr)),
    }
}

/// Frame codec for the chain serial link.
///
/// Encodes [`Command`] frames and decodes [`Response`] frames, suitable for
/// `Framed` over the UART or an in-memory duplex in tests.
#[derive(Default)]
pub struct FrameCodec;

impl Encoder<Command> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, command: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        const PREAMBLE: [u8; 2] = [0x55, 0xAA];
        let is_job = matches!(command, Command::Job(_));

        dst.put_slice(&PREAMBLE);
        let start = dst.len();
        dst.put_u8(command.header());

        // Length byte counts itself, the header, the payload, and the CRC.
        let length_pos = dst.len();
        dst.put_u8(0);
        command.encode_payload(dst);
        let payload_len = dst.len() - length_pos - 1;
        dst[length_pos] = payload_len as u8 + if is_job { 4 } else { 3 };

        if is_job {
            let crc = crc16(&dst[start..]);
            dst.put_slice(&crc.to_be_bytes());
        } else {
            let crc = crc5(&dst[start..]);
            dst.put_u8(crc);
        }

        trace!(
            bytes = dst.len(),
            frame = %HexBytes(dst.as_ref()),
            "TX chain"
        );

        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Response;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Never return Err for a recoverable frame fault: that would tear
        // down the stream. Resynchronize by advancing one byte and asking to
        // be called again once more data arrives.
        const CALL_AGAIN: Result<Option<Response>, io::Error> = Ok(None);

        if src.len() < RESPONSE_FRAME_LEN {
            return CALL_AGAIN;
        }

        match parse_response(&src[..RESPONSE_FRAME_LEN]) {
            Ok(response) => {
                trace!(
                    frame = %HexBytes(&src[..RESPONSE_FRAME_LEN]),
                    "RX chain"
                );
                src.advance(RESPONSE_FRAME_LEN);
                Ok(Some(response))
            }
            Err(err) => {
                trace!(error = %err, "Frame sync lost, searching for next preamble");
                src.advance(1);
                CALL_AGAIN
            }
        }
    }
}

// Bit-serial CRC-5 reference for constructing synthetic response frames in
// tests: the chip covers the 67 bits before the CRC field (eight data bytes
// plus the three type bits).
#[cfg(test)]
pub(crate) fn response_crc(data: &[u8; 9]) -> u8 {
    let mut crc: u8 = 0x1f;
    let mut feed = |bit: u8| {
        let top = (crc >> 4) & 1;
        crc = (crc << 1) & 0x1f;
        if top ^ bit == 1 {
            crc ^= 0x05;
        }
    };
    for byte in &data[..8] {
        for i in (0..8).rev() {
            feed((byte >> i) & 1);
        }
    }
    for i in (5..8).rev() {
        feed((data[8] >> i) & 1);
    }
    crc
}

/// Build a CRC-valid 11-byte response frame for tests.
#[cfg(test)]
pub(crate) fn build_response_frame(data: &[u8; 8], response_type: u8) -> [u8; RESPONSE_FRAME_LEN] {
    let mut frame = [0u8; RESPONSE_FRAME_LEN];
    frame[0..2].copy_from_slice(&RESPONSE_PREAMBLE);
    frame[2..10].copy_from_slice(data);

    let mut covered = [0u8; 9];
    covered[..8].copy_from_slice(data);
    covered[8] = response_type << 5;
    frame[10] = (response_type << 5) | response_crc(&covered);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(command: Command) -> Vec<u8> {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(command, &mut buf).unwrap();
        buf.to_vec()
    }

    // Captured 88-byte job frame, known accepted by the pool.
    const CAPTURED_JOB_FRAME: [u8; 88] = [
        0x55, 0xAA, 0x21, 0x56, 0x68, 0x01, 0x00, 0x00, 0x00, 0x00, 0x04, 0x3A, 0x02, 0x17, 0xD7,
        0x68, 0x54, 0x68, 0x55, 0x19, 0xA7, 0xCB, 0x04, 0x4F, 0x88, 0x72, 0x63, 0x55, 0x91, 0x9E,
        0x61, 0xA9, 0x8B, 0xCF, 0x71, 0xA0, 0xC2, 0x87, 0x95, 0xEA, 0x54, 0xDB, 0x8C, 0x36, 0x41,
        0x4B, 0x06, 0xDD, 0xF5, 0xF0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x96, 0x52,
        0x01, 0x00, 0x1D, 0x39, 0x96, 0xBC, 0xA3, 0xF4, 0x67, 0x0D, 0xFC, 0xD4, 0xF2, 0x01, 0xC1,
        0x62, 0xB9, 0x6D, 0xFD, 0x55, 0x64, 0x6B, 0x00, 0x00, 0x00, 0x20, 0x72, 0x1C,
    ];

    // Captured 11-byte nonce response for the job above.
    const CAPTURED_NONCE_FRAME: [u8; 11] = [
        0xAA, 0x55, 0x4C, 0x03, 0x52, 0x75, 0x0C, 0xD2, 0x05, 0xA2, 0x9C,
    ];

    #[test]
    fn encode_write_register_ticket_mask() {
        // Ticket mask write to a single chip at address 0; mask value for
        // difficulty 256.
        let frame = encode(Command::WriteRegister {
            broadcast: false,
            chip_address: 0x00,
            register: RegisterAddress::TicketMask,
            value: difficulty_mask_value(256),
        });

        assert_eq!(
            &frame[..10],
            &[0x55, 0xAA, 0x41, 0x09, 0x00, 0x14, 0x00, 0x00, 0x00, 0xFF]
        );
        // The trailing CRC-5 covers header through payload.
        assert_eq!(frame[10], crc5(&frame[2..10]));
        assert_eq!(frame[10], 0x00);
        assert_eq!(frame.len(), 11);
    }

    #[test]
    fn encode_broadcast_frames_match_captures() {
        assert_eq!(
            encode(Command::ChainInactive),
            [0x55, 0xAA, 0x53, 0x05, 0x00, 0x00, 0x03]
        );
        assert_eq!(
            encode(Command::SetChipAddress { chip_address: 0x08 }),
            [0x55, 0xAA, 0x40, 0x05, 0x08, 0x00, 0x07]
        );
        assert_eq!(
            encode(Command::ReadRegister {
                broadcast: true,
                chip_address: 0x00,
                register: RegisterAddress::ChipId,
            }),
            [0x55, 0xAA, 0x52, 0x05, 0x00, 0x00, 0x0A]
        );
        assert_eq!(
            encode(Command::WriteRegister {
                broadcast: true,
                chip_address: 0x00,
                register: RegisterAddress::VersionMask,
                value: version_mask_value(STRATUM_DEFAULT_VERSION_MASK),
            }),
            [0x55, 0xAA, 0x51, 0x09, 0x00, 0xA4, 0x90, 0x00, 0xFF, 0xFF, 0x1C]
        );
    }

    #[test]
    fn encode_job_frame_matches_capture() {
        let frame = encode(Command::Job(JobFrame {
            job_id: 0x68,
            num_midstates: 1,
            starting_nonce: 0,
            nbits: 0x17023A04,
            ntime: 0x685468D7,
            payload: JobPayload::FullHeader {
                merkle_root_be: CAPTURED_JOB_FRAME[18..50].try_into().unwrap(),
                prev_block_hash_be: CAPTURED_JOB_FRAME[50..82].try_into().unwrap(),
                version: 0x20000000,
            },
        }));

        assert_eq!(frame, CAPTURED_JOB_FRAME);
    }

    #[test]
    fn encode_midstate_job_length() {
        let frame = encode(Command::Job(JobFrame {
            job_id: 0x10,
            num_midstates: 4,
            starting_nonce: 0,
            nbits: 0x1d00ffff,
            ntime: 0x5a5a5a5a,
            payload: JobPayload::Midstates {
                merkle_tail: [1, 2, 3, 4],
                midstates: [[0xAB; 32]; 4],
                count: 4,
            },
        }));

        // preamble(2) + header(1) + length(1) + 18 fixed + 4*32 midstates
        // + crc16(2)
        assert_eq!(frame.len(), 2 + 1 + 1 + 18 + 128 + 2);
        assert_eq!(frame[2], TYPE_JOB | GROUP_SINGLE | CMD_WRITE);
        assert_eq!(frame[3], (18 + 128 + 4) as u8);
    }

    #[test]
    fn decode_nonce_frame_from_capture() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(&CAPTURED_NONCE_FRAME[..]);

        let response = codec.decode(&mut buf).unwrap().unwrap();
        let Response::Nonce(result) = response else {
            panic!("expected nonce response, got {:?}", response);
        };

        assert_eq!(result.nonce, 0x7552034C);
        assert_eq!(result.midstate_num, 0x0C);
        assert_eq!(result.job_id_hi(), 0xD0);
        assert_eq!(result.small_core(), 2);
        assert_eq!(result.core_id(), 38);
        assert_eq!(result.version_bits(), 0x00B44000);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_resynchronizes_after_garbage() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x00, 0xAA, 0x13]); // line noise
        buf.extend_from_slice(&CAPTURED_NONCE_FRAME);

        let mut decoded = None;
        while !buf.is_empty() {
            if let Some(response) = codec.decode(&mut buf).unwrap() {
                decoded = Some(response);
                break;
            }
        }

        assert!(matches!(decoded, Some(Response::Nonce(_))));
    }

    #[test]
    fn synthetic_response_crc_matches_capture() {
        let mut frame9 = [0u8; 9];
        frame9.copy_from_slice(&CAPTURED_NONCE_FRAME[2..]);
        let crc = response_crc(&frame9);
        assert_eq!(crc, CAPTURED_NONCE_FRAME[10] & 0x1f);
    }

    #[test]
    fn decode_rolled_version_composition() {
        // Nonce 0x12345678, job id 0x38, rolled version field 0x0001.
        let frame = build_response_frame(
            &[0x78, 0x56, 0x34, 0x12, 0x00, 0x38, 0x01, 0x00],
            ResponseType::Nonce as u8,
        );

        let response = parse_response(&frame).unwrap();
        let Response::Nonce(result) = response else {
            panic!("expected nonce");
        };

        assert_eq!(result.nonce, 0x12345678);
        assert_eq!(result.job_id_hi(), 0x38);
        assert_eq!(result.small_core(), 0);
        // bswap16(0x0001) << 13
        assert_eq!(result.version_bits(), 0x0100 << 13);
        assert_eq!(0x20000000 | result.version_bits(), 0x20200000);
    }

    #[test]
    fn parse_response_failure_kinds() {
        assert!(matches!(
            parse_response(&[0xAA, 0x55, 0x00]),
            Err(ProtocolError::ShortFrame { need: 11, have: 3 })
        ));

        let mut bad_preamble = CAPTURED_NONCE_FRAME;
        bad_preamble[0] = 0x55;
        assert!(matches!(
            parse_response(&bad_preamble),
            Err(ProtocolError::BadPreamble(0x55, 0x55))
        ));

        let mut bad_crc = CAPTURED_NONCE_FRAME;
        bad_crc[4] ^= 0x01;
        assert!(matches!(
            parse_response(&bad_crc),
            Err(ProtocolError::CrcMismatch)
        ));
    }

    #[test]
    fn pll_search_exact_and_boundary() {
        // 525 MHz is exactly representable; its VCO (2625 MHz) crosses the
        // high-VCO boundary.
        let pll = PllDividers::search(525.0).unwrap();
        assert_eq!((pll.fb, pll.ref_div, pll.post1, pll.post2), (210, 2, 5, 1));
        assert_eq!(pll.frequency(), 525.0);
        assert!(pll.high_vco());
        assert_eq!(pll.register_value()[0], 0x50);

        // 200 MHz resolves exactly in the low-VCO range.
        let pll = PllDividers::search(200.0).unwrap();
        assert_eq!(pll.frequency(), 200.0);
        assert!(!pll.high_vco());
        assert_eq!(pll.register_value()[0], 0x40);

        // Absurd targets have no in-range feedback divider.
        assert!(PllDividers::search(10_000.0).is_none());
        assert!(PllDividers::search(1.0).is_none());
    }

    #[test]
    fn pll_search_common_setpoints() {
        // 485 MHz: first hit is fb=233, ref=2, post1=6, post2=1.
        let pll = PllDividers::search(485.0).unwrap();
        assert_eq!((pll.fb, pll.ref_div, pll.post1, pll.post2), (233, 2, 6, 1));
        assert!((pll.frequency() - 485.4167).abs() < 0.01);

        // Every divider the search returns is in domain.
        for target in [56.25, 62.5, 100.0, 400.0, 490.0, 525.0, 575.0] {
            let pll = PllDividers::search(target).unwrap();
            assert!((PllDividers::FB_MIN..=PllDividers::FB_MAX).contains(&pll.fb));
            assert!(pll.ref_div == 1 || pll.ref_div == 2);
            assert!(pll.post1 >= 1 && pll.post1 <= 7);
            assert!(pll.post2 >= 1 && pll.post2 <= 7);
            assert!(pll.post2 <= pll.post1);
            assert!((pll.frequency() - target).abs() < 10.0);
        }
    }

    #[test]
    fn fallback_dividers_give_200mhz() {
        let pll = PllDividers::fallback_200mhz();
        assert_eq!(pll.frequency(), 200.0);
        assert_eq!(pll.register_value(), [0x40, 0xA0, 0x02, 0x41]);
    }

    #[test]
    fn difficulty_mask_rounds_to_power_of_two() {
        assert_eq!(largest_power_of_two(1), 1);
        assert_eq!(largest_power_of_two(256), 256);
        assert_eq!(largest_power_of_two(300), 256);
        assert_eq!(largest_power_of_two(511), 256);
        assert_eq!(largest_power_of_two(512), 512);

        // Difficulty 256 masks the low 8 bits.
        assert_eq!(difficulty_mask_value(256), [0x00, 0x00, 0x00, 0xFF]);
        // Difficulty 300 rounds down to 256.
        assert_eq!(difficulty_mask_value(300), [0x00, 0x00, 0x00, 0xFF]);
        // Difficulty 512: nine mask bits, bit-reversed per byte.
        assert_eq!(difficulty_mask_value(512), [0x00, 0x00, 0x80, 0xFF]);
    }

    #[test]
    fn version_mask_register_form() {
        assert_eq!(
            version_mask_value(STRATUM_DEFAULT_VERSION_MASK),
            [0x90, 0x00, 0xFF, 0xFF]
        );
        assert_eq!(version_mask_value(0x00006000), [0x90, 0x00, 0x00, 0x03]);
    }

    #[test]
    fn hash_wire_order_is_involution() {
        let mut hash = [0u8; 32];
        for (i, byte) in hash.iter_mut().enumerate() {
            *byte = i as u8;
        }

        let wire = hash_wire_order(&hash);
        assert_eq!(&wire[0..4], &[28, 29, 30, 31]);
        assert_eq!(&wire[28..32], &[0, 1, 2, 3]);
        assert_eq!(hash_wire_order(&wire), hash);
    }
}

//! CRC helpers for BM13xx protocol frames.
//!
//! Command frames carry a 5-bit CRC (the USB polynomial); job frames carry
//! CRC-16/CCITT-FALSE transmitted big-endian. Both are computed over the
//! frame bytes from the header byte through the last payload byte, i.e.
//! everything after the preamble and before the CRC itself.

use crc_all::CrcAlgo;

const CRC5_INIT: u8 = 0x1f;

const CRC5: CrcAlgo<u8> = CrcAlgo::<u8>::new(
    0x5,       // polynomial
    5,         // width
    CRC5_INIT, // init
    0,         // xorout
    false,     // reflect
);

/// CRC-5/USB over a byte slice (polynomial 0x05, init 0x1f, no reflection).
pub fn crc5(data: &[u8]) -> u8 {
    let mut crc = CRC5_INIT;
    CRC5.update_crc(&mut crc, data);
    CRC5.finish_crc(&crc)
}

/// Check a received frame whose final five bits are its CRC-5.
///
/// Running the CRC over data-plus-appended-CRC yields zero when intact.
pub fn crc5_is_valid(data: &[u8]) -> bool {
    crc5(data) == 0
}

const CRC16_INIT: u16 = 0xFFFF;

const CRC16: CrcAlgo<u16> = CrcAlgo::<u16>::new(
    0x1021,     // polynomial (CCITT-FALSE)
    16,         // width
    CRC16_INIT, // init
    0,          // xorout
    false,      // reflect
);

/// CRC-16/CCITT-FALSE over a byte slice. Used for job frames.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = CRC16_INIT;
    CRC16.update_crc(&mut crc, data);
    CRC16.finish_crc(&crc)
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    // Command frames known good from hardware bring-up captures. The first
    // two bytes are the preamble and the last byte is the expected CRC-5.
    #[test_case(&[0x55, 0xaa, 0x52, 0x05, 0x00, 0x00, 0x0a]; "enumeration_probe")]
    #[test_case(&[0x55, 0xaa, 0x53, 0x05, 0x00, 0x00, 0x03]; "chain_inactive")]
    #[test_case(&[0x55, 0xaa, 0x40, 0x05, 0x00, 0x00, 0x1c]; "set_chip_address_00")]
    #[test_case(&[0x55, 0xaa, 0x40, 0x05, 0x08, 0x00, 0x07]; "set_chip_address_08")]
    #[test_case(&[0x55, 0xaa, 0x51, 0x09, 0x00, 0xa8, 0x00, 0x07, 0x00, 0x00, 0x03]; "init_control")]
    #[test_case(&[0x55, 0xaa, 0x51, 0x09, 0x00, 0x18, 0xff, 0x0f, 0xc1, 0x00, 0x00]; "misc_control")]
    #[test_case(&[0x55, 0xaa, 0x51, 0x09, 0x00, 0x3c, 0x80, 0x00, 0x85, 0x40, 0x0c]; "core_control_first")]
    #[test_case(&[0x55, 0xaa, 0x51, 0x09, 0x00, 0x3c, 0x80, 0x00, 0x80, 0x20, 0x19]; "core_control_second")]
    #[test_case(&[0x55, 0xaa, 0x51, 0x09, 0x00, 0x54, 0x00, 0x00, 0x00, 0x03, 0x1d]; "analog_mux")]
    #[test_case(&[0x55, 0xaa, 0x51, 0x09, 0x00, 0x58, 0x02, 0x11, 0x11, 0x11, 0x06]; "io_driver_strength")]
    #[test_case(&[0x55, 0xaa, 0x41, 0x09, 0x00, 0x2c, 0x00, 0x7c, 0x00, 0x03, 0x03]; "uart_relay")]
    #[test_case(&[0x55, 0xaa, 0x51, 0x09, 0x00, 0xa4, 0x90, 0x00, 0xff, 0xff, 0x1c]; "version_mask")]
    #[test_case(&[0x55, 0xaa, 0x51, 0x09, 0x00, 0x28, 0x11, 0x30, 0x02, 0x00, 0x03]; "fast_uart")]
    fn crc5_matches_known_command_frames(frame: &[u8]) {
        let crc = super::crc5(&frame[2..frame.len() - 1]);
        assert_eq!(crc, frame[frame.len() - 1]);
    }

    // Response frames validate to zero when the trailing CRC is included.
    #[test_case(&[0xaa, 0x55, 0x13, 0x70, 0x00, 0x00, 0x00, 0x00, 0x06]; "chip_id_reply")]
    #[test_case(&[0xaa, 0x55, 0x4c, 0x03, 0x52, 0x75, 0x0c, 0xd2, 0x05, 0xa2, 0x9c]; "nonce_reply")]
    fn crc5_validates_response_frames(frame: &[u8]) {
        assert!(super::crc5_is_valid(&frame[2..]));
    }

    #[test]
    fn crc16_parameters() {
        // Init 0xffff, no reflection, no output xor.
        assert_eq!(super::crc16(&[]), 0xffff);
        // Standard CCITT-FALSE check value for "123456789".
        assert_eq!(super::crc16(b"123456789"), 0x29B1);
    }
}

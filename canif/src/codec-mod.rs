/*
 * Copyright (C) 2015-2023 IoT.bzh Company
 * Author: Fulup Ar Foll <fulup@iot.bzh>
 *
 * Redpesk interface code/config use MIT License and can be freely copy/modified even within proprietary code
 * License: $RP_BEGIN_LICENSE$ SPDX:MIT https://opensource.org/licenses/MIT $RP_END_LICENSE$
*/

// CAN-FD data length <-> data length code conversion per the ISO 11898-1
// DLC table. Both directions are pure and total.

static DLC2LEN: [u8; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64];

#[rustfmt::skip]
static LEN2DLC: [u8; 65] = [
    0, 1, 2, 3, 4, 5, 6, 7, 8,            /* 0 - 8 */
    9, 9, 9, 9,                           /* 9 - 12 */
    10, 10, 10, 10,                       /* 13 - 16 */
    11, 11, 11, 11,                       /* 17 - 20 */
    12, 12, 12, 12,                       /* 21 - 24 */
    13, 13, 13, 13, 13, 13, 13, 13,       /* 25 - 32 */
    14, 14, 14, 14, 14, 14, 14, 14,       /* 33 - 40 */
    14, 14, 14, 14, 14, 14, 14, 14,       /* 41 - 48 */
    15, 15, 15, 15, 15, 15, 15, 15,       /* 49 - 56 */
    15, 15, 15, 15, 15, 15, 15, 15,       /* 57 - 64 */
];

/// Map a payload length to its wire data length code. Lengths above 64
/// bytes saturate to the maximum DLC (15).
pub fn can_len2dlc(len: usize) -> u8 {
    if len > 64 {
        0xF
    } else {
        LEN2DLC[len]
    }
}

/// Map a data length code back to a payload length. Only the low nibble
/// is consulted, so any byte value is accepted.
pub fn can_dlc2len(dlc: u8) -> u8 {
    DLC2LEN[(dlc & 0x0F) as usize]
}

/// Snap a CAN-FD payload length to the nearest DLC-representable value.
pub fn can_fd_len(len: usize) -> u8 {
    can_dlc2len(can_len2dlc(len))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dlc_round_trip() {
        for dlc in 0u8..16 {
            assert_eq!(can_len2dlc(can_dlc2len(dlc) as usize), dlc);
        }
    }

    #[test]
    fn dlc_high_bits_ignored() {
        for dlc in 0u8..16 {
            assert_eq!(can_dlc2len(dlc), can_dlc2len(dlc | 0xF0));
        }
        assert_eq!(can_dlc2len(0xFF), 64);
    }

    #[test]
    fn len_saturates_above_64() {
        assert_eq!(can_len2dlc(65), 0xF);
        assert_eq!(can_len2dlc(128), 0xF);
        assert_eq!(can_len2dlc(usize::MAX), 0xF);
    }

    #[test]
    fn len_snaps_upward() {
        assert_eq!(can_fd_len(0), 0);
        assert_eq!(can_fd_len(8), 8);
        assert_eq!(can_fd_len(9), 12);
        assert_eq!(can_fd_len(13), 16);
        assert_eq!(can_fd_len(33), 48);
        assert_eq!(can_fd_len(49), 64);
        assert_eq!(can_fd_len(64), 64);
        assert_eq!(can_fd_len(1000), 64);
    }

    #[test]
    fn legal_lengths_are_fixed_points() {
        for len in [0usize, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64] {
            assert_eq!(can_fd_len(len) as usize, len);
        }
    }
}

// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Addressed register frame as it travels over SPI
//!
//! A frame is a 3 byte header (mode, chip, core, register) followed by register data in
//! network byte order. Data is 4 bytes wide on DCR1 and 8 bytes wide on SC1.

use crate::variant::ChipVariant;

use packed_struct::prelude::*;
use packed_struct_codegen::PackedStruct;
use packed_struct_codegen::PrimitiveEnum_u8;

use std::convert::TryInto;

/// Size of the address/control part of the frame
pub const HEADER_BYTES: usize = 3;

/// Largest frame any variant produces
pub const MAX_FRAME_BYTES: usize = HEADER_BYTES + 8;

/// Largest register address that fits the header
pub const MAX_REGISTER: u8 = 0x7f;

/// Transfer modes
#[derive(PrimitiveEnum_u8, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Write register of one core of one chip
    RegWrite = 0,
    /// Read register of one core of one chip
    RegRead = 1,
    /// Write register of all cores of one chip
    ChipWrite = 2,
    /// Write register of all cores of all chips
    Multicast = 3,
}

/// Frame header layout
#[derive(PackedStruct, Debug, PartialEq)]
#[packed_struct(bit_numbering = "lsb0", size_bytes = "3", endian = "msb")]
pub struct FrameHeader {
    #[packed_field(bits = "23:22", ty = "enum")]
    mode: Mode,
    #[packed_field(bits = "21:15")]
    chip: Integer<u8, packed_bits::Bits7>,
    #[packed_field(bits = "14:7")]
    core: Integer<u8, packed_bits::Bits8>,
    #[packed_field(bits = "6:0")]
    register: Integer<u8, packed_bits::Bits7>,
}

/// Logical content of one transfer
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Frame {
    pub mode: Mode,
    pub board: usize,
    pub chip: usize,
    pub core: usize,
    pub register: u8,
    pub data: u64,
}

impl Frame {
    pub fn write(board: usize, chip: usize, core: usize, register: u8, data: u64) -> Self {
        Self {
            mode: Mode::RegWrite,
            board,
            chip,
            core,
            register,
            data,
        }
    }

    pub fn read(board: usize, chip: usize, core: usize, register: u8) -> Self {
        Self {
            mode: Mode::RegRead,
            board,
            chip,
            core,
            register,
            data: 0,
        }
    }

    pub fn chip_write(board: usize, chip: usize, register: u8, data: u64) -> Self {
        Self {
            mode: Mode::ChipWrite,
            board,
            chip,
            core: 0,
            register,
            data,
        }
    }

    pub fn multicast(board: usize, register: u8, data: u64) -> Self {
        Self {
            mode: Mode::Multicast,
            board,
            chip: 0,
            core: 0,
            register,
            data,
        }
    }

    pub fn is_read(&self) -> bool {
        self.mode == Mode::RegRead
    }

    /// Chip field as it goes out on the wire, multicast ignores it
    fn wire_chip(&self) -> u8 {
        match self.mode {
            Mode::Multicast => 0,
            _ => (self.chip & 0x7f) as u8,
        }
    }

    /// Core field as it goes out on the wire, chip-wide modes ignore it
    fn wire_core(&self) -> u8 {
        match self.mode {
            Mode::Multicast | Mode::ChipWrite => 0,
            _ => (self.core & 0xff) as u8,
        }
    }
}

/// Frame encoder/decoder for one chip variant
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Codec {
    variant: ChipVariant,
}

impl Codec {
    pub fn new(variant: &ChipVariant) -> Self {
        Self { variant: *variant }
    }

    /// Number of bytes of an encoded frame
    pub fn frame_len(&self) -> usize {
        HEADER_BYTES + self.variant.data_bytes
    }

    /// Read erratum shift that applies to `frame`, writes are never shifted
    fn shift(&self, frame: &Frame) -> u32 {
        if frame.is_read() {
            self.variant.read_shift_for(frame.core, frame.register)
        } else {
            0
        }
    }

    /// Encode `frame` into `out` and return the number of bytes used
    ///
    /// Register address of a read request is pre-shifted by the read erratum shift of
    /// the register.
    pub fn encode(&self, frame: &Frame, out: &mut [u8]) -> usize {
        let register = (frame.register << self.shift(frame)) & MAX_REGISTER;
        let header = FrameHeader {
            mode: frame.mode,
            chip: frame.wire_chip().into(),
            core: frame.wire_core().into(),
            register: register.into(),
        };
        out[..HEADER_BYTES].copy_from_slice(&header.pack());

        let payload = &mut out[HEADER_BYTES..self.frame_len()];
        if frame.data == 0 {
            for byte in payload.iter_mut() {
                *byte = 0;
            }
        } else {
            payload.copy_from_slice(&frame.data.to_be_bytes()[8 - self.variant.data_bytes..]);
        }
        self.frame_len()
    }

    /// Reverse of [`encode`](Self::encode), data is taken as it is
    pub fn decode(&self, board: usize, bytes: &[u8]) -> Frame {
        let header: [u8; HEADER_BYTES] = bytes[..HEADER_BYTES]
            .try_into()
            .expect("BUG: frame shorter than its header");
        // every 2-bit mode value is defined so unpacking cannot fail
        let header = FrameHeader::unpack(&header).expect("BUG: cannot unpack frame header");
        let mut frame = Frame {
            mode: header.mode,
            board,
            chip: *header.chip as usize,
            core: *header.core as usize,
            register: *header.register,
            data: self.payload(bytes),
        };
        // chip side decoding: an address that names a result register is taken as it is
        frame.register >>= self.shift(&frame);
        frame
    }

    /// Extract register value of a response to `request`, undoing the read erratum shift
    pub fn decode_data(&self, request: &Frame, bytes: &[u8]) -> u64 {
        self.payload(bytes) >> self.shift(request)
    }

    fn payload(&self, bytes: &[u8]) -> u64 {
        bytes[HEADER_BYTES..self.frame_len()]
            .iter()
            .fold(0u64, |acc, byte| (acc << 8) | *byte as u64)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::variant::{CHIP_REGISTER_CORE, DCR1, SC1};

    #[test]
    fn test_header_layout() {
        let codec = Codec::new(&DCR1);
        let mut out = [0u8; MAX_FRAME_BYTES];
        // chip 0x55 (1010101b), core 0xa3, register 0x2f
        let frame = Frame::write(0, 0x55, 0xa3, 0x2f, 0x1234_5678);
        let len = codec.encode(&frame, &mut out);
        let expected = [0x2au8, 0xd1, 0xaf, 0x12, 0x34, 0x56, 0x78];
        assert_eq!(
            &out[..len],
            &expected[..],
            "Incorrectly composed frame: {:#04x?} expected: {:#04x?}",
            &out[..len],
            expected
        );
    }

    #[test]
    fn test_mode_bits() {
        let codec = Codec::new(&SC1);
        let mut out = [0u8; MAX_FRAME_BYTES];
        codec.encode(&Frame::read(0, 0, 0, 0x4e), &mut out);
        assert_eq!(out[0] >> 6, 1);
        codec.encode(&Frame::chip_write(0, 3, 0x20, 0), &mut out);
        assert_eq!(out[0] >> 6, 2);
        codec.encode(&Frame::multicast(0, 0x20, 0), &mut out);
        assert_eq!(out[0] >> 6, 3);
    }

    #[test]
    fn test_data_width_and_order() {
        let mut out = [0xffu8; MAX_FRAME_BYTES];
        let sc1 = Codec::new(&SC1);
        let len = sc1.encode(&Frame::multicast(0, 0x1e, 0x0b60_9366), &mut out);
        assert_eq!(len, 11);
        assert_eq!(&out[3..11], &[0, 0, 0, 0, 0x0b, 0x60, 0x93, 0x66]);

        let dcr1 = Codec::new(&DCR1);
        let len = dcr1.encode(&Frame::multicast(0, 0x1e, 0), &mut out);
        assert_eq!(len, 7);
        assert_eq!(&out[3..7], &[0, 0, 0, 0], "zero data must clear the payload");
    }

    #[test]
    fn test_chip_wide_modes_drop_core() {
        let codec = Codec::new(&DCR1);
        let mut out = [0u8; MAX_FRAME_BYTES];
        let mut frame = Frame::chip_write(1, 9, 0x2e, 0);
        frame.core = 0x77;
        codec.encode(&frame, &mut out);
        let decoded = codec.decode(1, &out);
        assert_eq!(decoded.core, 0);
        assert_eq!(decoded.chip, 9);

        let mut frame = Frame::multicast(1, 0x2e, 0);
        frame.chip = 5;
        codec.encode(&frame, &mut out);
        assert_eq!(codec.decode(1, &out).chip, 0);
    }

    #[test]
    fn test_decode_reverses_encode() {
        for variant in [SC1, DCR1].iter() {
            let codec = Codec::new(variant);
            let frames = [
                Frame::write(2, 14, variant.last_core(), 0x1e, 0x64ee_1000),
                Frame::read(0, 0, 0x80, 0x48),
                Frame::chip_write(1, 7, 0x2f, variant.data_mask()),
                Frame::multicast(0, 0x7f, 1),
            ];
            for frame in frames.iter() {
                let mut out = [0u8; MAX_FRAME_BYTES];
                let len = codec.encode(frame, &mut out);
                assert_eq!(codec.decode(frame.board, &out[..len]), *frame);
            }
        }
    }

    #[test]
    fn test_read_erratum_shift() {
        let codec = Codec::new(&DCR1.with_read_erratum(1));
        let mut out = [0u8; MAX_FRAME_BYTES];
        codec.encode(&Frame::read(0, 0, 7, 0x2f), &mut out);
        assert_eq!(out[2] & 0x7f, 0x5e, "read address must be shifted left");
        assert_eq!(codec.decode(0, &out).register, 0x2f);

        // writes are never shifted
        codec.encode(&Frame::write(0, 0, 7, 0x2f, 0), &mut out);
        assert_eq!(out[2] & 0x7f, 0x2f);

        let request = Frame::read(0, 0, 7, 0x2f);
        let response = [0u8, 0, 0, 0x1f, 0x00, 0x00, 0x10];
        assert_eq!(codec.decode_data(&request, &response), 0x0f80_0008);
        assert_eq!(
            Codec::new(&DCR1).decode_data(&request, &response),
            0x1f00_0010
        );
    }

    #[test]
    fn test_read_erratum_shift_of_every_readable_register() {
        for variant in [SC1, DCR1].iter() {
            let rev_a = variant.with_read_erratum(1);
            let codec = Codec::new(&rev_a);
            let data = 0x0f80_0008u64;
            let mut response = [0u8; MAX_FRAME_BYTES];
            response[HEADER_BYTES..codec.frame_len()].copy_from_slice(
                &(data << 1).to_be_bytes()[8 - variant.data_bytes..],
            );
            for core in [0, 7, CHIP_REGISTER_CORE].iter() {
                for register in 0..=MAX_REGISTER {
                    if !rev_a.is_readable(*core, register) {
                        continue;
                    }
                    let request = Frame::read(1, 3, *core, register);
                    let shift = rev_a.read_shift_for(*core, register);
                    let mut out = [0u8; MAX_FRAME_BYTES];
                    codec.encode(&request, &mut out);
                    assert_eq!(
                        out[2] & 0x7f,
                        register << shift,
                        "{} core {:#x} register {:#x}",
                        variant.name,
                        core,
                        register
                    );
                    assert_eq!(codec.decode(1, &out), request);
                    assert_eq!(codec.decode_data(&request, &response), (data << 1) >> shift);
                }
            }
        }
    }
}

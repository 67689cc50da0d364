//! Byte-span arithmetic for bit-fields packed into byte-addressable registers
//!
//! A bit-field occupies `length` bits starting at bit `lsbit` of a run of bytes. The run is
//! transferred most-significant byte first: byte `0` of the run holds the highest bits and the
//! last byte holds bit `0`.

/// Largest supported bit-field width
pub(crate) const MAX_FIELD_BITS: u32 = 64;

/// Position and width of a bit-field inside a run of bytes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BitSpan {
    lsbit: u32,
    length: u32,
}

impl BitSpan {
    /// # Panics
    ///
    /// `length` must be within `1..=64` and `lsbit` below 64. The register map loader rejects
    /// records that break this, so reaching the assertion is a library programming error.
    pub fn new(lsbit: u32, length: u32) -> Self {
        assert!(
            (1..=MAX_FIELD_BITS).contains(&length) && lsbit < MAX_FIELD_BITS,
            "unsupported bit span: lsbit {lsbit}, length {length}"
        );
        Self { lsbit, length }
    }

    /// Span of a plain one-byte register
    pub const fn whole_byte() -> Self {
        Self {
            lsbit: 0,
            length: 8,
        }
    }

    pub const fn lsbit(&self) -> u32 {
        self.lsbit
    }

    pub const fn length(&self) -> u32 {
        self.length
    }

    /// Number of bytes the field touches, `ceil((length + lsbit) / 8)`
    pub const fn num_bytes(&self) -> usize {
        ((self.length + self.lsbit + 7) / 8) as usize
    }

    /// Number of whole bytes a raw write may carry, `ceil(length / 8)`
    pub const fn capacity_bytes(&self) -> usize {
        ((self.length + 7) / 8) as usize
    }

    /// Largest unsigned value the field can represent, `2^length - 1`
    pub const fn max_value(&self) -> u64 {
        if self.length >= u64::BITS {
            u64::MAX
        } else {
            (1 << self.length) - 1
        }
    }

    pub const fn fits(&self, value: u64) -> bool {
        value <= self.max_value()
    }

    /// Mask of the field's bits across the whole run
    pub const fn mask(&self) -> u128 {
        (self.max_value() as u128) << self.lsbit
    }

    /// Distance in bits between bit `0` of byte `i` and bit `0` of the run
    const fn byte_shift(&self, i: usize) -> u32 {
        ((self.num_bytes() - 1 - i) * 8) as u32
    }

    /// The bits of byte `i` that belong to the field
    pub const fn byte_mask(&self, i: usize) -> u8 {
        ((self.mask() >> self.byte_shift(i)) & 0xff) as u8
    }

    /// Extract the right-justified field value from a run of `num_bytes` bytes
    pub fn extract(&self, bytes: &[u8]) -> u64 {
        debug_assert_eq!(bytes.len(), self.num_bytes());
        let value = bytes.iter().enumerate().fold(0u128, |acc, (i, byte)| {
            let owned = u128::from(byte & self.byte_mask(i));
            acc + ((owned << self.byte_shift(i)) >> self.lsbit)
        });
        // Bounded by `mask() >> lsbit`, which is at most `u64::MAX`
        value as u64
    }

    /// The field's share of byte `i` when the field holds `value`
    pub const fn place(&self, value: u64, i: usize) -> u8 {
        let shifted = (value as u128) << self.lsbit;
        ((shifted >> self.byte_shift(i)) & self.byte_mask(i) as u128) as u8
    }

    /// Replace the field's bits in `current`, byte `i` of the run, keeping all other bits
    pub const fn merge(&self, current: u8, value: u64, i: usize) -> u8 {
        (current & !self.byte_mask(i)) | self.place(value, i)
    }
}

/// Whether a byte is owned by the field in its entirety, making a read-modify-write
/// unnecessary
pub const fn byte_fully_owned(byte_mask: u8) -> bool {
    byte_mask == u8::MAX
}

#[test]
fn num_bytes_rounds_up() {
    assert_eq!(BitSpan::new(0, 1).num_bytes(), 1);
    assert_eq!(BitSpan::new(7, 1).num_bytes(), 1);
    assert_eq!(BitSpan::new(7, 2).num_bytes(), 2);
    assert_eq!(BitSpan::new(0, 8).num_bytes(), 1);
    assert_eq!(BitSpan::new(0, 9).num_bytes(), 2);
    assert_eq!(BitSpan::new(4, 12).num_bytes(), 2);
    assert_eq!(BitSpan::new(4, 13).num_bytes(), 3);
    assert_eq!(BitSpan::new(63, 64).num_bytes(), 16);
}

#[test]
fn capacity_ignores_alignment() {
    assert_eq!(BitSpan::new(5, 8).capacity_bytes(), 1);
    assert_eq!(BitSpan::new(0, 9).capacity_bytes(), 2);
    assert_eq!(BitSpan::whole_byte().capacity_bytes(), 1);
}

#[test]
fn max_value_works() {
    assert_eq!(BitSpan::new(3, 1).max_value(), 1);
    assert_eq!(BitSpan::new(4, 2).max_value(), 0b11);
    assert_eq!(BitSpan::new(0, 8).max_value(), 0xff);
    assert_eq!(BitSpan::new(0, 64).max_value(), u64::MAX);
    assert!(BitSpan::new(4, 2).fits(3));
    assert!(!BitSpan::new(4, 2).fits(4));
}

#[test]
fn byte_masks_are_msb_first() {
    // 12-bit field starting at bit 4: 0xfff0 over two bytes
    let span = BitSpan::new(4, 12);
    assert_eq!(span.byte_mask(0), 0xff);
    assert_eq!(span.byte_mask(1), 0xf0);
    assert!(byte_fully_owned(span.byte_mask(0)));
    assert!(!byte_fully_owned(span.byte_mask(1)));

    // 2-bit field at bits 7..=8 straddles the byte boundary
    let span = BitSpan::new(7, 2);
    assert_eq!(span.byte_mask(0), 0b0000_0001);
    assert_eq!(span.byte_mask(1), 0b1000_0000);
}

#[test]
fn extract_right_justifies() {
    assert_eq!(BitSpan::new(3, 1).extract(&[0x08]), 1);
    assert_eq!(BitSpan::new(4, 2).extract(&[0x28]), 0b10);
    assert_eq!(BitSpan::new(7, 2).extract(&[0x01, 0x80]), 0b11);
    assert_eq!(BitSpan::new(4, 12).extract(&[0xab, 0xcd]), 0xabc);
    // Bits outside the field are ignored
    assert_eq!(BitSpan::new(4, 2).extract(&[0xff]), 0b11);
    assert_eq!(BitSpan::new(0, 64).extract(&[0xde, 0xad, 0xbe, 0xef, 1, 2, 3, 4]), 0xdead_beef_0102_0304);
}

#[test]
fn merge_preserves_neighbors() {
    let busy = BitSpan::new(3, 1);
    let mode = BitSpan::new(4, 2);
    let byte = busy.merge(0x00, 1, 0);
    assert_eq!(byte, 0x08);
    let byte = mode.merge(byte, 0b10, 0);
    assert_eq!(byte, 0x28);
    let byte = busy.merge(byte, 0, 0);
    assert_eq!(byte, 0x20);
}

#[test]
fn place_then_extract_is_identity() {
    for (lsbit, length) in [(0, 1), (3, 5), (7, 2), (5, 11), (1, 17), (6, 33), (0, 64), (63, 64)] {
        let span = BitSpan::new(lsbit, length);
        for value in [0, 1, span.max_value() / 3, span.max_value()] {
            let bytes = (0..span.num_bytes())
                .map(|i| span.place(value, i))
                .collect::<Vec<_>>();
            assert_eq!(span.extract(&bytes), value, "lsbit {lsbit}, length {length}");
        }
    }
}

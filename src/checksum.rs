/// Running 8-bit XOR checksum covering every frame byte before the checksum itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct Checksum {
    current: u8,
}

impl Checksum {
    /// Creates a new `Checksum` instance, initialized to 0.
    #[inline]
    pub fn new() -> Checksum {
        Checksum { current: 0 }
    }

    /// XORs a single byte into the checksum.
    #[inline]
    pub fn push(&mut self, byte: u8) {
        self.current ^= byte;
    }

    /// XORs every byte of `data` into the checksum.
    #[inline]
    pub fn push_slice(&mut self, data: &[u8]) {
        for d in data {
            self.push(*d);
        }
    }

    /// Returns the calculated checksum value.
    #[inline]
    pub fn checksum(&self) -> u8 {
        self.current
    }

    /// Checksum of a complete byte slice.
    pub fn of(data: &[u8]) -> u8 {
        let mut checksum = Checksum::new();
        checksum.push_slice(data);
        checksum.checksum()
    }
}

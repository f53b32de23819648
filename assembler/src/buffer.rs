/// Append-only byte buffer with in-place patching at known offsets.
///
/// Capacity doubles as needed starting from a configured minimum. Growth
/// failure is recorded as a sticky exhausted condition instead of aborting;
/// emission continues as a no-op and the condition is reported when the
/// owner finishes the buffer.
pub struct Buffer {
    data: Vec<u8>,
    minimum_capacity: usize,
    exhausted: bool,
}

impl Buffer {
    pub fn new(minimum_capacity: usize) -> Self {
        Self {
            data: Vec::new(),
            minimum_capacity,
            exhausted: false,
        }
    }

    fn ensure(&mut self, space: usize) -> bool {
        if self.exhausted {
            return false;
        }
        let needed = self.data.len() + space;
        if needed > self.data.capacity() {
            let target = needed
                .max(self.minimum_capacity.max(self.data.capacity() * 2));
            if self
                .data
                .try_reserve(target - self.data.len())
                .is_err()
            {
                self.exhausted = true;
                return false;
            }
        }
        true
    }

    pub fn append1(&mut self, v: u8) {
        if self.ensure(1) {
            self.data.push(v);
        }
    }

    pub fn append2(&mut self, v: u16) {
        if self.ensure(2) {
            self.data.extend_from_slice(&v.to_le_bytes());
        }
    }

    pub fn append4(&mut self, v: u32) {
        if self.ensure(4) {
            self.data.extend_from_slice(&v.to_le_bytes());
        }
    }

    pub fn append8(&mut self, v: u64) {
        if self.ensure(8) {
            self.data.extend_from_slice(&v.to_le_bytes());
        }
    }

    /// Append a machine-word-sized little-endian value.
    pub fn append_addr(&mut self, v: usize) {
        if core::mem::size_of::<usize>() == 8 {
            self.append8(v as u64);
        } else {
            self.append4(v as u32);
        }
    }

    pub fn patch2(&mut self, offset: usize, v: u16) {
        debug_assert!(offset + 2 <= self.data.len());
        if offset + 2 <= self.data.len() {
            self.data[offset..offset + 2].copy_from_slice(&v.to_le_bytes());
        }
    }

    pub fn patch4(&mut self, offset: usize, v: u32) {
        debug_assert!(offset + 4 <= self.data.len());
        if offset + 4 <= self.data.len() {
            self.data[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
        }
    }

    pub fn get2(&self, offset: usize) -> u16 {
        let mut b = [0u8; 2];
        b.copy_from_slice(&self.data[offset..offset + 2]);
        u16::from_le_bytes(b)
    }

    pub fn get4(&self, offset: usize) -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.data[offset..offset + 4]);
        u32::from_le_bytes(b)
    }

    pub fn length(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// True once any growth attempt has failed; the contents are then
    /// incomplete and must not be used.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn copy_to(&self, out: &mut [u8]) {
        out[..self.data.len()].copy_from_slice(&self.data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_little_endian() {
        let mut b = Buffer::new(16);
        b.append1(0xAA);
        b.append2(0x1122);
        b.append4(0x3344_5566);
        assert_eq!(b.bytes(), &[0xAA, 0x22, 0x11, 0x66, 0x55, 0x44, 0x33]);
        assert_eq!(b.length(), 7);
    }

    #[test]
    fn patches_inside_appended_region() {
        let mut b = Buffer::new(4);
        b.append4(0);
        b.append4(0xFFFF_FFFF);
        b.patch4(0, 0xDEAD_BEEF);
        b.patch2(4, 0x1234);
        assert_eq!(b.get4(0), 0xDEAD_BEEF);
        assert_eq!(b.get2(4), 0x1234);
        assert_eq!(b.get2(6), 0xFFFF);
    }

    #[test]
    fn grows_past_minimum_capacity() {
        let mut b = Buffer::new(2);
        for i in 0..1000u32 {
            b.append4(i);
        }
        assert_eq!(b.length(), 4000);
        assert!(!b.is_exhausted());
        assert_eq!(b.get4(3996), 999);
    }

    #[test]
    fn word_append_matches_pointer_width() {
        let mut b = Buffer::new(8);
        b.append_addr(usize::MAX);
        assert_eq!(b.length(), core::mem::size_of::<usize>());
    }
}

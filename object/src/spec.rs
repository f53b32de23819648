use crate::{FieldCode, WORD};

/// Iterator over the parameter descriptors of a compact method spec
/// string `(<args>)<ret>`, yielding the head byte of each descriptor
/// (`'L'` and `'['` for references, a primitive letter otherwise).
pub struct SpecIterator<'a> {
    s: &'a [u8],
    pos: usize,
}

impl<'a> SpecIterator<'a> {
    pub fn new(spec: &'a str) -> Self {
        let s = spec.as_bytes();
        debug_assert!(s.first() == Some(&b'('), "bad spec {spec:?}");
        Self { s, pos: 1 }
    }
}

impl Iterator for SpecIterator<'_> {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        let c = *self.s.get(self.pos)?;
        if c == b')' {
            return None;
        }
        let head = c;
        // skip array ranks, then one descriptor
        while self.s.get(self.pos) == Some(&b'[') {
            self.pos += 1;
        }
        if self.s.get(self.pos) == Some(&b'L') {
            while !matches!(self.s.get(self.pos), None | Some(b';')) {
                self.pos += 1;
            }
            self.pos += 1;
        } else {
            self.pos += 1;
        }
        Some(head)
    }
}

/// Machine words occupied by a method's arguments on entry: `long` and
/// `double` take two on 32-bit targets and one on 64-bit targets, every
/// other descriptor takes one, and an instance receiver adds one.
pub fn parameter_footprint(spec: &str, is_static: bool) -> usize {
    let mut footprint = 0;
    for head in SpecIterator::new(spec) {
        footprint += match head {
            b'J' | b'D' if WORD == 4 => 2,
            _ => 1,
        };
    }
    if !is_static {
        footprint += 1;
    }
    footprint
}

/// The return storage class of a method spec.
pub fn return_code_of_spec(spec: &str) -> FieldCode {
    let close = spec
        .as_bytes()
        .iter()
        .position(|&c| c == b')')
        .unwrap_or_else(|| panic!("bad spec {spec:?}"));
    FieldCode::from_descriptor(spec.as_bytes()[close + 1])
}

const WORD_BITS: usize = u64::BITS as usize;

/// Exported LSB-first: bit `i` is bit `i % 8` of byte `i / 8`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    words: Vec<u64>,
    len: usize,
}

impl Bitmap {
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(WORD_BITS)],
            len,
        }
    }

    /// Rebuilds a bitmap from its exported bytes. Returns `None` if `bytes`
    /// is too short to hold `len` bits.
    pub fn from_bytes(len: usize, bytes: &[u8]) -> Option<Self> {
        if bytes.len() * 8 < len {
            return None;
        }
        let mut bitmap = Self::new(len);
        for (word, chunk) in bitmap.words.iter_mut().zip(bytes.chunks(8)) {
            let mut le = [0u8; 8];
            le[..chunk.len()].copy_from_slice(chunk);
            *word = u64::from_le_bytes(le);
        }
        bitmap.clear_tail();
        Some(bitmap)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes: Vec<u8> = self.words.iter().flat_map(|w| w.to_le_bytes()).collect();
        bytes.truncate(self.len.div_ceil(8));
        bytes
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn locate(bit: usize) -> (usize, u64) {
        (bit / WORD_BITS, 1 << (bit % WORD_BITS))
    }

    /// Sets `bit`, returning its previous value. Out-of-range bits are ignored.
    pub fn set(&mut self, bit: usize) -> bool {
        if bit >= self.len {
            return false;
        }
        let (w, mask) = Self::locate(bit);
        let prev = self.words[w] & mask != 0;
        self.words[w] |= mask;
        prev
    }

    /// Clears `bit`, returning its previous value. Out-of-range bits are ignored.
    pub fn reset(&mut self, bit: usize) -> bool {
        if bit >= self.len {
            return false;
        }
        let (w, mask) = Self::locate(bit);
        let prev = self.words[w] & mask != 0;
        self.words[w] &= !mask;
        prev
    }

    pub fn test(&self, bit: usize) -> bool {
        if bit >= self.len {
            return false;
        }
        let (w, mask) = Self::locate(bit);
        self.words[w] & mask != 0
    }

    /// Index of the lowest clear bit.
    pub fn first_zero(&self) -> Option<usize> {
        self.words.iter().enumerate().find_map(|(pos, w)| {
            if *w != u64::MAX {
                let bit = pos * WORD_BITS + w.trailing_ones() as usize;
                (bit < self.len).then_some(bit)
            } else {
                None
            }
        })
    }

    /// Index of the lowest set bit.
    pub fn first_set(&self) -> Option<usize> {
        self.words.iter().enumerate().find_map(|(pos, w)| {
            (*w != 0).then(|| pos * WORD_BITS + w.trailing_zeros() as usize)
        })
    }

    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    fn clear_tail(&mut self) {
        let tail = self.len % WORD_BITS;
        if tail != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1 << tail) - 1;
            }
        }
    }
}

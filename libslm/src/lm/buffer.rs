use std::cmp::Ordering;

use anyhow::{ensure, Result};

/// Bytes per packed bigram record in the model file.
pub(crate) const BYTES_PER_BIGRAM: usize = 8;
/// Bytes per packed trigram record in the model file.
pub(crate) const BYTES_PER_TRIGRAM: usize = 4;

/// One decoded bigram record, tagged with its position inside the follower
/// slice it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BigramRecord {
    pub which_follower: u32,
    pub word_id: u32,
    pub probability_id: u32,
    pub backoff_id: u32,
    /// Low 16 bits of the cumulative trigram index. The full index also needs
    /// the segment table base for the record's global bigram position.
    pub first_trigram_entry: u32,
}

/// The bigram followers of one predecessor word: a raw byte slice holding the
/// packed records plus the sentinel that closes the slice. Records are
/// decoded on access.
pub(crate) struct BigramBuffer {
    bytes: Vec<u8>,
    number_followers: usize,
    big_endian: bool,
    used: bool,
}

impl BigramBuffer {
    /// `bytes` must hold the follower records and the one record after them.
    pub fn new(bytes: Vec<u8>, number_followers: usize, big_endian: bool) -> Result<BigramBuffer> {
        ensure!(
            bytes.len() == (number_followers + 1) * BYTES_PER_BIGRAM,
            "bigram slice holds {} bytes, expected {} records plus a sentinel",
            bytes.len(),
            number_followers,
        );
        let buffer = BigramBuffer {
            bytes,
            number_followers,
            big_endian,
            used: false,
        };
        ensure!(
            buffer.followers_strictly_ascending(),
            "bigram followers are not strictly ascending"
        );
        Ok(buffer)
    }

    fn followers_strictly_ascending(&self) -> bool {
        (1..self.number_followers).all(|i| self.record(i - 1).word_id < self.record(i).word_id)
    }

    /// Number of real followers, sentinel excluded.
    pub fn len(&self) -> usize {
        self.number_followers
    }

    /// Decodes the record at `index`. `index == len()` addresses the
    /// sentinel, which only exists for cumulative trigram offset math.
    pub fn record(&self, index: usize) -> BigramRecord {
        debug_assert!(index <= self.number_followers);
        let base = index * BYTES_PER_BIGRAM;
        BigramRecord {
            which_follower: index as u32,
            word_id: u32::from(read_u16(&self.bytes, base, self.big_endian)),
            probability_id: u32::from(read_u16(&self.bytes, base + 2, self.big_endian)),
            backoff_id: u32::from(read_u16(&self.bytes, base + 4, self.big_endian)),
            first_trigram_entry: u32::from(read_u16(&self.bytes, base + 6, self.big_endian)),
        }
    }

    /// Binary search by follower word id. The sentinel is never a match.
    pub fn find(&self, word_id: u32) -> Option<BigramRecord> {
        let mut lo = 0;
        let mut hi = self.number_followers;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let record = self.record(mid);
            match record.word_id.cmp(&word_id) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Some(record),
            }
        }
        None
    }

    pub fn used(&self) -> bool {
        self.used
    }

    pub fn set_used(&mut self, used: bool) {
        self.used = used;
    }
}

/// The trigram followers of one (w1, w2) history. May be empty.
pub(crate) struct TrigramBuffer {
    bytes: Vec<u8>,
    number_trigrams: usize,
    big_endian: bool,
}

impl TrigramBuffer {
    pub fn new(bytes: Vec<u8>, number_trigrams: usize, big_endian: bool) -> Result<TrigramBuffer> {
        ensure!(
            bytes.len() == number_trigrams * BYTES_PER_TRIGRAM,
            "trigram slice holds {} bytes, expected {} records",
            bytes.len(),
            number_trigrams,
        );
        let buffer = TrigramBuffer {
            bytes,
            number_trigrams,
            big_endian,
        };
        ensure!(
            (1..number_trigrams).all(|i| buffer.word_id(i - 1) < buffer.word_id(i)),
            "trigram followers are not strictly ascending"
        );
        Ok(buffer)
    }

    pub fn len(&self) -> usize {
        self.number_trigrams
    }

    pub fn word_id(&self, index: usize) -> u32 {
        debug_assert!(index < self.number_trigrams);
        u32::from(read_u16(&self.bytes, index * BYTES_PER_TRIGRAM, self.big_endian))
    }

    pub fn probability_id(&self, index: usize) -> u32 {
        debug_assert!(index < self.number_trigrams);
        u32::from(read_u16(
            &self.bytes,
            index * BYTES_PER_TRIGRAM + 2,
            self.big_endian,
        ))
    }

    /// Binary search by third word id, returning the probability table index.
    pub fn find(&self, word_id: u32) -> Option<u32> {
        let mut lo = 0;
        let mut hi = self.number_trigrams;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.word_id(mid).cmp(&word_id) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Some(self.probability_id(mid)),
            }
        }
        None
    }
}

fn read_u16(bytes: &[u8], offset: usize, big_endian: bool) -> u16 {
    let pair = [bytes[offset], bytes[offset + 1]];
    if big_endian {
        u16::from_be_bytes(pair)
    } else {
        u16::from_le_bytes(pair)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pack_bigrams(records: &[[u16; 4]], big_endian: bool) -> Vec<u8> {
        let mut bytes = Vec::new();
        for record in records {
            for &field in record {
                if big_endian {
                    bytes.extend_from_slice(&field.to_be_bytes());
                } else {
                    bytes.extend_from_slice(&field.to_le_bytes());
                }
            }
        }
        bytes
    }

    fn pack_trigrams(records: &[[u16; 2]], big_endian: bool) -> Vec<u8> {
        let mut bytes = Vec::new();
        for record in records {
            for &field in record {
                if big_endian {
                    bytes.extend_from_slice(&field.to_be_bytes());
                } else {
                    bytes.extend_from_slice(&field.to_le_bytes());
                }
            }
        }
        bytes
    }

    #[test]
    fn finds_followers_in_both_byte_orders() {
        let records = [[2, 10, 20, 0], [5, 11, 21, 3], [9, 12, 22, 7], [0, 0, 0, 9]];
        for big_endian in [false, true] {
            let buffer =
                BigramBuffer::new(pack_bigrams(&records, big_endian), 3, big_endian).unwrap();
            assert_eq!(buffer.len(), 3);
            let hit = buffer.find(5).unwrap();
            assert_eq!(hit.which_follower, 1);
            assert_eq!(hit.probability_id, 11);
            assert_eq!(hit.backoff_id, 21);
            assert_eq!(hit.first_trigram_entry, 3);
            assert!(buffer.find(3).is_none());
            assert!(buffer.find(1).is_none());
            assert!(buffer.find(10).is_none());
        }
    }

    #[test]
    fn sentinel_is_reachable_but_never_found() {
        let records = [[4, 1, 2, 0], [7, 3, 4, 5], [4, 0, 0, 8]];
        let buffer = BigramBuffer::new(pack_bigrams(&records, false), 2, false).unwrap();
        // The sentinel repeats a follower id; lookups must not return it.
        assert_eq!(buffer.find(4).unwrap().which_follower, 0);
        assert_eq!(buffer.record(2).first_trigram_entry, 8);
    }

    #[test]
    fn rejects_unsorted_followers() {
        let records = [[7, 1, 2, 0], [4, 3, 4, 5], [0, 0, 0, 8]];
        assert!(BigramBuffer::new(pack_bigrams(&records, false), 2, false).is_err());
    }

    #[test]
    fn rejects_a_short_slice() {
        let records = [[4, 1, 2, 0]];
        assert!(BigramBuffer::new(pack_bigrams(&records, false), 1, false).is_err());
    }

    #[test]
    fn trigram_search_returns_the_probability_id() {
        let records = [[3, 30], [8, 31], [11, 32]];
        for big_endian in [false, true] {
            let buffer =
                TrigramBuffer::new(pack_trigrams(&records, big_endian), 3, big_endian).unwrap();
            assert_eq!(buffer.find(3), Some(30));
            assert_eq!(buffer.find(11), Some(32));
            assert_eq!(buffer.find(4), None);
        }
    }

    #[test]
    fn empty_trigram_buffer_finds_nothing() {
        let buffer = TrigramBuffer::new(Vec::new(), 0, false).unwrap();
        assert_eq!(buffer.len(), 0);
        assert_eq!(buffer.find(0), None);
    }
}

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use crate::bitfield::Bitfield;
use crate::torrent::Torrent;

use super::unit::StorageUnit;

/// Consecutive commit failures on one piece before the descriptor is
/// declared stalled.
pub const STALL_FAILURE_LIMIT: u32 = 3;

/// Posible data descriptor errors.
#[derive(Debug)]
pub enum DataDescriptorError {
    PieceOutOfBounds(u32),
    BlockOutOfBounds {
        index: u32,
        begin: u32,
        length: u32,
    },
    WrongPieceLength {
        index: u32,
        expected: u32,
        actual: usize,
    },
    HashMismatch(u32),
    PieceNotVerified(u32),
    Stalled,
    Closed,
    Io(io::Error),
    PoisonedInnerLock,
}

/// A contiguous byte range inside one storage unit.
#[derive(Debug, PartialEq)]
struct Span {
    unit: usize,
    offset: u64,
    length: usize,
}

#[derive(Debug)]
struct DescriptorInner {
    units: Vec<StorageUnit>,
    verified: Bitfield,
    commit_failures: HashMap<u32, u32>,
    stalled: bool,
    closed: bool,
}

/// The storage view of one registered torrent: per-file units, the
/// piece digest table (via the torrent model) and the verified
/// bitfield.
///
/// The bitfield and the payload writes share one lock so a set bit
/// always means the piece bytes are on disk.
#[derive(Debug)]
pub struct DataDescriptor {
    torrent: Torrent,
    inner: Mutex<DescriptorInner>,
}

impl DataDescriptor {
    /// Opens storage units for every file of the torrent under the
    /// download directory.
    pub fn open(torrent: Torrent, download_dir: &str) -> Result<Self, DataDescriptorError> {
        let base = PathBuf::from(download_dir).join(&torrent.name);

        let mut units = Vec::with_capacity(torrent.files.len());
        for file in &torrent.files {
            let unit = StorageUnit::open(base.join(&file.path), file.length)
                .map_err(DataDescriptorError::Io)?;
            units.push(unit);
        }

        let verified = Bitfield::new(torrent.total_pieces() as usize);

        Ok(Self {
            torrent,
            inner: Mutex::new(DescriptorInner {
                units,
                verified,
                commit_failures: HashMap::new(),
                stalled: false,
                closed: false,
            }),
        })
    }

    pub fn torrent(&self) -> &Torrent {
        &self.torrent
    }

    /// Splits a block into per-unit spans, crossing file boundaries as
    /// needed.
    fn spans(
        &self,
        index: u32,
        begin: u32,
        length: usize,
    ) -> Result<Vec<Span>, DataDescriptorError> {
        let piece_size = self
            .torrent
            .piece_size(index)
            .map_err(|_| DataDescriptorError::PieceOutOfBounds(index))?;
        if begin as usize + length > piece_size as usize {
            return Err(DataDescriptorError::BlockOutOfBounds {
                index,
                begin,
                length: length as u32,
            });
        }

        let start = index as u64 * self.torrent.piece_length as u64 + begin as u64;
        let end = start + length as u64;

        let mut spans = Vec::new();
        for (unit, file) in self.torrent.files.iter().enumerate() {
            if file.end_offset() <= start {
                continue;
            }
            if file.offset >= end {
                break;
            }
            let segment_start = start.max(file.offset);
            let segment_end = end.min(file.end_offset());
            spans.push(Span {
                unit,
                offset: segment_start - file.offset,
                length: (segment_end - segment_start) as usize,
            });
        }
        Ok(spans)
    }

    /// Verifies a complete piece against its digest and, on a match,
    /// writes it through to storage and marks it verified.
    ///
    /// Returns whether the bit was newly set; committing an already
    /// verified piece is a no-op.
    ///
    /// # Errors
    /// - `HashMismatch` if the SHA-1 of `data` differs from the digest table.
    /// - `Io` on write failure; `STALL_FAILURE_LIMIT` consecutive failures
    ///   on the same piece leave the descriptor stalled.
    /// - `Stalled` / `Closed` when the descriptor is out of service.
    pub fn commit_piece(&self, index: u32, data: &[u8]) -> Result<bool, DataDescriptorError> {
        let expected_size = self
            .torrent
            .piece_size(index)
            .map_err(|_| DataDescriptorError::PieceOutOfBounds(index))?;
        if data.len() != expected_size as usize {
            return Err(DataDescriptorError::WrongPieceLength {
                index,
                expected: expected_size,
                actual: data.len(),
            });
        }

        let digest = Sha1::digest(data);
        let expected = self
            .torrent
            .piece_hash(index)
            .map_err(|_| DataDescriptorError::PieceOutOfBounds(index))?;
        if digest.as_slice() != expected {
            return Err(DataDescriptorError::HashMismatch(index));
        }

        let spans = self.spans(index, 0, data.len())?;

        let mut inner = self.lock_inner()?;
        if inner.closed {
            return Err(DataDescriptorError::Closed);
        }
        if inner.stalled {
            return Err(DataDescriptorError::Stalled);
        }
        if inner.verified.has_piece(index) {
            return Ok(false);
        }

        let mut cursor = 0usize;
        for span in &spans {
            let slice = &data[cursor..cursor + span.length];
            if let Err(err) = inner.units[span.unit].write_fully(slice, span.offset) {
                let failures = {
                    let counter = inner.commit_failures.entry(index).or_insert(0);
                    *counter += 1;
                    *counter
                };
                if failures >= STALL_FAILURE_LIMIT {
                    warn!(
                        "Descriptor for {} stalled after {} failed commits of piece {}",
                        self.torrent.name, failures, index
                    );
                    inner.stalled = true;
                }
                return Err(DataDescriptorError::Io(err));
            }
            cursor += span.length;
        }

        inner.commit_failures.remove(&index);
        // Set under the same lock as the write: verified implies durable.
        inner
            .verified
            .set_bit(index, true)
            .map_err(|_| DataDescriptorError::PieceOutOfBounds(index))?;
        debug!("Piece {} of {} committed", index, self.torrent.name);
        Ok(true)
    }

    /// Reads a block of a verified piece.
    ///
    /// A failure to read back bytes that were committed is fatal for
    /// the descriptor: it flips to stalled.
    pub fn read_block(
        &self,
        index: u32,
        begin: u32,
        length: usize,
    ) -> Result<Vec<u8>, DataDescriptorError> {
        let spans = self.spans(index, begin, length)?;

        let mut inner = self.lock_inner()?;
        if inner.closed {
            return Err(DataDescriptorError::Closed);
        }
        if !inner.verified.has_piece(index) {
            return Err(DataDescriptorError::PieceNotVerified(index));
        }

        let mut block = vec![0; length];
        let mut cursor = 0usize;
        for span in &spans {
            let slice = &mut block[cursor..cursor + span.length];
            if let Err(err) = inner.units[span.unit].read_fully(slice, span.offset) {
                inner.stalled = true;
                warn!(
                    "Descriptor for {} stalled: verified piece {} unreadable: {}",
                    self.torrent.name, index, err
                );
                return Err(DataDescriptorError::Io(err));
            }
            cursor += span.length;
        }
        Ok(block)
    }

    /// Snapshot of the verified bitfield.
    pub fn verified(&self) -> Result<Bitfield, DataDescriptorError> {
        Ok(self.lock_inner()?.verified.clone())
    }

    pub fn is_complete(&self) -> Result<bool, DataDescriptorError> {
        Ok(self.lock_inner()?.verified.is_complete())
    }

    pub fn is_stalled(&self) -> Result<bool, DataDescriptorError> {
        Ok(self.lock_inner()?.stalled)
    }

    /// Flushes every storage unit to disk.
    pub fn flush(&self) -> Result<(), DataDescriptorError> {
        let mut inner = self.lock_inner()?;
        if inner.closed {
            return Err(DataDescriptorError::Closed);
        }
        for unit in &mut inner.units {
            unit.flush().map_err(DataDescriptorError::Io)?;
        }
        Ok(())
    }

    /// Closes the descriptor; later operations fail with `Closed`.
    /// Closing twice is a no-op.
    pub fn close(&self) -> Result<(), DataDescriptorError> {
        let mut inner = self.lock_inner()?;
        if inner.closed {
            return Ok(());
        }
        for unit in &mut inner.units {
            if let Err(err) = unit.flush() {
                warn!("Flush of {:?} on close failed: {}", unit.path(), err);
            }
        }
        inner.units.clear();
        inner.closed = true;
        Ok(())
    }

    fn lock_inner(&self) -> Result<MutexGuard<DescriptorInner>, DataDescriptorError> {
        self.inner
            .lock()
            .map_err(|_| DataDescriptorError::PoisonedInnerLock)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use super::*;
    use crate::torrent::TorrentId;

    #[test]
    fn test_commit_and_read_single_file() {
        let (descriptor, dir) = build_descriptor("descriptor_single", vec![("a.bin", 32)], 16);
        let piece = vec![b'A'; 16];

        assert!(descriptor.commit_piece(0, &piece).unwrap());
        assert!(descriptor.verified().unwrap().has_piece(0));

        let block = descriptor.read_block(0, 4, 8).unwrap();
        assert_eq!(block, vec![b'A'; 8]);

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_commit_is_idempotent() {
        let (descriptor, dir) = build_descriptor("descriptor_idempotent", vec![("a.bin", 16)], 16);
        let piece = vec![b'A'; 16];

        assert!(descriptor.commit_piece(0, &piece).unwrap());
        assert!(!descriptor.commit_piece(0, &piece).unwrap());

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_commit_crossing_file_boundary() {
        let dir = PathBuf::from("./download").join("test_descriptor_boundary");
        if dir.exists() {
            fs::remove_dir_all(&dir).unwrap();
        }
        let piece: Vec<u8> = (0..16).collect();

        let torrent = Torrent::new(
            TorrentId::new([3; 20]),
            "example".to_string(),
            16,
            vec![(PathBuf::from("a.bin"), 10), (PathBuf::from("b.bin"), 6)],
            Sha1::digest(&piece).to_vec(),
        )
        .unwrap();
        let descriptor = DataDescriptor::open(torrent, dir.to_str().unwrap()).unwrap();

        descriptor.commit_piece(0, &piece).unwrap();

        // The tail of the piece landed in the second file.
        let a = fs::read(dir.join("example").join("a.bin")).unwrap();
        let b = fs::read(dir.join("example").join("b.bin")).unwrap();
        assert_eq!(a, (0..10).collect::<Vec<u8>>());
        assert_eq!(b, (10..16).collect::<Vec<u8>>());

        let block = descriptor.read_block(0, 8, 4).unwrap();
        assert_eq!(block, vec![8, 9, 10, 11]);

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_commit_hash_mismatch() {
        let (descriptor, dir) = build_descriptor("descriptor_mismatch", vec![("a.bin", 16)], 16);

        let err = descriptor.commit_piece(0, &vec![b'B'; 16]).unwrap_err();
        assert!(matches!(err, DataDescriptorError::HashMismatch(0)));
        assert!(!descriptor.verified().unwrap().has_piece(0));

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_commit_wrong_length() {
        let (descriptor, dir) = build_descriptor("descriptor_length", vec![("a.bin", 16)], 16);

        let err = descriptor.commit_piece(0, &vec![b'A'; 8]).unwrap_err();
        assert!(matches!(
            err,
            DataDescriptorError::WrongPieceLength { index: 0, .. }
        ));

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_read_unverified_piece_is_an_error() {
        let (descriptor, dir) = build_descriptor("descriptor_unverified", vec![("a.bin", 16)], 16);

        let err = descriptor.read_block(0, 0, 8).unwrap_err();
        assert!(matches!(err, DataDescriptorError::PieceNotVerified(0)));

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_block_out_of_piece_bounds() {
        let (descriptor, dir) = build_descriptor("descriptor_bounds", vec![("a.bin", 16)], 16);

        let err = descriptor.read_block(0, 12, 8).unwrap_err();
        assert!(matches!(err, DataDescriptorError::BlockOutOfBounds { .. }));

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_close_is_idempotent_and_blocks_use() {
        let (descriptor, dir) = build_descriptor("descriptor_close", vec![("a.bin", 16)], 16);

        descriptor.close().unwrap();
        descriptor.close().unwrap();

        let err = descriptor.commit_piece(0, &vec![b'A'; 16]).unwrap_err();
        assert!(matches!(err, DataDescriptorError::Closed));

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_is_complete() {
        let (descriptor, dir) = build_descriptor("descriptor_complete", vec![("a.bin", 32)], 16);

        descriptor.commit_piece(0, &vec![b'A'; 16]).unwrap();
        assert!(!descriptor.is_complete().unwrap());
        descriptor.commit_piece(1, &vec![b'A'; 16]).unwrap();
        assert!(descriptor.is_complete().unwrap());

        fs::remove_dir_all(dir).unwrap();
    }

    // Auxiliary functions

    fn build_descriptor(
        name: &str,
        files: Vec<(&str, u64)>,
        piece_length: u32,
    ) -> (DataDescriptor, PathBuf) {
        let dir = PathBuf::from("./download").join(format!("test_{}", name));
        if dir.exists() {
            fs::remove_dir_all(&dir).unwrap();
        }

        let total: u64 = files.iter().map(|(_, len)| len).sum();
        let pieces = ((total + piece_length as u64 - 1) / piece_length as u64) as u32;

        // Every piece the aux builder describes is 'A'-filled.
        let mut piece_hashes = Vec::new();
        for index in 0..pieces {
            let start = index as u64 * piece_length as u64;
            let end = (start + piece_length as u64).min(total);
            piece_hashes.extend(Sha1::digest(vec![b'A'; (end - start) as usize]));
        }

        let torrent = Torrent::new(
            TorrentId::new([3; 20]),
            "example".to_string(),
            piece_length,
            files
                .into_iter()
                .map(|(path, len)| (PathBuf::from(path), len))
                .collect(),
            piece_hashes,
        )
        .unwrap();

        (
            DataDescriptor::open(torrent, dir.to_str().unwrap()).unwrap(),
            dir,
        )
    }
}

//! Read-only analysis over a dump's memory snapshot.

use crate::dump::{ForensicDump, PAGE_SIZE};
use thiserror::Error;

/// A read that would extend past the end of the memory snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("read of {length} bytes at offset {offset} is out of bounds (memory size {size})")]
pub struct OutOfBounds {
    pub offset: usize,
    pub length: usize,
    pub size: usize,
}

/// Options for [`MemoryAnalyzer::extract_strings`].
#[derive(Debug, Clone, Copy)]
pub struct StringScan {
    /// Runs shorter than this are skipped.
    pub min_length: usize,
    /// Runs longer than this are truncated at the boundary.
    pub max_length: usize,
}

impl Default for StringScan {
    fn default() -> Self {
        Self {
            min_length: 4,
            max_length: 256,
        }
    }
}

/// A printable-ASCII run found in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundString {
    /// Offset of the first byte of the emitted run.
    pub offset: usize,
    pub text: String,
}

/// Memory occupancy statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryStats {
    pub size_bytes: usize,
    pub size_pages: usize,
    pub zero_bytes: usize,
    pub non_zero_bytes: usize,
    /// Fraction of non-zero bytes; zero for an empty snapshot.
    pub utilization: f64,
}

/// Offline inspector for a dump's memory. All operations are read-only.
pub struct MemoryAnalyzer<'a> {
    memory: &'a [u8],
}

impl<'a> MemoryAnalyzer<'a> {
    pub fn new(dump: &'a ForensicDump) -> Self {
        Self {
            memory: &dump.memory,
        }
    }

    /// Byte offsets of every occurrence of `needle`, ascending. Overlapping
    /// matches are reported: after a match at `k`, the search resumes at
    /// `k + 1`. An empty needle yields no matches.
    pub fn find_pattern(&self, needle: &[u8]) -> Vec<usize> {
        if needle.is_empty() || needle.len() > self.memory.len() {
            return Vec::new();
        }
        self.memory
            .windows(needle.len())
            .enumerate()
            .filter(|(_, window)| *window == needle)
            .map(|(offset, _)| offset)
            .collect()
    }

    /// Printable-ASCII runs (`0x20..=0x7E`) at least `min_length` long,
    /// truncated to `max_length`.
    pub fn extract_strings(&self, scan: StringScan) -> Vec<FoundString> {
        let mut found = Vec::new();
        let mut i = 0;
        while i < self.memory.len() {
            if !is_printable(self.memory[i]) {
                i += 1;
                continue;
            }
            let start = i;
            while i < self.memory.len() && is_printable(self.memory[i]) {
                i += 1;
            }
            let run_length = i - start;
            if run_length >= scan.min_length {
                let emitted = run_length.min(scan.max_length);
                let text = self.memory[start..start + emitted]
                    .iter()
                    .map(|&b| b as char)
                    .collect();
                found.push(FoundString {
                    offset: start,
                    text,
                });
            }
        }
        found
    }

    /// Little-endian signed 32-bit read.
    pub fn read_i32(&self, offset: usize) -> Result<i32, OutOfBounds> {
        let bytes = self.read_bytes(offset, 4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Little-endian signed 64-bit read.
    pub fn read_i64(&self, offset: usize) -> Result<i64, OutOfBounds> {
        let bytes = self.read_bytes(offset, 8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(i64::from_le_bytes(raw))
    }

    /// Bounds-checked slice of memory.
    pub fn read_bytes(&self, offset: usize, length: usize) -> Result<&'a [u8], OutOfBounds> {
        let end = offset.checked_add(length).ok_or(OutOfBounds {
            offset,
            length,
            size: self.memory.len(),
        })?;
        if end > self.memory.len() {
            return Err(OutOfBounds {
                offset,
                length,
                size: self.memory.len(),
            });
        }
        Ok(&self.memory[offset..end])
    }

    /// Canonical 16-bytes-per-row hex rendering: 8-hex-digit absolute offset,
    /// two spaces, hex bytes padded to 48 columns, two spaces, ASCII gutter.
    pub fn hex_dump(&self, offset: usize, length: usize) -> Result<String, OutOfBounds> {
        let bytes = self.read_bytes(offset, length)?;
        let rows: Vec<String> = bytes
            .chunks(16)
            .enumerate()
            .map(|(row, chunk)| {
                let hex = chunk
                    .iter()
                    .map(|b| format!("{b:02x}"))
                    .collect::<Vec<_>>()
                    .join(" ");
                let ascii: String = chunk
                    .iter()
                    .map(|&b| if is_printable(b) { b as char } else { '.' })
                    .collect();
                format!("{:08x}  {hex:<48}  {ascii}", offset + row * 16)
            })
            .collect();
        Ok(rows.join("\n"))
    }

    /// Size and occupancy of the snapshot.
    pub fn stats(&self) -> MemoryStats {
        let size_bytes = self.memory.len();
        let zero_bytes = self.memory.iter().filter(|&&b| b == 0).count();
        let non_zero_bytes = size_bytes - zero_bytes;
        let utilization = if size_bytes > 0 {
            non_zero_bytes as f64 / size_bytes as f64
        } else {
            0.0
        };
        MemoryStats {
            size_bytes,
            size_pages: size_bytes / PAGE_SIZE,
            zero_bytes,
            non_zero_bytes,
            utilization,
        }
    }
}

fn is_printable(byte: u8) -> bool {
    (0x20..=0x7E).contains(&byte)
}

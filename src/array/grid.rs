//! Mapping row ranges onto fixed-size chunks

use std::ops::Range;

/// The part of one chunk touched by a row range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSpan {
    pub chunk_index: u64,
    /// Rows within the chunk
    pub chunk_rows: Range<usize>,
    /// Rows within the written block
    pub block_rows: Range<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkGrid {
    rows_per_chunk: u64,
}

impl ChunkGrid {
    pub fn new(rows_per_chunk: u64) -> Self {
        Self {
            rows_per_chunk: rows_per_chunk.max(1),
        }
    }

    pub fn rows_per_chunk(&self) -> u64 {
        self.rows_per_chunk
    }

    /// Number of chunks needed to hold `row_count` rows
    pub fn chunk_count(&self, row_count: u64) -> u64 {
        row_count.div_ceil(self.rows_per_chunk)
    }

    /// Split `rows` at chunk boundaries
    pub fn spans(&self, rows: Range<u64>) -> Vec<ChunkSpan> {
        let mut spans = Vec::new();
        let mut row = rows.start;

        while row < rows.end {
            let chunk_index = row / self.rows_per_chunk;
            let chunk_start = chunk_index * self.rows_per_chunk;
            let end = rows.end.min(chunk_start + self.rows_per_chunk);

            spans.push(ChunkSpan {
                chunk_index,
                chunk_rows: (row - chunk_start) as usize..(end - chunk_start) as usize,
                block_rows: (row - rows.start) as usize..(end - rows.start) as usize,
            });
            row = end;
        }

        spans
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_ranges() {
        let grid = ChunkGrid::new(3000);
        assert_eq!(
            grid.spans(0..3000),
            vec![ChunkSpan {
                chunk_index: 0,
                chunk_rows: 0..3000,
                block_rows: 0..3000,
            }]
        );
        assert_eq!(
            grid.spans(3000..5000),
            vec![ChunkSpan {
                chunk_index: 1,
                chunk_rows: 0..2000,
                block_rows: 0..2000,
            }]
        );
    }

    #[test]
    fn test_range_spanning_three_chunks() {
        let grid = ChunkGrid::new(10);
        let spans = grid.spans(7..25);
        assert_eq!(
            spans,
            vec![
                ChunkSpan {
                    chunk_index: 0,
                    chunk_rows: 7..10,
                    block_rows: 0..3,
                },
                ChunkSpan {
                    chunk_index: 1,
                    chunk_rows: 0..10,
                    block_rows: 3..13,
                },
                ChunkSpan {
                    chunk_index: 2,
                    chunk_rows: 0..5,
                    block_rows: 13..18,
                },
            ]
        );
    }

    #[test]
    fn test_empty_range_has_no_spans() {
        assert!(ChunkGrid::new(10).spans(5..5).is_empty());
    }

    #[test]
    fn test_chunk_count() {
        let grid = ChunkGrid::new(3000);
        assert_eq!(grid.chunk_count(0), 0);
        assert_eq!(grid.chunk_count(3000), 1);
        assert_eq!(grid.chunk_count(5000), 2);
    }
}

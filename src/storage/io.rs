use std::ops::Range;

use super::error::StorageError;
use super::writer::PieceWriter;
use crate::torrent::TorrentFile;

/// A slice of a torrent-global byte range that falls inside one file.
struct FileSpan<'a> {
    file: &'a TorrentFile,
    file_offset: u64,
    buf_range: Range<usize>,
}

fn spans(files: &[TorrentFile], offset: u64, length: usize) -> Result<Vec<FileSpan<'_>>, StorageError> {
    let size = files.iter().map(|f| f.offset + f.length).max().unwrap_or(0);
    let end = offset
        .checked_add(length as u64)
        .filter(|end| *end <= size)
        .ok_or(StorageError::OutOfBounds {
            offset,
            length,
            size,
        })?;

    let mut spans = Vec::new();
    for file in files.iter().filter(|f| f.length > 0) {
        let range = file.byte_range();
        let start = offset.max(range.start);
        let stop = end.min(range.end);
        if start >= stop {
            continue;
        }
        let buf_start = (start - offset) as usize;
        spans.push(FileSpan {
            file,
            file_offset: start - range.start,
            buf_range: buf_start..buf_start + (stop - start) as usize,
        });
    }
    Ok(spans)
}

/// Fills `buf` from the torrent's data starting at global `offset`.
pub fn read_block(
    writer: &dyn PieceWriter,
    files: &[TorrentFile],
    offset: u64,
    buf: &mut [u8],
) -> Result<(), StorageError> {
    for span in spans(files, offset, buf.len())? {
        writer.read(span.file, span.file_offset, &mut buf[span.buf_range])?;
    }
    Ok(())
}

/// Writes `data` into the torrent's files starting at global `offset`.
pub fn write_block(
    writer: &dyn PieceWriter,
    files: &[TorrentFile],
    offset: u64,
    data: &[u8],
) -> Result<(), StorageError> {
    for span in spans(files, offset, data.len())? {
        writer.write(span.file, span.file_offset, &data[span.buf_range])?;
    }
    Ok(())
}

use std::path::PathBuf;

/// Download priority of a file, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    DoNotDownload,
    Low,
    #[default]
    Normal,
    High,
    Immediate,
}

impl Priority {
    /// Tiers that take part in picking, highest first.
    pub const DOWNLOAD_ORDER: [Priority; 4] = [
        Priority::Immediate,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];
}

/// One file of a torrent and the pieces it overlaps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    pub path: PathBuf,
    pub length: u64,
    /// Offset of the first byte within the torrent's concatenated data.
    pub offset: u64,
    pub start_piece: u32,
    /// Last piece overlapping the file, inclusive.
    pub end_piece: u32,
    pub priority: Priority,
}

impl TorrentFile {
    /// Lays `files` out back to back and works out their piece ranges.
    pub fn layout(piece_length: u32, files: impl IntoIterator<Item = (PathBuf, u64)>) -> Vec<Self> {
        let piece_length = u64::from(piece_length.max(1));
        let mut offset = 0u64;
        files
            .into_iter()
            .map(|(path, length)| {
                let start_piece = (offset / piece_length) as u32;
                let end_piece = if length == 0 {
                    start_piece
                } else {
                    ((offset + length - 1) / piece_length) as u32
                };
                let file = Self {
                    path,
                    length,
                    offset,
                    start_piece,
                    end_piece,
                    priority: Priority::Normal,
                };
                offset += length;
                file
            })
            .collect()
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Byte range of the file within the torrent.
    pub fn byte_range(&self) -> std::ops::Range<u64> {
        self.offset..self.offset + self.length
    }
}

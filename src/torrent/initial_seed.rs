use crate::bitfield::Bitfield;

/// Bookkeeping for initial seeding.
///
/// Each peer is shown a few pieces it lacks, preferring pieces that nobody
/// has announced yet and then those revealed to the fewest peers. A piece is
/// distributed once any peer announces it. When every piece is distributed
/// the torrent can seed normally.
#[derive(Debug, Clone)]
pub struct InitialSeed {
    /// Connected peers each piece is currently revealed to.
    revealed: Vec<u32>,
    distributed: Bitfield,
}

impl InitialSeed {
    pub fn new(piece_count: usize) -> Self {
        Self {
            revealed: vec![0; piece_count],
            distributed: Bitfield::new(piece_count),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.distributed.all_true()
    }

    pub fn is_distributed(&self, index: u32) -> bool {
        self.distributed.get(index as usize)
    }

    /// Marks every piece `remote` announces as distributed.
    pub fn record(&mut self, remote: &Bitfield) {
        if remote.len() == self.distributed.len() {
            self.distributed.or(remote);
        }
    }

    /// Chooses another piece to reveal to a peer holding `remote` that has
    /// already been shown `offered`.
    pub fn next_offer(&mut self, remote: &Bitfield, offered: &[u32]) -> Option<u32> {
        let piece = (0..self.revealed.len())
            .filter(|&i| !remote.get(i) && !offered.contains(&(i as u32)))
            .min_by_key(|&i| (self.distributed.get(i), self.revealed[i], i))?;
        self.revealed[piece] += 1;
        Some(piece as u32)
    }

    /// Forgets that `pieces` were revealed to one peer.
    pub fn release(&mut self, pieces: &[u32]) {
        for &piece in pieces {
            if let Some(count) = self.revealed.get_mut(piece as usize) {
                *count = count.saturating_sub(1);
            }
        }
    }

    pub fn revealed(&self, index: u32) -> u32 {
        self.revealed.get(index as usize).copied().unwrap_or(0)
    }
}

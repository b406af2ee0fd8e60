use crate::peer::ConnectionId;

/// What the unchoker looks at for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChokeCandidate {
    pub id: ConnectionId,
    pub interested: bool,
    pub am_choking: bool,
    pub downloaded: u64,
    pub uploaded: u64,
}

/// Decides who to choke and unchoke with `slots` upload slots.
///
/// Interested peers are ranked by what they gave us while downloading, or
/// by what we sent them while seeding. Only changes are returned, as
/// `(id, unchoke)`.
pub fn unchoke_decisions(
    candidates: &[ChokeCandidate],
    slots: usize,
    seeding: bool,
) -> Vec<(ConnectionId, bool)> {
    let mut ranked: Vec<&ChokeCandidate> = candidates.iter().filter(|c| c.interested).collect();
    ranked.sort_by(|a, b| {
        let key = |c: &ChokeCandidate| if seeding { c.uploaded } else { c.downloaded };
        key(b).cmp(&key(a)).then(a.id.cmp(&b.id))
    });
    let unchoked: Vec<ConnectionId> = ranked.iter().take(slots).map(|c| c.id).collect();

    candidates
        .iter()
        .filter_map(|c| {
            let unchoke = unchoked.contains(&c.id);
            (unchoke == c.am_choking).then_some((c.id, unchoke))
        })
        .collect()
}

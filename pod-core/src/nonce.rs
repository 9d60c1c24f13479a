use serde::{Deserialize, Serialize};

/// Rolling nonce generator kept in lockstep with the pod.
///
/// The pod authenticates delivery-affecting commands with a 32-bit nonce
/// drawn from a pseudo-random table seeded by the pod's lot and TID. Both
/// sides run the same generator, so their nonces agree as long as every
/// command is received exactly once. When they diverge the pod rejects
/// the command with a sync word, and the whole table is rebuilt from a
/// seed derived from that word (see
/// [`PodState::resync_nonce`](crate::PodState::resync_nonce)).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceState {
    table: [u32; 18],
    idx: u8,
}

impl NonceState {
    /// Builds the table for a pod identity. `seed` is zero for the initial
    /// pairing table and the negotiated value after a resync.
    pub fn new(lot: u32, tid: u32, seed: u16) -> Self {
        let mut state = NonceState {
            table: [0; 18],
            idx: 0,
        };
        state.table[0] = (lot & 0xFFFF)
            .wrapping_add(lot >> 16)
            .wrapping_add(0x5554_3DC3)
            .wrapping_add(u32::from(seed & 0x00FF));
        state.table[1] = (tid & 0xFFFF)
            .wrapping_add(tid >> 16)
            .wrapping_add(0xAAAA_E44E)
            .wrapping_add(u32::from(seed >> 8));
        for slot in 2..18 {
            state.table[slot] = state.generate_entry();
        }
        state.idx = (state.table[0].wrapping_add(state.table[1]) & 0x0F) as u8;
        state
    }

    fn generate_entry(&mut self) -> u32 {
        self.table[0] =
            (self.table[0] >> 16).wrapping_add((self.table[0] & 0xFFFF).wrapping_mul(0x5D7F));
        self.table[1] =
            (self.table[1] >> 16).wrapping_add((self.table[1] & 0xFFFF).wrapping_mul(0x8CA0));
        self.table[1].wrapping_add((self.table[0] & 0xFFFF) << 16)
    }

    /// The nonce the next authenticated command must carry.
    pub fn current_nonce(&self) -> u32 {
        self.table[2 + self.idx as usize]
    }

    /// Consumes the current nonce: regenerates its slot and rotates the
    /// index to the consumed value's low nibble.
    pub fn advance_to_next_nonce(&mut self) {
        let nonce = self.current_nonce();
        let slot = 2 + self.idx as usize;
        self.table[slot] = self.generate_entry();
        self.idx = (nonce & 0x0F) as u8;
    }

    /// The rotating index must address one of the sixteen nonce slots.
    pub(crate) fn index_in_range(&self) -> bool {
        self.idx < 16
    }
}

//! Protocol-rules resolution for replayed transactions.
//!
//! Fork activation is data, not behaviour: every supported network is one
//! [`ForkSchedule`] row, and [`resolve`] turns a chain id into the
//! [`ChainRules`] object handed to the execution engine. The recorded corpus
//! originates from the Opera network, whose schedule follows the Ethash
//! ladder with every fork up to Istanbul live from genesis and chain-local
//! heights for Berlin and London.

/// Chain id of the Opera mainnet, the default replay target.
pub const OPERA_CHAIN_ID: u64 = 250;

/// Berlin activation height on Opera.
const OPERA_BERLIN_BLOCK: u64 = 37_455_223;

/// London activation height on Opera.
const OPERA_LONDON_BLOCK: u64 = 37_534_833;

/// Fork activation heights of one network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkSchedule {
    pub berlin_block: u64,
    pub london_block: u64,
}

const OPERA_SCHEDULE: ForkSchedule = ForkSchedule {
    berlin_block: OPERA_BERLIN_BLOCK,
    london_block: OPERA_LONDON_BLOCK,
};

/// Known networks. Unknown chain ids fall back to the Opera schedule, which
/// is what the recorded corpus was produced under.
const SCHEDULES: &[(u64, ForkSchedule)] = &[(OPERA_CHAIN_ID, OPERA_SCHEDULE)];

/// Protocol rules in effect for one replay.
///
/// Pre-Istanbul forks are live from genesis (the Ethash-compatible default);
/// only the Berlin and London heights vary per network. Base-fee burning is
/// never enforced: recordings carry their base fee verbatim and originate
/// from a chain that does not burn it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainRules {
    pub chain_id: u64,
    pub berlin_block: u64,
    pub london_block: u64,
    pub no_base_fee: bool,
}

impl ChainRules {
    /// EIP-158/161 empty-account pruning. Live from genesis.
    pub fn is_eip158(&self, _block: u64) -> bool {
        true
    }

    /// Byzantium rules. Live from genesis.
    pub fn is_byzantium(&self, _block: u64) -> bool {
        true
    }

    /// Istanbul rules. Live from genesis.
    pub fn is_istanbul(&self, _block: u64) -> bool {
        true
    }

    pub fn is_berlin(&self, block: u64) -> bool {
        block >= self.berlin_block
    }

    pub fn is_london(&self, block: u64) -> bool {
        block >= self.london_block
    }
}

/// Produces the protocol rules for the given chain id.
pub fn resolve(chain_id: u64) -> ChainRules {
    let schedule = SCHEDULES
        .iter()
        .find(|(id, _)| *id == chain_id)
        .map(|(_, schedule)| *schedule)
        .unwrap_or(OPERA_SCHEDULE);

    ChainRules {
        chain_id,
        berlin_block: schedule.berlin_block,
        london_block: schedule.london_block,
        no_base_fee: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_keeps_chain_id() {
        assert_eq!(resolve(OPERA_CHAIN_ID).chain_id, OPERA_CHAIN_ID);
        assert_eq!(resolve(4002).chain_id, 4002);
    }

    #[test]
    fn unknown_chain_falls_back_to_opera_schedule() {
        let rules = resolve(98765);
        assert_eq!(rules.berlin_block, OPERA_BERLIN_BLOCK);
        assert_eq!(rules.london_block, OPERA_LONDON_BLOCK);
        assert!(rules.no_base_fee);
    }

    #[test]
    fn fork_boundaries() {
        let rules = resolve(OPERA_CHAIN_ID);

        assert!(rules.is_byzantium(0));
        assert!(rules.is_eip158(0));
        assert!(rules.is_istanbul(0));

        assert!(!rules.is_berlin(OPERA_BERLIN_BLOCK - 1));
        assert!(rules.is_berlin(OPERA_BERLIN_BLOCK));

        assert!(!rules.is_london(OPERA_LONDON_BLOCK - 1));
        assert!(rules.is_london(OPERA_LONDON_BLOCK));
        assert!(rules.is_berlin(OPERA_LONDON_BLOCK));
    }
}

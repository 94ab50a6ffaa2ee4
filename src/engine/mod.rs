//! Core engine: lifecycle, ledger, settlement and the outbound queue.

pub mod ledger;
pub mod lifecycle;
pub mod queue;
pub mod settlement;

use crate::config::BettingConfig;
use crate::platform::Announcer;
use crate::storage::Store;

use self::ledger::BetLedger;
use self::lifecycle::LifecycleManager;
use self::settlement::SettlementEngine;

/// The three engine components wired over one store and one announcer.
#[derive(Clone)]
pub struct Engine {
    pub ledger: BetLedger,
    pub lifecycle: LifecycleManager,
    pub settlement: SettlementEngine,
    announcer: Announcer,
}

impl Engine {
    pub fn new(store: Store, announcer: Announcer, betting: &BettingConfig) -> Self {
        let ledger = BetLedger::new(store.clone(), betting.suspicious_amount);
        let lifecycle = LifecycleManager::new(store.clone(), ledger.clone(), announcer.clone());
        let settlement = SettlementEngine::new(
            store,
            ledger.clone(),
            announcer.clone(),
            betting.payout_expiry_days,
        );
        Self {
            ledger,
            lifecycle,
            settlement,
            announcer,
        }
    }

    pub fn announcer(&self) -> &Announcer {
        &self.announcer
    }
}

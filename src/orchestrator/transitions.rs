//! State transition table

use crate::types::{FlashPlan, FlashState, StageOutcome};

/// State that follows `from` when its stage finished with `outcome`
pub fn next_state(from: FlashState, outcome: StageOutcome) -> FlashState {
    use FlashState::*;

    match (from, outcome) {
        (Idle, _) => Connecting,
        (Connecting, _) => Unlocking,
        (Unlocking, _) => KeyProvisioning,
        (KeyProvisioning, _) => Imaging,
        (Imaging, StageOutcome::Continue) => Locking,
        (Imaging, StageOutcome::SkipLocking) => Done,
        (Locking, _) => Done,
        (Done, _) => Done,
        (Aborted, _) => Aborted,
    }
}

/// Whether the stage for `state` runs under `plan`
pub fn stage_enabled(state: FlashState, plan: &FlashPlan) -> bool {
    match state {
        FlashState::Connecting => true,
        FlashState::Unlocking => plan.unlock,
        FlashState::KeyProvisioning => plan.flash_key,
        FlashState::Imaging => plan.flash_zip,
        FlashState::Locking => plan.lock,
        FlashState::Idle | FlashState::Done | FlashState::Aborted => false,
    }
}

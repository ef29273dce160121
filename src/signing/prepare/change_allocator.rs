//! Change allocation
//!
//! Chooses funding inputs and sizes the change output so that
//! `inputs == outputs + fee` exactly. The allocator is pure: given the same
//! request and candidate order it always returns the same allocation, which
//! keeps funding reproducible in tests.

use crate::{
    errors::{WalletError, WalletResult},
    fee_model::FeeModel,
};

/// An existing output that funding may consume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundingCandidate {
    pub output_id: u32,
    pub satoshis: u64,
    pub unlocking_script_length: usize,
}

/// Everything the allocator needs to know about the transaction so far
#[derive(Debug, Clone)]
pub struct FundingRequest {
    pub fee_model: FeeModel,
    /// Explicit inputs: total value and unlocking script lengths
    pub input_satoshis: u64,
    pub input_unlocking_lengths: Vec<usize>,
    /// Fixed output amounts, including commission
    pub output_satoshis: u64,
    /// Locking script lengths of every output except change, including a max-possible output
    pub output_locking_lengths: Vec<usize>,
    /// Whether one output takes whatever remains
    pub has_max_output: bool,
    pub change_locking_length: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeAllocation {
    /// Candidates consumed, in the order they become inputs
    pub selected: Vec<FundingCandidate>,
    /// Amount of the single change output, if one is created
    pub change: Option<u64>,
    pub fee: u64,
    /// Resolved amount of the max-possible output
    pub max_output_satoshis: Option<u64>,
}

impl ChangeAllocation {
    pub fn selected_satoshis(&self) -> u64 {
        self.selected.iter().map(|c| c.satoshis).sum()
    }
}

/// Order basket candidates smallest first, ties broken by ID
pub fn sort_candidates(candidates: &mut [FundingCandidate]) {
    candidates.sort_by(|a, b| {
        a.satoshis
            .cmp(&b.satoshis)
            .then_with(|| a.output_id.cmp(&b.output_id))
    });
}

struct Tally<'a> {
    request: &'a FundingRequest,
    selected: Vec<FundingCandidate>,
    total_in: u64,
    unlocking_lengths: Vec<usize>,
}

impl<'a> Tally<'a> {
    fn new(request: &'a FundingRequest) -> Self {
        Self {
            request,
            selected: Vec::new(),
            total_in: request.input_satoshis,
            unlocking_lengths: request.input_unlocking_lengths.clone(),
        }
    }

    fn take(&mut self, candidate: FundingCandidate) {
        self.total_in += candidate.satoshis;
        self.unlocking_lengths.push(candidate.unlocking_script_length);
        self.selected.push(candidate);
    }

    fn fee(&self, with_change: bool) -> u64 {
        let mut locking = self.request.output_locking_lengths.clone();
        if with_change {
            locking.push(self.request.change_locking_length);
        }
        self.request.fee_model.fee_for(&self.unlocking_lengths, &locking)
    }

    fn required(&self) -> u64 {
        self.request.output_satoshis + self.fee(false)
    }
}

/// Allocate funding.
///
/// `no_send_change` is always consumed in full. `basket` is consumed in the
/// given order (see [`sort_candidates`]) until the inputs cover outputs plus
/// fee. An excess large enough to pay for its own output becomes one change
/// output; a smaller excess is left to the miner. With a max-possible output
/// the whole basket is consumed and the remainder goes to that output.
pub fn allocate_change(
    request: &FundingRequest,
    no_send_change: Vec<FundingCandidate>,
    basket: Vec<FundingCandidate>,
) -> WalletResult<ChangeAllocation> {
    let mut tally = Tally::new(request);
    for candidate in no_send_change {
        tally.take(candidate);
    }

    if request.has_max_output {
        for candidate in basket {
            tally.take(candidate);
        }
        let required = tally.required();
        if tally.total_in < required {
            return Err(insufficient(required, tally.total_in));
        }
        let fee = tally.fee(false);
        let leftover = tally.total_in - request.output_satoshis - fee;
        return Ok(ChangeAllocation {
            selected: tally.selected,
            change: None,
            fee,
            max_output_satoshis: Some(leftover),
        });
    }

    let mut pool = basket.into_iter();
    loop {
        let required = tally.required();
        if tally.total_in >= required {
            break;
        }
        match pool.next() {
            Some(candidate) => tally.take(candidate),
            None => return Err(insufficient(required, tally.total_in)),
        }
    }

    let fee_with_change = tally.fee(true);
    let (change, fee) = if tally.total_in > request.output_satoshis + fee_with_change {
        (
            Some(tally.total_in - request.output_satoshis - fee_with_change),
            fee_with_change,
        )
    } else {
        (None, tally.total_in - request.output_satoshis)
    };

    Ok(ChangeAllocation {
        selected: tally.selected,
        change,
        fee,
        max_output_satoshis: None,
    })
}

fn insufficient(required: u64, available: u64) -> WalletError {
    WalletError::InsufficientFunds {
        shortfall: required - available,
        message: format!("Not enough funds. Available: {available}, required: {required}"),
    }
}

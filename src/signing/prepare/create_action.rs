//! Action builder
//!
//! Turns a spend request into a funded, persisted action. Checks against
//! stored state run before the action record exists. Once it exists, any
//! failure releases the action's locks and marks it failed, so nothing is
//! left `Unfunded` with outputs held.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rand::{rngs::OsRng, Rng, RngCore};
use secp256k1::{Scalar, Secp256k1};
use tracing::{debug, error, info, warn};

use crate::{
    beef::Beef,
    config::ActionEngineConfig,
    data_structures::{
        ActionStatus, InputSource, Outpoint, OutputOrigin, ProvidedBy, Script, Transaction, Txid,
        DEFAULT_SEQUENCE,
    },
    errors::{KeyManagementError, WalletError, WalletResult},
    fee_model::{FeeModel, P2PKH_LOCKING_SCRIPT_LENGTH, P2PKH_UNLOCKING_SCRIPT_LENGTH},
    key_management::{KeyDerivation, SigningKeyProvider},
    signing::{
        models::{
            transaction_metadata::TransactionMetadata,
            types::{get_supported_version, ActionInputInfo, ActionOutputInfo, CreateActionResult},
        },
        prepare::change_allocator::{
            allocate_change, sort_candidates, ChangeAllocation, FundingCandidate, FundingRequest,
        },
        templates::p2pkh,
    },
    storage::{
        FundingCommit, OutputStatus, StoredAction, StoredBasket, StoredInput, StoredOutput,
        WalletStorage,
    },
    validation::{
        validate_create_action_args, CreateActionArgs, CreateActionInput, OutputAmount,
        ValidCreateActionArgs,
    },
};

/// Random bytes in an action reference
const REFERENCE_BYTES: usize = 12;
/// Random bytes in the per-action derivation prefix of change outputs
const DERIVATION_PREFIX_BYTES: usize = 10;
/// Random bytes in the per-output derivation suffix of change outputs
const DERIVATION_SUFFIX_BYTES: usize = 8;

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Explicit input after checking it against its source transaction and storage
#[derive(Debug, Clone)]
struct ResolvedInput {
    outpoint: Outpoint,
    satoshis: u64,
    locking_script: Script,
    unlocking_script: Option<Script>,
    unlocking_script_length: usize,
    sequence: u32,
    description: String,
    source: InputSource,
}

/// Output known before funding; change is added later
#[derive(Debug, Clone)]
struct PlannedOutput {
    satoshis: OutputAmount,
    locking_script: Script,
    basket: Option<String>,
    tags: Vec<String>,
    description: Option<String>,
    custom_instructions: Option<String>,
    origin: OutputOrigin,
}

/// Stored output chosen or listed for funding
#[derive(Debug, Clone)]
struct FundingOutput {
    output: StoredOutput,
    output_id: u32,
    outpoint: Outpoint,
    derivation: KeyDerivation,
}

impl FundingOutput {
    fn candidate(&self) -> FundingCandidate {
        FundingCandidate {
            output_id: self.output_id,
            satoshis: self.output.satoshis,
            unlocking_script_length: P2PKH_UNLOCKING_SCRIPT_LENGTH,
        }
    }
}

/// Builds and funds actions
pub struct ActionBuilder {
    storage: Arc<dyn WalletStorage>,
    keys: Arc<dyn SigningKeyProvider>,
    config: ActionEngineConfig,
}

impl ActionBuilder {
    pub fn new(
        storage: Arc<dyn WalletStorage>,
        keys: Arc<dyn SigningKeyProvider>,
        config: ActionEngineConfig,
    ) -> Self {
        Self {
            storage,
            keys,
            config,
        }
    }

    pub async fn create_action(&self, args: CreateActionArgs) -> WalletResult<CreateActionResult> {
        self.config.validate()?;
        let valid = validate_create_action_args(args, &self.config.change_basket)?;

        let inputs = self.validate_required_inputs(&valid).await?;
        let outputs = self.validate_required_outputs(&valid)?;
        let change_basket = self.storage.find_basket(&self.config.change_basket).await?;
        let change_basket_id = change_basket.and_then(|b| b.id);
        let no_send_change = self
            .validate_no_send_change(&valid.args.options.no_send_change, change_basket_id)
            .await?;
        let basket_candidates = match change_basket_id {
            Some(basket_id) => self.count_available_change(basket_id, &inputs).await?,
            None => Vec::new(),
        };
        let fee_model = valid.args.options.fee_model.unwrap_or(self.config.fee_model);

        let reference = random_hex(REFERENCE_BYTES);
        let action = StoredAction::new_unfunded(
            reference.clone(),
            valid.args.description.clone(),
            valid.args.options.version,
            valid.args.options.lock_time,
            fee_model,
            valid.args.options.no_send,
            valid.args.labels.clone(),
        );
        let action_id = self.storage.insert_action(&action).await?;
        info!(
            target: "wallet::create_action",
            action_id,
            reference = %reference,
            inputs = inputs.len(),
            outputs = outputs.len(),
            "Created unfunded action"
        );
        self.record_event(action_id, "created", &reference).await;

        let plan = FundingPlan {
            action_id,
            reference,
            valid,
            inputs,
            outputs,
            change_basket_id,
            no_send_change,
            basket_candidates,
            fee_model,
        };
        match self.fund(plan).await {
            Ok(result) => {
                self.record_event(action_id, "funded", &result.metadata.fee.to_string())
                    .await;
                Ok(result)
            }
            Err(e) => {
                warn!(
                    target: "wallet::create_action",
                    action_id,
                    error = %e,
                    "Funding failed, rolling back action"
                );
                if let Err(rollback) = self.storage.fail_action(action_id).await {
                    error!(
                        target: "wallet::create_action",
                        action_id,
                        error = %rollback,
                        "Rollback of failed action did not complete"
                    );
                }
                self.record_event(action_id, "failed", e.kind()).await;
                Err(e)
            }
        }
    }

    async fn record_event(&self, action_id: u32, event_type: &str, data: &str) {
        if let Err(e) = self
            .storage
            .store_simple_event(action_id, event_type, data)
            .await
        {
            warn!(target: "wallet::create_action", action_id, error = %e, "Failed to store event");
        }
    }

    async fn source_transaction(
        &self,
        input_beef: Option<&Beef>,
        txid: &Txid,
    ) -> WalletResult<Option<Transaction>> {
        if let Some(beef) = input_beef {
            if let Some(tx) = beef.find_transaction(txid)? {
                return Ok(Some(tx));
            }
        }
        match self.storage.get_source_transaction(txid).await? {
            Some(stored) => Ok(Some(Transaction::from_bytes(&stored.raw_tx)?)),
            None => Ok(None),
        }
    }

    async fn validate_required_inputs(
        &self,
        valid: &ValidCreateActionArgs,
    ) -> WalletResult<Vec<ResolvedInput>> {
        let mut resolved = Vec::with_capacity(valid.args.inputs.len());
        for (index, input) in valid.args.inputs.iter().enumerate() {
            let length = valid.unlocking_script_lengths[index];
            resolved.push(
                self.validate_required_input(valid.args.input_beef.as_ref(), input, length)
                    .await?,
            );
        }
        Ok(resolved)
    }

    async fn validate_required_input(
        &self,
        input_beef: Option<&Beef>,
        input: &CreateActionInput,
        unlocking_script_length: usize,
    ) -> WalletResult<ResolvedInput> {
        let outpoint = input.outpoint;
        let stored = self.storage.get_output_by_outpoint(&outpoint).await?;
        if let Some(stored) = &stored {
            if !stored.is_unspent() {
                return Err(WalletError::ValidationError(format!(
                    "Input {outpoint} is already spent"
                )));
            }
            if let Some(owner) = stored.locked_by_action {
                return Err(WalletError::ConflictError(format!(
                    "Input {outpoint} is in use by action {owner}"
                )));
            }
        }
        if let Some(owner) = self.storage.find_spending_action(&outpoint).await? {
            return Err(WalletError::ConflictError(format!(
                "Input {outpoint} is already spent by action {owner}"
            )));
        }

        let source_tx = self
            .source_transaction(input_beef, &outpoint.txid)
            .await?
            .ok_or_else(|| {
                WalletError::ValidationError(format!(
                    "Input {outpoint} is unknown and no source transaction was provided"
                ))
            })?;
        let source_output = source_tx
            .outputs
            .get(outpoint.vout as usize)
            .ok_or_else(|| {
                WalletError::ValidationError(format!(
                    "Source transaction {} has no output {}",
                    outpoint.txid, outpoint.vout
                ))
            })?;
        source_output.locking_script.chunks().map_err(|e| {
            WalletError::ValidationError(format!(
                "Input {outpoint} has an unparseable locking script: {e}"
            ))
        })?;
        if let Some(stored) = &stored {
            if stored.satoshis != source_output.satoshis
                || stored.locking_script != source_output.locking_script
            {
                return Err(WalletError::ValidationError(format!(
                    "Input {outpoint} does not match the output recorded in storage"
                )));
            }
        }

        let output_id = stored.as_ref().and_then(|o| o.id);
        let source = match (&input.derivation, &input.unlocking_script) {
            (Some(derivation), None) => {
                let output_id = output_id.ok_or_else(|| {
                    WalletError::ValidationError(format!(
                        "Input {outpoint} is declared wallet-owned but is not tracked in storage"
                    ))
                })?;
                self.check_derived_script(&outpoint, &source_output.locking_script, derivation)
                    .await?;
                InputSource::Me {
                    output_id,
                    derivation: derivation.clone(),
                }
            }
            _ => InputSource::You { output_id },
        };

        Ok(ResolvedInput {
            outpoint,
            satoshis: source_output.satoshis,
            locking_script: source_output.locking_script.clone(),
            unlocking_script: input.unlocking_script.clone(),
            unlocking_script_length,
            sequence: input.sequence(),
            description: input.input_description.clone(),
            source,
        })
    }

    /// A P2PKH script must be locked to the key at `derivation`
    async fn check_derived_script(
        &self,
        outpoint: &Outpoint,
        locking_script: &Script,
        derivation: &KeyDerivation,
    ) -> WalletResult<()> {
        if let Some(hash) = locking_script.p2pkh_hash() {
            let public_key = self.keys.public_key(derivation).await?;
            if p2pkh::hash160(&public_key.serialize()) != hash {
                return Err(WalletError::ValidationError(format!(
                    "Output {outpoint} is not locked to the key at '{}'",
                    derivation.invoice()
                )));
            }
        }
        Ok(())
    }

    fn validate_required_outputs(
        &self,
        valid: &ValidCreateActionArgs,
    ) -> WalletResult<Vec<PlannedOutput>> {
        let mut planned: Vec<PlannedOutput> = valid
            .args
            .outputs
            .iter()
            .map(|o| PlannedOutput {
                satoshis: o.satoshis,
                locking_script: o.locking_script.clone(),
                basket: o.basket.clone(),
                tags: o.tags.clone(),
                description: Some(o.output_description.clone()),
                custom_instructions: o.custom_instructions.clone(),
                origin: OutputOrigin::Caller,
            })
            .collect();

        if let Some(commission) = &self.config.commission {
            let mut offset = [0u8; 32];
            OsRng.fill_bytes(&mut offset);
            let tweak = Scalar::from_be_bytes(offset).map_err(|_| {
                KeyManagementError::DerivationFailed("commission key offset out of range".into())
            })?;
            let key = commission
                .public_key()?
                .add_exp_tweak(&Secp256k1::verification_only(), &tweak)
                .map_err(|e| KeyManagementError::DerivationFailed(e.to_string()))?;
            planned.push(PlannedOutput {
                satoshis: OutputAmount::Fixed(commission.satoshis),
                locking_script: p2pkh::lock(&key),
                basket: None,
                tags: Vec::new(),
                description: Some("Storage commission".to_string()),
                custom_instructions: None,
                origin: OutputOrigin::Commission {
                    key_offset: hex::encode(offset),
                },
            });
        }
        Ok(planned)
    }

    fn funding_output(output: StoredOutput) -> Option<FundingOutput> {
        let output_id = output.id?;
        let outpoint = output.outpoint()?;
        let derivation = output.origin.derivation()?.clone();
        Some(FundingOutput {
            output,
            output_id,
            outpoint,
            derivation,
        })
    }

    async fn validate_no_send_change(
        &self,
        listed: &[Outpoint],
        change_basket_id: Option<u32>,
    ) -> WalletResult<Vec<FundingOutput>> {
        if listed.is_empty() {
            return Ok(Vec::new());
        }
        let basket_id = change_basket_id.ok_or_else(|| {
            WalletError::ConfigurationError(format!(
                "Change basket '{}' does not exist",
                self.config.change_basket
            ))
        })?;

        let mut change = Vec::with_capacity(listed.len());
        for outpoint in listed {
            let not_valid = |reason: &str| {
                WalletError::ValidationError(format!(
                    "No-send change outpoint {outpoint} {reason}"
                ))
            };
            let output = self
                .storage
                .get_output_by_outpoint(outpoint)
                .await?
                .ok_or_else(|| not_valid("does not exist"))?;
            if !output.is_unspent() || output.locked_by_action.is_some() {
                return Err(not_valid("is spent or in use"));
            }
            if output.basket_id != Some(basket_id) || !output.origin.is_change() {
                return Err(not_valid("is not change in the change basket"));
            }
            let creator = match output.action_id {
                Some(id) => self.storage.get_action(id).await?,
                None => None,
            };
            match creator {
                Some(action)
                    if action.no_send
                        && matches!(
                            action.status,
                            ActionStatus::Signed | ActionStatus::Finalized
                        ) => {}
                _ => return Err(not_valid("was not created by a signed no-send action")),
            }
            let funding = Self::funding_output(output)
                .ok_or_else(|| not_valid("has no key derivation"))?;
            self.check_derived_script(outpoint, &funding.output.locking_script, &funding.derivation)
                .await
                .map_err(|_| not_valid("does not match its recorded key"))?;
            change.push(funding);
        }
        Ok(change)
    }

    async fn count_available_change(
        &self,
        basket_id: u32,
        explicit: &[ResolvedInput],
    ) -> WalletResult<Vec<FundingOutput>> {
        let excluded: HashSet<Outpoint> = explicit.iter().map(|i| i.outpoint).collect();
        let mut available: Vec<FundingOutput> = self
            .storage
            .get_spendable_change(basket_id)
            .await?
            .into_iter()
            .filter(|o| o.is_selectable())
            .filter_map(Self::funding_output)
            .filter(|o| !excluded.contains(&o.outpoint))
            .collect();
        available.sort_by(|a, b| {
            a.output
                .satoshis
                .cmp(&b.output.satoshis)
                .then_with(|| a.output_id.cmp(&b.output_id))
        });
        debug!(
            target: "wallet::create_action",
            basket_id,
            available = available.len(),
            "Counted available change"
        );
        Ok(available)
    }

    async fn ensure_basket(&self, name: &str) -> WalletResult<u32> {
        if let Some(basket) = self.storage.find_basket(name).await? {
            if let Some(id) = basket.id {
                return Ok(id);
            }
        }
        self.storage.save_basket(&StoredBasket::new(name)).await
    }

    async fn fund(&self, plan: FundingPlan) -> WalletResult<CreateActionResult> {
        let action_id = plan.action_id;

        let mut locked_ids: Vec<u32> = plan
            .inputs
            .iter()
            .filter_map(|i| i.source.output_id())
            .chain(plan.no_send_change.iter().map(|c| c.output_id))
            .collect();
        if !locked_ids.is_empty() {
            self.storage.lock_outputs(action_id, &locked_ids).await?;
        }

        let request = FundingRequest {
            fee_model: plan.fee_model,
            input_satoshis: plan.inputs.iter().map(|i| i.satoshis).sum(),
            input_unlocking_lengths: plan
                .inputs
                .iter()
                .map(|i| i.unlocking_script_length)
                .collect(),
            output_satoshis: plan.valid.fixed_output_satoshis()
                + plan
                    .outputs
                    .iter()
                    .filter(|o| !matches!(o.origin, OutputOrigin::Caller))
                    .map(|o| match o.satoshis {
                        OutputAmount::Fixed(sats) => sats,
                        OutputAmount::MaxPossible => 0,
                    })
                    .sum::<u64>(),
            output_locking_lengths: plan.outputs.iter().map(|o| o.locking_script.len()).collect(),
            has_max_output: plan.valid.max_output_index.is_some(),
            change_locking_length: P2PKH_LOCKING_SCRIPT_LENGTH,
        };
        let no_send_candidates: Vec<FundingCandidate> =
            plan.no_send_change.iter().map(|c| c.candidate()).collect();

        let (allocation, selected) = self
            .allocate_and_lock(&plan, &request, no_send_candidates)
            .await?;
        locked_ids.extend(selected.iter().map(|s| s.output_id));

        if plan.change_basket_id.is_none() && allocation.change.is_some() {
            return Err(WalletError::ConfigurationError(format!(
                "Change basket '{}' does not exist",
                self.config.change_basket
            )));
        }

        let derivation_prefix = random_hex(DERIVATION_PREFIX_BYTES);
        let randomize = plan
            .valid
            .args
            .options
            .randomize_output_order_keys
            .unwrap_or(self.config.randomize_output_order_keys);

        let outputs = self
            .materialize_outputs(&plan, &allocation, &derivation_prefix, randomize)
            .await?;
        let inputs = Self::materialize_inputs(&plan, &selected);

        let total_in: u64 = inputs.iter().map(|i| i.source_satoshis).sum();
        let total_out: u64 = outputs.iter().map(|o| o.satoshis).sum();
        if total_out + allocation.fee != total_in {
            error!(
                target: "wallet::create_action",
                action_id,
                total_in,
                total_out,
                fee = allocation.fee,
                "Funded action does not balance"
            );
            return Err(WalletError::InternalError(format!(
                "Action {action_id} does not balance: inputs {total_in}, outputs {total_out}, fee {}",
                allocation.fee
            )));
        }

        let owned_in: u64 = inputs
            .iter()
            .filter(|i| i.source.provided_by() != ProvidedBy::You)
            .map(|i| i.source_satoshis)
            .sum();
        let change_out: u64 = outputs
            .iter()
            .filter(|o| o.origin.is_change())
            .map(|o| o.satoshis)
            .sum();
        let net_satoshis = change_out as i64 - owned_in as i64;

        let beef = self.merge_input_beef(&plan, &inputs).await?;

        self.storage
            .commit_funding(&FundingCommit {
                action_id,
                locked_output_ids: locked_ids,
                inputs: inputs.clone(),
                outputs: outputs.clone(),
                fee: allocation.fee,
                satoshis: net_satoshis,
                beef: beef.clone(),
            })
            .await?;
        info!(
            target: "wallet::create_action",
            action_id,
            fee = allocation.fee,
            inputs = inputs.len(),
            outputs = outputs.len(),
            "Action funded"
        );

        let basket_names = self.basket_names(&plan, &outputs).await?;
        Ok(CreateActionResult {
            version: get_supported_version(),
            reference: plan.reference.clone(),
            status: ActionStatus::Funded,
            inputs_requiring_signature: inputs
                .iter()
                .filter(|i| i.source.requires_external_signature() && i.unlocking_script.is_none())
                .map(|i| i.vin)
                .collect(),
            inputs: inputs
                .iter()
                .map(|i| ActionInputInfo {
                    vin: i.vin,
                    outpoint: i.outpoint,
                    source_satoshis: i.source_satoshis,
                    provided_by: i.source.provided_by(),
                    unlocking_script_length: i.unlocking_script_length,
                    description: i.description.clone(),
                })
                .collect(),
            outputs: outputs
                .iter()
                .map(|o| ActionOutputInfo {
                    vout: o.vout,
                    satoshis: o.satoshis,
                    locking_script: o.locking_script.clone(),
                    provided_by: o.origin.provided_by(),
                    basket: o.basket_id.and_then(|id| basket_names.get(&id).cloned()),
                    tags: o.tags.clone(),
                    description: o.description.clone(),
                })
                .collect(),
            metadata: TransactionMetadata::new(
                allocation.fee,
                plan.valid.args.options.version,
                plan.valid.args.options.lock_time,
                plan.fee_model,
            ),
            satoshis: net_satoshis,
            beef,
        })
    }

    /// Allocate from the basket and lock the picks, re-querying after a lock race
    async fn allocate_and_lock(
        &self,
        plan: &FundingPlan,
        request: &FundingRequest,
        no_send_candidates: Vec<FundingCandidate>,
    ) -> WalletResult<(ChangeAllocation, Vec<FundingOutput>)> {
        let action_id = plan.action_id;
        let mut available = plan.basket_candidates.clone();

        for attempt in 1..=self.config.max_funding_attempts {
            let mut candidates: Vec<FundingCandidate> =
                available.iter().map(|a| a.candidate()).collect();
            sort_candidates(&mut candidates);

            let allocation = allocate_change(request, no_send_candidates.clone(), candidates)
                .map_err(|e| match (&e, plan.change_basket_id) {
                    (WalletError::InsufficientFunds { .. }, None) => {
                        WalletError::ConfigurationError(format!(
                            "Change basket '{}' does not exist and inputs do not cover outputs",
                            self.config.change_basket
                        ))
                    }
                    _ => e,
                })?;

            let no_send_ids: HashSet<u32> =
                plan.no_send_change.iter().map(|c| c.output_id).collect();
            let by_id: HashMap<u32, &FundingOutput> =
                available.iter().map(|a| (a.output_id, a)).collect();
            let selected: Vec<FundingOutput> = allocation
                .selected
                .iter()
                .filter(|c| !no_send_ids.contains(&c.output_id))
                .filter_map(|c| by_id.get(&c.output_id).map(|o| (*o).clone()))
                .collect();
            let ids: Vec<u32> = selected.iter().map(|s| s.output_id).collect();
            if ids.is_empty() {
                return Ok((allocation, selected));
            }

            match self.storage.lock_outputs(action_id, &ids).await {
                Ok(()) => {
                    debug!(
                        target: "wallet::create_action",
                        action_id,
                        attempt,
                        selected = ids.len(),
                        "Locked funding outputs"
                    );
                    return Ok((allocation, selected));
                }
                Err(e) if e.is_retryable() && attempt < self.config.max_funding_attempts => {
                    warn!(
                        target: "wallet::create_action",
                        action_id,
                        attempt,
                        error = %e,
                        "Funding outputs taken by another action, retrying"
                    );
                    let basket_id = plan.change_basket_id.ok_or_else(|| {
                        WalletError::InternalError("Retry without a change basket".to_string())
                    })?;
                    available = self.count_available_change(basket_id, &plan.inputs).await?;
                }
                Err(e) => return Err(e),
            }
        }
        Err(WalletError::ConflictError(format!(
            "Could not lock funding for action {action_id} after {} attempts",
            self.config.max_funding_attempts
        )))
    }

    async fn materialize_outputs(
        &self,
        plan: &FundingPlan,
        allocation: &ChangeAllocation,
        derivation_prefix: &str,
        randomize: bool,
    ) -> WalletResult<Vec<StoredOutput>> {
        let mut outputs = Vec::with_capacity(plan.outputs.len() + 1);
        for (index, planned) in plan.outputs.iter().enumerate() {
            let satoshis = match planned.satoshis {
                OutputAmount::Fixed(sats) => sats,
                OutputAmount::MaxPossible => allocation.max_output_satoshis.ok_or_else(|| {
                    WalletError::InternalError(format!(
                        "Output {index} requests the maximum but funding did not resolve it"
                    ))
                })?,
            };
            let basket_id = match &planned.basket {
                Some(name) => Some(self.ensure_basket(name).await?),
                None => None,
            };
            outputs.push(StoredOutput {
                id: None,
                action_id: Some(plan.action_id),
                basket_id,
                txid: None,
                vout: index as u32,
                satoshis,
                locking_script: planned.locking_script.clone(),
                spendable: false,
                origin: planned.origin.clone(),
                description: planned.description.clone(),
                custom_instructions: planned.custom_instructions.clone(),
                tags: planned.tags.clone(),
                sort_key: 0,
                status: OutputStatus::Unspent,
                locked_by_action: None,
                spent_by_action: None,
                created_at: None,
                updated_at: None,
            });
        }

        if let (Some(change), Some(basket_id)) = (allocation.change, plan.change_basket_id) {
            let derivation =
                KeyDerivation::new(derivation_prefix, random_hex(DERIVATION_SUFFIX_BYTES));
            let public_key = self.keys.public_key(&derivation).await?;
            outputs.push(StoredOutput {
                id: None,
                action_id: Some(plan.action_id),
                basket_id: Some(basket_id),
                txid: None,
                vout: outputs.len() as u32,
                satoshis: change,
                locking_script: p2pkh::lock(&public_key),
                spendable: false,
                origin: OutputOrigin::Change { derivation },
                description: None,
                custom_instructions: None,
                tags: Vec::new(),
                sort_key: 0,
                status: OutputStatus::Unspent,
                locked_by_action: None,
                spent_by_action: None,
                created_at: None,
                updated_at: None,
            });
        }

        for output in outputs.iter_mut() {
            output.sort_key = if randomize {
                OsRng.gen::<u32>()
            } else {
                output.vout
            };
        }
        Ok(outputs)
    }

    fn materialize_inputs(plan: &FundingPlan, selected: &[FundingOutput]) -> Vec<StoredInput> {
        let explicit = plan.inputs.iter().map(|input| StoredInput {
            id: None,
            action_id: plan.action_id,
            vin: 0,
            outpoint: input.outpoint,
            source_satoshis: input.satoshis,
            source_locking_script: input.locking_script.clone(),
            sequence: input.sequence,
            unlocking_script: input.unlocking_script.clone(),
            unlocking_script_length: input.unlocking_script_length,
            description: Some(input.description.clone()),
            source: input.source.clone(),
        });
        let funding = plan
            .no_send_change
            .iter()
            .chain(selected.iter())
            .map(|f| StoredInput {
                id: None,
                action_id: plan.action_id,
                vin: 0,
                outpoint: f.outpoint,
                source_satoshis: f.output.satoshis,
                source_locking_script: f.output.locking_script.clone(),
                sequence: DEFAULT_SEQUENCE,
                unlocking_script: None,
                unlocking_script_length: P2PKH_UNLOCKING_SCRIPT_LENGTH,
                description: None,
                source: InputSource::Storage {
                    output_id: f.output_id,
                    derivation: f.derivation.clone(),
                },
            });

        explicit
            .chain(funding)
            .enumerate()
            .map(|(vin, mut input)| {
                input.vin = vin as u32;
                input
            })
            .collect()
    }

    /// Merge source transactions for every input, plus unproven ancestors known to storage
    async fn merge_input_beef(
        &self,
        plan: &FundingPlan,
        inputs: &[StoredInput],
    ) -> WalletResult<Beef> {
        let mut beef = Beef::new();
        if let Some(input_beef) = &plan.valid.args.input_beef {
            beef.merge_beef(input_beef);
        }

        let mut pending: Vec<Txid> = inputs.iter().map(|i| i.outpoint.txid).collect();
        let mut visited = HashSet::new();
        while let Some(txid) = pending.pop() {
            if !visited.insert(txid) {
                continue;
            }
            let merkle_path = match self.storage.get_source_transaction(&txid).await? {
                Some(stored) => {
                    beef.merge_raw_tx(stored.raw_tx, stored.merkle_path.clone());
                    stored.merkle_path
                }
                None if beef.find(&txid).is_some_and(|tx| tx.is_full()) => None,
                None => {
                    return Err(WalletError::ValidationError(format!(
                        "Source transaction {txid} is not available for the proof bundle"
                    )))
                }
            };
            let has_proof = merkle_path.is_some() || beef.find(&txid).is_some_and(|t| t.has_proof());
            if has_proof {
                continue;
            }
            if let Some(tx) = beef.find_transaction(&txid)? {
                for parent in tx.inputs.iter().map(|i| i.previous_output.txid) {
                    if !visited.contains(&parent)
                        && self.storage.get_source_transaction(&parent).await?.is_some()
                    {
                        pending.push(parent);
                    }
                }
            }
        }
        beef.sort_txs();
        debug!(
            target: "wallet::create_action",
            action_id = plan.action_id,
            transactions = beef.len(),
            "Merged input proof bundle"
        );
        Ok(beef)
    }

    async fn basket_names(
        &self,
        plan: &FundingPlan,
        outputs: &[StoredOutput],
    ) -> WalletResult<HashMap<u32, String>> {
        let mut names = HashMap::new();
        if let Some(id) = plan.change_basket_id {
            names.insert(id, self.config.change_basket.clone());
        }
        for (planned, stored) in plan.outputs.iter().zip(outputs) {
            if let (Some(name), Some(id)) = (&planned.basket, stored.basket_id) {
                names.insert(id, name.clone());
            }
        }
        Ok(names)
    }
}

/// State carried from validation into funding
struct FundingPlan {
    action_id: u32,
    reference: String,
    valid: ValidCreateActionArgs,
    inputs: Vec<ResolvedInput>,
    outputs: Vec<PlannedOutput>,
    change_basket_id: Option<u32>,
    no_send_change: Vec<FundingOutput>,
    basket_candidates: Vec<FundingOutput>,
    fee_model: FeeModel,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data_structures::{TxInput, TxOutput},
        key_management::RootKeyDeriver,
        storage::{InMemoryStorage, StoredTransaction},
        validation::CreateActionOutput,
    };

    struct Fixture {
        storage: Arc<InMemoryStorage>,
        keys: Arc<RootKeyDeriver>,
        basket_id: u32,
    }

    async fn fixture() -> Fixture {
        let storage = Arc::new(InMemoryStorage::new());
        storage.initialize().await.unwrap();
        let basket_id = storage.save_basket(&StoredBasket::new("default")).await.unwrap();
        Fixture {
            storage,
            keys: Arc::new(RootKeyDeriver::from_bytes([0x33; 32]).unwrap()),
            basket_id,
        }
    }

    impl Fixture {
        fn builder(&self, config: ActionEngineConfig) -> ActionBuilder {
            ActionBuilder::new(self.storage.clone(), self.keys.clone(), config)
        }

        async fn add_change(&self, satoshis: u64, seed: u8) -> Outpoint {
            let derivation = KeyDerivation::new("seed", seed.to_string());
            let script = p2pkh::lock(&self.keys.public_key(&derivation).await.unwrap());
            let mut tx = Transaction::new(1, 0);
            tx.inputs.push(TxInput {
                previous_output: Outpoint::new(Txid::from_bytes([seed; 32]), 0),
                unlocking_script: Script::default(),
                sequence: DEFAULT_SEQUENCE,
            });
            tx.outputs.push(TxOutput {
                satoshis,
                locking_script: script.clone(),
            });
            let outpoint = Outpoint::new(tx.txid(), 0);
            self.storage
                .save_source_transaction(&StoredTransaction {
                    txid: tx.txid(),
                    raw_tx: tx.to_bytes(),
                    merkle_path: Some(vec![1, 2, 3]),
                })
                .await
                .unwrap();
            self.storage
                .save_output(&StoredOutput::spendable_in_basket(
                    outpoint,
                    satoshis,
                    script,
                    self.basket_id,
                    OutputOrigin::Change { derivation },
                ))
                .await
                .unwrap();
            outpoint
        }
    }

    fn pay(satoshis: u64) -> CreateActionArgs {
        CreateActionArgs::new("test payment").with_output(CreateActionOutput::fixed(
            p2pkh::lock_to_hash(&[0x07; 20]),
            satoshis,
            "pay someone",
        ))
    }

    #[tokio::test]
    async fn funds_from_basket_with_change() {
        let f = fixture().await;
        f.add_change(2000, 1).await;
        let config = ActionEngineConfig::new().with_fee_model(FeeModel::sat_per_kb(1000));
        let result = f.builder(config).create_action(pay(1000)).await.unwrap();

        assert_eq!(result.status, ActionStatus::Funded);
        assert_eq!(result.inputs.len(), 1);
        assert_eq!(result.outputs.len(), 2);
        assert_eq!(result.outputs[1].provided_by, ProvidedBy::Storage);
        assert!(result.inputs_requiring_signature.is_empty());
        let total_out: u64 = result.outputs.iter().map(|o| o.satoshis).sum();
        assert_eq!(total_out + result.metadata.fee, 2000);
        assert_eq!(result.beef.len(), 1);
    }

    #[tokio::test]
    async fn unknown_explicit_input_is_rejected_before_persisting() {
        let f = fixture().await;
        f.add_change(5000, 1).await;
        let args = pay(1000).with_input(CreateActionInput::deferred(
            Outpoint::new(Txid::from_bytes([9; 32]), 0),
            107,
            "mystery coin",
        ));
        let err = f
            .builder(ActionEngineConfig::new())
            .create_action(args)
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::ValidationError(_)));
        assert!(f.storage.list_actions(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_change_basket_is_a_configuration_error() {
        let f = fixture().await;
        f.add_change(5000, 1).await;
        let config = ActionEngineConfig::new().with_change_basket("elsewhere");
        let err = f.builder(config).create_action(pay(1000)).await.unwrap_err();
        assert!(matches!(err, WalletError::ConfigurationError(_)));
    }

    #[tokio::test]
    async fn insufficient_funds_rolls_back() {
        let f = fixture().await;
        f.add_change(500, 1).await;
        let err = f
            .builder(ActionEngineConfig::new())
            .create_action(pay(1000))
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::InsufficientFunds { .. }));
        let actions = f.storage.list_actions(None).await.unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].status, ActionStatus::Failed);
        assert_eq!(f.storage.get_spendable_change(f.basket_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sequential_order_keys_follow_vout() {
        let f = fixture().await;
        f.add_change(5000, 1).await;
        let builder = f.builder(ActionEngineConfig::new());
        let result = builder.create_action(pay(1000)).await.unwrap();
        let action = f
            .storage
            .get_action_by_reference(&result.reference)
            .await
            .unwrap()
            .unwrap();
        let outputs = f.storage.get_action_outputs(action.id.unwrap()).await.unwrap();
        for output in outputs {
            assert_eq!(output.sort_key, output.vout);
        }
    }

    #[tokio::test]
    async fn commission_follows_caller_outputs() {
        let f = fixture().await;
        f.add_change(10_000, 1).await;
        let commission_key = f.keys.root_public_key();
        let config = ActionEngineConfig::new()
            .with_commission(crate::config::CommissionConfig::new(&commission_key, 300));
        let result = f.builder(config).create_action(pay(1000)).await.unwrap();
        assert_eq!(result.outputs.len(), 3);
        assert_eq!(result.outputs[1].satoshis, 300);
        assert_eq!(result.outputs[1].provided_by, ProvidedBy::Storage);
        assert_ne!(result.outputs[1].locking_script, p2pkh::lock(&commission_key));
    }
}

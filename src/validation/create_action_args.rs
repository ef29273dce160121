//! Structural validation of `createAction` arguments
//!
//! These checks need no storage access. They run before anything is
//! persisted, so a rejected request leaves no trace.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{
    beef::Beef,
    data_structures::{Outpoint, Script, DEFAULT_SEQUENCE, DEFAULT_TX_VERSION},
    errors::{WalletError, WalletResult},
    fee_model::FeeModel,
    key_management::KeyDerivation,
};

/// Total supply in satoshis; no single amount may exceed it
pub const MAX_SATOSHIS: u64 = 2_100_000_000_000_000;

pub const MIN_DESCRIPTION_LENGTH: usize = 5;
pub const MAX_DESCRIPTION_LENGTH: usize = 2000;
pub const MAX_LABEL_LENGTH: usize = 300;
pub const MAX_BASKET_LENGTH: usize = 300;

/// Amount requested for an output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputAmount {
    Fixed(u64),
    /// Whatever is left once fixed outputs and the fee are paid
    MaxPossible,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateActionInput {
    pub outpoint: Outpoint,
    pub input_description: String,
    /// Final unlocking script, when the caller already has it
    #[serde(default)]
    pub unlocking_script: Option<Script>,
    /// Length of the unlocking script the caller will supply later
    #[serde(default)]
    pub unlocking_script_length: Option<usize>,
    #[serde(default)]
    pub sequence_number: Option<u32>,
    /// Key path of a wallet-owned output; lets the wallet sign it at completion
    #[serde(default)]
    pub derivation: Option<KeyDerivation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateActionOutput {
    pub locking_script: Script,
    pub satoshis: OutputAmount,
    pub output_description: String,
    /// Basket the wallet tracks the output in once finalized
    #[serde(default)]
    pub basket: Option<String>,
    #[serde(default)]
    pub custom_instructions: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateActionOptions {
    /// Keep the transaction local; its change is only reusable when listed explicitly
    pub no_send: bool,
    /// Change of earlier `no_send` actions to consume first
    pub no_send_change: Vec<Outpoint>,
    pub fee_model: Option<FeeModel>,
    pub randomize_output_order_keys: Option<bool>,
    pub lock_time: u32,
    pub version: u32,
}

impl Default for CreateActionOptions {
    fn default() -> Self {
        Self {
            no_send: false,
            no_send_change: Vec::new(),
            fee_model: None,
            randomize_output_order_keys: None,
            lock_time: 0,
            version: DEFAULT_TX_VERSION,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateActionArgs {
    pub description: String,
    /// Source transactions of the explicit inputs
    #[serde(default)]
    pub input_beef: Option<Beef>,
    #[serde(default)]
    pub inputs: Vec<CreateActionInput>,
    #[serde(default)]
    pub outputs: Vec<CreateActionOutput>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub options: CreateActionOptions,
}

impl CreateActionArgs {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            input_beef: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            labels: Vec::new(),
            options: CreateActionOptions::default(),
        }
    }

    pub fn with_input(mut self, input: CreateActionInput) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_output(mut self, output: CreateActionOutput) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn with_input_beef(mut self, beef: Beef) -> Self {
        self.input_beef = Some(beef);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.push(label.into());
        self
    }

    pub fn with_options(mut self, options: CreateActionOptions) -> Self {
        self.options = options;
        self
    }
}

impl CreateActionOutput {
    pub fn fixed(locking_script: Script, satoshis: u64, description: impl Into<String>) -> Self {
        Self {
            locking_script,
            satoshis: OutputAmount::Fixed(satoshis),
            output_description: description.into(),
            basket: None,
            custom_instructions: None,
            tags: Vec::new(),
        }
    }

    pub fn max_possible(locking_script: Script, description: impl Into<String>) -> Self {
        Self {
            satoshis: OutputAmount::MaxPossible,
            ..Self::fixed(locking_script, 0, description)
        }
    }
}

impl CreateActionInput {
    /// An input whose unlocking script the caller supplies at completion
    pub fn deferred(
        outpoint: Outpoint,
        unlocking_script_length: usize,
        description: impl Into<String>,
    ) -> Self {
        Self {
            outpoint,
            input_description: description.into(),
            unlocking_script: None,
            unlocking_script_length: Some(unlocking_script_length),
            sequence_number: None,
            derivation: None,
        }
    }

    pub fn sequence(&self) -> u32 {
        self.sequence_number.unwrap_or(DEFAULT_SEQUENCE)
    }
}

/// Arguments after validation, with normalized labels and tags
#[derive(Debug, Clone)]
pub struct ValidCreateActionArgs {
    pub args: CreateActionArgs,
    /// Unlocking script length per explicit input, in input order
    pub unlocking_script_lengths: Vec<usize>,
    /// Index of the output requesting the maximum possible amount
    pub max_output_index: Option<usize>,
}

impl ValidCreateActionArgs {
    /// Sum of the fixed output amounts
    pub fn fixed_output_satoshis(&self) -> u64 {
        self.args
            .outputs
            .iter()
            .map(|o| match o.satoshis {
                OutputAmount::Fixed(sats) => sats,
                OutputAmount::MaxPossible => 0,
            })
            .sum()
    }
}

fn validate_description(what: &str, text: &str) -> WalletResult<()> {
    let len = text.len();
    if !(MIN_DESCRIPTION_LENGTH..=MAX_DESCRIPTION_LENGTH).contains(&len) {
        return Err(WalletError::ValidationError(format!(
            "{what} must be between {MIN_DESCRIPTION_LENGTH} and {MAX_DESCRIPTION_LENGTH} bytes, got {len}"
        )));
    }
    Ok(())
}

/// Trim, lower-case and deduplicate labels or tags, keeping first occurrence order
pub fn normalize_identifiers(what: &str, values: &[String]) -> WalletResult<Vec<String>> {
    let mut seen = HashSet::new();
    let mut normalized = Vec::with_capacity(values.len());
    for value in values {
        let value = value.trim().to_lowercase();
        if value.is_empty() || value.len() > MAX_LABEL_LENGTH {
            return Err(WalletError::ValidationError(format!(
                "{what} must be between 1 and {MAX_LABEL_LENGTH} bytes: '{value}'"
            )));
        }
        if seen.insert(value.clone()) {
            normalized.push(value);
        }
    }
    Ok(normalized)
}

fn validate_input(index: usize, input: &CreateActionInput) -> WalletResult<usize> {
    validate_description(&format!("Input {index} description"), &input.input_description)?;
    match (&input.unlocking_script, input.unlocking_script_length) {
        (Some(script), Some(len)) if script.len() != len => Err(WalletError::ValidationError(
            format!(
                "Input {index} declares an unlocking script length of {len} but the script is {} bytes",
                script.len()
            ),
        )),
        (Some(script), _) => Ok(script.len()),
        (None, Some(len)) => Ok(len),
        (None, None) => Err(WalletError::ValidationError(format!(
            "Input {index} needs an unlocking script or an unlocking script length"
        ))),
    }
}

fn validate_output(
    index: usize,
    output: &mut CreateActionOutput,
    change_basket: &str,
) -> WalletResult<()> {
    validate_description(
        &format!("Output {index} description"),
        &output.output_description,
    )?;
    if let OutputAmount::Fixed(sats) = output.satoshis {
        if sats > MAX_SATOSHIS {
            return Err(WalletError::ValidationError(format!(
                "Output {index} amount {sats} exceeds the maximum of {MAX_SATOSHIS} satoshis"
            )));
        }
    }
    if let Some(basket) = &output.basket {
        let basket = basket.trim().to_lowercase();
        if basket.is_empty() || basket.len() > MAX_BASKET_LENGTH {
            return Err(WalletError::ValidationError(format!(
                "Output {index} basket must be between 1 and {MAX_BASKET_LENGTH} bytes"
            )));
        }
        if basket == change_basket {
            return Err(WalletError::ValidationError(format!(
                "Output {index} may not be placed in the change basket '{change_basket}'"
            )));
        }
        output.basket = Some(basket);
    }
    output.tags = normalize_identifiers(&format!("Output {index} tag"), &output.tags)?;
    Ok(())
}

/// Validate and normalize `createAction` arguments.
///
/// `change_basket` is the basket funding draws from; callers may not
/// place their own outputs in it.
pub fn validate_create_action_args(
    mut args: CreateActionArgs,
    change_basket: &str,
) -> WalletResult<ValidCreateActionArgs> {
    validate_description("Action description", &args.description)?;
    args.labels = normalize_identifiers("Label", &args.labels)?;

    let mut seen = HashSet::new();
    let mut unlocking_script_lengths = Vec::with_capacity(args.inputs.len());
    for (index, input) in args.inputs.iter().enumerate() {
        unlocking_script_lengths.push(validate_input(index, input)?);
        if !seen.insert(input.outpoint) {
            return Err(WalletError::ValidationError(format!(
                "Outpoint {} is spent by more than one input",
                input.outpoint
            )));
        }
    }

    let mut listed = HashSet::new();
    for outpoint in &args.options.no_send_change {
        if !listed.insert(*outpoint) {
            return Err(WalletError::ValidationError(format!(
                "No-send change outpoint {outpoint} is listed more than once"
            )));
        }
        if seen.contains(outpoint) {
            return Err(WalletError::ValidationError(format!(
                "No-send change outpoint {outpoint} is also an explicit input"
            )));
        }
    }

    let mut max_output_index = None;
    for (index, output) in args.outputs.iter_mut().enumerate() {
        validate_output(index, output, change_basket)?;
        if output.satoshis == OutputAmount::MaxPossible {
            if max_output_index.is_some() {
                return Err(WalletError::ValidationError(
                    "Only one output may request the maximum possible satoshis".to_string(),
                ));
            }
            max_output_index = Some(index);
        }
    }

    let valid = ValidCreateActionArgs {
        args,
        unlocking_script_lengths,
        max_output_index,
    };
    if valid.fixed_output_satoshis() > MAX_SATOSHIS {
        return Err(WalletError::ValidationError(format!(
            "Outputs total more than {MAX_SATOSHIS} satoshis"
        )));
    }
    Ok(valid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_structures::Txid;

    fn outpoint(n: u8, vout: u32) -> Outpoint {
        Outpoint::new(Txid::from_bytes([n; 32]), vout)
    }

    fn args() -> CreateActionArgs {
        CreateActionArgs::new("pay the invoice").with_output(CreateActionOutput::fixed(
            Script::new(vec![0x51]),
            1000,
            "invoice payment",
        ))
    }

    #[test]
    fn accepts_minimal_request() {
        let valid = validate_create_action_args(args(), "default").unwrap();
        assert_eq!(valid.fixed_output_satoshis(), 1000);
        assert!(valid.max_output_index.is_none());
    }

    #[test]
    fn rejects_short_description() {
        let err = validate_create_action_args(CreateActionArgs::new("pay"), "default").unwrap_err();
        assert!(matches!(err, WalletError::ValidationError(_)));
    }

    #[test]
    fn labels_are_trimmed_lowercased_and_deduplicated() {
        let request = args()
            .with_label(" Invoice ")
            .with_label("invoice")
            .with_label("Rent");
        let valid = validate_create_action_args(request, "default").unwrap();
        assert_eq!(valid.args.labels, vec!["invoice", "rent"]);
    }

    #[test]
    fn empty_label_is_rejected() {
        let request = args().with_label("   ");
        assert!(validate_create_action_args(request, "default").is_err());
    }

    #[test]
    fn input_needs_a_script_or_a_length() {
        let mut input = CreateActionInput::deferred(outpoint(1, 0), 107, "spend my coin");
        input.unlocking_script_length = None;
        let err = validate_create_action_args(args().with_input(input), "default").unwrap_err();
        assert!(err.to_string().contains("unlocking script"));
    }

    #[test]
    fn declared_length_must_match_script() {
        let mut input = CreateActionInput::deferred(outpoint(1, 0), 10, "spend my coin");
        input.unlocking_script = Some(Script::new(vec![0x51; 3]));
        assert!(validate_create_action_args(args().with_input(input), "default").is_err());
    }

    #[test]
    fn duplicate_input_outpoints_are_rejected() {
        let request = args()
            .with_input(CreateActionInput::deferred(outpoint(1, 0), 107, "first coin"))
            .with_input(CreateActionInput::deferred(outpoint(1, 0), 107, "same coin"));
        let err = validate_create_action_args(request, "default").unwrap_err();
        assert!(err.to_string().contains("more than one input"));
    }

    #[test]
    fn duplicate_no_send_change_is_rejected() {
        let request = args().with_options(CreateActionOptions {
            no_send_change: vec![outpoint(2, 1), outpoint(2, 1)],
            ..Default::default()
        });
        assert!(validate_create_action_args(request, "default").is_err());
    }

    #[test]
    fn outputs_may_not_use_the_change_basket() {
        let mut output = CreateActionOutput::fixed(Script::new(vec![0x51]), 5, "to my basket");
        output.basket = Some("Default".to_string());
        let err =
            validate_create_action_args(CreateActionArgs::new("basket test").with_output(output), "default")
                .unwrap_err();
        assert!(err.to_string().contains("change basket"));
    }

    #[test]
    fn only_one_max_possible_output() {
        let request = args()
            .with_output(CreateActionOutput::max_possible(Script::new(vec![0x51]), "sweep one"))
            .with_output(CreateActionOutput::max_possible(Script::new(vec![0x51]), "sweep two"));
        assert!(validate_create_action_args(request, "default").is_err());

        let request =
            args().with_output(CreateActionOutput::max_possible(Script::new(vec![0x51]), "sweep one"));
        let valid = validate_create_action_args(request, "default").unwrap();
        assert_eq!(valid.max_output_index, Some(1));
    }

    #[test]
    fn amounts_above_supply_are_rejected() {
        let request = CreateActionArgs::new("too much money").with_output(CreateActionOutput::fixed(
            Script::new(vec![0x51]),
            MAX_SATOSHIS + 1,
            "impossible",
        ));
        assert!(validate_create_action_args(request, "default").is_err());
    }
}

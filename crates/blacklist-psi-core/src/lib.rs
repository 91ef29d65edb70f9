use std::collections::HashMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One 64-bit slot of the engine's label channel, used as a bit-field container.
pub type Label = u64;

/// Ordered labels for one identity: the header label followed by one label per event.
pub type LabelSequence = Vec<Label>;

/// Server-side label map in the shape the engine's `srv_data` field expects.
pub type SrvData = HashMap<u64, LabelSequence>;

pub const FIELD_MASK: u64 = 0xF;
pub const FIELD_WIDTH: u32 = 4;
pub const MAX_FIELD_VALUE: u8 = 15;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("decode error: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum RiskLevel {
    A,
    B,
    C,
}

impl RiskLevel {
    pub const ALL: [Self; 3] = [Self::A, Self::B, Self::C];

    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::A => 1,
            Self::B => 2,
            Self::C => 3,
        }
    }

    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::A),
            2 => Some(Self::B),
            3 => Some(Self::C),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
        }
    }

    /// Display text shown to operators.
    #[must_use]
    pub fn description(self) -> &'static str {
        self.as_str()
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "A" => Some(Self::A),
            "B" => Some(Self::B),
            "C" => Some(Self::C),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BehaviorType {
    Hide,
    Complain,
    Other,
}

impl BehaviorType {
    pub const ALL: [Self; 3] = [Self::Hide, Self::Complain, Self::Other];

    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Hide => 1,
            Self::Complain => 2,
            Self::Other => 3,
        }
    }

    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Hide),
            2 => Some(Self::Complain),
            3 => Some(Self::Other),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hide => "hide",
            Self::Complain => "complain",
            Self::Other => "other",
        }
    }

    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::Hide => "concealment",
            Self::Complain => "complaint",
            Self::Other => "other",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "hide" => Some(Self::Hide),
            "complain" => Some(Self::Complain),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ToolType {
    Knife,
    Lighter,
    Other,
}

impl ToolType {
    pub const ALL: [Self; 3] = [Self::Knife, Self::Lighter, Self::Other];

    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Knife => 1,
            Self::Lighter => 2,
            Self::Other => 3,
        }
    }

    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Knife),
            2 => Some(Self::Lighter),
            3 => Some(Self::Other),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Knife => "knife",
            Self::Lighter => "lighter",
            Self::Other => "other",
        }
    }

    #[must_use]
    pub fn description(self) -> &'static str {
        self.as_str()
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "knife" => Some(Self::Knife),
            "lighter" => Some(Self::Lighter),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct IdentityRecord {
    pub owner_key: i64,
    pub identity: String,
    pub risk_level: RiskLevel,
    pub behavior_count: u8,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct BehaviorEvent {
    pub owner_key: i64,
    pub behavior_type: BehaviorType,
    pub tool: ToolType,
}

/// One identity together with its behavior events in storage order.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct IdentityWithEvents {
    pub record: IdentityRecord,
    #[serde(default)]
    pub events: Vec<BehaviorEvent>,
}

impl IdentityWithEvents {
    /// Validate one identity before it is persisted.
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] when the identity string is blank, the
    /// declared behavior count disagrees with the attached events, the event count
    /// does not fit the 4-bit header field, or an event belongs to another owner.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.record.identity.trim().is_empty() {
            return Err(CoreError::Validation("identity MUST be non-empty".to_string()));
        }

        if self.events.len() > usize::from(MAX_FIELD_VALUE) {
            return Err(CoreError::Validation(format!(
                "identity {} has {} behavior events; the label header holds at most {MAX_FIELD_VALUE}",
                self.record.owner_key,
                self.events.len()
            )));
        }

        if usize::from(self.record.behavior_count) != self.events.len() {
            return Err(CoreError::Validation(format!(
                "behavior_count={} MUST equal the number of behavior events ({})",
                self.record.behavior_count,
                self.events.len()
            )));
        }

        if let Some(foreign) =
            self.events.iter().find(|event| event.owner_key != self.record.owner_key)
        {
            return Err(CoreError::Validation(format!(
                "behavior event owned by {} attached to identity {}",
                foreign.owner_key, self.record.owner_key
            )));
        }

        Ok(())
    }

    #[must_use]
    pub fn correlation_key(&self) -> CorrelationKey {
        derive_correlation_key(&self.record.identity)
    }

    #[must_use]
    pub fn labels(&self) -> LabelSequence {
        encode_labels(self.record.risk_level, &self.events)
    }
}

/// 64-bit key the engine indexes server records on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct CorrelationKey(pub u64);

impl CorrelationKey {
    /// Key assigned to the empty (or absent) identity string.
    pub const EMPTY: Self = Self(0);

    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn to_hex(self) -> String {
        format!("{:016x}", self.0)
    }
}

impl Display for CorrelationKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Derive the correlation key for one identity string.
///
/// The key is the first 8 bytes of the SHA-256 digest of the UTF-8 bytes,
/// read as a big-endian integer. The querying client and the engine compute
/// the same value, so this must never change. The empty string maps to
/// [`CorrelationKey::EMPTY`].
#[must_use]
pub fn derive_correlation_key(identity: &str) -> CorrelationKey {
    if identity.is_empty() {
        return CorrelationKey::EMPTY;
    }

    let digest = Sha256::digest(identity.as_bytes());
    let mut prefix = [0_u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    CorrelationKey(u64::from_be_bytes(prefix))
}

#[must_use]
pub fn derive_optional_correlation_key(identity: Option<&str>) -> CorrelationKey {
    identity.map_or(CorrelationKey::EMPTY, derive_correlation_key)
}

#[must_use]
pub fn pack_fields(low: u64, high: u64) -> Label {
    (low & FIELD_MASK) | ((high & FIELD_MASK) << FIELD_WIDTH)
}

fn low_field(label: Label) -> u8 {
    label.to_le_bytes()[0] & 0x0F
}

fn high_field(label: Label) -> u8 {
    label.to_le_bytes()[0] >> FIELD_WIDTH
}

/// Pack raw codes into a label sequence.
///
/// Codes are masked to 4 bits; anything above 15 is silently truncated.
#[must_use]
pub fn encode_raw(risk_code: u64, events: &[(u64, u64)]) -> LabelSequence {
    let event_count = u64::try_from(events.len()).unwrap_or(u64::MAX);
    let mut labels = Vec::with_capacity(events.len() + 1);
    labels.push(pack_fields(risk_code, event_count));
    labels.extend(events.iter().map(|&(behavior, tool)| pack_fields(behavior, tool)));
    labels
}

/// Pack one identity's risk level and ordered events into labels.
///
/// The header stores the number of events actually encoded. Keeping it equal
/// to the record's declared count is the caller's job.
#[must_use]
pub fn encode_labels(risk_level: RiskLevel, events: &[BehaviorEvent]) -> LabelSequence {
    let raw = events
        .iter()
        .map(|event| (u64::from(event.behavior_type.code()), u64::from(event.tool.code())))
        .collect::<Vec<_>>();
    encode_raw(u64::from(risk_level.code()), &raw)
}

#[must_use]
pub fn decode_risk_level(label0: Label) -> u8 {
    low_field(label0)
}

#[must_use]
pub fn decode_event_count(label0: Label) -> u8 {
    high_field(label0)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct BehaviorLabel {
    pub behavior_type: u8,
    pub tool_type: u8,
}

impl BehaviorLabel {
    #[must_use]
    pub fn typed(self) -> Option<(BehaviorType, ToolType)> {
        Some((BehaviorType::from_code(self.behavior_type)?, ToolType::from_code(self.tool_type)?))
    }
}

#[must_use]
pub fn decode_behavior_label(label: Label) -> BehaviorLabel {
    BehaviorLabel { behavior_type: low_field(label), tool_type: high_field(label) }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DecodedLabels {
    pub risk_level: u8,
    pub declared_count: u8,
    pub events: Vec<BehaviorLabel>,
}

impl DecodedLabels {
    #[must_use]
    pub fn typed_risk_level(&self) -> Option<RiskLevel> {
        RiskLevel::from_code(self.risk_level)
    }
}

/// Decode a full label sequence back into its fields.
///
/// Reads at most `declared_count` event labels and never past the end of the
/// sequence, so a truncated sequence yields fewer events than declared.
///
/// # Errors
/// Returns [`CoreError::Decode`] when the sequence has no header label.
pub fn decode_labels(labels: &[Label]) -> Result<DecodedLabels, CoreError> {
    let Some((&header, rest)) = labels.split_first() else {
        return Err(CoreError::Decode("label sequence is empty".to_string()));
    };

    let declared_count = decode_event_count(header);
    let events = rest
        .iter()
        .take(usize::from(declared_count))
        .map(|&label| decode_behavior_label(label))
        .collect();

    Ok(DecodedLabels { risk_level: decode_risk_level(header), declared_count, events })
}

#[must_use]
pub fn describe_labels(labels: &[Label]) -> Vec<String> {
    let mut lines = Vec::with_capacity(labels.len());
    let Some((&header, rest)) = labels.split_first() else {
        return lines;
    };

    lines.push(format!(
        "labels[0]={header} (0x{header:x}) risk={} count={}",
        decode_risk_level(header),
        decode_event_count(header)
    ));
    for (index, &label) in rest.iter().enumerate() {
        let decoded = decode_behavior_label(label);
        lines.push(format!(
            "labels[{}]={label} (0x{label:x}) behavior={} tool={}",
            index + 1,
            decoded.behavior_type,
            decoded.tool_type
        ));
    }
    lines
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct AssemblyReport {
    pub identities: usize,
    pub entries: usize,
    pub total_labels: usize,
    /// Map entries replaced by a later identity with the same correlation key.
    pub overwritten_keys: usize,
    pub declared_count_mismatches: usize,
}

#[derive(Debug, Clone, Default)]
pub struct AssembledBatch {
    pub srv_data: SrvData,
    pub report: AssemblyReport,
}

/// Build the engine's key -> labels map for a whole snapshot.
///
/// Identities whose keys collide overwrite each other, last one wins. The
/// report counts overwrites and declared-count mismatches but nothing is rejected.
#[must_use]
pub fn assemble_srv_data(identities: &[IdentityWithEvents]) -> AssembledBatch {
    let mut srv_data = SrvData::with_capacity(identities.len());
    let mut report = AssemblyReport { identities: identities.len(), ..AssemblyReport::default() };

    for identity in identities {
        if usize::from(identity.record.behavior_count) != identity.events.len() {
            report.declared_count_mismatches += 1;
        }

        let labels = identity.labels();
        report.total_labels += labels.len();
        if let Some(replaced) = srv_data.insert(identity.correlation_key().value(), labels) {
            report.overwritten_keys += 1;
            report.total_labels -= replaced.len();
        }
    }

    report.entries = srv_data.len();
    AssembledBatch { srv_data, report }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MatchCount {
    Known { count: u64 },
    Unknown,
}

/// Strategy that derives a match count from the engine's encrypted response.
///
/// Wire contract: `response` is the engine's `EncryptResponse.payload_data`,
/// byte-for-byte as received. Implementations must not decrypt it; they may only
/// read metadata the engine publishes alongside the ciphertext. When no such
/// metadata is defined the strategy must answer [`MatchCount::Unknown`] rather
/// than a number.
pub trait MatchCountStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Derive the match count for one response.
    ///
    /// # Errors
    /// Returns [`CoreError::Decode`] when the response does not follow the
    /// strategy's declared metadata layout.
    fn interpret(&self, response: &[u8]) -> Result<MatchCount, CoreError>;
}

/// The engine does not publish a match count yet, so this strategy always
/// reports [`MatchCount::Unknown`].
#[derive(Debug, Clone, Copy, Default)]
pub struct UndeclaredMatchCount;

impl MatchCountStrategy for UndeclaredMatchCount {
    fn name(&self) -> &'static str {
        "undeclared"
    }

    fn interpret(&self, _response: &[u8]) -> Result<MatchCount, CoreError> {
        Ok(MatchCount::Unknown)
    }
}

//! Core value types shared by the governance engine
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::GovernanceError;

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Option<Self> {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .map(TimeStamp)
    }
    pub fn plus_hours(&self, hours: u32) -> Self {
        Self(self.0 + Duration::hours(i64::from(hours)))
    }
}

// `Utc` itself is not `Ord`, so ordering is on the instant.
impl PartialOrd for TimeStamp<Utc> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeStamp<Utc> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

impl Serialize for TimeStamp<Utc> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TimeStamp<Utc> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        DateTime::<Utc>::deserialize(deserializer).map(TimeStamp)
    }
}

/// Kind of entity a governed change targets.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, minicbor::Encode, minicbor::Decode,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    #[n(0)]
    Role,
    #[n(1)]
    User,
    #[n(2)]
    DataExport,
    #[n(3)]
    Billing,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Role => "ROLE",
            EntityType::User => "USER",
            EntityType::DataExport => "DATA_EXPORT",
            EntityType::Billing => "BILLING",
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, minicbor::Encode, minicbor::Decode,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestAction {
    #[n(0)]
    Create,
    #[n(1)]
    Update,
    #[n(2)]
    Delete,
    #[n(3)]
    Export,
}

impl RequestAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestAction::Create => "CREATE",
            RequestAction::Update => "UPDATE",
            RequestAction::Delete => "DELETE",
            RequestAction::Export => "EXPORT",
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    InProgress,
    #[n(2)]
    Approved,
    #[n(3)]
    Rejected,
    #[n(4)]
    Cancelled,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Approved | RequestStatus::Rejected | RequestStatus::Cancelled
        )
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    InProgress,
    #[n(2)]
    Approved,
    #[n(3)]
    Rejected,
    /// Left through an explicit escalation.
    #[n(4)]
    Escalated,
    /// Jumped over by an escalation, never acted on.
    #[n(5)]
    Skipped,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalType {
    /// Completes on the first qualifying approval.
    #[n(0)]
    Sequential,
    /// Completes once `required_count` distinct approvals are in.
    #[n(1)]
    Parallel,
}

/// The two verdicts an approver can hand down on a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalAction {
    Approve,
    Reject,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionKind {
    #[n(0)]
    Approve,
    #[n(1)]
    Reject,
    #[n(2)]
    Delegate,
    #[n(3)]
    Escalate,
}

impl From<ApprovalAction> for DecisionKind {
    fn from(value: ApprovalAction) -> Self {
        match value {
            ApprovalAction::Approve => DecisionKind::Approve,
            ApprovalAction::Reject => DecisionKind::Reject,
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    minicbor::Encode,
    minicbor::Decode,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    #[n(0)]
    Low,
    #[n(1)]
    Medium,
    #[n(2)]
    High,
}

/// Free-form before/after description of a proposed change.
///
/// Stored as JSON text inside the CBOR record so arbitrary shapes survive
/// the round trip through sled.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(pub serde_json::Value);

impl Payload {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    /// Permission slugs carried by the change, from `permissions` or
    /// `after.permissions`. Every entry must be a string; a payload that
    /// mixes in other values is refused rather than silently narrowed.
    pub fn permissions(&self) -> Result<Option<Vec<String>>, GovernanceError> {
        let Some(list) = self
            .0
            .get("permissions")
            .or_else(|| self.0.get("after").and_then(|after| after.get("permissions")))
            .and_then(serde_json::Value::as_array)
        else {
            return Ok(None);
        };

        list.iter()
            .enumerate()
            .map(|(i, slug)| {
                slug.as_str().map(str::to_owned).ok_or_else(|| {
                    GovernanceError::validation(
                        "payload.permissions",
                        format!("entry {i} is not a permission slug: {slug}"),
                    )
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }

    /// sha256 over the JSON rendering, used to fingerprint what was approved.
    pub fn digest(&self) -> String {
        sha256::digest(self.0.to_string())
    }
}

impl<C> minicbor::Encode<C> for Payload {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.str(&self.0.to_string())?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for Payload {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let text = d.str()?;

        serde_json::from_str(text)
            .map(Payload)
            .map_err(|_| minicbor::decode::Error::message("payload is not valid json"))
    }
}

/// Whoever is acting on a request, as handed over by the identity layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub name: String,
    pub role_ids: Vec<String>,
    pub mfa_verified: bool,
    /// Set for the timeout scheduler; bypasses approver-set standing.
    pub system: bool,
}

impl Actor {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role_ids: vec![],
            mfa_verified: false,
            system: false,
        }
    }
    pub fn system(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: format!("system:{name}"),
            name,
            role_ids: vec![],
            mfa_verified: true,
            system: true,
        }
    }
    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.role_ids = roles.into_iter().map(Into::into).collect();
        self
    }
    pub fn with_mfa(mut self, verified: bool) -> Self {
        self.mfa_verified = verified;
        self
    }
}

//! Durable table and order-line model.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Durable table identifier, assigned once at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableId(pub Uuid);

impl TableId {
    /// Generate a new random table id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TableId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of an authenticated user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a persisted order line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LineId(pub Uuid);

impl LineId {
    /// Generate a new random line id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LineId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Correlation id of one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Generate a new random connection id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Short, human-shareable public code of a table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableCode(String);

impl TableCode {
    /// Length of generated codes.
    pub const LEN: usize = 8;

    /// Wrap an existing code, e.g. one taken from a request path.
    #[must_use]
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    /// Generate a fresh random code. Uniqueness is the caller's concern.
    #[must_use]
    pub fn generate() -> Self {
        let mut raw = Uuid::new_v4().simple().to_string();
        raw.truncate(Self::LEN);
        Self(raw)
    }

    /// The code as text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of a durable table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Open,
    Closed,
}

impl TableStatus {
    /// Storage text of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }

    /// Parse the storage text of a status.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "open" => Some(Self::Open),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// Persisted table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRecord {
    pub id: TableId,
    pub code: TableCode,
    pub name: String,
    pub restaurant: String,
    pub status: TableStatus,
    pub created_by: UserId,
    /// Creation timestamp (Unix epoch seconds).
    pub created_at: i64,
}

/// Parameters for creating a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTable {
    pub code: TableCode,
    pub name: String,
    pub restaurant: String,
    pub created_by: UserId,
}

/// Currency amount in cents.
///
/// Wire values are decimal numbers (`3.5`) rounded to two places on the way
/// in; storage only ever sees the integer cent count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Price(i64);

impl Price {
    /// Amount from a cent count.
    #[must_use]
    pub const fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    /// Amount in cents.
    #[must_use]
    pub const fn cents(self) -> i64 {
        self.0
    }

    /// Round a decimal amount to the nearest cent. Non-finite input is rejected.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_decimal(amount: f64) -> Option<Self> {
        let cents = (amount * 100.0).round();
        if !cents.is_finite() || cents.abs() > 9.0e15 {
            return None;
        }
        Some(Self(cents as i64))
    }

    /// Amount as a decimal number of currency units.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn to_decimal(self) -> f64 {
        self.0 as f64 / 100.0
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

impl Serialize for Price {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.to_decimal())
    }
}

impl<'de> Deserialize<'de> for Price {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(f64),
            Text(String),
        }

        let amount = match Raw::deserialize(deserializer)? {
            Raw::Number(n) => n,
            Raw::Text(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|e| serde::de::Error::custom(format!("invalid price {s:?}: {e}")))?,
        };
        Self::from_decimal(amount)
            .ok_or_else(|| serde::de::Error::custom(format!("price out of range: {amount}")))
    }
}

/// Case-insensitive merge key of an order line: item name plus contributor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MergeKey {
    name: String,
    contributor: UserId,
}

impl MergeKey {
    /// Key for `name` added by `contributor`.
    #[must_use]
    pub fn new(name: &str, contributor: UserId) -> Self {
        Self {
            name: name.to_lowercase(),
            contributor,
        }
    }
}

/// Durable order line. A line with quantity <= 0 is never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub id: LineId,
    pub table_id: TableId,
    pub name: String,
    pub price: Price,
    pub quantity: i64,
    pub added_by: UserId,
    /// Free-text origin (e.g. the parsed menu text the item came from).
    #[serde(default)]
    pub description: Option<String>,
}

impl OrderLine {
    /// Key this line merges under.
    #[must_use]
    pub fn merge_key(&self) -> MergeKey {
        MergeKey::new(&self.name, self.added_by)
    }
}

/// Client-submitted quantity change for one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemDelta {
    pub item_name: String,
    pub price: Price,
    pub quantity_delta: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub added_by_user_id: UserId,
}

impl ItemDelta {
    /// Key this delta merges into.
    #[must_use]
    pub fn merge_key(&self) -> MergeKey {
        MergeKey::new(&self.item_name, self.added_by_user_id)
    }
}

/// Role of a user on a table's member list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Host,
    Guest,
}

impl MemberRole {
    /// Storage text of the role.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Guest => "guest",
        }
    }

    /// Parse the storage text of a role.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "host" => Some(Self::Host),
            "guest" => Some(Self::Guest),
            _ => None,
        }
    }
}

/// Durable membership of a user in a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMember {
    pub table_id: TableId,
    pub user_id: UserId,
    pub role: MemberRole,
    /// Unix epoch seconds.
    pub joined_at: i64,
}

const fn one() -> i64 {
    1
}

/// Item added to a table directly, e.g. from a parsed menu.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewItem {
    pub name: String,
    pub price: Price,
    #[serde(default = "one")]
    pub quantity: i64,
    /// Text the item was parsed from. Defaults to the item name.
    #[serde(default, alias = "originalParsedText")]
    pub description: Option<String>,
}

impl NewItem {
    /// Origin text to store for this item.
    #[must_use]
    pub fn origin_text(&self) -> String {
        self.description
            .clone()
            .filter(|text| !text.trim().is_empty())
            .unwrap_or_else(|| self.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_rounds_to_cents() {
        assert_eq!(Price::from_decimal(3.5), Some(Price::from_cents(350)));
        assert_eq!(Price::from_decimal(0.1 + 0.2), Some(Price::from_cents(30)));
        assert_eq!(Price::from_decimal(f64::NAN), None);
        assert_eq!(Price::from_cents(350).to_string(), "3.50");
        assert_eq!(Price::from_cents(-5).to_string(), "-0.05");
    }

    #[test]
    fn price_accepts_numbers_and_strings() {
        let from_number: Price = serde_json::from_str("12.999").unwrap();
        let from_text: Price = serde_json::from_str("\"4.20\"").unwrap();
        assert_eq!(from_number.cents(), 1300);
        assert_eq!(from_text.cents(), 420);
        assert!(serde_json::from_str::<Price>("\"abc\"").is_err());
    }

    #[test]
    fn merge_key_ignores_case() {
        let user = UserId(Uuid::new_v4());
        assert_eq!(MergeKey::new("Fries", user), MergeKey::new("fRIES", user));
        assert_ne!(
            MergeKey::new("Fries", user),
            MergeKey::new("Fries", UserId(Uuid::new_v4()))
        );
    }

    #[test]
    fn item_delta_uses_camel_case_fields() {
        let user = Uuid::new_v4();
        let json = format!(
            r#"{{"itemName":"Fries","price":3.5,"quantityDelta":-1,"addedByUserId":"{user}"}}"#
        );
        let delta: ItemDelta = serde_json::from_str(&json).unwrap();
        assert_eq!(delta.item_name, "Fries");
        assert_eq!(delta.quantity_delta, -1);
        assert_eq!(delta.price.cents(), 350);
        assert_eq!(delta.username, None);
    }

    #[test]
    fn generated_codes_are_short() {
        let code = TableCode::generate();
        assert_eq!(code.as_str().len(), TableCode::LEN);
        assert_ne!(code, TableCode::generate());
    }

    #[test]
    fn new_item_defaults_quantity_and_origin_text() {
        let item: NewItem = serde_json::from_str(r#"{"name":"Gyoza","price":"6.00"}"#).unwrap();
        assert_eq!(item.quantity, 1);
        assert_eq!(item.origin_text(), "Gyoza");

        let parsed: NewItem = serde_json::from_str(
            r#"{"name":"Gyoza","price":6,"quantity":2,"originalParsedText":"GYOZA (6) .... 6.00"}"#,
        )
        .unwrap();
        assert_eq!(parsed.quantity, 2);
        assert_eq!(parsed.origin_text(), "GYOZA (6) .... 6.00");
    }

    #[test]
    fn member_roles_round_trip_as_text() {
        assert_eq!(MemberRole::parse(MemberRole::Guest.as_str()), Some(MemberRole::Guest));
        assert_eq!(MemberRole::parse("owner"), None);
    }
}

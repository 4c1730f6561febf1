//! Upstream wire schemas.
//!
//! Fields arrive loosely typed (strings for dates and enumerations, numbers
//! that are sometimes quoted). They stay raw here and are validated once at
//! the batch boundary.

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};

/// A record as returned by the upstream list or detail endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamRecord {
    /// Natural key.
    #[serde(default, alias = "eventId")]
    pub external_id: String,
    #[serde(default)]
    pub title: Option<String>,
    /// `YYYY-MM-DD` or an RFC 3339 timestamp.
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub chamber: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub congress: Option<String>,
    #[serde(default, alias = "committees")]
    pub committee_codes: Vec<String>,
    #[serde(default, alias = "updateDate")]
    pub last_modified: Option<String>,
    #[serde(default)]
    pub witnesses: Vec<UpstreamWitness>,
    #[serde(default)]
    pub documents: Vec<UpstreamDocument>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamWitness {
    pub name: String,
    #[serde(default)]
    pub organization: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamDocument {
    pub title: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, rename = "type", alias = "kind")]
    pub kind: Option<String>,
}

/// One page of the list endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordPage {
    #[serde(default, alias = "events")]
    pub records: Vec<UpstreamRecord>,
}

/// Envelope of the detail endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DetailResponse {
    Wrapped { record: UpstreamRecord },
    Bare(UpstreamRecord),
}

impl DetailResponse {
    pub fn into_record(self) -> UpstreamRecord {
        match self {
            Self::Wrapped { record } => record,
            Self::Bare(record) => record,
        }
    }
}

/// Date range passed to the list endpoint. Unbounded ends are omitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchWindow {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl FetchWindow {
    pub fn between(from: NaiveDate, to: NaiveDate) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
        }
    }

    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.from.map_or(true, |from| date >= from) && self.to.map_or(true, |to| date <= to)
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Int(i64),
        Float(f64),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        None => None,
        Some(Raw::Text(s)) => Some(s),
        Some(Raw::Int(n)) => Some(n.to_string()),
        Some(Raw::Float(n)) => Some(n.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_congress_accepts_string_or_number() {
        let quoted: UpstreamRecord =
            serde_json::from_str(r#"{"externalId":"H-1","congress":"118"}"#).unwrap();
        let bare: UpstreamRecord = serde_json::from_str(r#"{"eventId":"H-1","congress":118}"#).unwrap();
        assert_eq!(quoted.congress.as_deref(), Some("118"));
        assert_eq!(bare.congress, quoted.congress);
        assert_eq!(bare.external_id, "H-1");
    }

    #[test]
    fn test_missing_fields_default() {
        let record: UpstreamRecord = serde_json::from_str("{}").unwrap();
        assert!(record.external_id.is_empty());
        assert!(record.witnesses.is_empty());
        assert!(record.congress.is_none());
    }

    #[test]
    fn test_detail_envelope_variants() {
        let wrapped: DetailResponse =
            serde_json::from_str(r#"{"record":{"externalId":"S-9","title":"Budget"}}"#).unwrap();
        let bare: DetailResponse = serde_json::from_str(r#"{"externalId":"S-9","title":"Budget"}"#).unwrap();
        assert_eq!(wrapped.into_record(), bare.into_record());
    }

    #[test]
    fn test_window_contains() {
        let d = |s: &str| NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap();
        let window = FetchWindow::between(d("2024-01-01"), d("2024-01-31"));
        assert!(window.contains(d("2024-01-31")));
        assert!(!window.contains(d("2024-02-01")));
        assert!(FetchWindow::unbounded().contains(d("1999-01-01")));
    }
}

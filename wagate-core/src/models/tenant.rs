use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub type TenantId = i64;

/// Event tags a tenant may subscribe its webhook to.
pub const SUPPORTED_EVENTS: &[&str] = &[
    "Message",
    "ReadReceipt",
    "Presence",
    "HistorySync",
    "ChatPresence",
    "All",
];

/// One managed messaging account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub token: String,
    pub webhook: String,
    /// External account id, empty until the first successful handshake.
    pub jid: String,
    /// Transient pairing code, cleared once `jid` is bound.
    pub qrcode: String,
    pub connected: bool,
    /// Unix seconds. `None` or `0` means the tenant never expires.
    pub expiration: Option<i64>,
    pub events: BTreeSet<String>,
}

impl Tenant {
    pub fn is_expired(&self, now: i64) -> bool {
        matches!(self.expiration, Some(exp) if exp > 0 && exp <= now)
    }

    pub fn is_linked(&self) -> bool {
        !self.jid.is_empty()
    }
}

/// Row shape of the `tenants` table. `connected` is stored as an integer flag
/// and `events` as a comma-separated list.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TenantRow {
    pub id: i64,
    pub name: String,
    pub token: String,
    pub webhook: String,
    pub jid: String,
    pub qrcode: String,
    pub connected: i16,
    pub expiration: Option<i64>,
    pub events: String,
}

impl From<TenantRow> for Tenant {
    fn from(row: TenantRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            token: row.token,
            webhook: row.webhook,
            jid: row.jid,
            qrcode: row.qrcode,
            connected: row.connected != 0,
            expiration: row.expiration,
            events: parse_events(&row.events),
        }
    }
}

/// Input for creating a tenant through the admin API.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewTenant {
    pub name: String,
    pub token: String,
    #[serde(default)]
    pub webhook: String,
    #[serde(default)]
    pub expiration: Option<i64>,
    #[serde(default)]
    pub events: BTreeSet<String>,
}

pub fn parse_events(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn join_events(events: &BTreeSet<String>) -> String {
    events.iter().map(String::as_str).collect::<Vec<_>>().join(",")
}

/// Returns the first tag that is not in [`SUPPORTED_EVENTS`], if any.
pub fn first_unsupported_event<'a, I>(events: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a String>,
{
    events
        .into_iter()
        .map(String::as_str)
        .find(|e| !SUPPORTED_EVENTS.contains(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(expiration: Option<i64>) -> Tenant {
        Tenant {
            id: 1,
            name: "acme".into(),
            token: "tok".into(),
            webhook: String::new(),
            jid: String::new(),
            qrcode: String::new(),
            connected: true,
            expiration,
            events: BTreeSet::new(),
        }
    }

    #[test]
    fn test_expiration_semantics() {
        assert!(!tenant(None).is_expired(1_000));
        assert!(!tenant(Some(0)).is_expired(1_000), "zero means no expiration");
        assert!(!tenant(Some(2_000)).is_expired(1_000));
        assert!(tenant(Some(1_000)).is_expired(1_000));
        assert!(tenant(Some(10)).is_expired(1_000));
    }

    #[test]
    fn test_events_column_parsing() {
        let events = parse_events("Message, ReadReceipt,,Presence ");
        assert_eq!(events.len(), 3);
        assert!(events.contains("ReadReceipt"));
        assert_eq!(join_events(&events), "Message,Presence,ReadReceipt");
        assert!(parse_events("").is_empty());
    }

    #[test]
    fn test_row_conversion_maps_integer_flag() {
        let row = TenantRow {
            id: 7,
            name: "n".into(),
            token: "t".into(),
            webhook: "https://hook".into(),
            jid: "5511@s.whatsapp.net".into(),
            qrcode: String::new(),
            connected: 1,
            expiration: None,
            events: "Message".into(),
        };
        let t = Tenant::from(row);
        assert!(t.connected);
        assert!(t.is_linked());
        assert_eq!(t.events.len(), 1);
    }

    #[test]
    fn test_unsupported_event_detection() {
        let ok: BTreeSet<String> = ["Message".to_string(), "All".to_string()].into();
        assert_eq!(first_unsupported_event(&ok), None);

        let bad: BTreeSet<String> = ["Message".to_string(), "Typing".to_string()].into();
        assert_eq!(first_unsupported_event(&bad), Some("Typing"));
    }
}

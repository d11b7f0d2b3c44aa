use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;

use crate::fingerprint::Fingerprint;

/// Which side of a merged document a topic feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Customer,
    Inventory,
}

/// A new (not yet forwarded) record, ready to be merged.
#[derive(Debug, Clone)]
pub struct Incoming {
    pub kind: RecordKind,
    /// Correlating key: the record id, falling back to the message key.
    pub key: String,
    pub payload: Value,
    pub fingerprint: Fingerprint,
}

/// One sink document, built from at most one record of each kind.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedEntry {
    pub key: String,
    pub customer: Option<Value>,
    pub inventory: Option<Value>,
    /// Claims to confirm or release depending on the forward outcome.
    pub fingerprints: Vec<Fingerprint>,
}

#[derive(Serialize)]
struct MergedDocument<'a> {
    key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    customer: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inventory: Option<&'a Value>,
    partial: bool,
    #[serde(with = "time::serde::rfc3339")]
    merged_at: OffsetDateTime,
}

impl MergedEntry {
    pub fn is_partial(&self) -> bool {
        self.customer.is_none() || self.inventory.is_none()
    }

    /// Metric label for the entry.
    pub fn kind(&self) -> &'static str {
        if self.is_partial() {
            "partial"
        } else {
            "merged"
        }
    }

    pub fn document(&self, merged_at: OffsetDateTime) -> Result<Value, serde_json::Error> {
        serde_json::to_value(MergedDocument {
            key: &self.key,
            customer: self.customer.as_ref(),
            inventory: self.inventory.as_ref(),
            partial: self.is_partial(),
            merged_at,
        })
    }
}

/// Join customer and inventory records sharing a key within one batch.
///
/// Keys keep the order of their first appearance. Under a key, the n-th customer is paired with
/// the n-th inventory record; whatever is left over becomes a partial entry. Records are never
/// collapsed, so two different payloads for the same id are both forwarded.
pub fn merge_batch(records: Vec<Incoming>) -> Vec<MergedEntry> {
    let mut groups: Vec<(String, Vec<Incoming>, Vec<Incoming>)> = Vec::new();

    for record in records {
        let index = match groups.iter().position(|(key, _, _)| *key == record.key) {
            Some(index) => index,
            None => {
                groups.push((record.key.clone(), Vec::new(), Vec::new()));
                groups.len() - 1
            }
        };

        let (_, customers, inventory) = &mut groups[index];
        match record.kind {
            RecordKind::Customer => customers.push(record),
            RecordKind::Inventory => inventory.push(record),
        }
    }

    let mut merged = Vec::new();
    for (key, customers, inventory) in groups {
        let mut customers = customers.into_iter();
        let mut inventory = inventory.into_iter();

        loop {
            let (customer, item) = match (customers.next(), inventory.next()) {
                (None, None) => break,
                pair => pair,
            };

            let fingerprints = customer
                .iter()
                .chain(item.iter())
                .map(|record| record.fingerprint.clone())
                .collect();

            merged.push(MergedEntry {
                key: key.clone(),
                customer: customer.map(|record| record.payload),
                inventory: item.map(|record| record.payload),
                fingerprints,
            });
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_eq;
    use serde_json::json;
    use time::macros::datetime;

    fn incoming(kind: RecordKind, payload: Value) -> Incoming {
        let bytes = serde_json::to_vec(&payload).unwrap();
        Incoming {
            kind,
            key: payload["id"].as_str().unwrap().to_owned(),
            fingerprint: Fingerprint::of(&bytes),
            payload,
        }
    }

    #[test]
    fn pairs_records_by_key() {
        let merged = merge_batch(vec![
            incoming(RecordKind::Customer, json!({"id": "1", "name": "A"})),
            incoming(RecordKind::Inventory, json!({"id": "2", "stock": 0})),
            incoming(RecordKind::Inventory, json!({"id": "1", "stock": 5})),
        ]);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].key, "1");
        assert_eq!(merged[0].kind(), "merged");
        assert_eq!(merged[0].fingerprints.len(), 2);
        assert_eq!(merged[1].key, "2");
        assert_eq!(merged[1].kind(), "partial");
        assert_eq!(merged[1].customer, None);
        assert_eq!(merged[1].fingerprints.len(), 1);
    }

    #[test]
    fn same_id_different_payloads_are_kept() {
        let merged = merge_batch(vec![
            incoming(RecordKind::Customer, json!({"id": "1", "name": "A"})),
            incoming(RecordKind::Customer, json!({"id": "1", "name": "A2"})),
            incoming(RecordKind::Inventory, json!({"id": "1", "stock": 1})),
        ]);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].customer, Some(json!({"id": "1", "name": "A"})));
        assert!(!merged[0].is_partial());
        assert_eq!(merged[1].customer, Some(json!({"id": "1", "name": "A2"})));
        assert!(merged[1].is_partial());
    }

    #[test]
    fn empty_batch_merges_to_nothing() {
        assert!(merge_batch(Vec::new()).is_empty());
    }

    #[test]
    fn document_shape() {
        let merged = merge_batch(vec![incoming(
            RecordKind::Customer,
            json!({"id": "9", "name": "Z", "additional": {"vip": true}}),
        )]);

        let document = merged[0]
            .document(datetime!(2024-05-01 12:00:00 UTC))
            .unwrap();

        assert_json_eq!(
            document,
            json!({
                "key": "9",
                "customer": {"id": "9", "name": "Z", "additional": {"vip": true}},
                "partial": true,
                "merged_at": "2024-05-01T12:00:00Z",
            })
        );
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The markdown parser/serializer is an external collaborator (§1, §6.1):
//! the core only consumes `parse(text) -> ParsedForm` and `serialize(form) ->
//! text`. This module defines the seam ([`FormSerializer`]) plus the
//! content-hash requirement (§4.5, §9) that does not depend on which
//! serializer is wired in.

use sha2::{Digest, Sha256};

use crate::model::ParsedForm;

/// Implemented by the external markdown serializer. `markform-core` ships a
/// deterministic JSON-based stand-in ([`JsonFormSerializer`]) so the harness
/// and its tests can run without that collaborator.
pub trait FormSerializer: Send + Sync {
    fn serialize(&self, form: &ParsedForm) -> String;
}

/// Deterministic placeholder serializer. Not the markdown wire format (§6.1)
/// — just a stable, reproducible textual projection of form state, sufficient
/// for `markdownSha256` stability testing until a real serializer is wired in.
pub struct JsonFormSerializer;

impl FormSerializer for JsonFormSerializer {
    fn serialize(&self, form: &ParsedForm) -> String {
        // BTreeMap via serde_json's preserve order is not guaranteed across
        // HashMap fields, so sort keys explicitly for reproducibility.
        let mut responses: Vec<_> = form.responses_by_field_id.iter().collect();
        responses.sort_by_key(|(k, _)| k.clone());
        let mut notes = form.notes.clone();
        notes.sort_by(|a, b| a.id.cmp(&b.id));
        serde_json::json!({
            "schemaId": form.schema.id,
            "responses": responses.into_iter().map(|(k, v)| (k.clone(), v)).collect::<std::collections::BTreeMap<_, _>>(),
            "notes": notes,
        })
        .to_string()
    }
}

/// Pure SHA-256 over the serialized form text. No host-crypto dependency, so
/// the core stays portable to constrained runtimes (§9).
pub fn markdown_sha256(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FormMetadata, Schema};

    #[test]
    fn hash_is_reproducible_for_identical_state() {
        let form = ParsedForm::new(
            Schema { id: "f".into(), title: "t".into(), description: None, groups: vec![] },
            vec![],
            vec![],
            FormMetadata::default(),
        );
        let s = JsonFormSerializer;
        let h1 = markdown_sha256(&s.serialize(&form));
        let h2 = markdown_sha256(&s.serialize(&form));
        assert_eq!(h1, h2);
    }

    #[test]
    fn hash_changes_when_state_changes() {
        let mut form = ParsedForm::new(
            Schema {
                id: "f".into(),
                title: "t".into(),
                description: None,
                groups: vec![crate::model::Group {
                    id: "g".into(),
                    title: "g".into(),
                    implicit: false,
                    fields: vec![crate::model::Field {
                        id: "name".into(),
                        label: "Name".into(),
                        kind: crate::model::FieldKind::String { min_length: None, max_length: None, pattern: None },
                        role: "agent".into(),
                        required: true,
                        order: 0,
                        parallel_batch: None,
                    }],
                }],
            },
            vec![],
            vec![],
            FormMetadata::default(),
        );
        let s = JsonFormSerializer;
        let before = markdown_sha256(&s.serialize(&form));
        crate::apply::apply(&mut form, &[crate::model::Patch::SetString { field_id: "name".into(), value: Some("x".into()) }]);
        let after = markdown_sha256(&s.serialize(&form));
        assert_ne!(before, after);
    }
}

//! Lightweight input validation helpers. Keep logic minimal and deterministic.

use crate::{CoreError, NewReplacement, ReplacementDraft, DEFAULT_SCOPE};

/// Turn a client draft into a `NewReplacement`.
///
/// `book_hash`, `original` and `replacement` must be present and non-empty.
/// A missing or empty `scope` falls back to [`DEFAULT_SCOPE`].
pub fn validate_new_replacement(draft: ReplacementDraft) -> Result<NewReplacement, CoreError> {
    let book_hash = required(draft.book_hash)?;
    let original = required(draft.original)?;
    let replacement = required(draft.replacement)?;
    let scope = draft
        .scope
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_SCOPE.to_string());
    Ok(NewReplacement {
        book_hash,
        cfi: draft.cfi,
        original,
        replacement,
        scope,
        device_id: draft.device_id,
    })
}

fn required(value: Option<String>) -> Result<String, CoreError> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(CoreError::MissingFields),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> ReplacementDraft {
        ReplacementDraft {
            book_hash: Some("b1".into()),
            original: Some("old".into()),
            replacement: Some("new".into()),
            ..ReplacementDraft::default()
        }
    }

    #[test]
    fn defaults_scope_and_cfi() {
        let new = validate_new_replacement(draft()).unwrap();
        assert_eq!(new.scope, "single");
        assert_eq!(new.cfi, None);
        assert_eq!(new.device_id, None);
    }

    #[test]
    fn keeps_explicit_scope() {
        let mut d = draft();
        d.scope = Some("book".into());
        assert_eq!(validate_new_replacement(d).unwrap().scope, "book");
    }

    #[test]
    fn rejects_missing_or_empty_required_fields() {
        let mut d = draft();
        d.book_hash = None;
        assert!(matches!(validate_new_replacement(d), Err(CoreError::MissingFields)));

        let mut d = draft();
        d.replacement = Some(String::new());
        assert!(matches!(validate_new_replacement(d), Err(CoreError::MissingFields)));

        let only_original = ReplacementDraft {
            original: Some("old".into()),
            ..ReplacementDraft::default()
        };
        assert!(validate_new_replacement(only_original).is_err());
    }
}

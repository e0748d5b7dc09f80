/// Schema/table names are interpolated into SQL text (Postgres has no
/// bind-parameter syntax for identifiers), so callers are restricted to
/// ASCII alnum/underscore names and this is checked once at construction.
pub fn assert_valid_identifier(ident: &str) {
    let valid = !ident.is_empty()
        && ident
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && ident.chars().next().is_some_and(|c| !c.is_ascii_digit());
    assert!(valid, "invalid schema/table identifier: `{ident}`");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_simple_identifiers() {
        assert_valid_identifier("tenant_a");
        assert_valid_identifier("dbo");
    }

    #[test]
    #[should_panic]
    fn rejects_identifiers_with_special_characters() {
        assert_valid_identifier("tenant; DROP TABLE outbox;--");
    }

    #[test]
    #[should_panic]
    fn rejects_empty_identifier() {
        assert_valid_identifier("");
    }
}

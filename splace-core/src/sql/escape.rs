//! String literal and identifier escaping for MySQL statements.
//!
//! Generated statements embed user input directly because the proxy driver
//! forwards raw SQL text instead of binding parameters. Every value that
//! ends up between quotes must go through [`quote_literal`].

/// Escapes a string for use inside a single-quoted MySQL literal.
///
/// Backslash, both quote characters, NUL, newline, carriage return and
/// Ctrl-Z are each replaced by their backslash escape. The result decodes
/// back to `input` under MySQL's literal grammar.
pub fn escape_string(input: &str) -> String {
    let mut escaped =
        String::with_capacity(input.len().saturating_add(input.len() / 8).saturating_add(2));
    for c in input.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '\'' => escaped.push_str("\\'"),
            '"' => escaped.push_str("\\\""),
            '\0' => escaped.push_str("\\0"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\x1a' => escaped.push_str("\\Z"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Escapes and single-quotes a string literal.
pub fn quote_literal(input: &str) -> String {
    format!("'{}'", escape_string(input))
}

/// Escapes `LIKE` wildcards so the input only ever matches literally.
///
/// Apply this before [`quote_literal`]; the backslashes it adds are then
/// escaped again for the string literal layer.
pub fn escape_like_wildcards(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len().saturating_add(2));
    for c in input.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Backtick-quotes an identifier, doubling any embedded backtick.
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

//! Distinguished name escaping and decomposition.
//!
//! Escaping follows RFC 2253. The cleaning helpers are deliberately
//! lenient: values that are already escaped, or components without a
//! key/value separator, pass through unchanged instead of erroring, since
//! they typically come straight from a directory server.

/// Escapes a single attribute value for use inside a DN, per RFC 2253.
///
/// Special characters are backslash-escaped; `#` and space additionally
/// when leading, space when trailing.
#[must_use]
pub fn escape_dn_value(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }

    let chars: Vec<char> = value.chars().collect();
    let mut escaped = String::with_capacity(value.len());

    for (idx, ch) in chars.iter().enumerate() {
        let is_first = idx == 0;
        let is_last = idx == chars.len() - 1;
        let needs_escape = matches!(ch, ',' | '+' | '"' | '\\' | '<' | '>' | ';')
            || (is_first && (*ch == ' ' || *ch == '#'))
            || (is_last && *ch == ' ');

        if needs_escape {
            escaped.push('\\');
        }
        escaped.push(*ch);
    }

    escaped
}

/// Escapes the value portion of a single RDN.
///
/// An RDN that already contains a backslash is assumed escaped and is
/// returned unchanged, which makes the function idempotent. An RDN with no
/// `=` separator is also returned unchanged rather than treated as an
/// error.
#[must_use]
pub fn clean_rdn(rdn: &str) -> String {
    if rdn.contains('\\') {
        // already escaped, disregard
        return rdn.to_string();
    }

    match rdn.split_once('=') {
        Some((key, value)) => format!("{}={}", key, escape_dn_value(value.trim_start())),
        None => rdn.to_string(),
    }
}

/// Escapes every RDN of a DN and rejoins them with `,`.
///
/// A segment without a `=` separator is a value fragment cut off at an
/// unescaped comma; it is reattached to the preceding RDN so the comma
/// ends up escaped rather than splitting the value.
#[must_use]
pub fn clean_dn(dn: &str) -> String {
    let mut components: Vec<String> = Vec::new();
    for segment in split_components(dn) {
        match components.last_mut() {
            Some(last) if !segment.contains('=') => {
                last.push(',');
                last.push_str(&segment);
            }
            _ => components.push(segment.trim().to_string()),
        }
    }

    components
        .iter()
        .map(|rdn| clean_rdn(rdn))
        .collect::<Vec<_>>()
        .join(",")
}

/// Splits a DN into its component RDNs.
///
/// The split honors backslash escapes, so `cn=Smith\, Jane,ou=People`
/// yields two components. With `strip_types` set, the `attr=` prefix is
/// removed from each component.
#[must_use]
pub fn explode_dn(dn: &str, strip_types: bool) -> Vec<String> {
    split_components(dn)
        .into_iter()
        .map(|part| {
            let part = part.trim().to_string();
            if strip_types {
                match part.split_once('=') {
                    Some((_, value)) => value.to_string(),
                    None => part,
                }
            } else {
                part
            }
        })
        .collect()
}

/// Splits a DN at unescaped commas, preserving whitespace inside the
/// segments.
fn split_components(dn: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut escaped = false;

    for ch in dn.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }

        match ch {
            '\\' => {
                current.push(ch);
                escaped = true;
            }
            ',' => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    parts.push(current);

    parts
}

/// Escapes a value for use inside a search filter, per RFC 4515.
#[must_use]
pub fn escape_filter_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '*' => escaped.push_str("\\2a"),
            '(' => escaped.push_str("\\28"),
            ')' => escaped.push_str("\\29"),
            '\\' => escaped.push_str("\\5c"),
            '\0' => escaped.push_str("\\00"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// Substitutes escaped assertion values into a filter template.
///
/// Each `%s` placeholder consumes one value. Surplus placeholders or
/// values are left alone; the template is trusted, the values are not.
#[must_use]
pub fn filter_format(template: &str, values: &[&str]) -> String {
    let mut result = String::with_capacity(template.len());
    let mut remaining = template;
    let mut values = values.iter();

    while let Some(pos) = remaining.find("%s") {
        result.push_str(&remaining[..pos]);
        match values.next() {
            Some(value) => result.push_str(&escape_filter_value(value)),
            None => result.push_str("%s"),
        }
        remaining = &remaining[pos + 2..];
    }
    result.push_str(remaining);

    result
}

//! Referral payload parsing.
//!
//! Referral errors carry free-text diagnostics with a directory URL
//! embedded somewhere inside. The URL is located by its scheme marker,
//! validated, and reduced to a plain connection target (any DN or query
//! parts the server attached are dropped).

use url::Url;
use userdir_core::Error;

use crate::Result;

/// Extracts and validates the directory URL from a referral payload.
///
/// # Errors
///
/// Returns [`Error::BadReferral`] when the payload contains no
/// well-formed `ldap`, `ldaps` or `ldapi` URL.
pub fn referral_url(payload: &str) -> Result<String> {
    let start = payload
        .find("ldap")
        .ok_or_else(|| bad_referral(payload))?;
    let candidate = payload[start..]
        .split_whitespace()
        .next()
        .unwrap_or_default();

    let parsed = Url::parse(candidate).map_err(|_| bad_referral(payload))?;
    match parsed.scheme() {
        "ldapi" => Ok(candidate.to_string()),
        "ldap" | "ldaps" => {
            let host = parsed.host_str().ok_or_else(|| bad_referral(payload))?;
            let target = match parsed.port() {
                Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
                None => format!("{}://{}", parsed.scheme(), host),
            };
            Ok(target)
        }
        _ => Err(bad_referral(payload)),
    }
}

fn bad_referral(payload: &str) -> Error {
    Error::BadReferral(format!("Bad referral \"{payload}\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_first_url_from_free_text() {
        let payload = "Referral:\nldap://other.example.com:389/ou=People,dc=example,dc=com";
        assert_eq!(
            referral_url(payload).unwrap(),
            "ldap://other.example.com:389"
        );
    }

    #[test]
    fn keeps_tls_scheme_and_drops_dn_part() {
        let payload = "referral to ldaps://secure.example.com:636/dc=example,dc=com??sub";
        assert_eq!(
            referral_url(payload).unwrap(),
            "ldaps://secure.example.com:636"
        );
    }

    #[test]
    fn url_without_port_is_preserved() {
        let payload = "ldap://plain.example.com/dc=example,dc=com";
        assert_eq!(referral_url(payload).unwrap(), "ldap://plain.example.com");
    }

    #[test]
    fn payload_without_marker_is_rejected() {
        let err = referral_url("no url in here").unwrap_err();
        assert!(matches!(err, Error::BadReferral(_)));
    }

    #[test]
    fn garbage_after_marker_is_rejected() {
        let err = referral_url("something ldapish but not a url").unwrap_err();
        assert!(matches!(err, Error::BadReferral(_)));
    }

    #[test]
    fn non_directory_scheme_is_rejected() {
        // The marker search finds "ldap" inside a hostname of a foreign
        // scheme only when the text starts with it; a bare http URL has
        // no marker at all.
        let err = referral_url("see http://example.com/").unwrap_err();
        assert!(matches!(err, Error::BadReferral(_)));
    }
}

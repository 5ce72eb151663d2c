//! Access control contracts and request identity extraction
//!
//! Verifying access tokens is someone else's job; this module only defines
//! the contract the measurement core consumes, plus the rule for extracting a
//! measurement id from a request.
// (c) 2025 Ross Younger

/// Claims extracted from a verified access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    /// The measurement id this token authorizes.
    pub id: String,
}

/// Verifies access tokens for a given machine.
pub trait TokenVerifier: Send + Sync {
    /// Checks a token and extracts its claims.
    fn verify(&self, token: &str, machine: &str) -> anyhow::Result<Claims>;
}

/// Splits a querystring into decoded name/value pairs.
pub(crate) fn parse_query(query: Option<&str>) -> Vec<(String, String)> {
    query
        .map(|q| form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

/// Returns the first value for a querystring parameter.
pub(crate) fn query_value<'a>(query: &'a [(String, String)], name: &str) -> Option<&'a str> {
    query
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

/// Extracts the measurement id ("mid") from a request, if present.
///
/// A measurement id can arrive two ways: as the ID claim of a verified access
/// token (when a verifier is installed), or as a plain `mid` querystring
/// parameter.
pub(crate) fn measurement_id(
    query: &[(String, String)],
    verifier: Option<&dyn TokenVerifier>,
    machine: &str,
) -> Option<String> {
    if let Some(verifier) = verifier {
        if let Some(token) = query_value(query, "access_token") {
            match verifier.verify(token, machine) {
                Ok(claims) => return Some(claims.id),
                Err(e) => {
                    tracing::info!("access token rejected: {e}");
                    return None;
                }
            }
        }
        return None;
    }
    query_value(query, "mid")
        .filter(|mid| !mid.is_empty())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct FixedVerifier(Option<Claims>);
    impl TokenVerifier for FixedVerifier {
        fn verify(&self, _token: &str, _machine: &str) -> anyhow::Result<Claims> {
            self.0.clone().ok_or_else(|| anyhow::anyhow!("invalid token"))
        }
    }

    fn query(s: &str) -> Vec<(String, String)> {
        parse_query(Some(s))
    }

    #[test]
    fn query_parsing_decodes() {
        let q = query("mid=test&client_name=msak%2Dclient");
        assert_eq!(query_value(&q, "mid"), Some("test"));
        assert_eq!(query_value(&q, "client_name"), Some("msak-client"));
        assert_eq!(query_value(&q, "nope"), None);
    }

    #[test]
    fn mid_from_querystring() {
        assert_eq!(
            measurement_id(&query("mid=abc"), None, ""),
            Some("abc".into())
        );
        assert_eq!(measurement_id(&query("mid="), None, ""), None);
        assert_eq!(measurement_id(&query("streams=1"), None, ""), None);
    }

    #[test]
    fn verifier_claim_wins() {
        let v = FixedVerifier(Some(Claims { id: "from-token".into() }));
        assert_eq!(
            measurement_id(&query("access_token=x&mid=abc"), Some(&v), "mlab1"),
            Some("from-token".into())
        );
    }

    #[test]
    fn verifier_rejection_is_final() {
        let v = FixedVerifier(None);
        // With verification enabled, a bare mid is not enough.
        assert_eq!(measurement_id(&query("mid=abc"), Some(&v), "mlab1"), None);
        assert_eq!(
            measurement_id(&query("access_token=bad&mid=abc"), Some(&v), "mlab1"),
            None
        );
    }
}

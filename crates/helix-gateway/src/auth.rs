//! Bearer credential check for `GET /stream/{session_id}` (`spec.md` §4.4:
//! "requires a bearer credential in `Authorization`"). Real identity and
//! authorization decisions live in the enclosing control plane
//! (`spec.md` §1 Out of scope); this is the ambient boundary check every
//! public-facing binary in the corpus carries regardless.

use crate::config::GatewayConfig;

/// Resolve an `Authorization: Bearer <token>` header value to the principal
/// that rate limiting is keyed on. `None` on a missing/malformed header or
/// an unrecognized token.
#[must_use]
pub fn authenticate(cfg: &GatewayConfig, authorization: Option<&str>) -> Option<String> {
    let header = authorization?;
    let token = header.strip_prefix("Bearer ")?;
    cfg.bearer_tokens
        .iter()
        .find(|bt| bt.token == token)
        .map(|bt| bt.principal.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BearerToken;

    fn cfg_with_token() -> GatewayConfig {
        let mut cfg = GatewayConfig::default();
        cfg.bearer_tokens.push(BearerToken { token: "secret".to_string(), principal: "agent-1".to_string() });
        cfg
    }

    #[test]
    fn missing_header_is_rejected() {
        assert_eq!(authenticate(&cfg_with_token(), None), None);
    }

    #[test]
    fn wrong_scheme_is_rejected() {
        assert_eq!(authenticate(&cfg_with_token(), Some("Basic secret")), None);
    }

    #[test]
    fn matching_token_resolves_principal() {
        assert_eq!(
            authenticate(&cfg_with_token(), Some("Bearer secret")),
            Some("agent-1".to_string())
        );
    }

    #[test]
    fn unknown_token_is_rejected() {
        assert_eq!(authenticate(&cfg_with_token(), Some("Bearer wrong")), None);
    }
}

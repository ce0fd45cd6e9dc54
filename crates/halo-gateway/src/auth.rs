use halo_core::config::GatewayConfig;

/// Who made the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    Anonymous,
    /// Index of the matching entry in `gateway.api_keys`.
    Key(usize),
}

/// Bearer header -> api_keys -> anonymous.
///
/// Returns `None` when keys are configured and the bearer is missing or
/// matches none of them.
pub fn validate_auth(config: &GatewayConfig, bearer: Option<&str>) -> Option<Caller> {
    if config.api_keys.is_empty() {
        return Some(Caller::Anonymous);
    }
    let bearer = bearer?;
    config
        .api_keys
        .iter()
        .position(|key| key == bearer)
        .map(Caller::Key)
}

/// Extract the token from an `Authorization: Bearer <token>` value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

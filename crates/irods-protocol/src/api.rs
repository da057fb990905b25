//! API numbers and server status codes used by the connection core

/// API numbers sent in `intInfo` of `RODS_API_REQ`
pub mod numbers {
    pub const AUTH_REQUEST_AN: i32 = 703;
    pub const AUTH_RESPONSE_AN: i32 = 704;
    pub const GSI_AUTH_REQUEST_AN: i32 = 711;
    pub const KRB_AUTH_REQUEST_AN: i32 = 713;
    pub const PAM_AUTH_REQUEST_AN: i32 = 725;
    pub const AUTH_PLUG_REQ_AN: i32 = 1201;
}

/// Negative status codes returned by the server
pub mod status {
    pub const SYS_HEADER_READ_LEN_ERR: i32 = -4000;
    pub const SYS_RECONN_OPR_MISMATCH: i32 = -47000;
    pub const USER_AUTH_STRING_EMPTY: i32 = -60000;
    pub const USER_AUTH_SCHEME_ERR: i32 = -300000;
    pub const CAT_INVALID_AUTHENTICATION: i32 = -826000;
    pub const CAT_INVALID_USER: i32 = -827000;
    pub const CAT_INVALID_ZONE: i32 = -828000;
    pub const CAT_PASSWORD_EXPIRED: i32 = -840000;
    pub const PAM_AUTH_ERROR: i32 = -993000;
}

/// Symbolic name of a server status code. Codes carry an errno in their
/// last three digits, which is ignored for the lookup.
pub fn status_name(code: i32) -> Option<&'static str> {
    use status::*;
    let base = code - (code % 1000);
    let name = match base {
        SYS_HEADER_READ_LEN_ERR => "SYS_HEADER_READ_LEN_ERR",
        SYS_RECONN_OPR_MISMATCH => "SYS_RECONN_OPR_MISMATCH",
        USER_AUTH_STRING_EMPTY => "USER_AUTH_STRING_EMPTY",
        USER_AUTH_SCHEME_ERR => "USER_AUTH_SCHEME_ERR",
        CAT_INVALID_AUTHENTICATION => "CAT_INVALID_AUTHENTICATION",
        CAT_INVALID_USER => "CAT_INVALID_USER",
        CAT_INVALID_ZONE => "CAT_INVALID_ZONE",
        CAT_PASSWORD_EXPIRED => "CAT_PASSWORD_EXPIRED",
        PAM_AUTH_ERROR => "PAM_AUTH_ERROR",
        _ => return None,
    };
    Some(name)
}

/// `NAME (code)` or just the code when unknown
pub fn describe_status(code: i32) -> String {
    match status_name(code) {
        Some(name) => format!("{} ({})", name, code),
        None => code.to_string(),
    }
}

use std::fmt;

use buslink::ClaimError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const DEVICE_ERROR: i32 = 3;
pub const DEVICE_BUSY: i32 = 4;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
#[allow(dead_code)]
pub const USAGE: i32 = 64;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

pub fn claim_error(err: ClaimError) -> CliError {
    let code = match &err {
        ClaimError::Busy => DEVICE_BUSY,
        ClaimError::Unauthorized => PERMISSION_DENIED,
        ClaimError::Invalid(_) => DATA_INVALID,
        ClaimError::NoMatchingDevice => FAILURE,
        _ => DEVICE_ERROR,
    };
    CliError::new(code, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_map_by_variant() {
        assert_eq!(claim_error(ClaimError::Busy).code, DEVICE_BUSY);
        assert_eq!(
            claim_error(ClaimError::Unauthorized).code,
            PERMISSION_DENIED
        );
        assert_eq!(
            claim_error(ClaimError::Invalid("x".into())).code,
            DATA_INVALID
        );
        assert_eq!(
            claim_error(ClaimError::Device("x".into())).code,
            DEVICE_ERROR
        );
    }
}

//! Input validation helpers shared by the API boundary and the
//! execution service. Structural problems found here are terminal on the
//! first attempt and never retried.

use crate::error::AppError;
use crate::models::CreateTaskRequest;

pub const PRIORITY_MIN: i32 = 1;
pub const PRIORITY_MAX: i32 = 10;
pub const TIMEOUT_MIN_SECS: i32 = 1;
pub const TIMEOUT_MAX_SECS: i32 = 3600;
pub const NAME_MAX_CHARS: usize = 255;

pub fn validate_priority(priority: i32) -> Result<(), AppError> {
    if !(PRIORITY_MIN..=PRIORITY_MAX).contains(&priority) {
        return Err(AppError::Validation(format!(
            "priority must be between {} and {}, got {}",
            PRIORITY_MIN, PRIORITY_MAX, priority
        )));
    }
    Ok(())
}

pub fn validate_timeout_seconds(timeout: i32) -> Result<(), AppError> {
    if !(TIMEOUT_MIN_SECS..=TIMEOUT_MAX_SECS).contains(&timeout) {
        return Err(AppError::Validation(format!(
            "timeout_seconds must be between {} and {}, got {}",
            TIMEOUT_MIN_SECS, TIMEOUT_MAX_SECS, timeout
        )));
    }
    Ok(())
}

pub fn validate_task_name(name: &str) -> Result<(), AppError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation("task name must not be empty".into()));
    }
    if trimmed.chars().count() > NAME_MAX_CHARS {
        return Err(AppError::Validation(format!(
            "task name must not exceed {} characters",
            NAME_MAX_CHARS
        )));
    }
    Ok(())
}

pub fn validate_script(script: &str, max_bytes: usize) -> Result<(), AppError> {
    if script.trim().is_empty() {
        return Err(AppError::Validation("script_content must not be empty".into()));
    }
    if script.len() > max_bytes {
        return Err(AppError::Validation(format!(
            "script_content exceeds the {} byte limit",
            max_bytes
        )));
    }
    Ok(())
}

/// Full validation of a create-task request.
pub fn validate_create_task(req: &CreateTaskRequest, max_script_bytes: usize) -> Result<(), AppError> {
    validate_task_name(&req.name)?;
    validate_script(&req.script_content, max_script_bytes)?;
    if let Some(priority) = req.priority {
        validate_priority(priority)?;
    }
    if let Some(timeout) = req.timeout_seconds {
        validate_timeout_seconds(timeout)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ScriptLanguage;

    fn request() -> CreateTaskRequest {
        CreateTaskRequest {
            name: "hello".into(),
            description: None,
            script_content: "print('ok')".into(),
            script_type: ScriptLanguage::Python,
            priority: Some(5),
            timeout_seconds: Some(30),
            metadata: None,
        }
    }

    #[test]
    fn accepts_well_formed_request() {
        assert!(validate_create_task(&request(), 64 * 1024).is_ok());
    }

    #[test]
    fn rejects_priority_out_of_range() {
        assert!(validate_priority(0).is_err());
        assert!(validate_priority(11).is_err());
        assert!(validate_priority(1).is_ok());
        assert!(validate_priority(10).is_ok());
    }

    #[test]
    fn rejects_timeout_out_of_range() {
        assert!(validate_timeout_seconds(0).is_err());
        assert!(validate_timeout_seconds(3601).is_err());
        assert!(validate_timeout_seconds(1).is_ok());
        assert!(validate_timeout_seconds(3600).is_ok());
    }

    #[test]
    fn rejects_empty_script() {
        let mut req = request();
        req.script_content = "   \n".into();
        assert!(validate_create_task(&req, 1024).is_err());
    }

    #[test]
    fn rejects_oversized_script() {
        let mut req = request();
        req.script_content = "x".repeat(2048);
        assert!(validate_create_task(&req, 1024).is_err());
    }

    #[test]
    fn rejects_blank_name() {
        let mut req = request();
        req.name = "  ".into();
        assert!(validate_create_task(&req, 1024).is_err());
    }
}

// Derived UI helpers
//
// Pure functions over `Status`; the UI never decides these itself.

use crate::models::state::Status;

pub fn get_button_label(status: Status, is_last_step: bool) -> &'static str {
    match status {
        Status::Validating => "Validating...",
        Status::Installing => "Installing...",
        Status::Invalid => "Retry",
        Status::Ready => "Get Started",
        _ if is_last_step => "Finish",
        _ => "Next",
    }
}

pub fn is_button_disabled(status: Status, detecting: bool) -> bool {
    detecting || matches!(status, Status::Validating | Status::Installing)
}

pub fn can_advance(status: Status) -> bool {
    !matches!(
        status,
        Status::Validating | Status::Installing | Status::Invalid
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_statuses_show_progress_labels() {
        assert_eq!(get_button_label(Status::Validating, false), "Validating...");
        assert_eq!(get_button_label(Status::Installing, true), "Installing...");
    }

    #[test]
    fn last_step_reads_finish_unless_ready() {
        assert_eq!(get_button_label(Status::Valid, true), "Finish");
        assert_eq!(get_button_label(Status::Ready, true), "Get Started");
        assert_eq!(get_button_label(Status::Idle, false), "Next");
        assert_eq!(get_button_label(Status::Invalid, true), "Retry");
    }

    #[test]
    fn detection_disables_the_button() {
        assert!(is_button_disabled(Status::Idle, true));
        assert!(is_button_disabled(Status::Installing, false));
        assert!(!is_button_disabled(Status::Invalid, false));
    }

    #[test]
    fn invalid_and_busy_block_advancing() {
        for status in [Status::Validating, Status::Installing, Status::Invalid] {
            assert!(!can_advance(status), "{:?} should block", status);
        }
        for status in [Status::Idle, Status::Valid, Status::Installed, Status::Ready] {
            assert!(can_advance(status), "{:?} should allow", status);
        }
    }
}

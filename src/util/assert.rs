/// Panics with an internal assertion message when `condition` is false.
///
/// Used for invariants whose violation means the local cache is corrupt or a component
/// was driven out of order. The async queue catches the panic and fails permanently.
#[track_caller]
pub fn hard_assert(condition: bool, message: impl AsRef<str>) {
    if !condition {
        panic!("{}", internal_assertion_message(message));
    }
}

/// Unconditional form of [`hard_assert`] for unreachable states.
#[track_caller]
pub fn fail(message: impl AsRef<str>) -> ! {
    panic!("{}", internal_assertion_message(message));
}

pub fn internal_assertion_message(message: impl AsRef<str>) -> String {
    format!(
        "FIRESTORE ({}) INTERNAL ASSERT FAILED: {}",
        env!("CARGO_PKG_VERSION"),
        message.as_ref()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "INTERNAL ASSERT FAILED")]
    fn panics_on_false() {
        hard_assert(false, "batch removed twice");
    }

    #[test]
    fn message_carries_reason() {
        let message = internal_assertion_message("missing target global");
        assert!(message.starts_with("FIRESTORE"));
        assert!(message.ends_with("missing target global"));
    }
}
